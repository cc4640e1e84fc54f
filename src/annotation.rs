use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::ProcessedRecord;
use crate::error::KiraError;
use crate::store::Store;

const UNIPROT_BASE_URL: &str = "https://rest.uniprot.org/uniprotkb";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProteinAnnotation {
    pub accession: String,
    /// Primary gene names first, then synonyms.
    pub gene_names: Vec<String>,
    pub protein_name: Option<String>,
    pub organism: Option<String>,
}

/// External protein-name service. Only used to enrich display names and
/// gene-name search; every caller must cope with it being absent.
pub trait AnnotationClient: Send + Sync {
    fn fetch_annotation(&self, accession: &str) -> Result<Option<ProteinAnnotation>, KiraError>;

    fn lookup_gene_name(&self, accession: &str) -> Result<Option<String>, KiraError> {
        Ok(self
            .fetch_annotation(accession)?
            .and_then(|annotation| annotation.gene_names.into_iter().next()))
    }
}

#[derive(Clone)]
pub struct UniprotHttpClient {
    client: Client,
    base_url: String,
}

impl UniprotHttpClient {
    pub fn new() -> Result<Self, KiraError> {
        Self::with_base_url(UNIPROT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-px/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::UniprotHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| KiraError::UniprotHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, KiraError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(status, attempt, delay, "retrying uniprot request");
                        std::thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(error = %err, attempt, delay, "retrying uniprot request");
                        std::thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(KiraError::UniprotHttp(err.to_string()));
                }
            }
        }
    }

    /// `Ok(None)` for unknown accessions.
    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<Option<reqwest::blocking::Response>, KiraError> {
        let status = response.status();
        if status.is_success() {
            return Ok(Some(response));
        }
        if matches!(status.as_u16(), 400 | 404) {
            return Ok(None);
        }
        let message = response
            .text()
            .unwrap_or_else(|_| "UniProt request failed".to_string());
        Err(KiraError::UniprotStatus {
            status: status.as_u16(),
            message,
        })
    }

    fn entry_url(&self, accession: &str) -> String {
        format!("{}/{}.json", self.base_url, accession)
    }
}

impl AnnotationClient for UniprotHttpClient {
    fn fetch_annotation(&self, accession: &str) -> Result<Option<ProteinAnnotation>, KiraError> {
        let url = self.entry_url(accession);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        let Some(response) = Self::handle_status(response)? else {
            debug!(accession, "accession unknown to uniprot");
            return Ok(None);
        };
        let raw: Value = response
            .json()
            .map_err(|err| KiraError::UniprotHttp(err.to_string()))?;
        Ok(extract_annotation(&raw))
    }
}

/// Pulls the fields used for display names out of a UniProtKB entry.
pub fn extract_annotation(raw: &Value) -> Option<ProteinAnnotation> {
    let accession = raw.get("primaryAccession").and_then(|v| v.as_str())?.to_string();
    let protein_name = raw
        .get("proteinDescription")
        .and_then(|v| v.get("recommendedName"))
        .and_then(|v| v.get("fullName"))
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .or_else(|| {
            raw.get("proteinDescription")
                .and_then(|v| v.get("submissionNames"))
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.first())
                .and_then(|v| v.get("fullName"))
                .and_then(|v| v.get("value"))
                .and_then(|v| v.as_str())
                .map(|v| v.to_string())
        });

    let mut primary = Vec::new();
    let mut synonyms = Vec::new();
    if let Some(genes) = raw.get("genes").and_then(|v| v.as_array()) {
        for gene in genes {
            if let Some(name) = gene
                .get("geneName")
                .and_then(|v| v.get("value"))
                .and_then(|v| v.as_str())
            {
                primary.push(name.to_string());
            }
            if let Some(syns) = gene.get("synonyms").and_then(|v| v.as_array()) {
                synonyms.extend(
                    syns.iter()
                        .filter_map(|syn| syn.get("value").and_then(|v| v.as_str()))
                        .map(str::to_string),
                );
            }
        }
    }
    let mut seen = BTreeSet::new();
    let gene_names = primary
        .into_iter()
        .chain(synonyms)
        .filter(|name| seen.insert(name.clone()))
        .collect();

    let organism = raw
        .get("organism")
        .and_then(|v| v.get("scientificName"))
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    Some(ProteinAnnotation {
        accession,
        gene_names,
        protein_name,
        organism,
    })
}

/// Serves lookups from the shared annotation cache and records every
/// successful fetch in it.
pub struct CachedAnnotationClient<'a> {
    inner: &'a dyn AnnotationClient,
    store: &'a Store,
}

impl<'a> CachedAnnotationClient<'a> {
    pub fn new(inner: &'a dyn AnnotationClient, store: &'a Store) -> Self {
        Self { inner, store }
    }
}

impl AnnotationClient for CachedAnnotationClient<'_> {
    fn fetch_annotation(&self, accession: &str) -> Result<Option<ProteinAnnotation>, KiraError> {
        match self.store.read_cached_annotation(accession) {
            Ok(Some(hit)) => return Ok(Some(hit)),
            Ok(None) => {}
            Err(err) => warn!(accession, error = %err, "ignoring unreadable cache entry"),
        }
        let fetched = self.inner.fetch_annotation(accession)?;
        if let Some(annotation) = &fetched {
            if let Err(err) = self.store.write_cached_annotation(accession, annotation) {
                warn!(accession, error = %err, "failed to cache annotation");
            }
        }
        Ok(fetched)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Fetches one annotation per distinct leading accession. The first service
/// error stops further lookups; what was fetched so far is returned.
pub fn fetch_annotations(
    client: &dyn AnnotationClient,
    records: &[ProcessedRecord],
) -> Vec<ProteinAnnotation> {
    let accessions = records
        .iter()
        .filter_map(|record| record.accessions().next())
        .collect::<BTreeSet<_>>();
    let mut annotations = Vec::new();
    for accession in accessions {
        match client.fetch_annotation(accession) {
            Ok(Some(annotation)) => annotations.push(annotation),
            Ok(None) => {}
            Err(err) => {
                warn!(accession, error = %err, "annotation service failed, continuing without it");
                break;
            }
        }
    }
    annotations
}

/// Primary id → label shown on plots and in search output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayNames {
    names: BTreeMap<String, String>,
}

impl DisplayNames {
    /// Annotation gene name of the first accession, else the dataset's gene
    /// column, else the primary id. A failing client is abandoned after its
    /// first error.
    pub fn resolve(records: &[ProcessedRecord], client: Option<&dyn AnnotationClient>) -> Self {
        let mut client = client;
        let mut names = BTreeMap::new();
        for record in records {
            let annotated = match (client, record.accessions().next()) {
                (Some(service), Some(accession)) => match service.lookup_gene_name(accession) {
                    Ok(name) => name,
                    Err(err) => {
                        warn!(accession, error = %err, "gene name lookup failed, using dataset names");
                        client = None;
                        None
                    }
                },
                _ => None,
            };
            names.insert(record.primary_id.clone(), fallback_name(record, annotated));
        }
        Self { names }
    }

    /// Same precedence as [`DisplayNames::resolve`] using already fetched
    /// annotations.
    pub fn from_annotations(records: &[ProcessedRecord], annotations: &[ProteinAnnotation]) -> Self {
        let by_accession = annotations
            .iter()
            .filter_map(|annotation| {
                let gene = annotation.gene_names.first()?;
                Some((annotation.accession.to_uppercase(), gene.clone()))
            })
            .collect::<BTreeMap<_, _>>();
        let names = records
            .iter()
            .map(|record| {
                let annotated = record
                    .accessions()
                    .next()
                    .and_then(|accession| by_accession.get(&accession.to_uppercase()).cloned());
                (record.primary_id.clone(), fallback_name(record, annotated))
            })
            .collect();
        Self { names }
    }

    pub fn get(&self, primary_id: &str) -> Option<&str> {
        self.names.get(primary_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn fallback_name(record: &ProcessedRecord, annotated: Option<String>) -> String {
    annotated
        .filter(|name| !name.trim().is_empty())
        .or_else(|| {
            record
                .gene_names
                .as_deref()
                .map(str::trim)
                .filter(|genes| !genes.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| record.primary_id.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    struct MockAnnotation {
        calls: AtomicUsize,
        fail: bool,
    }

    impl MockAnnotation {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl AnnotationClient for MockAnnotation {
        fn fetch_annotation(&self, accession: &str) -> Result<Option<ProteinAnnotation>, KiraError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(KiraError::UniprotHttp("offline".to_string()));
            }
            Ok((accession == "P69905").then(|| ProteinAnnotation {
                accession: "P69905".to_string(),
                gene_names: vec!["HBA1".to_string(), "HBA2".to_string()],
                protein_name: Some("Hemoglobin subunit alpha".to_string()),
                organism: Some("Homo sapiens".to_string()),
            }))
        }
    }

    fn record(id: &str, genes: Option<&str>) -> ProcessedRecord {
        ProcessedRecord {
            primary_id: id.to_string(),
            gene_names: genes.map(str::to_string),
            fold_change: Some(1.0),
            significance: Some(0.01),
            comparison: "1".to_string(),
        }
    }

    #[test]
    fn extracts_primary_genes_before_synonyms() {
        let raw = json!({
            "primaryAccession": "P69905",
            "proteinDescription": {
                "recommendedName": { "fullName": { "value": "Hemoglobin subunit alpha" } }
            },
            "genes": [
                { "geneName": { "value": "HBA1" }, "synonyms": [{ "value": "HBA" }] },
                { "geneName": { "value": "HBA2" } }
            ],
            "organism": { "scientificName": "Homo sapiens" }
        });
        let annotation = extract_annotation(&raw).unwrap();
        assert_eq!(annotation.gene_names, vec!["HBA1", "HBA2", "HBA"]);
        assert_eq!(annotation.protein_name.as_deref(), Some("Hemoglobin subunit alpha"));
        assert_eq!(annotation.organism.as_deref(), Some("Homo sapiens"));
        assert!(extract_annotation(&json!({})).is_none());
    }

    #[test]
    fn display_names_prefer_annotation_then_dataset() {
        let records = vec![
            record("P69905;P68871", Some("HBA")),
            record("Q00000", Some("ABC1")),
            record("Q11111", None),
        ];
        let client = MockAnnotation::new(false);
        let names = DisplayNames::resolve(&records, Some(&client));
        assert_eq!(names.get("P69905;P68871"), Some("HBA1"));
        assert_eq!(names.get("Q00000"), Some("ABC1"));
        assert_eq!(names.get("Q11111"), Some("Q11111"));

        let offline = DisplayNames::resolve(&records, None);
        assert_eq!(offline.get("P69905;P68871"), Some("HBA"));
    }

    #[test]
    fn failing_client_is_abandoned() {
        let records = vec![record("P1", Some("G1")), record("P2", None)];
        let client = MockAnnotation::new(true);
        let names = DisplayNames::resolve(&records, Some(&client));
        assert_eq!(names.get("P1"), Some("G1"));
        assert_eq!(names.get("P2"), Some("P2"));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_serves_repeat_lookups() {
        let temp = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new_with_paths(root.join("project"), root.join("cache"));
        let inner = MockAnnotation::new(false);
        let cached = CachedAnnotationClient::new(&inner, &store);

        assert_eq!(cached.lookup_gene_name("P69905").unwrap().as_deref(), Some("HBA1"));
        assert_eq!(cached.lookup_gene_name("P69905").unwrap().as_deref(), Some("HBA1"));
        assert_eq!(cached.lookup_gene_name("Q00000").unwrap(), None);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fetched_annotations_feed_display_names() {
        let records = vec![record("P69905", None), record("P69905-2", None)];
        let client = MockAnnotation::new(false);
        let annotations = fetch_annotations(&client, &records);
        assert_eq!(annotations.len(), 1);
        let names = DisplayNames::from_annotations(&records, &annotations);
        assert_eq!(names.get("P69905"), Some("HBA1"));
        assert_eq!(names.get("P69905-2"), Some("P69905-2"));
    }
}
