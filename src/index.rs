//! Alias indices mapping split ids and gene names back to canonical
//! (composite) primary ids.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::annotation::ProteinAnnotation;
use crate::domain::{DatasetId, ProcessedRecord, SearchType, split_tokens};
use crate::error::KiraError;

pub type AliasTable = BTreeMap<String, BTreeSet<String>>;

/// Immutable once built. Rebuilding always produces a fresh value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasIndex {
    split_id: AliasTable,
    gene_name: AliasTable,
    /// Full gene-name string per canonical id, for typeahead and display.
    gene_names: BTreeMap<String, String>,
    primary_ids: BTreeSet<String>,
}

impl AliasIndex {
    pub fn build(records: &[ProcessedRecord]) -> Self {
        let mut index = Self::default();
        for record in records {
            let primary = record.primary_id.trim();
            if primary.is_empty() {
                continue;
            }
            index.primary_ids.insert(primary.to_string());
            register_id(&mut index.split_id, primary, primary);
            for token in split_tokens(primary) {
                register_id(&mut index.split_id, token, primary);
            }

            let Some(genes) = record.gene_names.as_deref().map(str::trim) else {
                continue;
            };
            if genes.is_empty() {
                continue;
            }
            index
                .gene_names
                .entry(primary.to_string())
                .or_insert_with(|| genes.to_string());
            register(&mut index.gene_name, genes.to_uppercase(), primary);
            for token in split_tokens(genes) {
                register(&mut index.gene_name, token.to_uppercase(), primary);
            }
        }
        debug!(
            proteins = index.primary_ids.len(),
            split_ids = index.split_id.len(),
            gene_names = index.gene_name.len(),
            "built alias index"
        );
        index
    }

    /// The alias table a search type resolves against.
    pub fn table(&self, search_type: SearchType) -> &AliasTable {
        match search_type {
            SearchType::PrimaryId | SearchType::AccessionId => &self.split_id,
            SearchType::GeneName => &self.gene_name,
        }
    }

    pub fn lookup(&self, search_type: SearchType, key: &str) -> Option<&BTreeSet<String>> {
        self.table(search_type).get(key)
    }

    pub fn lookup_split_id(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.split_id.get(key)
    }

    pub fn lookup_gene_name(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.gene_name.get(&key.to_uppercase())
    }

    /// `(primary id, full gene-name string)` pairs in primary id order.
    pub fn gene_name_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.gene_names
            .iter()
            .map(|(primary, genes)| (primary.as_str(), genes.as_str()))
    }

    pub fn primary_ids(&self) -> impl Iterator<Item = &str> {
        self.primary_ids.iter().map(String::as_str)
    }

    pub fn protein_count(&self) -> usize {
        self.primary_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary_ids.is_empty()
    }
}

fn register(table: &mut AliasTable, key: String, primary: &str) {
    table.entry(key).or_default().insert(primary.to_string());
}

/// Ids are stored verbatim; an uppercased alias is added so normalized
/// queries still hit lowercase accessions.
fn register_id(table: &mut AliasTable, key: &str, primary: &str) {
    register(table, key.to_string(), primary);
    let upper = key.to_uppercase();
    if upper != key {
        register(table, upper, primary);
    }
}

/// Gene name → accession table sourced from an external annotation service.
///
/// Optional: without it gene-name search only sees the dataset's own gene
/// column and misses synonyms the service knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessionIndex {
    by_gene: AliasTable,
}

impl AccessionIndex {
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut by_gene = AliasTable::new();
        for (gene, accession) in pairs {
            let (gene, accession) = (gene.trim(), accession.trim());
            if gene.is_empty() || accession.is_empty() {
                continue;
            }
            register(&mut by_gene, gene.to_uppercase(), &accession.to_uppercase());
        }
        Self { by_gene }
    }

    pub fn from_annotations<'a, I>(annotations: I) -> Self
    where
        I: IntoIterator<Item = &'a ProteinAnnotation>,
    {
        Self::from_pairs(annotations.into_iter().flat_map(|annotation| {
            annotation
                .gene_names
                .iter()
                .map(move |gene| (gene.as_str(), annotation.accession.as_str()))
        }))
    }

    pub fn accessions_for(&self, gene: &str) -> Option<&BTreeSet<String>> {
        self.by_gene.get(&gene.to_uppercase())
    }

    pub fn len(&self) -> usize {
        self.by_gene.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_gene.is_empty()
    }
}

/// Per-dataset registry of built indices.
///
/// Readers receive `Arc` snapshots; a rebuild swaps the snapshot and never
/// mutates one that was handed out.
#[derive(Debug, Default)]
pub struct IndexRegistry {
    indices: Mutex<HashMap<DatasetId, Arc<AliasIndex>>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<DatasetId, Arc<AliasIndex>>> {
        self.indices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Builds the index for `dataset` unless one already exists.
    pub fn build(&self, dataset: &DatasetId, records: &[ProcessedRecord]) -> Arc<AliasIndex> {
        if let Some(existing) = self.guard().get(dataset) {
            debug!(%dataset, "alias index already built");
            return Arc::clone(existing);
        }
        let built = Arc::new(AliasIndex::build(records));
        info!(%dataset, proteins = built.protein_count(), "alias index built");
        Arc::clone(self.guard().entry(dataset.clone()).or_insert(built))
    }

    /// Builds a fresh index and swaps it in, replacing any existing snapshot.
    pub fn rebuild(&self, dataset: &DatasetId, records: &[ProcessedRecord]) -> Arc<AliasIndex> {
        let built = Arc::new(AliasIndex::build(records));
        info!(%dataset, proteins = built.protein_count(), "alias index rebuilt");
        self.guard().insert(dataset.clone(), Arc::clone(&built));
        built
    }

    /// Registers a previously persisted index unless one already exists.
    pub fn restore(&self, dataset: &DatasetId, index: AliasIndex) -> Arc<AliasIndex> {
        Arc::clone(
            self.guard()
                .entry(dataset.clone())
                .or_insert_with(|| Arc::new(index)),
        )
    }

    pub fn get(&self, dataset: &DatasetId) -> Result<Arc<AliasIndex>, KiraError> {
        self.guard()
            .get(dataset)
            .cloned()
            .ok_or_else(|| KiraError::IndexNotBuilt(dataset.to_string()))
    }

    pub fn contains(&self, dataset: &DatasetId) -> bool {
        self.guard().contains_key(dataset)
    }

    pub fn clear(&self, dataset: &DatasetId) -> bool {
        self.guard().remove(dataset).is_some()
    }
}
