use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::annotation::ProteinAnnotation;
use crate::config::{ColumnMapping, GenericExtraField, TransformOptions};
use crate::domain::{DatasetId, ProcessedRecord, RawSample};
use crate::error::KiraError;
use crate::index::AliasIndex;
use crate::selection::{DatasetSelections, SelectionMap};
use crate::session::SearchListManifest;
use crate::tabular::{parse_processed, parse_raw};
use crate::volcano::VolcanoPayload;

const RAW_FILE: &str = "raw.tsv";
const PROCESSED_FILE: &str = "processed.tsv";
const DESCRIPTOR_FILE: &str = "dataset.json";
const SELECTIONS_FILE: &str = "selections.json";
const SEARCH_LISTS_FILE: &str = "search-lists.json";
const ALIAS_INDEX_FILE: &str = "alias-index.json";
const VOLCANO_CACHE_FILE: &str = "volcano-cache.json";
const ANNOTATIONS_FILE: &str = "annotations.json";

/// On-disk layout: `.kira-px/` in the project directory for datasets and
/// `~/.cache/kira-proteomics-explorer/` for annotation lookups shared
/// between projects.
#[derive(Debug, Clone)]
pub struct Store {
    project_root: Utf8PathBuf,
    cache_root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, KiraError> {
        let cwd = std::env::current_dir().map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let project_root = Utf8PathBuf::from_path_buf(cwd.join(".kira-px"))
            .map_err(|_| KiraError::Filesystem("invalid project path".to_string()))?;

        let cache_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.home_dir().join(".cache").join("kira-proteomics-explorer"),
                )
                .ok()
            })
            .ok_or_else(|| {
                KiraError::Filesystem("unable to resolve cache directory".to_string())
            })?;

        Ok(Self {
            project_root,
            cache_root,
        })
    }

    pub fn new_with_paths(project_root: Utf8PathBuf, cache_root: Utf8PathBuf) -> Self {
        Self {
            project_root,
            cache_root,
        }
    }

    pub fn project_root(&self) -> &Utf8Path {
        &self.project_root
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn datasets_root(&self) -> Utf8PathBuf {
        self.project_root.join("datasets")
    }

    pub fn dataset_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.datasets_root().join(id.as_str())
    }

    pub fn dataset_file(&self, id: &DatasetId, name: &str) -> Utf8PathBuf {
        self.dataset_dir(id).join(name)
    }

    pub fn cache_annotation_path(&self, accession: &str) -> Utf8PathBuf {
        self.cache_root
            .join("annotations")
            .join(format!("{}.json", accession.to_uppercase()))
    }

    pub fn clear_project(&self) -> Result<(), KiraError> {
        if self.project_root.as_std_path().exists() {
            fs::remove_dir_all(self.project_root.as_std_path())
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    /// Writes through a sibling temp file and renames it into place.
    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
        let parent = path
            .parent()
            .ok_or_else(|| KiraError::Filesystem(format!("invalid destination path {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".kira-px-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), KiraError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    /// `Ok(None)` when the file does not exist.
    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, KiraError> {
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("read {path}: {err}")))?;
        let value = serde_json::from_str(&content)
            .map_err(|err| KiraError::Filesystem(format!("parse {path}: {err}")))?;
        Ok(Some(value))
    }

    pub fn read_cached_annotation(
        &self,
        accession: &str,
    ) -> Result<Option<ProteinAnnotation>, KiraError> {
        Self::read_json(&self.cache_annotation_path(accession))
    }

    pub fn write_cached_annotation(
        &self,
        accession: &str,
        annotation: &ProteinAnnotation,
    ) -> Result<(), KiraError> {
        Self::write_json_atomic(&self.cache_annotation_path(accession), annotation)
    }
}

/// Metadata written next to an imported dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub id: DatasetId,
    pub columns: ColumnMapping,
    #[serde(default)]
    pub transforms: TransformOptions,
    pub imported_at: String,
    pub tool: String,
    #[serde(default)]
    pub processed_rows: usize,
    #[serde(default)]
    pub raw_samples: usize,
    #[serde(default)]
    pub extra: BTreeMap<String, GenericExtraField>,
}

/// What the core needs from persistent storage.
pub trait DatasetStorage {
    fn get_all_processed_records(&self, dataset: &DatasetId)
    -> Result<Vec<ProcessedRecord>, KiraError>;

    fn get_all_raw_samples(&self, dataset: &DatasetId) -> Result<Vec<RawSample>, KiraError>;

    fn get_canonical_selection_map(&self, dataset: &DatasetId) -> Result<SelectionMap, KiraError>;

    fn put_selection_map(
        &self,
        selections: &DatasetSelections,
        manifest: &SearchListManifest,
    ) -> Result<(), KiraError>;

    fn put_alias_index(&self, dataset: &DatasetId, index: &AliasIndex) -> Result<(), KiraError>;

    /// Optional: the core works without a cache.
    fn put_volcano_point_cache(
        &self,
        _dataset: &DatasetId,
        _payload: &VolcanoPayload,
    ) -> Result<(), KiraError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FsStorage {
    store: Store,
}

impl FsStorage {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Copies both tables into the project and writes the descriptor. An
    /// existing dataset with the same id is replaced, derived files included.
    pub fn import_dataset(
        &self,
        id: &DatasetId,
        raw: &str,
        processed: &str,
        columns: &ColumnMapping,
        transforms: TransformOptions,
        extra: BTreeMap<String, GenericExtraField>,
    ) -> Result<DatasetDescriptor, KiraError> {
        let processed_rows = parse_processed(processed, columns, transforms).len();
        let raw_samples = parse_raw(raw, columns, transforms).len();

        let dir = self.store.dataset_dir(id);
        for derived in [ALIAS_INDEX_FILE, VOLCANO_CACHE_FILE] {
            let path = dir.join(derived);
            if path.as_std_path().exists() {
                fs::remove_file(path.as_std_path())
                    .map_err(|err| KiraError::Filesystem(err.to_string()))?;
            }
        }
        Store::write_bytes_atomic(&dir.join(RAW_FILE), raw.as_bytes())?;
        Store::write_bytes_atomic(&dir.join(PROCESSED_FILE), processed.as_bytes())?;

        let descriptor = DatasetDescriptor {
            id: id.clone(),
            columns: columns.clone(),
            transforms,
            imported_at: chrono::Utc::now().to_rfc3339(),
            tool: format!("kira-px/{}", env!("CARGO_PKG_VERSION")),
            processed_rows,
            raw_samples,
            extra,
        };
        Store::write_json_atomic(&dir.join(DESCRIPTOR_FILE), &descriptor)?;
        info!(dataset = %id, processed_rows, raw_samples, "dataset imported");
        Ok(descriptor)
    }

    pub fn contains(&self, id: &DatasetId) -> bool {
        self.store
            .dataset_file(id, DESCRIPTOR_FILE)
            .as_std_path()
            .exists()
    }

    pub fn dataset_descriptor(&self, id: &DatasetId) -> Result<DatasetDescriptor, KiraError> {
        Store::read_json(&self.store.dataset_file(id, DESCRIPTOR_FILE))?
            .ok_or_else(|| KiraError::DatasetNotFound(id.to_string()))
    }

    pub fn list_datasets(&self) -> Result<Vec<DatasetDescriptor>, KiraError> {
        let root = self.store.datasets_root();
        if !root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let mut descriptors = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let path = entry.path().join(DESCRIPTOR_FILE);
            let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
                continue;
            };
            if let Some(descriptor) = Store::read_json::<DatasetDescriptor>(&path)? {
                descriptors.push(descriptor);
            }
        }
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(descriptors)
    }

    pub fn remove_dataset(&self, id: &DatasetId) -> Result<(), KiraError> {
        if !self.contains(id) {
            return Err(KiraError::DatasetNotFound(id.to_string()));
        }
        fs::remove_dir_all(self.store.dataset_dir(id).as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        debug!(dataset = %id, "dataset removed");
        Ok(())
    }

    pub fn clear_project(&self) -> Result<(), KiraError> {
        self.store.clear_project()
    }

    fn read_table(&self, id: &DatasetId, name: &str) -> Result<String, KiraError> {
        let path = self.store.dataset_file(id, name);
        fs::read_to_string(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("read {path}: {err}")))
    }

    pub fn get_dataset_selections(&self, id: &DatasetId) -> Result<DatasetSelections, KiraError> {
        self.ensure_exists(id)?;
        Ok(Store::read_json(&self.store.dataset_file(id, SELECTIONS_FILE))?
            .unwrap_or_else(|| DatasetSelections::new(id.clone())))
    }

    pub fn get_search_lists(&self, id: &DatasetId) -> Result<SearchListManifest, KiraError> {
        self.ensure_exists(id)?;
        Ok(Store::read_json(&self.store.dataset_file(id, SEARCH_LISTS_FILE))?.unwrap_or_default())
    }

    pub fn get_alias_index(&self, id: &DatasetId) -> Result<Option<AliasIndex>, KiraError> {
        self.ensure_exists(id)?;
        Store::read_json(&self.store.dataset_file(id, ALIAS_INDEX_FILE))
    }

    pub fn get_volcano_point_cache(
        &self,
        id: &DatasetId,
    ) -> Result<Option<VolcanoPayload>, KiraError> {
        self.ensure_exists(id)?;
        Store::read_json(&self.store.dataset_file(id, VOLCANO_CACHE_FILE))
    }

    pub fn get_annotations(&self, id: &DatasetId) -> Result<Vec<ProteinAnnotation>, KiraError> {
        self.ensure_exists(id)?;
        Ok(Store::read_json(&self.store.dataset_file(id, ANNOTATIONS_FILE))?.unwrap_or_default())
    }

    pub fn put_annotations(
        &self,
        id: &DatasetId,
        annotations: &[ProteinAnnotation],
    ) -> Result<(), KiraError> {
        self.ensure_exists(id)?;
        Store::write_json_atomic(&self.store.dataset_file(id, ANNOTATIONS_FILE), &annotations)
    }

    fn ensure_exists(&self, id: &DatasetId) -> Result<(), KiraError> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(KiraError::DatasetNotFound(id.to_string()))
        }
    }
}

impl DatasetStorage for FsStorage {
    fn get_all_processed_records(
        &self,
        dataset: &DatasetId,
    ) -> Result<Vec<ProcessedRecord>, KiraError> {
        let descriptor = self.dataset_descriptor(dataset)?;
        let text = self.read_table(dataset, PROCESSED_FILE)?;
        Ok(parse_processed(&text, &descriptor.columns, descriptor.transforms))
    }

    fn get_all_raw_samples(&self, dataset: &DatasetId) -> Result<Vec<RawSample>, KiraError> {
        let descriptor = self.dataset_descriptor(dataset)?;
        let text = self.read_table(dataset, RAW_FILE)?;
        Ok(parse_raw(&text, &descriptor.columns, descriptor.transforms))
    }

    fn get_canonical_selection_map(&self, dataset: &DatasetId) -> Result<SelectionMap, KiraError> {
        Ok(self.get_dataset_selections(dataset)?.selections)
    }

    fn put_selection_map(
        &self,
        selections: &DatasetSelections,
        manifest: &SearchListManifest,
    ) -> Result<(), KiraError> {
        let dataset = &selections.dataset;
        self.ensure_exists(dataset)?;
        Store::write_json_atomic(&self.store.dataset_file(dataset, SELECTIONS_FILE), selections)?;
        Store::write_json_atomic(&self.store.dataset_file(dataset, SEARCH_LISTS_FILE), manifest)?;
        debug!(
            dataset = %dataset,
            proteins = selections.selections.len(),
            lists = manifest.lists.len(),
            "selections saved"
        );
        Ok(())
    }

    fn put_alias_index(&self, dataset: &DatasetId, index: &AliasIndex) -> Result<(), KiraError> {
        self.ensure_exists(dataset)?;
        Store::write_json_atomic(&self.store.dataset_file(dataset, ALIAS_INDEX_FILE), index)
    }

    fn put_volcano_point_cache(
        &self,
        dataset: &DatasetId,
        payload: &VolcanoPayload,
    ) -> Result<(), KiraError> {
        self.ensure_exists(dataset)?;
        Store::write_json_atomic(&self.store.dataset_file(dataset, VOLCANO_CACHE_FILE), payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = Store::new_with_paths(
            Utf8PathBuf::from("/work/.kira-px"),
            Utf8PathBuf::from("/home/me/.cache/kira-proteomics-explorer"),
        );
        let id: DatasetId = "lfq-1".parse().unwrap();

        assert!(store.dataset_file(&id, RAW_FILE).ends_with("datasets/lfq-1/raw.tsv"));
        assert!(
            store
                .cache_annotation_path("p69905")
                .ends_with("annotations/P69905.json")
        );
    }

    #[test]
    fn atomic_write_replaces_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("nested").join("a.json")).unwrap();
        Store::write_json_atomic(&path, &vec![1, 2]).unwrap();
        Store::write_json_atomic(&path, &vec![3]).unwrap();
        let back: Option<Vec<u32>> = Store::read_json(&path).unwrap();
        assert_eq!(back, Some(vec![3]));
        assert_eq!(Store::read_json::<Vec<u32>>(&path.with_extension("missing")).unwrap(), None);
    }
}
