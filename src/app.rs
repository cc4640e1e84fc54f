use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::annotation::{
    AnnotationClient, CachedAnnotationClient, DisplayNames, fetch_annotations,
};
use crate::config::{DatasetSource, GenericExtraField};
use crate::domain::{DatasetId, HexColor, SearchType};
use crate::error::KiraError;
use crate::index::{AccessionIndex, AliasIndex, IndexRegistry};
use crate::search::{BatchOutcome, SearchEngine, Suggestion};
use crate::selection::{DatasetSelections, SelectionMap};
use crate::session::{NewSearchList, SearchList, SelectionSession};
use crate::store::{DatasetDescriptor, DatasetStorage, FsStorage};
use crate::volcano::{VolcanoPayload, VolcanoProcessor, VolcanoSettings};

#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub dataset: DatasetId,
    pub processed_rows: usize,
    pub raw_samples: usize,
    pub imported_at: String,
    pub indexed_proteins: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexResult {
    pub dataset: DatasetId,
    pub proteins: usize,
    pub split_id_keys: usize,
    pub gene_name_keys: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub dataset: DatasetId,
    pub search_type: SearchType,
    pub regex: bool,
    /// Display label per matched primary id.
    pub labels: BTreeMap<String, String>,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuggestResult {
    pub dataset: DatasetId,
    pub query: String,
    pub suggestions: Vec<Suggestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectResult {
    pub dataset: DatasetId,
    pub list: SearchList,
    pub unmatched_terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListsResult {
    pub dataset: DatasetId,
    pub lists: Vec<SearchListEntry>,
    /// Proteins shown by the current filters.
    pub filtered_protein_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchListEntry {
    pub active: bool,
    #[serde(flatten)]
    pub list: SearchList,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotateResult {
    pub dataset: DatasetId,
    pub annotated: usize,
    pub accession_index_genes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub datasets: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub id: DatasetId,
    pub processed_rows: usize,
    pub raw_samples: usize,
    pub imported_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub descriptor: DatasetDescriptor,
    pub indexed: bool,
    pub selection_names: Vec<String>,
    pub search_lists: usize,
    pub annotations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub cleared: bool,
    pub dataset: Option<DatasetId>,
}

/// Edit applied to the search lists of one dataset.
#[derive(Debug, Clone)]
pub enum ListEdit {
    Remove(Uuid),
    Rename(Uuid, String),
    Recolor(Uuid, HexColor),
    ToggleFilter(Uuid),
    /// Toggles a selection that only lives in the selection map.
    ToggleStored(String),
    /// Replaces both filter sets. Unknown list ids reject the whole edit.
    SetFilters {
        lists: Vec<Uuid>,
        stored: Vec<String>,
    },
    /// Drops every list and filter; stored selections stay.
    Clear,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn progress(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

fn finished(sink: &dyn ProgressSink, message: String, start: Instant) {
    sink.event(ProgressEvent {
        message,
        elapsed: Some(start.elapsed()),
    });
}

pub struct App<A: AnnotationClient> {
    storage: FsStorage,
    annotation: A,
    indices: IndexRegistry,
}

impl<A: AnnotationClient> App<A> {
    pub fn new(storage: FsStorage, annotation: A) -> Self {
        Self {
            storage,
            annotation,
            indices: IndexRegistry::new(),
        }
    }

    pub fn storage(&self) -> &FsStorage {
        &self.storage
    }

    pub fn import(
        &self,
        id: &DatasetId,
        source: &DatasetSource,
        extra: BTreeMap<String, GenericExtraField>,
        build_index: bool,
        sink: &dyn ProgressSink,
    ) -> Result<ImportResult, KiraError> {
        let start = Instant::now();
        progress(sink, format!("phase=Read; {}", source.processed.display()));
        let raw = read_table(&source.raw)?;
        let processed = read_table(&source.processed)?;

        progress(sink, format!("phase=Store; importing {id}"));
        let descriptor = self.storage.import_dataset(
            id,
            &raw,
            &processed,
            &source.columns,
            source.transforms,
            extra,
        )?;
        self.indices.clear(id);

        let indexed_proteins = if build_index {
            Some(self.build_index(id, true, sink)?.proteins)
        } else {
            None
        };
        finished(sink, format!("phase=Done; imported {id}"), start);
        Ok(ImportResult {
            dataset: descriptor.id,
            processed_rows: descriptor.processed_rows,
            raw_samples: descriptor.raw_samples,
            imported_at: descriptor.imported_at,
            indexed_proteins,
        })
    }

    /// Builds and persists the alias index of one dataset. An existing index
    /// (in memory or persisted) is kept unless `force` is set.
    pub fn build_index(
        &self,
        id: &DatasetId,
        force: bool,
        sink: &dyn ProgressSink,
    ) -> Result<IndexResult, KiraError> {
        let start = Instant::now();
        progress(sink, format!("phase=Index; building alias index for {id}"));
        let records = self.storage.get_all_processed_records(id)?;
        let index = if force {
            self.indices.rebuild(id, &records)
        } else {
            match self.index(id) {
                Ok(existing) => existing,
                Err(KiraError::IndexNotBuilt(_)) => self.indices.build(id, &records),
                Err(err) => return Err(err),
            }
        };
        self.storage.put_alias_index(id, &index)?;
        finished(sink, format!("phase=Done; indexed {id}"), start);
        Ok(IndexResult {
            dataset: id.clone(),
            proteins: index.protein_count(),
            split_id_keys: index.table(SearchType::PrimaryId).len(),
            gene_name_keys: index.table(SearchType::GeneName).len(),
        })
    }

    /// In-memory snapshot, else the persisted one. Never builds.
    fn index(&self, id: &DatasetId) -> Result<Arc<AliasIndex>, KiraError> {
        if let Ok(index) = self.indices.get(id) {
            return Ok(index);
        }
        match self.storage.get_alias_index(id)? {
            Some(index) => {
                debug!(dataset = %id, "restored persisted alias index");
                Ok(self.indices.restore(id, index))
            }
            None => Err(KiraError::IndexNotBuilt(id.to_string())),
        }
    }

    fn accession_index(&self, id: &DatasetId) -> Result<Option<AccessionIndex>, KiraError> {
        let annotations = self.storage.get_annotations(id)?;
        if annotations.is_empty() {
            return Ok(None);
        }
        Ok(Some(AccessionIndex::from_annotations(&annotations)))
    }

    pub fn search(
        &self,
        id: &DatasetId,
        lines: &[String],
        search_type: SearchType,
        regex: bool,
        sink: &dyn ProgressSink,
    ) -> Result<SearchResponse, KiraError> {
        let start = Instant::now();
        let index = self.index(id)?;
        let accessions = self.accession_index(id)?;
        progress(sink, format!("phase=Search; {} lines against {id}", lines.len()));
        let engine = SearchEngine::new(&index, accessions.as_ref());
        let outcome = if regex {
            engine.search_regex(lines, search_type)
        } else {
            engine.search_batch(lines, search_type)
        };

        let labels = if outcome.matches.is_empty() {
            BTreeMap::new()
        } else {
            let records = self.storage.get_all_processed_records(id)?;
            let names = DisplayNames::from_annotations(&records, &self.storage.get_annotations(id)?);
            outcome
                .protein_ids()
                .into_iter()
                .filter_map(|primary| {
                    let label = names.get(&primary)?.to_string();
                    Some((primary, label))
                })
                .collect()
        };
        finished(
            sink,
            format!("phase=Done; {} groups matched", outcome.matches.len()),
            start,
        );
        Ok(SearchResponse {
            dataset: id.clone(),
            search_type,
            regex,
            labels,
            outcome,
        })
    }

    pub fn suggest(
        &self,
        id: &DatasetId,
        query: &str,
        search_type: SearchType,
        limit: usize,
    ) -> Result<SuggestResult, KiraError> {
        let index = self.index(id)?;
        let suggestions = SearchEngine::new(&index, None).suggest(query, search_type, limit);
        Ok(SuggestResult {
            dataset: id.clone(),
            query: query.to_string(),
            suggestions,
        })
    }

    pub fn volcano(
        &self,
        id: &DatasetId,
        settings: &VolcanoSettings,
        sink: &dyn ProgressSink,
    ) -> Result<VolcanoPayload, KiraError> {
        let start = Instant::now();
        progress(sink, format!("phase=Read; loading {id}"));
        let records = self.storage.get_all_processed_records(id)?;
        let selections = self.storage.get_dataset_selections(id)?;
        let names = DisplayNames::from_annotations(&records, &self.storage.get_annotations(id)?);

        let mut settings = settings.clone();
        for (group, color) in selections.colors {
            settings.color_overrides.entry(group).or_insert(color);
        }

        progress(sink, format!("phase=Process; {} records", records.len()));
        let payload =
            VolcanoProcessor::new(&settings).process(&records, &selections.selections, Some(&names));
        self.storage.put_volcano_point_cache(id, &payload)?;
        finished(
            sink,
            format!("phase=Done; {} points", payload.points.len()),
            start,
        );
        Ok(payload)
    }

    /// Searches `terms` and saves the matches as a named search list.
    pub fn select(
        &self,
        id: &DatasetId,
        name: &str,
        terms: &[String],
        search_type: SearchType,
        description: Option<String>,
        sink: &dyn ProgressSink,
    ) -> Result<SelectResult, KiraError> {
        let response = self.search(id, terms, search_type, false, sink)?;
        let (mut selections, mut session) = self.load_session(id)?;

        let list_id = session.create(
            &mut selections,
            NewSearchList {
                name: name.to_string(),
                color: None,
                protein_ids: response.outcome.protein_ids(),
                search_terms: response
                    .outcome
                    .groups
                    .iter()
                    .map(|group| group.key.clone())
                    .collect(),
                search_type,
                description,
            },
        );
        self.storage.put_selection_map(&selections, &session.manifest())?;
        let list = session.get(list_id)?.clone();
        info!(dataset = %id, list = %list.name, proteins = list.protein_ids.len(), "search list saved");
        Ok(SelectResult {
            dataset: id.clone(),
            list,
            unmatched_terms: response.outcome.statistics.unmatched_terms,
        })
    }

    fn load_session(&self, id: &DatasetId) -> Result<(DatasetSelections, SelectionSession), KiraError> {
        let selections = self.storage.get_dataset_selections(id)?;
        let manifest = self.storage.get_search_lists(id)?;
        let session = SelectionSession::import(&selections.selections, &manifest);
        Ok((selections, session))
    }

    pub fn lists(&self, id: &DatasetId) -> Result<ListsResult, KiraError> {
        let (selections, session) = self.load_session(id)?;
        Ok(lists_result(id, &selections, &session))
    }

    pub fn edit_list(&self, id: &DatasetId, edit: ListEdit) -> Result<ListsResult, KiraError> {
        let (mut selections, mut session) = self.load_session(id)?;
        match edit {
            ListEdit::Remove(list) => {
                session.remove(&mut selections, list)?;
            }
            ListEdit::Rename(list, name) => session.rename(&mut selections, list, &name)?,
            ListEdit::Recolor(list, color) => session.recolor(&mut selections, list, color)?,
            ListEdit::ToggleFilter(list) => {
                session.toggle_filter(list)?;
            }
            ListEdit::ToggleStored(name) => {
                session.toggle_stored_filter(&name);
            }
            ListEdit::SetFilters { lists, stored } => {
                session.set_filters(lists)?;
                session.set_stored_filters(stored);
            }
            ListEdit::Clear => session.clear_all(&mut selections),
        }
        self.storage.put_selection_map(&selections, &session.manifest())?;
        Ok(lists_result(id, &selections, &session))
    }

    /// The dataset's selection map with every search list folded in.
    pub fn export_selections(&self, id: &DatasetId) -> Result<SelectionMap, KiraError> {
        let (selections, session) = self.load_session(id)?;
        Ok(session.export(&selections.selections))
    }

    /// Union-merges a `{protein: {name: true}}` document into the dataset's
    /// selection map. Tags under a search list's name join that list.
    pub fn import_selections(&self, id: &DatasetId, path: &Path) -> Result<ListsResult, KiraError> {
        let text = read_table(path)?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|err| KiraError::InvalidSelectionMap(err.to_string()))?;
        let incoming = SelectionMap::from_json(&value)?;

        let mut selections = self.storage.get_dataset_selections(id)?;
        selections.selections.merge(&incoming);
        let manifest = self.storage.get_search_lists(id)?;
        let session = SelectionSession::import(&selections.selections, &manifest);
        self.storage.put_selection_map(&selections, &session.manifest())?;
        info!(dataset = %id, proteins = incoming.len(), "selections imported");
        Ok(lists_result(id, &selections, &session))
    }

    /// Fetches annotations for every leading accession through the shared
    /// cache and stores them with the dataset.
    pub fn annotate(&self, id: &DatasetId, sink: &dyn ProgressSink) -> Result<AnnotateResult, KiraError> {
        let start = Instant::now();
        let records = self.storage.get_all_processed_records(id)?;
        progress(sink, format!("phase=Annotate; {} records", records.len()));
        let client = CachedAnnotationClient::new(&self.annotation, self.storage.store());
        let annotations = fetch_annotations(&client, &records);
        self.storage.put_annotations(id, &annotations)?;
        let accession_index = AccessionIndex::from_annotations(&annotations);
        finished(
            sink,
            format!("phase=Done; {} annotations", annotations.len()),
            start,
        );
        Ok(AnnotateResult {
            dataset: id.clone(),
            annotated: annotations.len(),
            accession_index_genes: accession_index.len(),
        })
    }

    pub fn list(&self, sink: &dyn ProgressSink) -> Result<ListResult, KiraError> {
        progress(sink, "phase=Resolve; scanning datasets".to_string());
        let datasets = self
            .storage
            .list_datasets()?
            .into_iter()
            .map(|descriptor| ListEntry {
                id: descriptor.id,
                processed_rows: descriptor.processed_rows,
                raw_samples: descriptor.raw_samples,
                imported_at: descriptor.imported_at,
            })
            .collect();
        Ok(ListResult { datasets })
    }

    pub fn info(&self, id: &DatasetId, sink: &dyn ProgressSink) -> Result<InfoResult, KiraError> {
        progress(sink, format!("phase=Resolve; looking up {id}"));
        let descriptor = self.storage.dataset_descriptor(id)?;
        let indexed = self.indices.contains(id) || self.storage.get_alias_index(id)?.is_some();
        let (selections, session) = self.load_session(id)?;
        Ok(InfoResult {
            descriptor,
            indexed,
            selection_names: selections
                .selections
                .selection_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            search_lists: session.len(),
            annotations: self.storage.get_annotations(id)?.len(),
        })
    }

    /// Removes one dataset, or the whole project store when `id` is `None`.
    pub fn clear(&self, id: Option<&DatasetId>, sink: &dyn ProgressSink) -> Result<ClearResult, KiraError> {
        match id {
            Some(id) => {
                progress(sink, format!("phase=Store; removing {id}"));
                self.storage.remove_dataset(id)?;
                self.indices.clear(id);
            }
            None => {
                progress(sink, "phase=Store; clearing project store".to_string());
                for descriptor in self.storage.list_datasets()? {
                    self.indices.clear(&descriptor.id);
                }
                self.storage.clear_project()?;
            }
        }
        Ok(ClearResult {
            cleared: true,
            dataset: id.cloned(),
        })
    }
}

fn lists_result(id: &DatasetId, selections: &DatasetSelections, session: &SelectionSession) -> ListsResult {
    ListsResult {
        dataset: id.clone(),
        lists: session
            .lists()
            .map(|list| SearchListEntry {
                active: session.is_active(list.id),
                list: list.clone(),
            })
            .collect(),
        filtered_protein_ids: session
            .filtered_protein_ids(&selections.selections)
            .into_iter()
            .collect(),
    }
}

fn read_table(path: &Path) -> Result<String, KiraError> {
    fs::read_to_string(path)
        .map_err(|err| KiraError::Filesystem(format!("read {}: {err}", path.display())))
}
