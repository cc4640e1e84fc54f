use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use uuid::Uuid;

use kira_proteomics_explorer::annotation::{AnnotationClient, ProteinAnnotation};
use kira_proteomics_explorer::app::{App, ListEdit};
use kira_proteomics_explorer::config::{ColumnMapping, DatasetSource, TransformOptions};
use kira_proteomics_explorer::domain::{DatasetId, MatchType, SearchType};
use kira_proteomics_explorer::error::KiraError;
use kira_proteomics_explorer::output::JsonOutput;
use kira_proteomics_explorer::search::GroupStatus;
use kira_proteomics_explorer::store::{DatasetStorage, FsStorage, Store};
use kira_proteomics_explorer::volcano::VolcanoSettings;

const PROCESSED: &str = "Index\tGene\tlog2FC\tp.value\tComparison\n\
P12345;P12345-2\tAKT1\t1.2\t0.01\tKO\n\
Q99999\tTP53;P53\t0.1\t0.2\tKO\n\
O11111-3\t\t-2.0\t0.001\tKO\n";

const RAW: &str = "Index\tS1\tS2\n\
P12345;P12345-2\t100\t200\n\
Q99999\t50\tNaN\n";

#[derive(Default)]
struct MockAnnotation {
    calls: Mutex<usize>,
}

impl AnnotationClient for MockAnnotation {
    fn fetch_annotation(&self, accession: &str) -> Result<Option<ProteinAnnotation>, KiraError> {
        *self.calls.lock().unwrap() += 1;
        Ok((accession == "O11111-3").then(|| ProteinAnnotation {
            accession: "O11111-3".to_string(),
            gene_names: vec!["MAPK1".to_string(), "ERK2".to_string()],
            protein_name: Some("Mitogen-activated protein kinase 1".to_string()),
            organism: Some("Homo sapiens".to_string()),
        }))
    }
}

fn columns() -> ColumnMapping {
    ColumnMapping {
        primary_id: "Index".to_string(),
        raw_primary_id: None,
        gene_names: Some("Gene".to_string()),
        fold_change: Some("log2FC".to_string()),
        significance: Some("p.value".to_string()),
        comparison: Some("Comparison".to_string()),
        samples: vec!["S1".to_string(), "S2".to_string()],
    }
}

fn source(dir: &Path) -> DatasetSource {
    let raw = dir.join("raw.tsv");
    let processed = dir.join("processed.tsv");
    fs::write(&raw, RAW).unwrap();
    fs::write(&processed, PROCESSED).unwrap();
    DatasetSource {
        raw,
        processed,
        columns: columns(),
        transforms: TransformOptions {
            neg_log10_significance: true,
            ..TransformOptions::default()
        },
    }
}

fn app(dir: &Path) -> App<MockAnnotation> {
    let project_root = Utf8PathBuf::from_path_buf(dir.join("project")).unwrap();
    let cache_root = Utf8PathBuf::from_path_buf(dir.join("cache")).unwrap();
    let store = Store::new_with_paths(project_root, cache_root);
    App::new(FsStorage::new(store), MockAnnotation::default())
}

fn dataset() -> DatasetId {
    "lfq-1".parse().unwrap()
}

fn imported(dir: &Path, build_index: bool) -> App<MockAnnotation> {
    let app = app(dir);
    app.import(&dataset(), &source(dir), BTreeMap::new(), build_index, &JsonOutput)
        .unwrap();
    app
}

#[test]
fn import_parses_and_indexes() {
    let temp = tempfile::tempdir().unwrap();
    let app = app(temp.path());
    let result = app
        .import(&dataset(), &source(temp.path()), BTreeMap::new(), true, &JsonOutput)
        .unwrap();

    assert_eq!(result.processed_rows, 3);
    assert_eq!(result.raw_samples, 4);
    assert_eq!(result.indexed_proteins, Some(3));

    let samples = app.storage().get_all_raw_samples(&dataset()).unwrap();
    assert!(samples.iter().any(|s| s.sample_name == "S2" && s.value.is_none()));

    let list = app.list(&JsonOutput).unwrap();
    assert_eq!(list.datasets.len(), 1);
    assert_eq!(list.datasets[0].id, dataset());
}

#[test]
fn search_requires_an_index() {
    let temp = tempfile::tempdir().unwrap();
    let app = imported(temp.path(), false);
    let terms = vec!["P12345".to_string()];

    assert_matches!(
        app.search(&dataset(), &terms, SearchType::PrimaryId, false, &JsonOutput),
        Err(KiraError::IndexNotBuilt(_))
    );

    app.build_index(&dataset(), false, &JsonOutput).unwrap();
    let response = app
        .search(&dataset(), &terms, SearchType::PrimaryId, false, &JsonOutput)
        .unwrap();
    assert_eq!(response.outcome.protein_ids(), vec!["P12345;P12345-2"]);
}

#[test]
fn persisted_index_survives_restart() {
    let temp = tempfile::tempdir().unwrap();
    imported(temp.path(), true);

    let fresh = app(temp.path());
    let terms = vec!["q99999".to_string()];
    let response = fresh
        .search(&dataset(), &terms, SearchType::PrimaryId, false, &JsonOutput)
        .unwrap();
    assert_eq!(response.outcome.protein_ids(), vec!["Q99999"]);
}

#[test]
fn unknown_dataset_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let app = app(temp.path());
    let missing: DatasetId = "nope".parse().unwrap();
    assert_matches!(app.info(&missing, &JsonOutput), Err(KiraError::DatasetNotFound(_)));
    assert_matches!(
        app.volcano(&missing, &VolcanoSettings::default(), &JsonOutput),
        Err(KiraError::DatasetNotFound(_))
    );
}

#[test]
fn batch_search_exact_then_fuzzy() {
    let temp = tempfile::tempdir().unwrap();
    let app = imported(temp.path(), true);
    let terms = vec!["p12345-2;nope\nO11111".to_string(), "missing".to_string()];
    let response = app
        .search(&dataset(), &terms, SearchType::PrimaryId, false, &JsonOutput)
        .unwrap();
    let outcome = &response.outcome;

    assert_eq!(outcome.groups.len(), 3);
    assert_eq!(outcome.matches["P12345-2;NOPE"][0].primary_id, "P12345;P12345-2");
    assert_eq!(outcome.matches["O11111"][0].match_type, MatchType::Fuzzy);
    assert_eq!(outcome.status("MISSING"), GroupStatus::Unmatched);
    assert_eq!(outcome.status("OTHER"), GroupStatus::NotRequested);
    assert_eq!(outcome.statistics.unmatched_terms, vec!["MISSING"]);
    assert_eq!(outcome.statistics.total_proteins, 3);
    assert_eq!(response.labels["P12345;P12345-2"], "AKT1");
}

#[test]
fn regex_search_swallows_bad_patterns() {
    let temp = tempfile::tempdir().unwrap();
    let app = imported(temp.path(), true);
    let terms = vec!["^tp5".to_string(), "(".to_string()];
    let response = app
        .search(&dataset(), &terms, SearchType::GeneName, true, &JsonOutput)
        .unwrap();
    assert_eq!(response.outcome.protein_ids(), vec!["Q99999"]);
    assert_eq!(response.outcome.statistics.unmatched_terms, vec!["("]);
}

#[test]
fn annotations_enable_two_hop_gene_search() {
    let temp = tempfile::tempdir().unwrap();
    let app = imported(temp.path(), true);
    let terms = vec!["ERK2".to_string()];

    let before = app
        .search(&dataset(), &terms, SearchType::GeneName, false, &JsonOutput)
        .unwrap();
    assert!(before.outcome.matches.is_empty());

    let annotated = app.annotate(&dataset(), &JsonOutput).unwrap();
    assert_eq!(annotated.annotated, 1);

    let after = app
        .search(&dataset(), &terms, SearchType::GeneName, false, &JsonOutput)
        .unwrap();
    assert_eq!(after.outcome.protein_ids(), vec!["O11111-3"]);
    assert_eq!(after.labels["O11111-3"], "MAPK1");

    let volcano = app
        .volcano(&dataset(), &VolcanoSettings::default(), &JsonOutput)
        .unwrap();
    let point = volcano
        .points
        .iter()
        .find(|point| point.protein_id == "O11111-3")
        .unwrap();
    assert_eq!(point.gene_name, "MAPK1");
}

#[test]
fn suggestions_need_two_characters() {
    let temp = tempfile::tempdir().unwrap();
    let app = imported(temp.path(), true);
    assert!(
        app.suggest(&dataset(), "t", SearchType::GeneName, 10)
            .unwrap()
            .suggestions
            .is_empty()
    );
    let result = app.suggest(&dataset(), "p5", SearchType::GeneName, 10).unwrap();
    assert_eq!(result.suggestions.len(), 1);
    assert_eq!(result.suggestions[0].value, "TP53");
}

#[test]
fn volcano_classifies_and_caches() {
    let temp = tempfile::tempdir().unwrap();
    let app = imported(temp.path(), true);
    let settings = VolcanoSettings {
        sample_seed: Some(1),
        ..VolcanoSettings::default()
    };
    let payload = app.volcano(&dataset(), &settings, &JsonOutput).unwrap();

    assert_eq!(payload.points.len(), 3);
    assert_eq!(payload.points[0].selections, vec!["P-value <= 0.05; FC > 0.6 (KO)"]);
    assert_eq!(payload.points[1].selections, vec!["P-value > 0.05; FC <= 0.6 (KO)"]);
    assert_eq!(payload.points[0].gene_name, "AKT1");
    assert_eq!(payload.axis.min_x, -3.0);

    let cached = app
        .storage()
        .get_volcano_point_cache(&dataset())
        .unwrap()
        .unwrap();
    assert_eq!(cached.points.len(), payload.points.len());
    assert_eq!(cached.color_map, payload.color_map);
    assert_eq!(cached.total_points, 3);
}

#[test]
fn select_persists_search_list() {
    let temp = tempfile::tempdir().unwrap();
    let app = imported(temp.path(), true);
    let terms = vec!["AKT1".to_string(), "TP53".to_string()];
    let result = app
        .select(
            &dataset(),
            "Favourites",
            &terms,
            SearchType::GeneName,
            None,
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(result.list.protein_ids.len(), 2);

    let selections = app.storage().get_canonical_selection_map(&dataset()).unwrap();
    assert!(selections.contains("Q99999", "Favourites"));

    let payload = app
        .volcano(&dataset(), &VolcanoSettings::default(), &JsonOutput)
        .unwrap();
    assert_eq!(payload.points[0].selections, vec!["Favourites"]);
    assert_eq!(payload.color_map["Favourites"], result.list.color);

    let lists = app.lists(&dataset()).unwrap();
    assert_eq!(lists.filtered_protein_ids.len(), 2);
    assert!(lists.lists[0].active);

    let list_id = result.list.id;
    let renamed = app
        .edit_list(&dataset(), ListEdit::Rename(list_id, "Hits".to_string()))
        .unwrap();
    assert_eq!(renamed.lists[0].list.name, "Hits");
    let toggled = app
        .edit_list(&dataset(), ListEdit::ToggleFilter(list_id))
        .unwrap();
    assert!(toggled.filtered_protein_ids.is_empty());

    app.edit_list(&dataset(), ListEdit::Remove(list_id)).unwrap();
    assert!(
        app.storage()
            .get_canonical_selection_map(&dataset())
            .unwrap()
            .is_empty()
    );
    assert_matches!(
        app.edit_list(&dataset(), ListEdit::ToggleFilter(list_id)),
        Err(KiraError::SearchListNotFound(id)) if id == list_id
    );
}

#[test]
fn index_build_keeps_existing_unless_forced() {
    let temp = tempfile::tempdir().unwrap();
    let app = imported(temp.path(), true);
    let kept = app.build_index(&dataset(), false, &JsonOutput).unwrap();
    assert_eq!(kept.proteins, 3);

    let rebuilt = app.build_index(&dataset(), true, &JsonOutput).unwrap();
    assert_eq!(rebuilt.proteins, 3);
    assert_eq!(rebuilt.split_id_keys, kept.split_id_keys);
    assert!(app.storage().get_alias_index(&dataset()).unwrap().is_some());
}

fn select(app: &App<MockAnnotation>, name: &str, term: &str) -> Uuid {
    let terms = vec![term.to_string()];
    app.select(&dataset(), name, &terms, SearchType::GeneName, None, &JsonOutput)
        .unwrap()
        .list
        .id
}

#[test]
fn rename_to_a_used_name_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let app = imported(temp.path(), true);
    let first = select(&app, "Kinases", "AKT1");
    select(&app, "Suppressors", "TP53");

    assert_matches!(
        app.edit_list(&dataset(), ListEdit::Rename(first, "Suppressors".to_string())),
        Err(KiraError::SelectionNameTaken(name)) if name == "Suppressors"
    );
    let selections = app.storage().get_canonical_selection_map(&dataset()).unwrap();
    assert!(selections.contains("P12345;P12345-2", "Kinases"));
    assert!(!selections.contains("P12345;P12345-2", "Suppressors"));
}

#[test]
fn filters_can_be_replaced_and_cleared() {
    let temp = tempfile::tempdir().unwrap();
    let app = imported(temp.path(), true);
    let first = select(&app, "Kinases", "AKT1");
    let second = select(&app, "Suppressors", "TP53");

    let result = app
        .edit_list(
            &dataset(),
            ListEdit::SetFilters {
                lists: vec![second],
                stored: Vec::new(),
            },
        )
        .unwrap();
    assert_eq!(result.filtered_protein_ids, vec!["Q99999"]);

    assert_matches!(
        app.edit_list(
            &dataset(),
            ListEdit::SetFilters {
                lists: vec![first, Uuid::new_v4()],
                stored: Vec::new(),
            },
        ),
        Err(KiraError::SearchListNotFound(_))
    );
    assert_eq!(app.lists(&dataset()).unwrap().filtered_protein_ids, vec!["Q99999"]);

    let cleared = app.edit_list(&dataset(), ListEdit::Clear).unwrap();
    assert!(cleared.lists.is_empty());
    assert!(cleared.filtered_protein_ids.is_empty());
    assert!(
        app.storage()
            .get_canonical_selection_map(&dataset())
            .unwrap()
            .is_empty()
    );
}

#[test]
fn selections_export_and_import() {
    let temp = tempfile::tempdir().unwrap();
    let app = imported(temp.path(), true);
    select(&app, "Favourites", "AKT1");

    let exported = app.export_selections(&dataset()).unwrap();
    assert!(exported.contains("P12345;P12345-2", "Favourites"));
    assert_eq!(exported.len(), 1);

    let file = temp.path().join("selections.json");
    fs::write(
        &file,
        r#"{"Q99999": {"Favourites": true}, "P12345;P12345-2": {"Stored": true, "x": false}}"#,
    )
    .unwrap();
    let result = app.import_selections(&dataset(), &file).unwrap();
    assert_eq!(result.lists.len(), 1);
    assert_eq!(
        result.lists[0]
            .list
            .protein_ids
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>(),
        vec!["P12345;P12345-2", "Q99999"]
    );

    let selections = app.storage().get_canonical_selection_map(&dataset()).unwrap();
    assert!(selections.contains("P12345;P12345-2", "Stored"));
    assert!(!selections.contains("P12345;P12345-2", "x"));
    assert!(selections.contains("Q99999", "Favourites"));

    fs::write(&file, "not json").unwrap();
    assert_matches!(
        app.import_selections(&dataset(), &file),
        Err(KiraError::InvalidSelectionMap(_))
    );
}

#[test]
fn clear_removes_datasets() {
    let temp = tempfile::tempdir().unwrap();
    let app = imported(temp.path(), true);
    let info = app.info(&dataset(), &JsonOutput).unwrap();
    assert!(info.indexed);

    app.clear(Some(&dataset()), &JsonOutput).unwrap();
    assert!(app.list(&JsonOutput).unwrap().datasets.is_empty());
    assert_matches!(
        app.clear(Some(&dataset()), &JsonOutput),
        Err(KiraError::DatasetNotFound(_))
    );
    let cleared = app.clear(None, &JsonOutput).unwrap();
    assert!(cleared.cleared);
}
