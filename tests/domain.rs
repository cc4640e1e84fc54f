use assert_matches::assert_matches;

use kira_proteomics_explorer::domain::{
    DatasetId, HexColor, MatchType, ProcessedRecord, SearchType, split_tokens,
};
use kira_proteomics_explorer::error::KiraError;

#[test]
fn dataset_id_serializes_as_string() {
    let id: DatasetId = "lfq-1".parse().unwrap();
    assert_eq!(serde_json::to_string(&id).unwrap(), "\"lfq-1\"");
    let back: DatasetId = serde_json::from_str("\"lfq-1\"").unwrap();
    assert_eq!(back, id);
    assert!(serde_json::from_str::<DatasetId>("\"a/b\"").is_err());
}

#[test]
fn dataset_id_rejects_hidden_names() {
    assert_matches!(".kira".parse::<DatasetId>(), Err(KiraError::InvalidDatasetId(_)));
    assert_matches!("a b".parse::<DatasetId>(), Err(KiraError::InvalidDatasetId(_)));
}

#[test]
fn hex_color_accepts_alpha() {
    let color: HexColor = "#AABBCCDD".parse().unwrap();
    assert_eq!(color.to_string(), "#aabbccdd");
    assert_matches!("#abcd".parse::<HexColor>(), Err(KiraError::InvalidColor(_)));
}

#[test]
fn search_and_match_types_serialize() {
    assert_eq!(
        serde_json::to_string(&SearchType::GeneName).unwrap(),
        "\"GENE_NAME\""
    );
    assert_eq!(SearchType::AccessionId.to_string(), "ACCESSION_ID");
    assert_eq!(serde_json::to_string(&MatchType::Fuzzy).unwrap(), "\"fuzzy\"");
}

#[test]
fn record_accessions_split_composite_ids() {
    let record = ProcessedRecord {
        primary_id: "P04637; P04637-2;".to_string(),
        gene_names: Some("TP53".to_string()),
        fold_change: Some(1.0),
        significance: None,
        comparison: "1".to_string(),
    };
    assert_eq!(record.accessions().collect::<Vec<_>>(), vec!["P04637", "P04637-2"]);
    assert_eq!(split_tokens(";;").count(), 0);
}
