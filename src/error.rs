use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid dataset id: {0}")]
    InvalidDatasetId(String),

    #[error("invalid hex color: {0}")]
    InvalidColor(String),

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("alias index not built for dataset {0}")]
    #[diagnostic(help("build the index (kira-px index build <dataset>) before searching"))]
    IndexNotBuilt(String),

    #[error("search list not found: {0}")]
    SearchListNotFound(Uuid),

    #[error("selection name already in use: {0}")]
    SelectionNameTaken(String),

    #[error("invalid selection map: {0}")]
    InvalidSelectionMap(String),

    #[error("missing config file kira-px.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("uniprot request failed: {0}")]
    UniprotHttp(String),

    #[error("uniprot returned status {status}: {message}")]
    UniprotStatus { status: u16, message: String },
}
