use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

/// Identifier of an imported dataset. Used as a directory name by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && !normalized.starts_with('.')
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(KiraError::InvalidDatasetId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for DatasetId {
    type Error = KiraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatasetId> for String {
    fn from(value: DatasetId) -> Self {
        value.0
    }
}

/// `#rgb`, `#rrggbb` or `#rrggbbaa`, stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexColor(String);

impl HexColor {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// For compile-time palette constants that are known to be valid.
    pub(crate) fn from_trusted(value: &str) -> Self {
        Self(value.to_ascii_lowercase())
    }
}

impl fmt::Display for HexColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HexColor {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        let digits = normalized.strip_prefix('#').unwrap_or("");
        let is_valid = matches!(digits.len(), 3 | 6 | 8)
            && digits.chars().all(|ch| ch.is_ascii_hexdigit());
        if !is_valid {
            return Err(KiraError::InvalidColor(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for HexColor {
    type Error = KiraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HexColor> for String {
    fn from(value: HexColor) -> Self {
        value.0
    }
}

/// Which alias table a query is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchType {
    PrimaryId,
    GeneName,
    AccessionId,
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchType::PrimaryId => write!(f, "PRIMARY_ID"),
            SearchType::GeneName => write!(f, "GENE_NAME"),
            SearchType::AccessionId => write!(f, "ACCESSION_ID"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Pattern,
}

/// One row of the processed (differential expression) table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub primary_id: String,
    pub gene_names: Option<String>,
    pub fold_change: Option<f64>,
    pub significance: Option<f64>,
    pub comparison: String,
}

impl ProcessedRecord {
    /// Trimmed, non-empty accessions making up the composite primary id.
    pub fn accessions(&self) -> impl Iterator<Item = &str> {
        split_tokens(&self.primary_id)
    }
}

/// One intensity cell of the raw table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub primary_id: String,
    pub sample_name: String,
    pub value: Option<f64>,
}

/// Splits a semicolon-joined composite into trimmed, non-empty tokens.
pub fn split_tokens(value: &str) -> impl Iterator<Item = &str> {
    value.split(';').map(str::trim).filter(|token| !token.is_empty())
}
