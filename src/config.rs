use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::{DatasetId, HexColor};
use crate::error::KiraError;
use crate::volcano::{AxisOverrides, VolcanoSettings};

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
    #[serde(default)]
    pub volcano: Option<VolcanoConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DatasetEntry {
    Shorthand(String),
    Detailed(DatasetEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatasetEntryObject {
    pub id: String,
    #[serde(default)]
    pub raw: Option<PathBuf>,
    #[serde(default)]
    pub processed: Option<PathBuf>,
    #[serde(default)]
    pub columns: Option<ColumnMapping>,
    #[serde(default)]
    pub transforms: Option<TransformOptions>,
    #[serde(default)]
    pub extra: BTreeMap<String, GenericExtraField>,
}

/// Names of the columns holding each role in the raw and processed tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub primary_id: String,
    /// Primary id column of the raw table when it differs from the processed one.
    #[serde(default)]
    pub raw_primary_id: Option<String>,
    #[serde(default)]
    pub gene_names: Option<String>,
    #[serde(default)]
    pub fold_change: Option<String>,
    #[serde(default)]
    pub significance: Option<String>,
    #[serde(default)]
    pub comparison: Option<String>,
    #[serde(default)]
    pub samples: Vec<String>,
}

impl ColumnMapping {
    pub fn raw_primary_id(&self) -> &str {
        self.raw_primary_id.as_deref().unwrap_or(&self.primary_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOptions {
    #[serde(default)]
    pub log2_fold_change: bool,
    #[serde(default)]
    pub neg_log10_significance: bool,
    #[serde(default)]
    pub reverse_fold_change: bool,
    #[serde(default)]
    pub log2_raw: bool,
}

/// Loosely typed dataset metadata. Only lives at the import boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GenericExtraField {
    Number(f64),
    Text(String),
    List(Vec<GenericExtraField>),
    Map(BTreeMap<String, GenericExtraField>),
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct VolcanoConfig {
    #[serde(default)]
    pub p_cutoff: Option<f64>,
    #[serde(default)]
    pub fc_cutoff: Option<f64>,
    #[serde(default)]
    pub grey_background: Option<bool>,
    #[serde(default)]
    pub background_cap: Option<usize>,
    #[serde(default)]
    pub palette: Option<Vec<HexColor>>,
    #[serde(default)]
    pub colors: BTreeMap<String, HexColor>,
    #[serde(default)]
    pub axis: AxisOverrides,
    #[serde(default)]
    pub sample_seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DatasetSource {
    pub raw: PathBuf,
    pub processed: PathBuf,
    pub columns: ColumnMapping,
    pub transforms: TransformOptions,
}

#[derive(Debug, Clone)]
pub struct DatasetRequest {
    pub id: DatasetId,
    pub source: Option<DatasetSource>,
    pub extra: BTreeMap<String, GenericExtraField>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub datasets: Vec<DatasetRequest>,
    pub volcano: VolcanoSettings,
}

impl ResolvedConfig {
    pub fn dataset(&self, id: &DatasetId) -> Option<&DatasetRequest> {
        self.datasets.iter().find(|request| &request.id == id)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("kira-px.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(KiraError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        let base = config_path
            .parent()
            .map(|parent| parent.to_path_buf())
            .unwrap_or_default();
        let mut resolved = Self::resolve_config(config)?;
        for request in &mut resolved.datasets {
            if let Some(source) = request.source.as_mut() {
                source.raw = base.join(&source.raw);
                source.processed = base.join(&source.processed);
            }
        }
        Ok(resolved)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let datasets = config
            .datasets
            .into_iter()
            .map(|entry| match entry {
                DatasetEntry::Shorthand(value) => Ok(DatasetRequest {
                    id: value.parse()?,
                    source: None,
                    extra: BTreeMap::new(),
                }),
                DatasetEntry::Detailed(obj) => {
                    let source = match (obj.raw, obj.processed, obj.columns) {
                        (Some(raw), Some(processed), Some(columns)) => Some(DatasetSource {
                            raw,
                            processed,
                            columns,
                            transforms: obj.transforms.unwrap_or_default(),
                        }),
                        (None, None, _) => None,
                        _ => {
                            return Err(KiraError::ConfigParse(format!(
                                "dataset {} needs raw, processed and columns together",
                                obj.id
                            )));
                        }
                    };
                    Ok(DatasetRequest {
                        id: obj.id.parse()?,
                        source,
                        extra: obj.extra,
                    })
                }
            })
            .collect::<Result<Vec<_>, KiraError>>()?;

        let volcano = config.volcano.unwrap_or_default().into_settings();

        Ok(ResolvedConfig {
            schema_version,
            datasets,
            volcano,
        })
    }
}

impl VolcanoConfig {
    pub fn into_settings(self) -> VolcanoSettings {
        let defaults = VolcanoSettings::default();
        VolcanoSettings {
            p_cutoff: self.p_cutoff.unwrap_or(defaults.p_cutoff),
            fc_cutoff: self.fc_cutoff.unwrap_or(defaults.fc_cutoff),
            grey_background: self.grey_background.unwrap_or(defaults.grey_background),
            background_cap: self.background_cap.unwrap_or(defaults.background_cap),
            palette: self.palette.unwrap_or(defaults.palette),
            color_overrides: self.colors,
            axis: self.axis,
            sample_seed: self.sample_seed,
            transforms: defaults.transforms,
        }
    }
}
