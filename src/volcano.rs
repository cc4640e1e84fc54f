//! Volcano-plot payload construction.
//!
//! One call to [`VolcanoProcessor::process`] is one pass: ingest and
//! transform records, apply persisted selections, classify the rest by
//! cutoffs, color every group, down-sample the uninteresting background and
//! compute axis bounds. Nothing carries over between passes except what the
//! caller supplies in [`VolcanoSettings`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use rand::SeedableRng;
use rand::rngs::StdRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::annotation::DisplayNames;
use crate::config::TransformOptions;
use crate::domain::{HexColor, ProcessedRecord};
use crate::palette::{ColorAssignment, default_palette};
use crate::selection::SelectionMap;
use crate::tabular::{log2_positive, neg_log10_positive};

pub const BACKGROUND_GROUP: &str = "Background";
pub const BACKGROUND_COLOR: &str = "#a4a2a2";
pub const DEFAULT_BACKGROUND_CAP: usize = 2000;
pub const DEFAULT_AXIS: AxisBounds = AxisBounds {
    min_x: -3.0,
    max_x: 3.0,
    min_y: 0.0,
    max_y: 5.0,
};

/// Last parenthesized suffix of a selection name, e.g. `Hits (KO vs WT)`.
static COMPARISON_SUFFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\(([^)]*)\)[^(]*$").ok());

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisOverrides {
    #[serde(default)]
    pub min_x: Option<f64>,
    #[serde(default)]
    pub max_x: Option<f64>,
    #[serde(default)]
    pub min_y: Option<f64>,
    #[serde(default)]
    pub max_y: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl AxisBounds {
    fn with_overrides(self, overrides: &AxisOverrides) -> Self {
        Self {
            min_x: overrides.min_x.unwrap_or(self.min_x),
            max_x: overrides.max_x.unwrap_or(self.max_x),
            min_y: overrides.min_y.unwrap_or(self.min_y),
            max_y: overrides.max_y.unwrap_or(self.max_y),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VolcanoSettings {
    /// Raw p-value cutoff; compared against `-log10` significance.
    pub p_cutoff: f64,
    /// Absolute fold-change cutoff.
    pub fc_cutoff: f64,
    pub grey_background: bool,
    pub background_cap: usize,
    pub palette: Vec<HexColor>,
    pub color_overrides: BTreeMap<String, HexColor>,
    pub axis: AxisOverrides,
    pub sample_seed: Option<u64>,
    /// Applied at ingest to records that were parsed untransformed.
    pub transforms: TransformOptions,
}

impl Default for VolcanoSettings {
    fn default() -> Self {
        Self {
            p_cutoff: 0.05,
            fc_cutoff: 0.6,
            grey_background: false,
            background_cap: DEFAULT_BACKGROUND_CAP,
            palette: default_palette(),
            color_overrides: BTreeMap::new(),
            axis: AxisOverrides::default(),
            sample_seed: None,
            transforms: TransformOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolcanoPoint {
    pub protein_id: String,
    pub gene_name: String,
    pub x: f64,
    pub y: f64,
    pub comparison: String,
    /// Parallel to `colors`; the first entry is the primary group.
    pub selections: Vec<String>,
    pub colors: Vec<HexColor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolcanoPayload {
    pub points: Vec<VolcanoPoint>,
    pub color_map: BTreeMap<String, HexColor>,
    pub axis: AxisBounds,
    /// Points that survived ingest, before down-sampling.
    pub total_points: usize,
    /// Records dropped at ingest for a missing or untransformable value.
    pub excluded_records: usize,
    pub background_points: usize,
    pub sampled_background: usize,
}

impl VolcanoPayload {
    fn empty(settings: &VolcanoSettings, excluded_records: usize) -> Self {
        Self {
            points: Vec::new(),
            color_map: settings.color_overrides.clone(),
            axis: DEFAULT_AXIS.with_overrides(&settings.axis),
            total_points: 0,
            excluded_records,
            background_points: 0,
            sampled_background: 0,
        }
    }
}

/// Relation strings used in classification group names.
pub fn classification_group(
    significance: f64,
    fold_change: f64,
    comparison: &str,
    settings: &VolcanoSettings,
) -> (String, bool) {
    let p_ok = significance >= significance_threshold(settings.p_cutoff);
    let fc_ok = fold_change.abs() > settings.fc_cutoff;
    let p_part = if p_ok {
        format!("P-value <= {}", settings.p_cutoff)
    } else {
        format!("P-value > {}", settings.p_cutoff)
    };
    let fc_part = if fc_ok {
        format!("FC > {}", settings.fc_cutoff)
    } else {
        format!("FC <= {}", settings.fc_cutoff)
    };
    (format!("{p_part}; {fc_part} ({comparison})"), p_ok && fc_ok)
}

fn significance_threshold(p_cutoff: f64) -> f64 {
    neg_log10_positive(p_cutoff).unwrap_or(f64::INFINITY)
}

/// Whether a selection applies to a point of the given comparison.
pub fn selection_applies(name: &str, comparison: &str) -> bool {
    match COMPARISON_SUFFIX.as_ref().and_then(|pattern| pattern.captures(name)) {
        Some(captures) => captures.get(1).is_some_and(|m| m.as_str() == comparison),
        None => true,
    }
}

struct Ingested<'r> {
    record: &'r ProcessedRecord,
    x: f64,
    y: f64,
}

struct Classified<'r> {
    ingested: Ingested<'r>,
    groups: Vec<String>,
    highlighted: bool,
}

pub struct VolcanoProcessor<'a> {
    settings: &'a VolcanoSettings,
}

impl<'a> VolcanoProcessor<'a> {
    pub fn new(settings: &'a VolcanoSettings) -> Self {
        Self { settings }
    }

    fn ingest<'r>(&self, record: &'r ProcessedRecord) -> Option<Ingested<'r>> {
        let transforms = self.settings.transforms;
        let mut x = record.fold_change?;
        if transforms.log2_fold_change {
            x = log2_positive(x)?;
        }
        if transforms.reverse_fold_change {
            x = -x;
        }
        let mut y = record.significance?;
        if transforms.neg_log10_significance {
            y = neg_log10_positive(y)?;
        }
        Some(Ingested { record, x, y })
    }

    pub fn process(
        &self,
        records: &[ProcessedRecord],
        selections: &SelectionMap,
        display_names: Option<&DisplayNames>,
    ) -> VolcanoPayload {
        let settings = self.settings;
        let ingested = records
            .iter()
            .filter_map(|record| self.ingest(record))
            .collect::<Vec<_>>();
        let excluded = records.len() - ingested.len();
        if ingested.is_empty() {
            debug!(excluded, "no plottable points");
            return VolcanoPayload::empty(settings, excluded);
        }

        let mut assignment = ColorAssignment::new(settings.palette.clone(), &settings.color_overrides);
        assignment.assign_all(selections.selection_names());

        let mut fallback_groups = BTreeSet::new();
        let classified = ingested
            .into_iter()
            .map(|ingested| {
                let record = ingested.record;
                let applied = selections
                    .selections_of(&record.primary_id)
                    .filter(|name| assignment.contains(name))
                    .filter(|name| selection_applies(name, &record.comparison))
                    .map(str::to_string)
                    .collect::<Vec<_>>();
                if !applied.is_empty() {
                    return Classified {
                        ingested,
                        groups: applied,
                        highlighted: true,
                    };
                }
                let (group, significant) = if settings.grey_background {
                    (BACKGROUND_GROUP.to_string(), false)
                } else {
                    classification_group(ingested.y, ingested.x, &record.comparison, settings)
                };
                fallback_groups.insert(group.clone());
                Classified {
                    ingested,
                    groups: vec![group],
                    highlighted: significant,
                }
            })
            .collect::<Vec<_>>();

        if fallback_groups.remove(BACKGROUND_GROUP) && !assignment.contains(BACKGROUND_GROUP) {
            let mut background = BTreeMap::new();
            background.insert(
                BACKGROUND_GROUP.to_string(),
                HexColor::from_trusted(BACKGROUND_COLOR),
            );
            assignment.pin(&background);
        }
        assignment.assign_all(&fallback_groups);

        let axis = observed_axis(&classified).with_overrides(&settings.axis);
        let total_points = classified.len();
        let (kept, background_points, sampled_background) =
            self.down_sample(classified, settings.background_cap);

        let points = kept
            .into_iter()
            .map(|classified| {
                let record = classified.ingested.record;
                let colors = classified
                    .groups
                    .iter()
                    .map(|group| assignment.assign(group))
                    .collect();
                VolcanoPoint {
                    protein_id: record.primary_id.clone(),
                    gene_name: display_name(record, display_names),
                    x: classified.ingested.x,
                    y: classified.ingested.y,
                    comparison: record.comparison.clone(),
                    selections: classified.groups,
                    colors,
                }
            })
            .collect::<Vec<_>>();

        let color_map = assignment.into_map();
        info!(
            points = points.len(),
            total_points,
            excluded,
            groups = color_map.len(),
            "volcano pass finished"
        );
        VolcanoPayload {
            points,
            color_map,
            axis,
            total_points,
            excluded_records: excluded,
            background_points,
            sampled_background,
        }
    }

    /// Keeps every highlighted point and at most `cap` of the rest, chosen
    /// uniformly at random. Input order is preserved.
    ///
    /// Highlighted means selected, or in the `P-value <= X; FC > Y` group.
    /// Points significant on only one axis keep their palette color but are
    /// sampled as background.
    fn down_sample<'r>(
        &self,
        classified: Vec<Classified<'r>>,
        cap: usize,
    ) -> (Vec<Classified<'r>>, usize, usize) {
        let background = classified
            .iter()
            .enumerate()
            .filter(|(_, point)| !point.highlighted)
            .map(|(position, _)| position)
            .collect::<Vec<_>>();
        let background_points = background.len();
        if background_points <= cap {
            return (classified, background_points, background_points);
        }

        let mut rng = match self.settings.sample_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut keep = vec![true; classified.len()];
        for position in &background {
            keep[*position] = false;
        }
        for picked in rand::seq::index::sample(&mut rng, background_points, cap) {
            keep[background[picked]] = true;
        }
        debug!(background_points, cap, "down-sampled background points");

        let kept = classified
            .into_iter()
            .zip(keep)
            .filter_map(|(point, keep)| keep.then_some(point))
            .collect();
        (kept, background_points, cap)
    }
}

fn observed_axis(points: &[Classified<'_>]) -> AxisBounds {
    let mut min_x = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut max_y = f64::NEG_INFINITY;
    for point in points {
        min_x = min_x.min(point.ingested.x);
        max_x = max_x.max(point.ingested.x);
        max_y = max_y.max(point.ingested.y);
    }
    AxisBounds {
        min_x: min_x - 1.0,
        max_x: max_x + 1.0,
        min_y: 0.0,
        max_y: max_y + 1.0,
    }
}

fn display_name(record: &ProcessedRecord, display_names: Option<&DisplayNames>) -> String {
    display_names
        .and_then(|names| names.get(&record.primary_id))
        .map(str::to_string)
        .or_else(|| record.gene_names.clone())
        .unwrap_or_else(|| record.primary_id.clone())
}
