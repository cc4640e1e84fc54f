//! Tab-delimited parsing of the raw (per-sample intensity) and processed
//! (differential expression) tables.
//!
//! Both parsers are total: a header without the primary id column, short rows
//! and unparseable numbers degrade to fewer rows or `None` fields, never to an
//! error.

use tracing::{debug, warn};

use crate::config::{ColumnMapping, TransformOptions};
use crate::domain::{ProcessedRecord, RawSample};

/// Comparison label used when the table carries no comparison column.
pub const DEFAULT_COMPARISON: &str = "1";

/// `log2(x)` for strictly positive input.
pub fn log2_positive(value: f64) -> Option<f64> {
    (value > 0.0).then(|| value.log2())
}

/// `-log10(p)` for strictly positive input.
pub fn neg_log10_positive(value: f64) -> Option<f64> {
    (value > 0.0).then(|| -value.log10())
}

fn parse_number(cell: &str) -> Option<f64> {
    cell.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

struct Header<'a> {
    cells: Vec<&'a str>,
}

impl<'a> Header<'a> {
    /// Spreadsheet exports may lead with a UTF-8 byte order mark.
    fn new(line: &'a str) -> Self {
        Self {
            cells: line
                .trim_start_matches('\u{feff}')
                .split('\t')
                .map(|cell| cell.trim_end_matches('\r'))
                .collect(),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.cells.iter().position(|cell| *cell == name)
    }

    /// Looks up an optional role, warning when it is mapped but absent.
    fn optional(&self, role: &str, name: Option<&str>) -> Option<usize> {
        let name = name?;
        let position = self.position(name);
        if position.is_none() {
            warn!(role, column = name, "mapped column missing from header");
        }
        position
    }
}

fn rows(text: &str) -> impl Iterator<Item = Vec<&str>> {
    text.lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split('\t').collect())
}

/// Parses the processed table into one record per data row.
pub fn parse_processed(
    text: &str,
    columns: &ColumnMapping,
    transforms: TransformOptions,
) -> Vec<ProcessedRecord> {
    let Some(header_line) = text.lines().next() else {
        return Vec::new();
    };
    let header = Header::new(header_line);
    let Some(id_col) = header.position(&columns.primary_id) else {
        warn!(column = %columns.primary_id, "primary id column not found; no usable data");
        return Vec::new();
    };
    let gene_col = header.optional("gene_names", columns.gene_names.as_deref());
    let fc_col = header.optional("fold_change", columns.fold_change.as_deref());
    let sig_col = header.optional("significance", columns.significance.as_deref());
    let cmp_col = header.optional("comparison", columns.comparison.as_deref());

    let max_col = [Some(id_col), gene_col, fc_col, sig_col, cmp_col]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(id_col);

    let mut skipped = 0usize;
    let mut records = Vec::new();
    for cells in rows(text) {
        if cells.len() <= max_col {
            skipped += 1;
            continue;
        }
        let primary_id = cells[id_col].trim();
        if primary_id.is_empty() {
            skipped += 1;
            continue;
        }

        let gene_names = gene_col
            .map(|col| cells[col].trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let mut fold_change = fc_col.and_then(|col| parse_number(cells[col]));
        if transforms.log2_fold_change {
            fold_change = fold_change.and_then(log2_positive);
        }
        if transforms.reverse_fold_change {
            fold_change = fold_change.map(|value| -value);
        }

        let mut significance = sig_col.and_then(|col| parse_number(cells[col]));
        if transforms.neg_log10_significance {
            significance = significance.and_then(neg_log10_positive);
        }

        let comparison = cmp_col
            .map(|col| cells[col].trim())
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_COMPARISON)
            .to_string();

        records.push(ProcessedRecord {
            primary_id: primary_id.to_string(),
            gene_names,
            fold_change,
            significance,
            comparison,
        });
    }

    debug!(rows = records.len(), skipped, "parsed processed table");
    records
}

/// Parses the raw table into one sample value per (row, sample column).
pub fn parse_raw(text: &str, columns: &ColumnMapping, transforms: TransformOptions) -> Vec<RawSample> {
    let Some(header_line) = text.lines().next() else {
        return Vec::new();
    };
    let header = Header::new(header_line);
    let Some(id_col) = header.position(columns.raw_primary_id()) else {
        warn!(column = columns.raw_primary_id(), "raw primary id column not found; no usable data");
        return Vec::new();
    };

    let samples = columns
        .samples
        .iter()
        .filter_map(|name| match header.position(name) {
            Some(col) => Some((name.as_str(), col)),
            None => {
                warn!(sample = %name, "sample column missing from raw header");
                None
            }
        })
        .collect::<Vec<_>>();
    let max_col = samples
        .iter()
        .map(|(_, col)| *col)
        .chain(std::iter::once(id_col))
        .max()
        .unwrap_or(id_col);

    let mut out = Vec::new();
    for cells in rows(text) {
        if cells.len() <= max_col {
            continue;
        }
        let primary_id = cells[id_col].trim();
        if primary_id.is_empty() {
            continue;
        }
        for (name, col) in &samples {
            let mut value = parse_number(cells[*col]);
            if transforms.log2_raw {
                value = value.and_then(log2_positive);
            }
            out.push(RawSample {
                primary_id: primary_id.to_string(),
                sample_name: name.to_string(),
                value,
            });
        }
    }

    debug!(cells = out.len(), samples = samples.len(), "parsed raw table");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> ColumnMapping {
        ColumnMapping {
            primary_id: "Index".to_string(),
            raw_primary_id: None,
            gene_names: Some("Gene".to_string()),
            fold_change: Some("logFC".to_string()),
            significance: Some("p".to_string()),
            comparison: Some("Comparison".to_string()),
            samples: vec!["S1".to_string(), "S2".to_string()],
        }
    }

    #[test]
    fn parses_processed_rows() {
        let text = "Index\tGene\tlogFC\tp\tComparison\n\
                    P1;P2\tGENE1;G1\t1.5\t0.01\tA\n\
                    P3\t\tNA\t0.2\t\n";
        let records = parse_processed(text, &mapping(), TransformOptions::default());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].primary_id, "P1;P2");
        assert_eq!(records[0].gene_names.as_deref(), Some("GENE1;G1"));
        assert_eq!(records[0].fold_change, Some(1.5));
        assert_eq!(records[0].comparison, "A");
        assert_eq!(records[1].gene_names, None);
        assert_eq!(records[1].fold_change, None);
        assert_eq!(records[1].comparison, DEFAULT_COMPARISON);
    }

    #[test]
    fn header_byte_order_mark_is_ignored() {
        let text = "\u{feff}Index\tGene\tlogFC\tp\tComparison\nP1\tG1\t1.0\t0.5\tA\n";
        let records = parse_processed(text, &mapping(), TransformOptions::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].primary_id, "P1");

        let raw = "\u{feff}Index\tS1\nP1\t8\n";
        let samples = parse_raw(raw, &mapping(), TransformOptions::default());
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].primary_id, "P1");
    }

    #[test]
    fn missing_primary_column_yields_nothing() {
        let text = "Accession\tlogFC\nP1\t1.0\n";
        assert!(parse_processed(text, &mapping(), TransformOptions::default()).is_empty());
        assert!(parse_raw(text, &mapping(), TransformOptions::default()).is_empty());
    }

    #[test]
    fn short_rows_are_skipped() {
        let text = "Index\tGene\tlogFC\tp\tComparison\nP1\tG\t1.0\nP2\tG\t1.0\t0.5\tA\n";
        let records = parse_processed(text, &mapping(), TransformOptions::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].primary_id, "P2");
    }

    #[test]
    fn transforms_guard_non_positive_input() {
        let text = "Index\tGene\tlogFC\tp\tComparison\n\
                    P1\tG\t4\t0.001\t1\n\
                    P2\tG\t0\t0\t1\n\
                    P3\tG\t-2\t1\t1\r\n";
        let transforms = TransformOptions {
            log2_fold_change: true,
            neg_log10_significance: true,
            reverse_fold_change: true,
            log2_raw: false,
        };
        let records = parse_processed(text, &mapping(), transforms);
        assert_eq!(records[0].fold_change, Some(-2.0));
        assert!((records[0].significance.unwrap() - 3.0).abs() < 1e-9);
        assert_eq!(records[1].fold_change, None);
        assert_eq!(records[1].significance, None);
        assert_eq!(records[2].fold_change, None);
        assert_eq!(records[2].significance, Some(0.0));
        assert_eq!(records[2].comparison, "1");
    }

    #[test]
    fn parses_raw_samples() {
        let text = "Index\tS1\tS2\tS3\nP1\t8\t-1\t5\nP2\tx\t16\t5\n";
        let transforms = TransformOptions {
            log2_raw: true,
            ..TransformOptions::default()
        };
        let samples = parse_raw(text, &mapping(), transforms);
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].sample_name, "S1");
        assert_eq!(samples[0].value, Some(3.0));
        assert_eq!(samples[1].value, None);
        assert_eq!(samples[2].value, None);
        assert_eq!(samples[3].value, Some(4.0));
    }
}
