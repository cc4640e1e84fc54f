//! Query resolution against a built [`AliasIndex`].
//!
//! Every lookup goes through a [`Resolver`], an ordered list of stages that
//! each either produce canonical ids or report themselves exhausted:
//!
//! * exact resolution unions [`Stage::Direct`] and [`Stage::TwoHop`]
//!   (gene name → accession → primary id, only when an [`AccessionIndex`]
//!   is available);
//! * fuzzy resolution takes the first non-exhausted of [`Stage::FuzzyMap`]
//!   and [`Stage::Direct`].
//!
//! Batch search tries the whole input line exactly first and only falls back
//! to fuzzy resolution of its `;`-separated sub-terms when that finds nothing.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use indexmap::IndexMap;
use rayon::prelude::*;
use regex::RegexBuilder;
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{MatchType, SearchType, split_tokens};
use crate::index::{AccessionIndex, AliasIndex};

/// Queries shorter than this never produce suggestions.
pub const MIN_SUGGEST_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    /// The normalized term that produced the hit.
    pub term: String,
    pub primary_id: String,
    pub match_type: MatchType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    pub value: String,
    pub primary_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchGroup {
    /// Full trimmed, uppercased input line.
    pub key: String,
    pub sub_terms: Vec<String>,
    /// Zero-based position among the non-empty input lines.
    pub position: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchStatistics {
    pub total_proteins: usize,
    pub matched_proteins: usize,
    pub unmatched_terms: Vec<String>,
    pub exact_matches: usize,
    pub partial_matches: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Matched,
    Unmatched,
    NotRequested,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub groups: Vec<BatchGroup>,
    /// Only groups with at least one hit, in input order.
    pub matches: IndexMap<String, Vec<SearchResult>>,
    pub statistics: SearchStatistics,
}

impl BatchOutcome {
    pub fn status(&self, key: &str) -> GroupStatus {
        if self.matches.contains_key(key) {
            GroupStatus::Matched
        } else if self.groups.iter().any(|group| group.key == key) {
            GroupStatus::Unmatched
        } else {
            GroupStatus::NotRequested
        }
    }

    /// Distinct matched primary ids in first-seen order.
    pub fn protein_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.matches
            .values()
            .flatten()
            .filter(|result| seen.insert(result.primary_id.as_str()))
            .map(|result| result.primary_id.clone())
            .collect()
    }
}

/// Splits batch input into groups: one per non-empty line, with the line's
/// `;`-separated pieces as fallback sub-terms. Repeated lines collapse into
/// the first occurrence.
pub fn parse_batch_input<S: AsRef<str>>(lines: &[S]) -> Vec<BatchGroup> {
    let joined = lines
        .iter()
        .map(|line| line.as_ref())
        .collect::<Vec<_>>()
        .join("\n")
        .replace('\r', "");

    let mut seen = HashSet::new();
    let mut groups = Vec::new();
    for line in joined.split('\n') {
        let key = line.trim().to_uppercase();
        if key.is_empty() || !seen.insert(key.clone()) {
            continue;
        }
        let sub_terms = split_tokens(&key).map(str::to_string).collect();
        groups.push(BatchGroup {
            key,
            sub_terms,
            position: groups.len(),
        });
    }
    groups
}

/// Trailing isoform (`-2`) or version (`.3`) suffix removed.
pub fn stem(value: &str) -> &str {
    let trimmed = value.trim();
    match trimmed.rfind(['-', '.']) {
        Some(pos)
            if pos > 0
                && pos + 1 < trimmed.len()
                && trimmed[pos + 1..].chars().all(|ch| ch.is_ascii_digit()) =>
        {
            &trimmed[..pos]
        }
        _ => trimmed,
    }
}

/// Secondary alias table for one batch, keyed by the raw sub-term.
///
/// A term matches every alias sharing its isoform/version stem, so
/// `P12345-2` finds a dataset entry listed as `P12345` and vice versa.
#[derive(Debug, Clone, Default)]
pub struct FuzzyMap {
    entries: HashMap<String, BTreeSet<String>>,
}

impl FuzzyMap {
    pub fn build<'t, I>(
        terms: I,
        index: &AliasIndex,
        accessions: Option<&AccessionIndex>,
        search_type: SearchType,
    ) -> Self
    where
        I: IntoIterator<Item = &'t str>,
    {
        let mut by_stem: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (key, primaries) in index.table(search_type) {
            by_stem
                .entry(stem(key).to_uppercase())
                .or_default()
                .extend(primaries.iter().cloned());
        }
        let mut split_by_stem: HashMap<String, BTreeSet<String>> = HashMap::new();
        if search_type == SearchType::GeneName && accessions.is_some() {
            for (key, primaries) in index.table(SearchType::AccessionId) {
                split_by_stem
                    .entry(stem(key).to_uppercase())
                    .or_default()
                    .extend(primaries.iter().cloned());
            }
        }

        let mut entries = HashMap::new();
        for term in terms {
            let mut hits = by_stem
                .get(&stem(term).to_uppercase())
                .cloned()
                .unwrap_or_default();
            if let Some(accessions) = accessions.filter(|_| search_type == SearchType::GeneName) {
                for accession in accessions.accessions_for(term).into_iter().flatten() {
                    if let Some(primaries) = split_by_stem.get(stem(accession)) {
                        hits.extend(primaries.iter().cloned());
                    }
                }
            }
            if !hits.is_empty() {
                entries.insert(term.to_string(), hits);
            }
        }
        Self { entries }
    }

    pub fn get(&self, term: &str) -> Option<&BTreeSet<String>> {
        self.entries.get(term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Key lookup in the alias table of the search type.
    Direct,
    /// Gene name → accession → primary id via the accession index.
    TwoHop,
    /// Stem lookup in the batch's [`FuzzyMap`].
    FuzzyMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Hit(BTreeSet<String>),
    Exhausted,
}

pub struct Resolver<'a> {
    index: &'a AliasIndex,
    accessions: Option<&'a AccessionIndex>,
    fuzzy: Option<&'a FuzzyMap>,
    search_type: SearchType,
}

impl<'a> Resolver<'a> {
    pub const EXACT_STAGES: [Stage; 2] = [Stage::Direct, Stage::TwoHop];
    pub const FUZZY_STAGES: [Stage; 2] = [Stage::FuzzyMap, Stage::Direct];

    pub fn new(
        index: &'a AliasIndex,
        accessions: Option<&'a AccessionIndex>,
        search_type: SearchType,
    ) -> Self {
        Self {
            index,
            accessions,
            fuzzy: None,
            search_type,
        }
    }

    pub fn with_fuzzy_map(mut self, fuzzy: &'a FuzzyMap) -> Self {
        self.fuzzy = Some(fuzzy);
        self
    }

    pub fn run_stage(&self, stage: Stage, term: &str) -> StageOutcome {
        let hits = match stage {
            Stage::Direct => self.index.lookup(self.search_type, term).cloned(),
            Stage::TwoHop => {
                if self.search_type != SearchType::GeneName {
                    return StageOutcome::Exhausted;
                }
                let Some(accessions) = self.accessions else {
                    return StageOutcome::Exhausted;
                };
                let hits = accessions
                    .accessions_for(term)
                    .into_iter()
                    .flatten()
                    .filter_map(|accession| self.index.lookup_split_id(accession))
                    .flatten()
                    .cloned()
                    .collect::<BTreeSet<_>>();
                Some(hits)
            }
            Stage::FuzzyMap => self.fuzzy.and_then(|fuzzy| fuzzy.get(term)).cloned(),
        };
        match hits {
            Some(hits) if !hits.is_empty() => StageOutcome::Hit(hits),
            _ => StageOutcome::Exhausted,
        }
    }

    /// Union of every exact stage.
    pub fn exact(&self, term: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for stage in Self::EXACT_STAGES {
            if let StageOutcome::Hit(hits) = self.run_stage(stage, term) {
                out.extend(hits);
            }
        }
        out
    }

    /// First fuzzy stage that is not exhausted.
    pub fn fuzzy(&self, term: &str) -> Option<(Stage, BTreeSet<String>)> {
        Self::FUZZY_STAGES
            .into_iter()
            .find_map(|stage| match self.run_stage(stage, term) {
                StageOutcome::Hit(hits) => Some((stage, hits)),
                StageOutcome::Exhausted => None,
            })
    }
}

fn results(term: &str, hits: BTreeSet<String>, match_type: MatchType) -> Vec<SearchResult> {
    hits.into_iter()
        .map(|primary_id| SearchResult {
            term: term.to_string(),
            primary_id,
            match_type,
        })
        .collect()
}

pub struct SearchEngine<'a> {
    index: &'a AliasIndex,
    accessions: Option<&'a AccessionIndex>,
}

impl<'a> SearchEngine<'a> {
    pub fn new(index: &'a AliasIndex, accessions: Option<&'a AccessionIndex>) -> Self {
        if accessions.is_none() {
            debug!("no accession index; gene-name search limited to dataset gene column");
        }
        Self { index, accessions }
    }

    fn resolver(&self, search_type: SearchType) -> Resolver<'a> {
        Resolver::new(self.index, self.accessions, search_type)
    }

    pub fn search_single(&self, term: &str, search_type: SearchType) -> Vec<SearchResult> {
        let term = term.trim().to_uppercase();
        if term.is_empty() {
            return Vec::new();
        }
        let hits = self.resolver(search_type).exact(&term);
        results(&term, hits, MatchType::Exact)
    }

    pub fn search_batch<S: AsRef<str>>(
        &self,
        lines: &[S],
        search_type: SearchType,
    ) -> BatchOutcome {
        let start = Instant::now();
        let groups = parse_batch_input(lines);
        let fuzzy = FuzzyMap::build(
            groups
                .iter()
                .flat_map(|group| group.sub_terms.iter().map(String::as_str)),
            self.index,
            self.accessions,
            search_type,
        );
        let resolver =
            Resolver::new(self.index, self.accessions, search_type).with_fuzzy_map(&fuzzy);

        let resolved = groups
            .par_iter()
            .map(|group| resolve_group(&resolver, group))
            .collect::<Vec<_>>();

        let outcome = self.collect(groups, resolved, start);
        debug!(
            groups = outcome.groups.len(),
            matched = outcome.matches.len(),
            %search_type,
            "batch search finished"
        );
        outcome
    }

    /// Each line is a case-insensitive pattern over the primary id universe,
    /// or the full gene-name strings for gene-name searches.
    pub fn search_regex<S: AsRef<str>>(&self, lines: &[S], search_type: SearchType) -> BatchOutcome {
        let start = Instant::now();
        let mut seen = HashSet::new();
        let mut groups = Vec::new();
        for line in lines.iter().flat_map(|line| line.as_ref().split('\n')) {
            let pattern = line.trim();
            if pattern.is_empty() || !seen.insert(pattern.to_string()) {
                continue;
            }
            groups.push(BatchGroup {
                key: pattern.to_string(),
                sub_terms: Vec::new(),
                position: groups.len(),
            });
        }

        let resolved = groups
            .iter()
            .map(|group| {
                let regex = match RegexBuilder::new(&group.key).case_insensitive(true).build() {
                    Ok(regex) => regex,
                    Err(err) => {
                        warn!(pattern = %group.key, error = %err, "invalid search pattern");
                        return Vec::new();
                    }
                };
                let hits = match search_type {
                    SearchType::GeneName => self
                        .index
                        .gene_name_entries()
                        .filter(|(_, genes)| regex.is_match(genes))
                        .map(|(primary, _)| primary.to_string())
                        .collect::<BTreeSet<_>>(),
                    SearchType::PrimaryId | SearchType::AccessionId => self
                        .index
                        .primary_ids()
                        .filter(|primary| regex.is_match(primary))
                        .map(str::to_string)
                        .collect(),
                };
                results(&group.key, hits, MatchType::Pattern)
            })
            .collect::<Vec<_>>();

        self.collect(groups, resolved, start)
    }

    pub fn suggest(&self, query: &str, search_type: SearchType, limit: usize) -> Vec<Suggestion> {
        let query = query.trim().to_uppercase();
        if query.chars().count() < MIN_SUGGEST_LEN || limit == 0 {
            return Vec::new();
        }

        let sources: Box<dyn Iterator<Item = (&str, &str)> + '_> = match search_type {
            SearchType::GeneName => Box::new(self.index.gene_name_entries()),
            SearchType::PrimaryId | SearchType::AccessionId => {
                Box::new(self.index.primary_ids().map(|primary| (primary, primary)))
            }
        };

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (primary, composite) in sources {
            let hit = split_tokens(composite)
                .map(str::to_uppercase)
                .find(|token| token.contains(&query));
            if let Some(value) = hit {
                if seen.insert(value.clone()) {
                    out.push(Suggestion {
                        value,
                        primary_id: primary.to_string(),
                    });
                    if out.len() == limit {
                        break;
                    }
                }
            }
        }
        out
    }

    fn collect(
        &self,
        groups: Vec<BatchGroup>,
        resolved: Vec<Vec<SearchResult>>,
        start: Instant,
    ) -> BatchOutcome {
        let mut statistics = SearchStatistics {
            total_proteins: self.index.protein_count(),
            ..SearchStatistics::default()
        };
        let mut matched = HashSet::new();
        let mut matches = IndexMap::new();
        for (group, hits) in groups.iter().zip(resolved) {
            let Some(first) = hits.first() else {
                statistics.unmatched_terms.push(group.key.clone());
                continue;
            };
            match first.match_type {
                MatchType::Exact => statistics.exact_matches += 1,
                MatchType::Fuzzy | MatchType::Pattern => statistics.partial_matches += 1,
            }
            matched.extend(hits.iter().map(|result| result.primary_id.clone()));
            matches.insert(group.key.clone(), hits);
        }
        statistics.matched_proteins = matched.len();
        statistics.duration_ms = start.elapsed().as_millis() as u64;

        BatchOutcome {
            groups,
            matches,
            statistics,
        }
    }
}

fn resolve_group(resolver: &Resolver<'_>, group: &BatchGroup) -> Vec<SearchResult> {
    let exact = resolver.exact(&group.key);
    if !exact.is_empty() {
        return results(&group.key, exact, MatchType::Exact);
    }
    group
        .sub_terms
        .iter()
        .find_map(|term| {
            resolver
                .fuzzy(term)
                .map(|(_, hits)| results(term, hits, MatchType::Fuzzy))
        })
        .unwrap_or_default()
}
