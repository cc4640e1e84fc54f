use std::io::{self, Write};

use serde::Serialize;
use tracing::debug;

use crate::app::{
    AnnotateResult, ClearResult, ImportResult, IndexResult, InfoResult, ListResult, ListsResult,
    ProgressEvent, ProgressSink, SearchResponse, SelectResult, SuggestResult,
};
use crate::selection::SelectionMap;
use crate::volcano::VolcanoPayload;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_import(result: &ImportResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_index(result: &IndexResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_search(result: &SearchResponse) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_suggest(result: &SuggestResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_volcano(result: &VolcanoPayload) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_select(result: &SelectResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_lists(result: &ListsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_selections(result: &SelectionMap) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_annotate(result: &AnnotateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_info(result: &InfoResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_clear(result: &ClearResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Forwards progress events to the tracing subscriber.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => debug!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => debug!("{}", event.message),
        }
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}
