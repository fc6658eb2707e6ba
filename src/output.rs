use std::io::{self, Write};

use serde::Serialize;
use tracing::{info, warn};

use crate::acquire::RetryPrompt;
use crate::app::{CacheListResult, CatalogResult, ClearResult, FetchResult, ProgressEvent, ProgressSink};
use crate::error::ScenarioLinkError;
use crate::generate::GenerationReport;

#[derive(Debug, Clone, Copy)]
pub enum Presentation {
    Interactive,
    NonInteractive,
}

/// Non-interactive front end: results as pretty JSON on stdout, progress to
/// the log, and retries accepted up to the configured attempt limit.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_catalog(result: &CatalogResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_generate(result: &GenerationReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_cache_list(result: &CacheListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_clear(result: &ClearResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, event: ProgressEvent) {
        info!("{}", event.message);
    }
}

impl RetryPrompt for JsonOutput {
    fn retry(&self, error: &ScenarioLinkError, attempt: u32) -> bool {
        warn!(attempt, %error, "attempt failed, retrying");
        true
    }
}
