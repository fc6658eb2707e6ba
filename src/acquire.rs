use std::fmt;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::assemble::Assembler;
use crate::datapackage::Datapackage;
use crate::domain::RecordId;
use crate::error::ScenarioLinkError;
use crate::store::Cache;
use crate::zenodo::RecordClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcquireState {
    Idle,
    CheckingCache,
    CacheHit,
    CacheMiss,
    Fetching,
    Assembling,
    Cached,
    Done,
    Failed,
}

impl fmt::Display for AcquireState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AcquireState::Idle => "idle",
            AcquireState::CheckingCache => "checking-cache",
            AcquireState::CacheHit => "cache-hit",
            AcquireState::CacheMiss => "cache-miss",
            AcquireState::Fetching => "fetching",
            AcquireState::Assembling => "assembling",
            AcquireState::Cached => "cached",
            AcquireState::Done => "done",
            AcquireState::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

/// Decides whether a recoverable failure gets another attempt.
pub trait RetryPrompt {
    fn retry(&self, error: &ScenarioLinkError, attempt: u32) -> bool;
}

pub struct NeverRetry;

impl RetryPrompt for NeverRetry {
    fn retry(&self, _error: &ScenarioLinkError, _attempt: u32) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquireSource {
    Cache,
    Download,
}

#[derive(Debug, Clone)]
pub struct AcquireOutcome {
    pub package: Datapackage,
    pub source: AcquireSource,
    pub attempts: u32,
}

/// Turns a record id into an opened datapackage, going through the cache.
pub struct Acquirer<C: RecordClient> {
    cache: Cache,
    client: C,
    max_attempts: u32,
}

impl<C: RecordClient> Acquirer<C> {
    pub fn new(cache: Cache, client: C, max_attempts: u32) -> Self {
        Self {
            cache,
            client,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn acquire(
        &self,
        id: &RecordId,
        sink: &dyn ProgressSink,
        prompt: &dyn RetryPrompt,
    ) -> Result<AcquireOutcome, ScenarioLinkError> {
        let started = Instant::now();
        // waiting on another acquisition of the same record shows as idle
        transition(sink, id, AcquireState::Idle, started);
        self.cache
            .with_record_lock(id, || self.acquire_locked(id, sink, prompt, started))
    }

    /// Opens a user-supplied archive directly: no cache, no network.
    pub fn acquire_from_disk(&self, path: &Utf8Path) -> Result<Datapackage, ScenarioLinkError> {
        let is_zip = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        if !is_zip {
            return Err(ScenarioLinkError::NotFound(format!(
                "{path} is not a .zip datapackage"
            )));
        }
        if !path.as_std_path().is_file() {
            return Err(ScenarioLinkError::NotFound(path.to_string()));
        }
        Datapackage::open(path)
    }

    fn acquire_locked(
        &self,
        id: &RecordId,
        sink: &dyn ProgressSink,
        prompt: &dyn RetryPrompt,
        started: Instant,
    ) -> Result<AcquireOutcome, ScenarioLinkError> {
        transition(sink, id, AcquireState::CheckingCache, started);
        if self.cache.is_cached(id) {
            transition(sink, id, AcquireState::CacheHit, started);
            let package = Datapackage::open(&self.cache.path_for(id))?;
            transition(sink, id, AcquireState::Done, started);
            return Ok(AcquireOutcome {
                package,
                source: AcquireSource::Cache,
                attempts: 0,
            });
        }
        transition(sink, id, AcquireState::CacheMiss, started);

        let mut attempt = 1;
        let path = loop {
            match self.fetch_once(id, sink, started) {
                Ok(path) => break path,
                Err(err) => {
                    transition(sink, id, AcquireState::Failed, started);
                    if !err.is_recoverable() {
                        return Err(err);
                    }
                    if attempt >= self.max_attempts || !prompt.retry(&err, attempt) {
                        warn!(record = %id, attempt, error = %err, "acquisition abandoned");
                        return Err(err);
                    }
                    sink.event(ProgressEvent::new(format!(
                        "retry record {id} attempt {} after: {err}",
                        attempt + 1
                    )));
                    info!(record = %id, attempt = attempt + 1, "retrying acquisition");
                    attempt += 1;
                }
            }
        };

        let package = Datapackage::open(&path)?;
        transition(sink, id, AcquireState::Done, started);
        Ok(AcquireOutcome {
            package,
            source: AcquireSource::Download,
            attempts: attempt,
        })
    }

    fn fetch_once(
        &self,
        id: &RecordId,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<Utf8PathBuf, ScenarioLinkError> {
        transition(sink, id, AcquireState::Fetching, started);
        let files = self.client.list_files(id)?;
        if files.is_empty() {
            return Err(ScenarioLinkError::NotFound(format!("record {id} lists no files")));
        }
        debug!(record = %id, files = files.len(), "record listed");

        transition(sink, id, AcquireState::Assembling, started);
        let staging = self.cache.staging_dir()?;
        let staged = Assembler::new(&self.client, sink).assemble(id, &files, staging.path())?;
        // a cached archive must open; reject it before it becomes visible
        Datapackage::open(&staged)?;
        let path = self.cache.commit(&staged, id)?;
        transition(sink, id, AcquireState::Cached, started);
        Ok(path)
    }
}

fn transition(sink: &dyn ProgressSink, id: &RecordId, state: AcquireState, started: Instant) {
    debug!(record = %id, %state, "acquire state");
    let phase = match state {
        AcquireState::Idle | AcquireState::CheckingCache => "Resolve",
        AcquireState::CacheHit | AcquireState::CacheMiss => "Resolve",
        AcquireState::Fetching => "Fetch",
        AcquireState::Assembling => "Assemble",
        AcquireState::Cached | AcquireState::Done | AcquireState::Failed => "Store",
    };
    sink.event(ProgressEvent {
        message: format!("phase={phase}; record {id} {state}"),
        elapsed: Some(started.elapsed()),
    });
}
