use std::time::Duration;

use camino::Utf8Path;
use serde::Serialize;

use crate::acquire::{Acquirer, AcquireSource, RetryPrompt};
use crate::catalog::{CatalogClient, CatalogEntry};
use crate::datapackage::Datapackage;
use crate::domain::RecordId;
use crate::error::ScenarioLinkError;
use crate::generate::{GenerationReport, GenerationRequest, Generator, Unfolder};
use crate::store::{Cache, CacheEntry};
use crate::zenodo::RecordClient;

#[derive(Debug, Clone, Serialize)]
pub struct CatalogResult {
    pub entries: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub record_id: Option<String>,
    /// `cache`, `download` or `disk`.
    pub action: String,
    pub attempts: u32,
    pub package: PackageSummary,
    #[serde(skip)]
    pub handle: Datapackage,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageSummary {
    pub path: String,
    pub name: Option<String>,
    pub dependencies: Vec<String>,
    pub scenarios: Vec<ScenarioRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioRow {
    pub index: usize,
    pub name: String,
    pub description: Option<String>,
}

impl From<&Datapackage> for PackageSummary {
    fn from(package: &Datapackage) -> Self {
        Self {
            path: package.path().to_string(),
            name: package.name().map(str::to_string),
            dependencies: package
                .dependencies()
                .iter()
                .map(|dep| dep.name.clone())
                .collect(),
            scenarios: package
                .scenarios()
                .iter()
                .enumerate()
                .map(|(index, scenario)| ScenarioRow {
                    index,
                    name: scenario.name.clone(),
                    description: scenario.description.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheListResult {
    pub cache_root: String,
    pub entries: Vec<CacheEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub removed: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressSinkKind {
    Catalog,
    Fetch,
    Generate,
    Cache,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<C: RecordClient, K: CatalogClient, U: Unfolder> {
    acquirer: Acquirer<C>,
    catalog: K,
    unfolder: U,
}

impl<C: RecordClient, K: CatalogClient, U: Unfolder> App<C, K, U> {
    pub fn new(cache: Cache, client: C, catalog: K, unfolder: U, max_attempts: u32) -> Self {
        Self {
            acquirer: Acquirer::new(cache, client, max_attempts),
            catalog,
            unfolder,
        }
    }

    pub fn cache(&self) -> &Cache {
        self.acquirer.cache()
    }

    pub fn record_client(&self) -> &C {
        self.acquirer.client()
    }

    pub fn unfolder(&self) -> &U {
        &self.unfolder
    }

    pub fn catalog(&self, sink: &dyn ProgressSink) -> Result<CatalogResult, ScenarioLinkError> {
        sink.event(ProgressEvent::new("phase=Resolve; loading catalog"));
        let entries = self.catalog.fetch_catalog()?;
        sink.event(ProgressEvent::new(format!(
            "phase=Store; {} catalog entries",
            entries.len()
        )));
        Ok(CatalogResult { entries })
    }

    pub fn fetch(
        &self,
        id: &RecordId,
        sink: &dyn ProgressSink,
        prompt: &dyn RetryPrompt,
    ) -> Result<FetchResult, ScenarioLinkError> {
        let outcome = self.acquirer.acquire(id, sink, prompt)?;
        let action = match outcome.source {
            AcquireSource::Cache => "cache",
            AcquireSource::Download => "download",
        };
        Ok(FetchResult {
            record_id: Some(id.to_string()),
            action: action.to_string(),
            attempts: outcome.attempts,
            package: PackageSummary::from(&outcome.package),
            handle: outcome.package,
        })
    }

    pub fn open(
        &self,
        path: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResult, ScenarioLinkError> {
        sink.event(ProgressEvent::new(format!("phase=Resolve; opening {path}")));
        let package = self.acquirer.acquire_from_disk(path)?;
        Ok(FetchResult {
            record_id: None,
            action: "disk".to_string(),
            attempts: 0,
            package: PackageSummary::from(&package),
            handle: package,
        })
    }

    pub fn generate(
        &self,
        request: GenerationRequest,
        sink: &dyn ProgressSink,
    ) -> Result<GenerationReport, ScenarioLinkError> {
        Generator::new(self.cache(), &self.unfolder).generate(request, sink)
    }

    pub fn list_cache(&self, sink: &dyn ProgressSink) -> Result<CacheListResult, ScenarioLinkError> {
        sink.event(ProgressEvent::new("phase=Resolve; scanning cache"));
        Ok(CacheListResult {
            cache_root: self.cache().cache_root().to_string(),
            entries: self.cache().entries()?,
        })
    }

    /// Removes one cached record, or every cached archive when `id` is `None`.
    pub fn clear_cache(
        &self,
        id: Option<&RecordId>,
        sink: &dyn ProgressSink,
    ) -> Result<ClearResult, ScenarioLinkError> {
        let removed = match id {
            Some(id) => {
                sink.event(ProgressEvent::new(format!("phase=Store; removing record {id}")));
                usize::from(self.cache().remove(id)?)
            }
            None => {
                sink.event(ProgressEvent::new("phase=Store; clearing cache"));
                self.cache().clear()?
            }
        };
        Ok(ClearResult { removed })
    }
}
