//! Hands a confirmed selection to the external transformation tool.
//!
//! The invoker resolves where the archive lives, settles the output name and
//! delegates the actual database work to an [`Unfolder`]. It does not check
//! the scenario list for emptiness; keeping at least one scenario included is
//! the selection model's job.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info};

use crate::app::{ProgressEvent, ProgressSink};
use crate::datapackage::Datapackage;
use crate::domain::{OutputMode, PackageSource};
use crate::error::ScenarioLinkError;
use crate::naming;
use crate::selection::SelectionModel;
use crate::store::Cache;

/// Dependency name declared by the package -> local database name.
pub type DependencyMapping = BTreeMap<String, String>;

pub type UnfoldError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub source: PackageSource,
    pub scenarios: Vec<usize>,
    pub dependencies: DependencyMapping,
    pub mode: OutputMode,
    pub output_name: Option<String>,
    pub sdf_dir: Option<Utf8PathBuf>,
}

impl GenerationRequest {
    /// Builds a request from the current selection. An empty selection
    /// disables generation, so it is refused here rather than handed on.
    pub fn from_selection(
        source: PackageSource,
        selection: &SelectionModel,
        dependencies: DependencyMapping,
        mode: OutputMode,
    ) -> Result<Self, ScenarioLinkError> {
        if selection.is_empty_selection() {
            return Err(ScenarioLinkError::InvalidSelection(format!(
                "{source} has no scenario selected"
            )));
        }
        Ok(Self {
            source,
            scenarios: selection.included_indices(),
            dependencies,
            mode,
            output_name: None,
            sdf_dir: None,
        })
    }
}

/// Exactly what the transformation tool receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnfoldJob {
    pub archive: Utf8PathBuf,
    pub scenarios: Vec<usize>,
    pub dependencies: DependencyMapping,
    pub superstructure: bool,
    pub name: Option<String>,
    pub sdf_dir: Option<Utf8PathBuf>,
}

pub trait Unfolder: Send + Sync {
    fn unfold(&self, job: &UnfoldJob) -> Result<(), UnfoldError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub archive: Utf8PathBuf,
    pub scenarios: Vec<usize>,
    pub mode: OutputMode,
    pub output_name: Option<String>,
}

/// Runs an external command as `<program> <args...> <job.json>`.
#[derive(Debug, Clone)]
pub struct ProcessUnfolder {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessUnfolder {
    pub fn new(command: &[String]) -> Result<Self, ScenarioLinkError> {
        let (program, args) = command.split_first().ok_or_else(|| {
            ScenarioLinkError::ConfigParse("unfold_command must name a program".to_string())
        })?;
        Ok(Self {
            program: PathBuf::from(program),
            args: args.to_vec(),
        })
    }
}

impl Unfolder for ProcessUnfolder {
    fn unfold(&self, job: &UnfoldJob) -> Result<(), UnfoldError> {
        let mut job_file = tempfile::Builder::new()
            .prefix("unfold-job")
            .suffix(".json")
            .tempfile()?;
        job_file.write_all(&serde_json::to_vec_pretty(job)?)?;
        job_file.flush()?;

        debug!(program = %self.program.display(), "running unfold command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(job_file.path())
            .output()
            .map_err(|err| format!("failed to run {}: {err}", self.program.display()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            format!("{} exited with {}", self.program.display(), output.status)
        } else {
            stderr
        };
        Err(detail.into())
    }
}

pub struct Generator<'a, U: Unfolder + ?Sized> {
    cache: &'a Cache,
    unfolder: &'a U,
}

impl<'a, U: Unfolder + ?Sized> Generator<'a, U> {
    pub fn new(cache: &'a Cache, unfolder: &'a U) -> Self {
        Self { cache, unfolder }
    }

    pub fn generate(
        &self,
        request: GenerationRequest,
        sink: &dyn ProgressSink,
    ) -> Result<GenerationReport, ScenarioLinkError> {
        let started = Instant::now();
        let archive = self.resolve_archive(&request.source)?;
        let superstructure = request.mode == OutputMode::Superstructure;
        if superstructure && request.scenarios.len() == 1 {
            return Err(ScenarioLinkError::InvalidSelection(
                "superstructure output needs more than one scenario".to_string(),
            ));
        }

        let output_name = match (&request.output_name, superstructure) {
            (Some(name), _) => Some(name.clone()),
            (None, true) => Some(default_name(&archive, &request)?),
            (None, false) => None,
        };
        if let Some(dir) = &request.sdf_dir {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| ScenarioLinkError::Storage(format!("create {dir}: {err}")))?;
        }

        let job = UnfoldJob {
            archive: archive.clone(),
            scenarios: request.scenarios.clone(),
            dependencies: request.dependencies,
            superstructure,
            name: output_name.clone(),
            sdf_dir: request.sdf_dir,
        };
        sink.event(ProgressEvent::new(format!(
            "phase=Generate; unfolding {} scenario(s) from {archive} as {}",
            job.scenarios.len(),
            request.mode
        )));
        info!(%archive, scenarios = ?job.scenarios, mode = %request.mode, "generation started");
        self.unfolder
            .unfold(&job)
            .map_err(|cause| ScenarioLinkError::Execution {
                message: format!("unfolding {archive} failed"),
                source: Some(cause),
            })?;
        info!(%archive, "generation finished");
        sink.event(ProgressEvent {
            message: "phase=Generate; done".to_string(),
            elapsed: Some(started.elapsed()),
        });

        Ok(GenerationReport {
            archive,
            scenarios: job.scenarios,
            mode: request.mode,
            output_name,
        })
    }

    fn resolve_archive(&self, source: &PackageSource) -> Result<Utf8PathBuf, ScenarioLinkError> {
        let path = match source {
            PackageSource::Record(id) => self.cache.path_for(id),
            PackageSource::Path(path) => path.clone(),
        };
        if !path.as_std_path().is_file() {
            // acquisition guarantees the archive; reaching this is a broken invariant
            return Err(ScenarioLinkError::NotFound(format!(
                "archive for {source} missing at {path}"
            )));
        }
        Ok(path)
    }
}

fn default_name(archive: &Utf8Path, request: &GenerationRequest) -> Result<String, ScenarioLinkError> {
    let package = Datapackage::open(archive)?;
    let names: Vec<&str> = request
        .scenarios
        .iter()
        .filter_map(|&idx| package.scenarios().get(idx))
        .map(|scenario| scenario.name.as_str())
        .collect();
    let dependency_db = package
        .dependencies()
        .iter()
        .find_map(|dep| request.dependencies.get(&dep.name))
        .or_else(|| request.dependencies.values().next())
        .map(String::as_str);
    Ok(naming::default_superstructure_name(
        dependency_db,
        package.name(),
        &names,
    ))
}
