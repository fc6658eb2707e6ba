use std::fs;
use std::io::{Read, Seek};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use zip::ZipArchive;

use crate::error::ScenarioLinkError;

pub const DESCRIPTOR_NAME: &str = "datapackage.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An opened local archive. Immutable; reopen to pick up a different file.
#[derive(Debug, Clone)]
pub struct Datapackage {
    path: Utf8PathBuf,
    descriptor: Descriptor,
}

impl Datapackage {
    pub fn open(path: &Utf8Path) -> Result<Self, ScenarioLinkError> {
        let file = fs::File::open(path.as_std_path())
            .map_err(|err| ScenarioLinkError::Storage(format!("open {path}: {err}")))?;
        let mut archive = ZipArchive::new(file)
            .map_err(|err| ScenarioLinkError::InvalidArchive(format!("{path}: {err}")))?;

        let entry_name = find_descriptor(&archive).ok_or_else(|| {
            ScenarioLinkError::InvalidDescriptor(format!("{path} has no {DESCRIPTOR_NAME}"))
        })?;
        let mut entry = archive
            .by_name(&entry_name)
            .map_err(|err| ScenarioLinkError::InvalidArchive(err.to_string()))?;
        let mut raw = String::new();
        entry
            .read_to_string(&mut raw)
            .map_err(|err| ScenarioLinkError::InvalidDescriptor(format!("{entry_name}: {err}")))?;

        Ok(Self {
            path: path.to_path_buf(),
            descriptor: parse_descriptor(&raw)?,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn name(&self) -> Option<&str> {
        self.descriptor.name.as_deref()
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.descriptor.scenarios
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.descriptor.dependencies
    }

    pub fn scenario_count(&self) -> usize {
        self.descriptor.scenarios.len()
    }
}

pub fn parse_descriptor(raw: &str) -> Result<Descriptor, ScenarioLinkError> {
    serde_json::from_str(raw).map_err(|err| ScenarioLinkError::InvalidDescriptor(err.to_string()))
}

/// Root-level descriptor first, otherwise the shallowest one.
fn find_descriptor<R: Read + Seek>(archive: &ZipArchive<R>) -> Option<String> {
    archive
        .file_names()
        .filter(|name| name.rsplit('/').next() == Some(DESCRIPTOR_NAME))
        .min_by_key(|name| (name.matches('/').count(), name.len()))
        .map(|name| name.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use zip::write::SimpleFileOptions;

    use super::*;

    const DESCRIPTOR: &str = r#"{
        "name": "remind-ssp2",
        "dependencies": [{"name": "ecoinvent", "system model": "cutoff"}, {"name": "biosphere3"}],
        "scenarios": [
            {"name": "SSP2-Base 2030", "description": "baseline"},
            {"name": "SSP2-Base 2050", "description": "baseline", "year": 2050}
        ],
        "resources": []
    }"#;

    fn write_package(path: &Utf8Path, entries: &[(&str, &str)]) {
        let file = fs::File::create(path.as_std_path()).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn open_reads_descriptor() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("1.zip")).unwrap();
        write_package(&path, &[("datapackage.json", DESCRIPTOR), ("data/a.csv", "x")]);

        let package = Datapackage::open(&path).unwrap();
        assert_eq!(package.name(), Some("remind-ssp2"));
        assert_eq!(package.scenario_count(), 2);
        assert_eq!(package.dependencies()[0].name, "ecoinvent");
        assert_eq!(
            package.dependencies()[0].extra.get("system model"),
            Some(&Value::from("cutoff"))
        );
        assert_eq!(package.scenarios()[1].extra.get("year"), Some(&Value::from(2050)));
        assert!(package.descriptor().extra.contains_key("resources"));
    }

    #[test]
    fn prefers_shallowest_descriptor() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("1.zip")).unwrap();
        write_package(
            &path,
            &[
                ("nested/deeper/datapackage.json", r#"{"scenarios": []}"#),
                ("pkg/datapackage.json", DESCRIPTOR),
            ],
        );
        let package = Datapackage::open(&path).unwrap();
        assert_eq!(package.scenario_count(), 2);
    }

    #[test]
    fn missing_descriptor_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("1.zip")).unwrap();
        write_package(&path, &[("data/a.csv", "x")]);
        assert_matches!(
            Datapackage::open(&path),
            Err(ScenarioLinkError::InvalidDescriptor(_))
        );
    }

    #[test]
    fn missing_scenarios_means_zero() {
        let descriptor = parse_descriptor(r#"{"name": "empty"}"#).unwrap();
        assert!(descriptor.scenarios.is_empty());
        assert!(descriptor.dependencies.is_empty());
    }
}
