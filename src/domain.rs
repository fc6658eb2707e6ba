use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::ScenarioLinkError;

/// Key of a remotely hosted scenario bundle. Doubles as the cache file stem
/// and as the path component of the record API, so it must be a single safe
/// path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = ScenarioLinkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized.len() <= 128
            && !normalized.starts_with('.')
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(ScenarioLinkError::InvalidRecordId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for RecordId {
    type Error = ScenarioLinkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RecordId> for String {
    fn from(value: RecordId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    fn hex_len(self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 32,
            DigestAlgorithm::Sha256 => 64,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestAlgorithm::Md5 => write!(f, "md5"),
            DigestAlgorithm::Sha256 => write!(f, "sha256"),
        }
    }
}

/// Expected checksum as published by the record API, `"<algorithm>:<hex>"`.
/// The hex text is kept lowercase so comparisons are format-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedDigest {
    pub algorithm: DigestAlgorithm,
    pub hex: String,
}

impl fmt::Display for ExpectedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for ExpectedDigest {
    type Err = ScenarioLinkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (algorithm, hex) = match trimmed.split_once(':') {
            Some((algo, hex)) => {
                let algorithm = match algo.trim().to_ascii_lowercase().as_str() {
                    "md5" => DigestAlgorithm::Md5,
                    "sha256" | "sha-256" => DigestAlgorithm::Sha256,
                    _ => return Err(ScenarioLinkError::InvalidDigest(value.to_string())),
                };
                (algorithm, hex.trim())
            }
            None => (DigestAlgorithm::Md5, trimmed),
        };
        let hex = hex.to_ascii_lowercase();
        if hex.len() != algorithm.hex_len() || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(ScenarioLinkError::InvalidDigest(value.to_string()));
        }
        Ok(Self { algorithm, hex })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// One database per selected scenario.
    #[default]
    Databases,
    /// One database plus a scenario difference file.
    Superstructure,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Databases => write!(f, "databases"),
            OutputMode::Superstructure => write!(f, "superstructure"),
        }
    }
}

/// Where a generation request finds its archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    Record(RecordId),
    Path(Utf8PathBuf),
}

impl fmt::Display for PackageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageSource::Record(id) => write!(f, "record:{id}"),
            PackageSource::Path(path) => write!(f, "{path}"),
        }
    }
}
