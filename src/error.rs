use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

type BoxedCause = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error, Diagnostic)]
pub enum ScenarioLinkError {
    #[error("invalid record identifier: {0}")]
    InvalidRecordId(String),

    #[error("invalid checksum: {0}")]
    InvalidDigest(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("record API request failed: {0}")]
    #[diagnostic(help("check the network connection and retry"))]
    Network(String),

    #[error("record API returned status {status}: {message}")]
    NetworkStatus { status: u16, message: String },

    #[error("checksum mismatch for {file}: expected {expected}, found {actual}")]
    #[diagnostic(help("the download was corrupted or the record changed; retry the fetch"))]
    Integrity {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("filesystem error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("invalid datapackage descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid scenario selection: {0}")]
    InvalidSelection(String),

    #[error("scenario index {index} out of range (package has {count} scenarios)")]
    ScenarioIndexOutOfRange { index: usize, count: usize },

    #[error("catalog request failed: {0}")]
    Catalog(String),

    #[error("database generation failed: {message}")]
    Execution {
        message: String,
        #[source]
        source: Option<BoxedCause>,
    },
}

impl ScenarioLinkError {
    /// Failures that the acquisition pipeline surfaces as a retry-or-abort decision.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScenarioLinkError::Network(_)
                | ScenarioLinkError::NetworkStatus { .. }
                | ScenarioLinkError::Integrity { .. }
        )
    }

    pub fn execution(message: impl Into<String>, source: impl Into<BoxedCause>) -> Self {
        ScenarioLinkError::Execution {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert!(ScenarioLinkError::Network("timeout".to_string()).is_recoverable());
        assert!(
            ScenarioLinkError::Integrity {
                file: "a.zip".to_string(),
                expected: "00".to_string(),
                actual: "ff".to_string(),
            }
            .is_recoverable()
        );
        assert!(!ScenarioLinkError::Storage("disk full".to_string()).is_recoverable());
        assert!(!ScenarioLinkError::NotFound("1.zip".to_string()).is_recoverable());
    }

    #[test]
    fn execution_keeps_cause() {
        let cause = std::io::Error::other("unknown dependency 'ecoinvent'");
        let err = ScenarioLinkError::execution("unfold exited with status 1", cause);
        let source = err.source().map(|source| source.to_string());
        assert_eq!(source.as_deref(), Some("unknown dependency 'ecoinvent'"));
    }
}
