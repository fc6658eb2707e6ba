use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::catalog::DEFAULT_CATALOG_URL;
use crate::error::ScenarioLinkError;
use crate::store::Cache;
use crate::zenodo::DEFAULT_API_BASE;

pub const DEFAULT_CONFIG_FILE: &str = "scenariolink.json";
pub const CACHE_DIR_ENV: &str = "SCENARIOLINK_CACHE_DIR";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub unfold_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_base: String,
    pub catalog_url: String,
    /// `None` means the per-user default cache directory.
    pub cache_dir: Option<Utf8PathBuf>,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub unfold_command: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            cache_dir: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            unfold_command: vec!["unfold-cli".to_string()],
        }
    }
}

impl Settings {
    pub fn cache(&self) -> Result<Cache, ScenarioLinkError> {
        match &self.cache_dir {
            Some(dir) => Ok(Cache::new_with_root(dir.clone())),
            None => Cache::new(),
        }
    }

    /// A whole fragment transfer may take much longer than one API call.
    pub fn download_timeout(&self) -> Duration {
        self.request_timeout.saturating_mul(30)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<Settings, ScenarioLinkError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| ScenarioLinkError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| ScenarioLinkError::ConfigParse(err.to_string()))?
        };

        let mut settings = Self::resolve_config(config)?;
        if let Some(dir) = env::var(CACHE_DIR_ENV).ok().filter(|dir| !dir.trim().is_empty()) {
            settings.cache_dir = Some(Utf8PathBuf::from(dir));
        }
        Ok(settings)
    }

    pub fn resolve_config(config: Config) -> Result<Settings, ScenarioLinkError> {
        let defaults = Settings::default();
        let request_timeout = match config.request_timeout_secs {
            Some(0) => {
                return Err(ScenarioLinkError::ConfigParse(
                    "request_timeout_secs must be positive".to_string(),
                ));
            }
            Some(secs) => Duration::from_secs(secs),
            None => defaults.request_timeout,
        };
        let max_attempts = match config.max_attempts {
            Some(0) => {
                return Err(ScenarioLinkError::ConfigParse(
                    "max_attempts must be at least 1".to_string(),
                ));
            }
            Some(attempts) => attempts,
            None => defaults.max_attempts,
        };
        let unfold_command = match config.unfold_command {
            Some(command) if command.is_empty() => {
                return Err(ScenarioLinkError::ConfigParse(
                    "unfold_command must name a program".to_string(),
                ));
            }
            Some(command) => command,
            None => defaults.unfold_command,
        };

        Ok(Settings {
            api_base: config.api_base.unwrap_or(defaults.api_base),
            catalog_url: config.catalog_url.unwrap_or(defaults.catalog_url),
            cache_dir: config.cache_dir.map(Utf8PathBuf::from),
            request_timeout,
            max_attempts,
            unfold_command,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let settings = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.api_base, "https://zenodo.org/api");
        assert_eq!(settings.max_attempts, 2);
    }

    #[test]
    fn zero_attempts_rejected() {
        let config = Config {
            max_attempts: Some(0),
            ..Default::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(ScenarioLinkError::ConfigParse(_))
        );
    }

    #[test]
    fn empty_unfold_command_rejected() {
        let config = Config {
            unfold_command: Some(Vec::new()),
            ..Default::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(ScenarioLinkError::ConfigParse(_))
        );
    }
}
