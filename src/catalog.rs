use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::RecordId;
use crate::error::ScenarioLinkError;
use crate::zenodo::{build_client, handle_status, send_with_retries};

pub const DEFAULT_CATALOG_URL: &str = "https://raw.githubusercontent.com/polca/ScenarioLink/main/ab_plugin_scenariolink/scenarios%20list/list.csv";
const SEPARATOR: char = ';';

/// One row of the published catalog. The last column is the record id; the
/// other columns are kept as-is for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub columns: Vec<(String, String)>,
    pub record_id: RecordId,
}

impl CatalogEntry {
    pub fn column(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub trait CatalogClient: Send + Sync {
    fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>, ScenarioLinkError>;
}

#[derive(Clone)]
pub struct CatalogHttpClient {
    client: Client,
    url: String,
}

impl CatalogHttpClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ScenarioLinkError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.to_string(),
        })
    }
}

impl CatalogClient for CatalogHttpClient {
    fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>, ScenarioLinkError> {
        // the raw host caches aggressively without a throwaway query
        let url = if self.url.contains('?') {
            format!("{}&nocache", self.url)
        } else {
            format!("{}?nocache", self.url)
        };
        debug!(%url, "fetching catalog");
        let body = send_with_retries(|| self.client.get(&url))
            .and_then(handle_status)
            .and_then(|response| {
                response
                    .text()
                    .map_err(|err| ScenarioLinkError::Network(err.to_string()))
            })
            .map_err(|err| ScenarioLinkError::Catalog(err.to_string()))?;
        parse_catalog(&body)
    }
}

pub fn parse_catalog(text: &str) -> Result<Vec<CatalogEntry>, ScenarioLinkError> {
    let mut lines = text
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty());
    let header: Vec<String> = lines
        .next()
        .ok_or_else(|| ScenarioLinkError::Catalog("catalog is empty".to_string()))?
        .trim_start_matches('\u{feff}')
        .split(SEPARATOR)
        .map(|field| field.trim().to_string())
        .collect();

    let mut entries = Vec::new();
    for (row, line) in lines.enumerate() {
        let fields: Vec<&str> = line.split(SEPARATOR).map(str::trim).collect();
        let Some(raw_id) = fields.last().filter(|value| !value.is_empty()) else {
            warn!(row = row + 1, "catalog row without record id, skipping");
            continue;
        };
        let record_id = match raw_id.parse::<RecordId>() {
            Ok(id) => id,
            Err(err) => {
                warn!(row = row + 1, error = %err, "catalog row with invalid record id, skipping");
                continue;
            }
        };
        let columns = header
            .iter()
            .enumerate()
            .map(|(idx, key)| {
                let value = fields.get(idx).copied().unwrap_or_default();
                (key.clone(), value.to_string())
            })
            .collect();
        entries.push(CatalogEntry { columns, record_id });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const CATALOG: &str = "\
name;description;source;zenodo
REMIND SSP2;Energy transition pathways;PIK;8033297\r
IMAGE SSP2;Land use;PBL;8015559

incomplete;no id;;
";

    #[test]
    fn parses_rows_with_last_column_as_record() {
        let entries = parse_catalog(CATALOG).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].record_id.as_str(), "8033297");
        assert_eq!(entries[0].column("name"), Some("REMIND SSP2"));
        assert_eq!(entries[1].column("Source"), Some("PBL"));
        assert_eq!(entries[1].columns.len(), 4);
    }

    #[test]
    fn empty_catalog_is_error() {
        assert_matches!(parse_catalog("\n\n"), Err(ScenarioLinkError::Catalog(_)));
    }

    #[test]
    fn header_only_catalog_has_no_entries() {
        assert!(parse_catalog("name;zenodo\n").unwrap().is_empty());
    }
}
