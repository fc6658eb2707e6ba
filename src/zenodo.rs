use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{ExpectedDigest, RecordId};
use crate::error::ScenarioLinkError;

pub const DEFAULT_API_BASE: &str = "https://zenodo.org/api";
const CHUNK_SIZE: usize = 64 * 1024;

/// One downloadable file of a record, as listed by the record API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFile {
    pub key: String,
    pub url: String,
    pub checksum: ExpectedDigest,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub downloaded: u64,
    /// From `Content-Length`; `None` means progress is indeterminate.
    pub total: Option<u64>,
}

pub trait RecordClient: Send + Sync {
    fn list_files(&self, id: &RecordId) -> Result<Vec<RemoteFile>, ScenarioLinkError>;
    fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<u64, ScenarioLinkError>;
}

#[derive(Clone)]
pub struct ZenodoHttpClient {
    client: Client,
    api_base: String,
    request_timeout: Duration,
}

impl ZenodoHttpClient {
    /// `download_timeout` bounds a whole file transfer; `request_timeout`
    /// bounds the listing call.
    pub fn new(
        api_base: &str,
        request_timeout: Duration,
        download_timeout: Duration,
    ) -> Result<Self, ScenarioLinkError> {
        Ok(Self {
            client: build_client(download_timeout)?,
            api_base: api_base.trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    pub fn record_url(&self, id: &RecordId) -> String {
        format!("{}/records/{}", self.api_base, id.as_str())
    }
}

impl RecordClient for ZenodoHttpClient {
    fn list_files(&self, id: &RecordId) -> Result<Vec<RemoteFile>, ScenarioLinkError> {
        let url = self.record_url(id);
        debug!(%url, "listing record files");
        let response = send_with_retries(|| self.client.get(&url).timeout(self.request_timeout))?;
        let response = handle_status(response)?;
        let listing: RecordListing = response
            .json()
            .map_err(|err| ScenarioLinkError::Network(format!("decode record listing: {err}")))?;
        listing.into_remote_files()
    }

    fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<u64, ScenarioLinkError> {
        let response = send_with_retries(|| self.client.get(url))?;
        let mut response = handle_status(response)?;
        let total = response.content_length();

        let file = File::create(destination)
            .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        let mut writer = BufWriter::new(file);
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut downloaded = 0u64;
        progress(TransferProgress { downloaded, total });
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|err| ScenarioLinkError::Network(format!("read {url}: {err}")))?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buffer[..read])
                .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
            downloaded += read as u64;
            progress(TransferProgress { downloaded, total });
        }
        writer
            .flush()
            .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        if let Some(total) = total {
            if downloaded != total {
                return Err(ScenarioLinkError::Network(format!(
                    "truncated download from {url}: {downloaded} of {total} bytes"
                )));
            }
        }
        Ok(downloaded)
    }
}

/// Record payload. The record endpoint lists `files`; the files
/// sub-resource lists `entries`.
#[derive(Debug, Deserialize)]
pub struct RecordListing {
    #[serde(default)]
    files: Option<Vec<FileEntry>>,
    #[serde(default)]
    entries: Option<Vec<FileEntry>>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    links: FileLinks,
}

#[derive(Debug, Default, Deserialize)]
struct FileLinks {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, rename = "self")]
    self_link: Option<String>,
    #[serde(default)]
    download: Option<String>,
}

impl RecordListing {
    pub fn into_remote_files(self) -> Result<Vec<RemoteFile>, ScenarioLinkError> {
        let entries = self.files.or(self.entries).ok_or_else(|| {
            ScenarioLinkError::Network("record listing contains no file list".to_string())
        })?;
        entries
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| -> Result<RemoteFile, ScenarioLinkError> {
                let key = entry.key.or(entry.filename).ok_or_else(|| {
                    ScenarioLinkError::Network(format!("file entry {idx} has no key"))
                })?;
                let url = entry
                    .links
                    .content
                    .or(entry.links.download)
                    .or(entry.links.self_link)
                    .ok_or_else(|| {
                        ScenarioLinkError::Network(format!("file {key} has no download link"))
                    })?;
                let checksum = entry
                    .checksum
                    .ok_or_else(|| {
                        ScenarioLinkError::InvalidDigest(format!("file {key} has no checksum"))
                    })?
                    .parse::<ExpectedDigest>()?;
                Ok(RemoteFile {
                    key,
                    url,
                    checksum,
                    size: entry.size,
                })
            })
            .collect()
    }
}

pub fn parse_record_files(json: &str) -> Result<Vec<RemoteFile>, ScenarioLinkError> {
    let listing: RecordListing = serde_json::from_str(json)
        .map_err(|err| ScenarioLinkError::Network(format!("decode record listing: {err}")))?;
    listing.into_remote_files()
}

pub(crate) fn build_client(timeout: Duration) -> Result<Client, ScenarioLinkError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("scenariolink/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| ScenarioLinkError::Network(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(10).min(timeout))
        .timeout(timeout)
        .build()
        .map_err(|err| ScenarioLinkError::Network(err.to_string()))
}

pub(crate) fn handle_status(response: Response) -> Result<Response, ScenarioLinkError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "record API request failed".to_string());
    Err(ScenarioLinkError::NetworkStatus { status, message })
}

pub(crate) fn send_with_retries<F>(mut make_req: F) -> Result<Response, ScenarioLinkError>
where
    F: FnMut() -> RequestBuilder,
{
    const MAX_RETRIES: usize = 3;
    const BASE_DELAY_MS: u64 = 200;
    let mut attempt = 0usize;
    loop {
        match make_req().send() {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if attempt < MAX_RETRIES && is_retryable_status(status) {
                    warn!(status, attempt, "transient status, retrying request");
                    thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if attempt < MAX_RETRIES && is_retryable_error(&err) {
                    warn!(error = %err, attempt, "request failed, retrying");
                    thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                    attempt += 1;
                    continue;
                }
                return Err(ScenarioLinkError::Network(err.to_string()));
            }
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::DigestAlgorithm;

    #[test]
    fn parse_legacy_record_listing() {
        let json = r#"{
            "id": 8351309,
            "files": [
                {
                    "key": "a.zip",
                    "size": 1024,
                    "checksum": "md5:0cc175b9c0f1b6a831c399e269772661",
                    "links": {"self": "https://zenodo.org/api/records/8351309/files/a.zip/content"}
                },
                {
                    "key": "b.zip",
                    "checksum": "md5:92eb5ffee6ae2fec3ad71c777531578f",
                    "links": {"self": "https://zenodo.org/api/records/8351309/files/b.zip/content"}
                }
            ]
        }"#;
        let files = parse_record_files(json).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].key, "a.zip");
        assert_eq!(files[0].size, Some(1024));
        assert_eq!(files[0].checksum.algorithm, DigestAlgorithm::Md5);
        assert_eq!(files[1].size, None);
        assert!(files[1].url.ends_with("b.zip/content"));
    }

    #[test]
    fn parse_files_subresource_prefers_content_link() {
        let json = r#"{
            "entries": [
                {
                    "key": "a.zip",
                    "checksum": "md5:0cc175b9c0f1b6a831c399e269772661",
                    "links": {
                        "self": "https://zenodo.org/api/records/1/files/a.zip",
                        "content": "https://zenodo.org/api/records/1/files/a.zip/content"
                    }
                }
            ]
        }"#;
        let files = parse_record_files(json).unwrap();
        assert_eq!(
            files[0].url,
            "https://zenodo.org/api/records/1/files/a.zip/content"
        );
    }

    #[test]
    fn listing_without_files_is_network_error() {
        let err = parse_record_files(r#"{"id": 1}"#).unwrap_err();
        assert_matches!(err, ScenarioLinkError::Network(_));
    }

    #[test]
    fn entry_without_checksum_is_rejected() {
        let json = r#"{"files": [{"key": "a.zip", "links": {"self": "https://x/a.zip"}}]}"#;
        let err = parse_record_files(json).unwrap_err();
        assert_matches!(err, ScenarioLinkError::InvalidDigest(_));
    }
}
