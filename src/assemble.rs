use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::Path;

use camino::Utf8PathBuf;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::app::{ProgressEvent, ProgressSink};
use crate::digest;
use crate::domain::RecordId;
use crate::error::ScenarioLinkError;
use crate::fs_util;
use crate::zenodo::{RecordClient, RemoteFile, TransferProgress};

const PROGRESS_STEP: u64 = 4 * 1024 * 1024;

/// Downloads each fragment of a record, verifies it, unpacks it and repacks
/// the union of all fragments into one archive. Fragments are handled in
/// listing order and the first failure aborts the whole assembly.
pub struct Assembler<'a, C: RecordClient + ?Sized> {
    client: &'a C,
    sink: &'a dyn ProgressSink,
}

impl<'a, C: RecordClient + ?Sized> Assembler<'a, C> {
    pub fn new(client: &'a C, sink: &'a dyn ProgressSink) -> Self {
        Self { client, sink }
    }

    /// Writes `<staging_dir>/<id>.zip`. On error no archive is left behind.
    pub fn assemble(
        &self,
        id: &RecordId,
        files: &[RemoteFile],
        staging_dir: &Path,
    ) -> Result<Utf8PathBuf, ScenarioLinkError> {
        let archive_path = staging_dir.join(format!("{id}.zip"));
        let archive_path = Utf8PathBuf::from_path_buf(archive_path)
            .map_err(|_| ScenarioLinkError::Storage("non-utf8 staging path".to_string()))?;

        match self.write_archive(&archive_path, files, staging_dir) {
            Ok(entries) => {
                info!(record = %id, fragments = files.len(), entries, "archive assembled");
                Ok(archive_path)
            }
            Err(err) => {
                if archive_path.as_std_path().exists() {
                    let _ = fs::remove_file(archive_path.as_std_path());
                }
                Err(err)
            }
        }
    }

    fn write_archive(
        &self,
        archive_path: &Utf8PathBuf,
        files: &[RemoteFile],
        staging_dir: &Path,
    ) -> Result<usize, ScenarioLinkError> {
        let file = File::create(archive_path.as_std_path())
            .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        let mut writer = ZipWriter::new(BufWriter::new(file));
        let mut written = BTreeSet::new();

        for (idx, remote) in files.iter().enumerate() {
            self.sink.event(ProgressEvent::new(format!(
                "phase=Fetch; downloading file {}/{} {}",
                idx + 1,
                files.len(),
                remote.key
            )));
            let fragment_dir = tempfile::Builder::new()
                .prefix("fragment")
                .tempdir_in(staging_dir)
                .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
            let download_path = fragment_dir.path().join("download.zip");
            self.download(remote, &download_path)?;

            self.sink.event(ProgressEvent::new(format!(
                "phase=Verify; checking {} ({})",
                remote.key, remote.checksum.algorithm
            )));
            if !digest::verify(&download_path, &remote.checksum)? {
                let actual = digest::compute(&download_path, remote.checksum.algorithm)?;
                return Err(ScenarioLinkError::Integrity {
                    file: remote.key.clone(),
                    expected: remote.checksum.to_string(),
                    actual: format!("{}:{actual}", remote.checksum.algorithm),
                });
            }

            self.sink.event(ProgressEvent::new(format!(
                "phase=Assemble; unpacking {}",
                remote.key
            )));
            fs_util::validate_zip(&download_path)?;
            let extract_dir = fragment_dir.path().join("extract");
            fs::create_dir_all(&extract_dir)
                .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
            fs_util::extract_zip(&download_path, &extract_dir)?;
            append_tree(&mut writer, &extract_dir, &mut written, &remote.key)?;
        }

        let mut inner = writer
            .finish()
            .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        io::Write::flush(&mut inner).map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        Ok(written.len())
    }

    fn download(&self, remote: &RemoteFile, destination: &Path) -> Result<(), ScenarioLinkError> {
        let mut next_report = PROGRESS_STEP;
        let key = remote.key.as_str();
        let sink = self.sink;
        let mut report = |progress: TransferProgress| {
            if progress.downloaded < next_report && Some(progress.downloaded) != progress.total {
                return;
            }
            next_report = progress.downloaded + PROGRESS_STEP;
            let message = match progress.total {
                Some(total) if total > 0 => format!(
                    "download {key} {}/{} bytes ({}%)",
                    progress.downloaded,
                    total,
                    progress.downloaded * 100 / total
                ),
                _ => format!("download {key} {} bytes", progress.downloaded),
            };
            sink.event(ProgressEvent::new(message));
        };
        let bytes = self.client.download(&remote.url, destination, &mut report)?;
        debug!(file = key, bytes, "fragment downloaded");
        Ok(())
    }
}

fn append_tree<W: io::Write + io::Seek>(
    writer: &mut ZipWriter<W>,
    root: &Path,
    written: &mut BTreeSet<String>,
    fragment: &str,
) -> Result<(), ScenarioLinkError> {
    for path in fs_util::walk_files(root)? {
        let relative = path
            .strip_prefix(root)
            .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        let name = fs_util::archive_name(relative).ok_or_else(|| {
            ScenarioLinkError::InvalidArchive(format!(
                "unsupported entry name {} in {fragment}",
                relative.display()
            ))
        })?;
        if written.contains(&name) {
            warn!(entry = %name, fragment, "duplicate entry across fragments, keeping first");
            continue;
        }
        let size = fs::metadata(&path)
            .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?
            .len();
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(size >= u64::from(u32::MAX));
        writer
            .start_file(name.as_str(), options)
            .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        let mut source =
            File::open(&path).map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        io::copy(&mut source, writer).map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        written.insert(name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::ExpectedDigest;

    struct NoopSink;

    impl ProgressSink for NoopSink {
        fn event(&self, _event: ProgressEvent) {}
    }

    /// Serves fragments from memory, keyed by URL.
    struct MemoryClient {
        fragments: Vec<(String, Vec<u8>)>,
        downloads: Mutex<usize>,
    }

    impl RecordClient for MemoryClient {
        fn list_files(&self, _id: &RecordId) -> Result<Vec<RemoteFile>, ScenarioLinkError> {
            Ok(Vec::new())
        }

        fn download(
            &self,
            url: &str,
            destination: &Path,
            progress: &mut dyn FnMut(TransferProgress),
        ) -> Result<u64, ScenarioLinkError> {
            *self.downloads.lock().unwrap() += 1;
            let (_, bytes) = self
                .fragments
                .iter()
                .find(|(candidate, _)| candidate == url)
                .ok_or_else(|| ScenarioLinkError::NetworkStatus {
                    status: 404,
                    message: url.to_string(),
                })?;
            fs::write(destination, bytes).unwrap();
            progress(TransferProgress {
                downloaded: bytes.len() as u64,
                total: Some(bytes.len() as u64),
            });
            Ok(bytes.len() as u64)
        }
    }

    fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(io::Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn remote(key: &str, bytes: &[u8]) -> RemoteFile {
        let temp = tempfile::NamedTempFile::new().unwrap();
        fs::write(temp.path(), bytes).unwrap();
        let hex = digest::compute(temp.path(), crate::domain::DigestAlgorithm::Md5).unwrap();
        RemoteFile {
            key: key.to_string(),
            url: format!("mem://{key}"),
            checksum: format!("md5:{hex}").parse::<ExpectedDigest>().unwrap(),
            size: Some(bytes.len() as u64),
        }
    }

    fn entry_names(path: &Utf8PathBuf) -> Vec<String> {
        let archive = zip::ZipArchive::new(File::open(path.as_std_path()).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    #[test]
    fn merges_fragments_preserving_relative_paths() {
        let a = zip_bytes(&[("datapackage.json", "{}"), ("data/a.csv", "1")]);
        let b = zip_bytes(&[("data/b.csv", "2"), ("datapackage.json", "{\"dup\": true}")]);
        let files = vec![remote("a.zip", &a), remote("b.zip", &b)];
        let client = MemoryClient {
            fragments: vec![("mem://a.zip".to_string(), a), ("mem://b.zip".to_string(), b)],
            downloads: Mutex::new(0),
        };
        let staging = tempfile::tempdir().unwrap();
        let id: RecordId = "12345".parse().unwrap();

        let path = Assembler::new(&client, &NoopSink)
            .assemble(&id, &files, staging.path())
            .unwrap();

        assert!(path.ends_with("12345.zip"));
        assert_eq!(
            entry_names(&path),
            vec!["data/a.csv", "data/b.csv", "datapackage.json"]
        );
        assert_eq!(*client.downloads.lock().unwrap(), 2);
    }

    #[test]
    fn checksum_mismatch_aborts_and_removes_archive() {
        let a = zip_bytes(&[("datapackage.json", "{}")]);
        let b = zip_bytes(&[("data/b.csv", "2")]);
        let mut bad = remote("b.zip", &b);
        bad.checksum = "md5:00000000000000000000000000000000".parse().unwrap();
        let files = vec![remote("a.zip", &a), bad];
        let client = MemoryClient {
            fragments: vec![("mem://a.zip".to_string(), a), ("mem://b.zip".to_string(), b)],
            downloads: Mutex::new(0),
        };
        let staging = tempfile::tempdir().unwrap();
        let id: RecordId = "12345".parse().unwrap();

        let err = Assembler::new(&client, &NoopSink)
            .assemble(&id, &files, staging.path())
            .unwrap_err();

        assert_matches!(err, ScenarioLinkError::Integrity { ref file, .. } if file == "b.zip");
        assert!(!staging.path().join("12345.zip").exists());
    }

    #[test]
    fn download_failure_midway_leaves_no_archive() {
        let a = zip_bytes(&[("datapackage.json", "{}")]);
        let files = vec![remote("a.zip", &a), remote("missing.zip", b"whatever")];
        let client = MemoryClient {
            fragments: vec![("mem://a.zip".to_string(), a)],
            downloads: Mutex::new(0),
        };
        let staging = tempfile::tempdir().unwrap();
        let id: RecordId = "12345".parse().unwrap();

        let err = Assembler::new(&client, &NoopSink)
            .assemble(&id, &files, staging.path())
            .unwrap_err();

        assert_matches!(err, ScenarioLinkError::NetworkStatus { status: 404, .. });
        assert!(!staging.path().join("12345.zip").exists());
    }
}
