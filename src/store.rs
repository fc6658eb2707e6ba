use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::Serialize;
use tempfile::{Builder, TempDir};
use tracing::{debug, info};

use crate::domain::RecordId;
use crate::error::ScenarioLinkError;

const ARCHIVE_EXT: &str = "zip";
const STAGING_PREFIX: &str = ".staging-";

/// Process-wide archive cache: one `<record_id>.zip` per record, no index.
/// A file at `path_for(id)` is always a complete, verified archive; partial
/// work happens in staging directories under the same root and is renamed
/// into place only once finished.
#[derive(Debug, Clone)]
pub struct Cache {
    cache_root: Utf8PathBuf,
    locks: Arc<Mutex<HashMap<RecordId, Arc<Mutex<()>>>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub record_id: String,
    pub path: String,
    pub size_bytes: u64,
    pub modified_at: Option<String>,
}

impl Cache {
    pub fn new() -> Result<Self, ScenarioLinkError> {
        let cache_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.cache_dir().join("ActivityBrowser")).ok()
            })
            .ok_or_else(|| {
                ScenarioLinkError::Storage("unable to resolve cache directory".to_string())
            })?;
        Ok(Self::new_with_root(cache_root))
    }

    pub fn new_with_root(cache_root: Utf8PathBuf) -> Self {
        Self {
            cache_root,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn path_for(&self, id: &RecordId) -> Utf8PathBuf {
        self.cache_root.join(format!("{id}.{ARCHIVE_EXT}"))
    }

    pub fn is_cached(&self, id: &RecordId) -> bool {
        self.path_for(id).as_std_path().is_file()
    }

    pub fn ensure_cache_root(&self) -> Result<&Utf8Path, ScenarioLinkError> {
        fs::create_dir_all(self.cache_root.as_std_path())
            .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        Ok(&self.cache_root)
    }

    /// Private scratch directory on the cache's filesystem. Removed on drop.
    pub fn staging_dir(&self) -> Result<TempDir, ScenarioLinkError> {
        self.ensure_cache_root()?;
        Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(self.cache_root.as_std_path())
            .map_err(|err| ScenarioLinkError::Storage(err.to_string()))
    }

    /// Moves a fully assembled archive into its canonical location.
    pub fn commit(&self, staged: &Utf8Path, id: &RecordId) -> Result<Utf8PathBuf, ScenarioLinkError> {
        let target = self.path_for(id);
        self.ensure_cache_root()?;
        if fs::rename(staged.as_std_path(), target.as_std_path()).is_err() {
            // rename does not replace an existing file on every platform
            if target.as_std_path().exists() {
                fs::remove_file(target.as_std_path())
                    .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
            }
            fs::rename(staged.as_std_path(), target.as_std_path())
                .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        }
        info!(record = %id, path = %target, "archive cached");
        Ok(target)
    }

    /// Serializes work on one record id within this process.
    pub fn with_record_lock<T>(&self, id: &RecordId, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(id.clone()).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f()
        };
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // only the map and this call still hold it: nobody is waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
        result
    }

    pub fn entries(&self) -> Result<Vec<CacheEntry>, ScenarioLinkError> {
        if !self.cache_root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        let dir = fs::read_dir(self.cache_root.as_std_path())
            .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        for entry in dir {
            let entry = entry.map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if !path.as_std_path().is_file() || path.extension() != Some(ARCHIVE_EXT) {
                continue;
            }
            let Some(record_id) = path.file_stem().and_then(|stem| stem.parse::<RecordId>().ok())
            else {
                continue;
            };
            let metadata = entry
                .metadata()
                .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
            let modified_at = metadata
                .modified()
                .ok()
                .map(|time| chrono::DateTime::<chrono::Utc>::from(time).to_rfc3339());
            entries.push(CacheEntry {
                record_id: record_id.to_string(),
                path: path.to_string(),
                size_bytes: metadata.len(),
                modified_at,
            });
        }
        entries.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        Ok(entries)
    }

    pub fn remove(&self, id: &RecordId) -> Result<bool, ScenarioLinkError> {
        self.with_record_lock(id, || {
            let path = self.path_for(id);
            if !path.as_std_path().exists() {
                return Ok(false);
            }
            fs::remove_file(path.as_std_path())
                .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
            debug!(record = %id, "cache entry removed");
            Ok(true)
        })
    }

    /// Removes every cached archive and stale staging directory. Other files
    /// under the root are left alone since the directory is shared with the
    /// host application.
    pub fn clear(&self) -> Result<usize, ScenarioLinkError> {
        let mut removed = 0;
        for entry in self.entries()? {
            if let Ok(id) = entry.record_id.parse::<RecordId>() {
                if self.remove(&id)? {
                    removed += 1;
                }
            }
        }
        if self.cache_root.as_std_path().exists() {
            let dir = fs::read_dir(self.cache_root.as_std_path())
                .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
            for entry in dir.flatten() {
                let path = entry.path();
                let is_staging = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with(STAGING_PREFIX))
                    .unwrap_or(false);
                if is_staging && path.is_dir() {
                    fs::remove_dir_all(&path)
                        .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
                }
            }
        }
        info!(removed, "cache cleared");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache() -> (tempfile::TempDir, Cache) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap();
        (temp, Cache::new_with_root(root))
    }

    #[test]
    fn layout_paths() {
        let (_temp, cache) = temp_cache();
        let id: RecordId = "8351309".parse().unwrap();
        assert!(cache.path_for(&id).ends_with("cache/8351309.zip"));
        assert!(!cache.is_cached(&id));
    }

    #[test]
    fn ensure_cache_root_is_idempotent() {
        let (_temp, cache) = temp_cache();
        cache.ensure_cache_root().unwrap();
        cache.ensure_cache_root().unwrap();
        assert!(cache.cache_root().as_std_path().is_dir());
    }

    #[test]
    fn commit_moves_staged_archive() {
        let (_temp, cache) = temp_cache();
        let id: RecordId = "42".parse().unwrap();
        let staging = cache.staging_dir().unwrap();
        let staged = Utf8PathBuf::from_path_buf(staging.path().join("42.zip")).unwrap();
        fs::write(staged.as_std_path(), b"archive").unwrap();

        let target = cache.commit(&staged, &id).unwrap();
        assert_eq!(target, cache.path_for(&id));
        assert!(cache.is_cached(&id));
        assert!(!staged.as_std_path().exists());
    }

    #[test]
    fn record_locks_are_pruned_once_released() {
        let (_temp, cache) = temp_cache();
        let first: RecordId = "1".parse().unwrap();
        let second: RecordId = "2".parse().unwrap();

        let held_inside = cache.with_record_lock(&first, || {
            cache.with_record_lock(&second, || cache.locks.lock().unwrap().len())
        });
        assert_eq!(held_inside, 2);
        assert!(cache.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn clear_keeps_foreign_files() {
        let (_temp, cache) = temp_cache();
        cache.ensure_cache_root().unwrap();
        fs::write(cache.cache_root().join("1.zip").as_std_path(), b"a").unwrap();
        fs::write(cache.cache_root().join("2.zip").as_std_path(), b"b").unwrap();
        fs::write(cache.cache_root().join("settings.json").as_std_path(), b"{}").unwrap();
        let staging = cache.staging_dir().unwrap().keep();

        assert_eq!(cache.entries().unwrap().len(), 2);
        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.entries().unwrap().is_empty());
        assert!(cache.cache_root().join("settings.json").as_std_path().exists());
        assert!(!staging.exists());
    }
}
