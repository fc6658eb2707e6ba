use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use zip::ZipArchive;

use crate::error::ScenarioLinkError;

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<usize, ScenarioLinkError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        ScenarioLinkError::Storage(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive = ZipArchive::new(file)
        .map_err(|err| ScenarioLinkError::InvalidArchive(format!("{}: {err}", zip_path.display())))?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| ScenarioLinkError::InvalidArchive(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(ScenarioLinkError::InvalidArchive(format!(
                    "zip entry path traversal detected: {}",
                    entry.name()
                )));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| ScenarioLinkError::InvalidArchive(err.to_string()))?;
        written += 1;
    }
    Ok(written)
}

/// Reads every entry to the end so CRC and truncation problems surface
/// before anything is extracted.
pub fn validate_zip(zip_path: &Path) -> Result<(), ScenarioLinkError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        ScenarioLinkError::Storage(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive = ZipArchive::new(file)
        .map_err(|err| ScenarioLinkError::InvalidArchive(format!("{}: {err}", zip_path.display())))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| ScenarioLinkError::InvalidArchive(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| ScenarioLinkError::InvalidArchive(err.to_string()))?;
    }
    Ok(())
}

/// All regular files under `root`, sorted so archive layout is reproducible.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>, ScenarioLinkError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| ScenarioLinkError::Storage(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                items.push(path);
            }
        }
    }
    items.sort();
    Ok(items)
}

/// Archive entry name for a path relative to an extraction root: forward
/// slashes, no `.`/`..`/root components.
pub fn archive_name(relative: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
