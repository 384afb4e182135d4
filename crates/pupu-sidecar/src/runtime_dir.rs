//! Size report and cleanup for the sidecar's runtime data directory.
//! Blocking; call from `spawn_blocking`.

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeDirSize {
    pub entries: Vec<RuntimeEntry>,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeDirOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RuntimeDirOutcome {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

// Symlinks are sized as links, never followed.
fn path_size(path: &Path) -> u64 {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| path_size(&entry.path()))
        .sum()
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn non_blank(dir: &str) -> Option<PathBuf> {
    let dir = dir.trim();
    (!dir.is_empty()).then(|| PathBuf::from(dir))
}

/// Top-level entries of `dir` with recursive sizes, largest first.
pub fn runtime_dir_size(dir: &str) -> RuntimeDirSize {
    let Some(dir) = non_blank(dir) else {
        return RuntimeDirSize {
            entries: Vec::new(),
            total: 0,
            error: Some("no_path".to_string()),
        };
    };
    let Ok(read) = fs::read_dir(&dir) else {
        return RuntimeDirSize {
            entries: Vec::new(),
            total: 0,
            error: Some("not_found".to_string()),
        };
    };

    let mut entries: Vec<RuntimeEntry> = read
        .flatten()
        .filter_map(|entry| {
            let meta = fs::symlink_metadata(entry.path()).ok()?;
            Some(RuntimeEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: path_size(&entry.path()),
                is_dir: meta.is_dir(),
            })
        })
        .collect();
    entries.sort_by(|a, b| b.size.cmp(&a.size));
    let total = entries.iter().map(|e| e.size).sum();

    RuntimeDirSize {
        entries,
        total,
        error: None,
    }
}

/// Delete one entry of `dir`. Only the final path component of `entry_name`
/// is used, so nothing outside `dir` can be named.
pub fn delete_runtime_entry(dir: &str, entry_name: &str) -> RuntimeDirOutcome {
    let Some(dir) = non_blank(dir) else {
        return RuntimeDirOutcome::failed("invalid");
    };
    let Some(name) = Path::new(entry_name.trim()).file_name() else {
        return RuntimeDirOutcome::failed("invalid");
    };
    match remove_path(&dir.join(name)) {
        Ok(()) => RuntimeDirOutcome::ok(),
        Err(e) => RuntimeDirOutcome::failed(e.to_string()),
    }
}

/// Delete everything inside `dir`, keeping `dir` itself.
pub fn clear_runtime_dir(dir: &str) -> RuntimeDirOutcome {
    let Some(dir) = non_blank(dir).filter(|d| d.is_dir()) else {
        return RuntimeDirOutcome::failed("not_found");
    };
    let read = match fs::read_dir(&dir) {
        Ok(read) => read,
        Err(e) => return RuntimeDirOutcome::failed(e.to_string()),
    };
    for entry in read.flatten() {
        if let Err(e) = remove_path(&entry.path()) {
            return RuntimeDirOutcome::failed(e.to_string());
        }
    }
    RuntimeDirOutcome::ok()
}
