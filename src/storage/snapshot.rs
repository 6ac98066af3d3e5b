//! On-disk snapshot files and the atomic-replace convention.
//!
//! Snapshots are rewritten wholesale: the new contents go to `<file>.tmp`, are
//! fsynced, and are renamed over the target. A reader therefore sees either the
//! previous snapshot or the new one, never a partial write.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::types::{FeedbackEntry, KnowledgeEntry};

pub const KNOWLEDGE_FILE: &str = "knowledge.json";
pub const FEEDBACK_FILE: &str = "feedback.json";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub entries: Vec<KnowledgeEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub feedback: Vec<FeedbackEntry>,
}

/// Temp path used while writing `path`.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to `path` via temp file + fsync + rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);

    let result = (|| -> Result<()> {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("failed to create temp file: {}", tmp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write temp file: {}", tmp.display()))?;
        file.sync_all().context("failed to fsync temp file")?;
        drop(file);

        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename temp file over {}", path.display()))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
        return result;
    }

    // Persist the rename itself.
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Read a JSON snapshot. `Ok(None)` when the file does not exist; `Err` when it
/// exists but cannot be read or parsed.
pub fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let parsed = serde_json::from_slice(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(parsed))
}

/// Remove a temp file left behind by a flush that never reached its rename.
pub fn remove_stale_tmp(path: &Path) {
    let tmp = tmp_path(path);
    if tmp.exists() {
        match std::fs::remove_file(&tmp) {
            Ok(()) => tracing::warn!(path = %tmp.display(), "removed interrupted snapshot write"),
            Err(e) => tracing::warn!(path = %tmp.display(), error = %e, "failed to remove stale temp file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_replaces_target() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.json");

        write_atomic(&path, b"{\"a\":1}").unwrap();
        write_atomic(&path, b"{\"a\":2}").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn missing_snapshot_is_none() {
        let tmp = TempDir::new().unwrap();
        let loaded: Option<serde_json::Value> =
            read_snapshot(&tmp.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, b"{\"entries\": [").unwrap();
        assert!(read_snapshot::<serde_json::Value>(&path).is_err());
    }

    #[test]
    fn interrupted_write_leaves_previous_snapshot_intact() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.json");
        write_atomic(&path, b"{\"a\":1}").unwrap();

        // Simulate a crash between writing the temp file and renaming it.
        std::fs::write(tmp_path(&path), b"{\"a\":").unwrap();

        let loaded: serde_json::Value = read_snapshot(&path).unwrap().unwrap();
        assert_eq!(loaded["a"], 1);

        remove_stale_tmp(&path);
        assert!(!tmp_path(&path).exists());
    }
}
