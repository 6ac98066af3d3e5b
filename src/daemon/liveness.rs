//! Directory ownership: the `<dir>/daemon.lock` file lock and the
//! `<dir>/daemon.json` liveness marker.
//!
//! A daemon takes the lock before it loads storage or binds, and holds it
//! until it stops. The marker is written once the listener is bound and
//! removed on a clean stop. Whoever holds the lock owns the directory, so a
//! marker found by the lock holder is stale.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::transport::BoundAddress;
use crate::storage::snapshot;

pub const MARKER_FILE: &str = "daemon.json";
pub const LOCK_FILE: &str = "daemon.lock";

/// Exclusive claim on a storage directory, released when dropped.
///
/// The lock lives on the open file, so the kernel releases it when the
/// process dies and there is never a stale lock to clean up. The file itself
/// stays in place; unlinking it would let two processes lock different inodes.
#[derive(Debug)]
pub struct OwnershipLock {
    _file: std::fs::File,
}

impl OwnershipLock {
    /// `Ok(None)` when another daemon, in this process or another, holds the lock.
    pub fn try_acquire(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(LOCK_FILE);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;
        if !lock_exclusive(&file).with_context(|| format!("failed to lock {}", path.display()))? {
            return Ok(None);
        }

        // Holder pid, for humans reading the directory.
        use std::io::Write;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Some(Self { _file: file }))
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &std::fs::File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

// Without flock only the liveness marker guards the directory.
#[cfg(not(unix))]
fn lock_exclusive(_file: &std::fs::File) -> std::io::Result<bool> {
    Ok(true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessMarker {
    pub pid: u32,
    /// `unix:<path>` or `http://<addr>`.
    pub address: String,
    pub started_at: DateTime<Utc>,
    pub version: String,
}

impl LivenessMarker {
    pub fn for_current_process(address: &BoundAddress) -> Self {
        Self {
            pid: std::process::id(),
            address: address.to_string(),
            started_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MARKER_FILE)
    }

    /// `Ok(None)` when no marker exists. An unparsable marker is treated as stale.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        match snapshot::read_snapshot::<Self>(&path) {
            Ok(marker) => Ok(marker),
            Err(e) if path.exists() => {
                tracing::warn!(error = %format!("{e:#}"), "unreadable liveness marker, treating as stale");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("failed to serialize liveness marker")?;
        snapshot::write_atomic(&Self::path(dir), &bytes)
    }

    pub fn remove(dir: &Path) -> Result<()> {
        match std::fs::remove_file(Self::path(dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to remove liveness marker"),
        }
    }

    pub fn address(&self) -> Result<BoundAddress> {
        self.address.parse()
    }

    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 performs the permission and existence checks without delivering anything.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    pid == std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_remove() {
        let tmp = TempDir::new().unwrap();
        let address = BoundAddress::Socket(tmp.path().join("memoryd.sock"));
        let marker = LivenessMarker::for_current_process(&address);

        marker.write(tmp.path()).unwrap();
        let loaded = LivenessMarker::read(tmp.path()).unwrap().unwrap();
        assert_eq!(loaded, marker);
        assert!(loaded.is_alive());
        assert_eq!(loaded.address().unwrap(), address);

        LivenessMarker::remove(tmp.path()).unwrap();
        LivenessMarker::remove(tmp.path()).unwrap();
        assert!(LivenessMarker::read(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn garbage_marker_reads_as_absent() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(LivenessMarker::path(tmp.path()), b"pid=12").unwrap();
        assert!(LivenessMarker::read(tmp.path()).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn lock_is_exclusive_until_dropped() {
        let tmp = TempDir::new().unwrap();
        let first = OwnershipLock::try_acquire(tmp.path()).unwrap();
        assert!(first.is_some());
        assert!(OwnershipLock::try_acquire(tmp.path()).unwrap().is_none());

        drop(first);
        let second = OwnershipLock::try_acquire(tmp.path()).unwrap();
        assert!(second.is_some());
        let holder = std::fs::read_to_string(tmp.path().join(LOCK_FILE)).unwrap();
        assert_eq!(holder.trim(), std::process::id().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_is_not_alive() {
        // A child that has exited and been reaped no longer exists.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!pid_alive(pid));
        assert!(pid_alive(std::process::id()));
    }
}
