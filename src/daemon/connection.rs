//! Connection ceiling and per-connection bookkeeping.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;

struct ConnectionInfo {
    peer: String,
    connected_at: Instant,
    task: Option<AbortHandle>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub active: usize,
    pub accepted: u64,
    pub rejected: u64,
}

pub struct ConnectionManager {
    max: usize,
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, ConnectionInfo>>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl ConnectionManager {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            next_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, ConnectionInfo>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Claim a slot. `None` when the ceiling is reached.
    pub fn try_admit(self: &Arc<Self>, peer: impl Into<String>) -> Option<ConnectionGuard> {
        let mut active = self.lock();
        if active.len() >= self.max {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let peer = peer.into();
        tracing::debug!(id, peer = %peer, active = active.len() + 1, "connection admitted");
        active.insert(
            id,
            ConnectionInfo {
                peer,
                connected_at: Instant::now(),
                task: None,
            },
        );
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Some(ConnectionGuard {
            id,
            manager: Arc::clone(self),
        })
    }

    /// Associate the task serving connection `id` so it can be aborted at shutdown.
    pub fn attach(&self, id: u64, task: AbortHandle) {
        if let Some(info) = self.lock().get_mut(&id) {
            info.task = Some(task);
        }
    }

    fn release(&self, id: u64) {
        if let Some(info) = self.lock().remove(&id) {
            tracing::debug!(
                id,
                peer = %info.peer,
                duration_ms = info.connected_at.elapsed().as_millis() as u64,
                "connection closed"
            );
        }
    }

    pub fn active(&self) -> usize {
        self.lock().len()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active: self.active(),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Wait for every connection to close, up to `grace`. Returns `true` when drained.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.active() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Abort every connection task still running. Returns how many were aborted.
    pub fn abort_all(&self) -> usize {
        let drained: Vec<(u64, ConnectionInfo)> = self.lock().drain().collect();
        for (id, info) in &drained {
            if let Some(task) = &info.task {
                task.abort();
            }
            tracing::warn!(id = *id, peer = %info.peer, "connection aborted at shutdown");
        }
        drained.len()
    }
}

/// A held connection slot. Dropping it frees the slot.
pub struct ConnectionGuard {
    id: u64,
    manager: Arc<ConnectionManager>,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_rejects_and_release_frees_slot() {
        let manager = ConnectionManager::new(2);
        let a = manager.try_admit("a").unwrap();
        let _b = manager.try_admit("b").unwrap();
        assert!(manager.try_admit("c").is_none());
        assert_eq!(manager.active(), 2);

        drop(a);
        assert!(manager.try_admit("d").is_some());

        let stats = manager.stats();
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn abort_all_clears_active_set() {
        let manager = ConnectionManager::new(4);
        let guard = manager.try_admit("peer").unwrap();
        let task = tokio::spawn(std::future::pending::<()>());
        manager.attach(guard.id(), task.abort_handle());

        assert!(!manager.wait_idle(Duration::from_millis(50)).await);
        assert_eq!(manager.abort_all(), 1);
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(manager.wait_idle(Duration::from_millis(10)).await);
        drop(guard);
    }
}
