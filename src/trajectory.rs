//! In-memory tracking of in-flight units of work ("trajectories").
//!
//! A trajectory begins with `beginTrajectory` and completes when feedback for it
//! arrives. Completed trajectories are kept until the eviction manager flushes them;
//! active ones are evicted oldest-first under memory pressure.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::eviction::TrajectoryEvictor;
use crate::storage::{Outcome, Storage};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trajectory {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

impl Trajectory {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    fn approx_bytes(&self) -> usize {
        96 + self.id.len() + self.label.as_ref().map(String::len).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoryStats {
    pub active: usize,
    pub completed: usize,
}

#[derive(Default)]
struct TrackerState {
    trajectories: HashMap<String, Trajectory>,
    /// Ids in start order.
    order: VecDeque<String>,
}

#[derive(Default)]
pub struct TrajectoryTracker {
    state: Mutex<TrackerState>,
}

impl TrajectoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, TrackerState>> {
        self.state
            .lock()
            .map_err(|e| anyhow!("trajectory lock poisoned: {e}"))
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.state.lock();
            panic!("panicked while holding the trajectory lock");
        }));
    }

    /// Start tracking `id` (generated when `None`). Beginning an id that is
    /// already tracked returns the existing trajectory unchanged.
    pub fn begin(&self, id: Option<String>, label: Option<String>) -> Result<Trajectory> {
        let id = id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let mut state = self.lock()?;
        if let Some(existing) = state.trajectories.get(&id) {
            return Ok(existing.clone());
        }
        let trajectory = Trajectory {
            id: id.clone(),
            label,
            started_at: Utc::now(),
            completed_at: None,
            outcome: None,
        };
        state.trajectories.insert(id.clone(), trajectory.clone());
        state.order.push_back(id);
        Ok(trajectory)
    }

    /// Mark an active trajectory complete. Returns `false` when the id is not
    /// tracked or was already complete.
    pub fn complete(&self, id: &str, outcome: Outcome) -> Result<bool> {
        let mut state = self.lock()?;
        match state.trajectories.get_mut(id) {
            Some(t) if !t.is_complete() => {
                t.completed_at = Some(Utc::now());
                t.outcome = Some(outcome);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Trajectory>> {
        Ok(self.lock()?.trajectories.get(id).cloned())
    }

    pub fn stats(&self) -> Result<TrajectoryStats> {
        let state = self.lock()?;
        let completed = state
            .trajectories
            .values()
            .filter(|t| t.is_complete())
            .count();
        Ok(TrajectoryStats {
            active: state.trajectories.len() - completed,
            completed,
        })
    }

    /// Total tracked trajectories, active and completed.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.trajectories.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn approx_bytes(&self) -> Result<usize> {
        Ok(self
            .lock()?
            .trajectories
            .values()
            .map(Trajectory::approx_bytes)
            .sum())
    }

    /// Remove and return every completed trajectory.
    pub fn drain_completed(&self) -> Result<Vec<Trajectory>> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let done: Vec<String> = state
            .order
            .iter()
            .filter(|id| state.trajectories.get(*id).is_some_and(Trajectory::is_complete))
            .cloned()
            .collect();
        let mut drained = Vec::with_capacity(done.len());
        for id in &done {
            if let Some(t) = state.trajectories.remove(id) {
                drained.push(t);
            }
        }
        state.order.retain(|id| state.trajectories.contains_key(id));
        Ok(drained)
    }

    /// Drop up to `count` active trajectories, oldest start first.
    pub fn evict_oldest_active(&self, count: usize) -> Result<usize> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let victims: Vec<String> = state
            .order
            .iter()
            .filter(|id| state.trajectories.get(*id).is_some_and(|t| !t.is_complete()))
            .take(count)
            .cloned()
            .collect();
        for id in &victims {
            state.trajectories.remove(id);
        }
        state.order.retain(|id| state.trajectories.contains_key(id));
        Ok(victims.len())
    }
}

/// The trajectory tracker as seen by the eviction manager.
///
/// Completed trajectories are only dropped after a storage flush has made their
/// feedback durable.
pub struct TrajectoryCache {
    tracker: Arc<TrajectoryTracker>,
    storage: Storage,
}

impl TrajectoryCache {
    pub fn new(tracker: Arc<TrajectoryTracker>, storage: Storage) -> Self {
        Self { tracker, storage }
    }
}

impl TrajectoryEvictor for TrajectoryCache {
    fn size(&self) -> Result<usize> {
        self.tracker.len()
    }

    fn flush_completed(&self) -> Result<usize> {
        self.storage.flush()?;
        let drained = self.tracker.drain_completed()?;
        tracing::debug!(flushed = drained.len(), "completed trajectories flushed");
        Ok(drained.len())
    }

    fn evict_oldest_active(&self, count: usize) -> Result<usize> {
        self.tracker.evict_oldest_active(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_is_idempotent_per_id() {
        let tracker = TrajectoryTracker::new();
        let first = tracker.begin(Some("t1".into()), Some("build".into())).unwrap();
        let again = tracker.begin(Some("t1".into()), None).unwrap();
        assert_eq!(first.started_at, again.started_at);
        assert_eq!(again.label.as_deref(), Some("build"));
        assert_eq!(tracker.len().unwrap(), 1);

        let generated = tracker.begin(None, None).unwrap();
        assert!(!generated.id.is_empty());
    }

    #[test]
    fn complete_only_affects_tracked_active() {
        let tracker = TrajectoryTracker::new();
        tracker.begin(Some("t1".into()), None).unwrap();

        assert!(tracker.complete("t1", Outcome::Positive).unwrap());
        assert!(!tracker.complete("t1", Outcome::Negative).unwrap());
        assert!(!tracker.complete("unknown", Outcome::Neutral).unwrap());

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn evicts_oldest_active_and_skips_completed() {
        let tracker = TrajectoryTracker::new();
        for id in ["a", "b", "c", "d"] {
            tracker.begin(Some(id.into()), None).unwrap();
        }
        tracker.complete("a", Outcome::Positive).unwrap();

        assert_eq!(tracker.evict_oldest_active(2).unwrap(), 2);
        assert!(tracker.get("a").unwrap().is_some(), "completed kept");
        assert!(tracker.get("b").unwrap().is_none());
        assert!(tracker.get("c").unwrap().is_none());
        assert!(tracker.get("d").unwrap().is_some());

        let drained = tracker.drain_completed().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, "a");
        assert_eq!(tracker.len().unwrap(), 1);
    }
}
