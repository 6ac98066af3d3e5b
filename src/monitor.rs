//! Memory monitor: samples usage counters and raises alerts at thresholds.
//!
//! Each component has a configured limit. A reading at or above
//! `warning_ratio × limit` raises a `warning`; a reading at or above the limit
//! raises an `error`. Alerts are broadcast to subscribers (the eviction manager).
//! Repeated alerts for the same component are suppressed for `alert_cooldown_ms`
//! unless the severity escalates.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::MonitorConfig;
use crate::eviction::CacheEvictor;
use crate::storage::Storage;
use crate::trajectory::TrajectoryTracker;

/// Logical component a memory alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertComponent {
    EpisodeCache,
    EmbeddingCache,
    TrajectoryCache,
    TotalOverhead,
}

impl AlertComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EpisodeCache => "episodeCache",
            Self::EmbeddingCache => "embeddingCache",
            Self::TrajectoryCache => "trajectoryCache",
            Self::TotalOverhead => "totalOverhead",
        }
    }
}

impl std::fmt::Display for AlertComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// An over-budget reading. Immutable, consumed once, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAlert {
    pub component: AlertComponent,
    pub severity: Severity,
    pub current: usize,
    pub limit: usize,
    pub timestamp: DateTime<Utc>,
}

impl MemoryAlert {
    pub fn new(component: AlertComponent, severity: Severity, current: usize, limit: usize) -> Self {
        Self {
            component,
            severity,
            current,
            limit,
            timestamp: Utc::now(),
        }
    }
}

/// One reading of every monitored counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSample {
    /// Knowledge entries held in memory.
    pub episode_cache: usize,
    /// Entries in the external embedding cache, when one is wired in.
    pub embedding_cache: Option<usize>,
    /// Tracked trajectories.
    pub trajectory_cache: usize,
    /// Estimated bytes across all collections.
    pub total_bytes: usize,
}

/// Source of usage readings.
pub trait UsageProbe: Send + Sync {
    fn sample(&self) -> Result<UsageSample>;
}

/// Reads usage straight from the daemon's own collections.
pub struct DaemonUsageProbe {
    storage: Storage,
    trajectories: Arc<TrajectoryTracker>,
    embedding_cache: Option<Arc<dyn CacheEvictor>>,
}

impl DaemonUsageProbe {
    pub fn new(
        storage: Storage,
        trajectories: Arc<TrajectoryTracker>,
        embedding_cache: Option<Arc<dyn CacheEvictor>>,
    ) -> Self {
        Self {
            storage,
            trajectories,
            embedding_cache,
        }
    }
}

impl UsageProbe for DaemonUsageProbe {
    fn sample(&self) -> Result<UsageSample> {
        let (episode_cache, storage_bytes) = {
            let engine = self.storage.lock()?;
            (engine.knowledge_len(), engine.approx_bytes())
        };
        let embedding_cache = match &self.embedding_cache {
            Some(cache) => Some(cache.size()?),
            None => None,
        };
        Ok(UsageSample {
            episode_cache,
            embedding_cache,
            trajectory_cache: self.trajectories.len()?,
            total_bytes: storage_bytes + self.trajectories.approx_bytes()?,
        })
    }
}

pub struct MemoryMonitor {
    config: MonitorConfig,
    probe: Arc<dyn UsageProbe>,
    alerts: broadcast::Sender<MemoryAlert>,
    last_alert: Mutex<HashMap<AlertComponent, (Severity, Instant)>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryMonitor {
    pub fn new(config: MonitorConfig, probe: Arc<dyn UsageProbe>) -> Self {
        let (alerts, _) = broadcast::channel(64);
        Self {
            config,
            probe,
            alerts,
            last_alert: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemoryAlert> {
        self.alerts.subscribe()
    }

    /// Thresholds crossed by `sample`, before cooldown suppression.
    pub fn evaluate(&self, sample: &UsageSample) -> Vec<MemoryAlert> {
        let readings = [
            (AlertComponent::EpisodeCache, Some(sample.episode_cache), self.config.episode_cache_limit),
            (AlertComponent::EmbeddingCache, sample.embedding_cache, self.config.embedding_cache_limit),
            (AlertComponent::TrajectoryCache, Some(sample.trajectory_cache), self.config.trajectory_cache_limit),
            (AlertComponent::TotalOverhead, Some(sample.total_bytes), self.config.total_overhead_limit_bytes),
        ];

        readings
            .into_iter()
            .filter_map(|(component, current, limit)| {
                let current = current?;
                let severity = classify(current, limit, self.config.warning_ratio)?;
                Some(MemoryAlert::new(component, severity, current, limit))
            })
            .collect()
    }

    /// Take one sample and broadcast any alerts that survive the cooldown.
    pub fn check(&self) -> Result<Vec<MemoryAlert>> {
        let sample = self.probe.sample()?;
        let cooldown = Duration::from_millis(self.config.alert_cooldown_ms);
        let now = Instant::now();

        let mut emitted = Vec::new();
        let mut last = self
            .last_alert
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for alert in self.evaluate(&sample) {
            let suppressed = last.get(&alert.component).is_some_and(|(severity, at)| {
                alert.severity <= *severity && now.duration_since(*at) < cooldown
            });
            if suppressed {
                tracing::debug!(component = %alert.component, "memory alert suppressed by cooldown");
                continue;
            }
            last.insert(alert.component, (alert.severity, now));

            tracing::warn!(
                component = %alert.component,
                severity = %alert.severity,
                current = alert.current,
                limit = alert.limit,
                "memory threshold crossed"
            );
            // No subscribers is not an error; the alert is simply dropped.
            let _ = self.alerts.send(alert.clone());
            emitted.push(alert);
        }
        Ok(emitted)
    }

    /// Start the sampling timer. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.is_some() {
            return;
        }
        let monitor = Arc::clone(self);
        let period = Duration::from_millis(self.config.interval_ms.max(1));
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = monitor.check() {
                    tracing::warn!(error = %format!("{e:#}"), "memory sample failed");
                }
            }
        }));
        tracing::info!(interval_ms = self.config.interval_ms, "memory monitor started");
    }

    pub fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            tracing::info!("memory monitor stopped");
        }
    }
}

fn classify(current: usize, limit: usize, warning_ratio: f64) -> Option<Severity> {
    if limit == 0 {
        return None;
    }
    if current >= limit {
        Some(Severity::Error)
    } else if current as f64 >= limit as f64 * warning_ratio {
        Some(Severity::Warning)
    } else {
        None
    }
}
