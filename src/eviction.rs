//! Alert-driven cache trimming.
//!
//! The [`EvictionManager`] subscribes to the memory monitor and, for each alert,
//! evicts a fraction of the offending component: `warning_evict_percent` on a
//! warning, `error_evict_percent` on an error. Every component call runs on the
//! blocking pool under `handler_timeout`. Failures are reported, never raised.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::EvictionConfig;
use crate::monitor::{AlertComponent, MemoryAlert, MemoryMonitor, Severity};
use crate::storage::Storage;

/// A cache that can report its size and drop entries on request.
pub trait CacheEvictor: Send + Sync {
    fn size(&self) -> Result<usize>;
    /// Drop up to `count` entries in the cache's own eviction order. Returns how many went.
    fn evict(&self, count: usize) -> Result<usize>;
}

/// The trajectory tracker's eviction seam.
pub trait TrajectoryEvictor: Send + Sync {
    fn size(&self) -> Result<usize>;
    /// Persist and drop completed trajectories. Returns how many were dropped.
    fn flush_completed(&self) -> Result<usize>;
    fn evict_oldest_active(&self, count: usize) -> Result<usize>;
}

/// Knowledge entries are the episode cache, evicted least recently used first.
impl CacheEvictor for Storage {
    fn size(&self) -> Result<usize> {
        Ok(self.lock()?.knowledge_len())
    }

    fn evict(&self, count: usize) -> Result<usize> {
        Ok(self.lock()?.evict_least_recent(count))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentEvictionResult {
    pub component: AlertComponent,
    pub requested: usize,
    pub evicted: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ComponentEvictionResult {
    fn unavailable(component: AlertComponent) -> Self {
        Self {
            component,
            requested: 0,
            evicted: 0,
            success: false,
            error: Some(format!("{component} not available")),
            duration_ms: 0,
            timed_out: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionReport {
    pub alert: MemoryAlert,
    pub percent: f64,
    pub results: Vec<ComponentEvictionResult>,
}

impl EvictionReport {
    pub fn total_evicted(&self) -> usize {
        self.results.iter().map(|r| r.evicted).sum()
    }

    pub fn result_for(&self, component: AlertComponent) -> Option<&ComponentEvictionResult> {
        self.results.iter().find(|r| r.component == component)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionStats {
    pub alerts_handled: u64,
    pub items_evicted: u64,
    pub failures: u64,
    pub subscribed: bool,
}

/// Number of items to evict: `ceil(size × percent)`, never more than `size`.
pub fn eviction_count(size: usize, percent: f64) -> usize {
    if size == 0 || percent <= 0.0 {
        return 0;
    }
    // The epsilon keeps float noise (e.g. 100 × 0.2 = 20.000000000000004) from rounding up.
    let raw = (size as f64 * percent - 1e-9).ceil();
    (raw.max(0.0) as usize).min(size)
}

#[derive(Default)]
struct Counters {
    alerts_handled: AtomicU64,
    items_evicted: AtomicU64,
    failures: AtomicU64,
}

pub struct EvictionManager {
    config: EvictionConfig,
    episode_cache: Option<Arc<dyn CacheEvictor>>,
    embedding_cache: Option<Arc<dyn CacheEvictor>>,
    trajectories: Option<Arc<dyn TrajectoryEvictor>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl EvictionManager {
    pub fn new(config: EvictionConfig) -> Self {
        Self {
            config,
            episode_cache: None,
            embedding_cache: None,
            trajectories: None,
            consumer: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn with_episode_cache(mut self, cache: Arc<dyn CacheEvictor>) -> Self {
        self.episode_cache = Some(cache);
        self
    }

    pub fn with_embedding_cache(mut self, cache: Arc<dyn CacheEvictor>) -> Self {
        self.embedding_cache = Some(cache);
        self
    }

    pub fn with_trajectories(mut self, trajectories: Arc<dyn TrajectoryEvictor>) -> Self {
        self.trajectories = Some(trajectories);
        self
    }

    fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.config.handler_timeout_ms)
    }

    /// Subscribe to `monitor` and start consuming alerts.
    ///
    /// Returns `false` (and does nothing) when already subscribed.
    pub fn initialize(self: &Arc<Self>, monitor: &MemoryMonitor) -> bool {
        let mut consumer = self
            .consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if consumer.is_some() {
            tracing::info!("eviction manager already subscribed to memory alerts");
            return false;
        }

        let mut alerts = monitor.subscribe();
        let manager = Arc::clone(self);
        *consumer = Some(tokio::spawn(async move {
            loop {
                match alerts.recv().await {
                    Ok(alert) => {
                        manager.handle_alert(&alert).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "eviction manager fell behind on memory alerts");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        tracing::info!("eviction manager subscribed to memory alerts");
        true
    }

    pub fn is_subscribed(&self) -> bool {
        self.consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Unsubscribe from alerts. Work already handed to the blocking pool finishes on its own.
    pub fn stop(&self) {
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = consumer {
            task.abort();
            tracing::info!("eviction manager stopped");
        }
    }

    pub fn stats(&self) -> EvictionStats {
        EvictionStats {
            alerts_handled: self.counters.alerts_handled.load(Ordering::Relaxed),
            items_evicted: self.counters.items_evicted.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            subscribed: self.is_subscribed(),
        }
    }

    fn percent_for(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Warning => self.config.warning_evict_percent,
            Severity::Error => self.config.error_evict_percent,
        }
    }

    /// React to one alert. Never fails: every problem ends up in a result entry.
    pub async fn handle_alert(&self, alert: &MemoryAlert) -> EvictionReport {
        let percent = self.percent_for(alert.severity);
        tracing::info!(
            component = %alert.component,
            severity = %alert.severity,
            percent,
            "handling memory alert"
        );

        let results = match alert.component {
            AlertComponent::EpisodeCache => vec![self.evict_episodes(percent).await],
            AlertComponent::EmbeddingCache => vec![self.evict_embeddings(percent).await],
            AlertComponent::TrajectoryCache => vec![self.evict_trajectories(percent).await],
            AlertComponent::TotalOverhead => {
                let (episodes, embeddings, trajectories) = tokio::join!(
                    self.evict_episodes(percent),
                    self.evict_embeddings(percent),
                    self.evict_trajectories(percent),
                );
                vec![episodes, embeddings, trajectories]
            }
        };

        self.counters.alerts_handled.fetch_add(1, Ordering::Relaxed);
        for result in &results {
            self.counters
                .items_evicted
                .fetch_add(result.evicted as u64, Ordering::Relaxed);
            if !result.success {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    component = %result.component,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    timed_out = result.timed_out,
                    "eviction failed"
                );
            } else {
                tracing::info!(
                    component = %result.component,
                    requested = result.requested,
                    evicted = result.evicted,
                    duration_ms = result.duration_ms,
                    "eviction complete"
                );
            }
        }

        EvictionReport {
            alert: alert.clone(),
            percent,
            results,
        }
    }

    async fn evict_episodes(&self, percent: f64) -> ComponentEvictionResult {
        match &self.episode_cache {
            Some(cache) => {
                self.evict_cache(AlertComponent::EpisodeCache, Arc::clone(cache), percent)
                    .await
            }
            None => ComponentEvictionResult::unavailable(AlertComponent::EpisodeCache),
        }
    }

    async fn evict_embeddings(&self, percent: f64) -> ComponentEvictionResult {
        match &self.embedding_cache {
            Some(cache) => {
                self.evict_cache(AlertComponent::EmbeddingCache, Arc::clone(cache), percent)
                    .await
            }
            None => ComponentEvictionResult::unavailable(AlertComponent::EmbeddingCache),
        }
    }

    async fn evict_cache(
        &self,
        component: AlertComponent,
        cache: Arc<dyn CacheEvictor>,
        percent: f64,
    ) -> ComponentEvictionResult {
        let started = Instant::now();
        let requested = match size_of(Arc::clone(&cache)).await {
            Ok(size) => eviction_count(size, percent),
            Err(e) => return failed(component, 0, started, e, false),
        };

        let work = tokio::task::spawn_blocking(move || cache.evict(requested));
        self.finish(component, requested, started, work).await
    }

    async fn evict_trajectories(&self, percent: f64) -> ComponentEvictionResult {
        let component = AlertComponent::TrajectoryCache;
        let Some(trajectories) = self.trajectories.clone() else {
            return ComponentEvictionResult::unavailable(component);
        };

        let started = Instant::now();
        let sizer = Arc::clone(&trajectories);
        let size = tokio::task::spawn_blocking(move || sizer.size())
            .await
            .map_err(|e| anyhow!("size task failed: {e}"))
            .and_then(|r| r);
        let requested = match size {
            Ok(size) => eviction_count(size, percent),
            Err(e) => return failed(component, 0, started, e, false),
        };

        // Completed trajectories go first, and only after storage is durable.
        let work = tokio::task::spawn_blocking(move || -> Result<usize> {
            let flushed = trajectories.flush_completed()?;
            let remaining = requested.saturating_sub(flushed);
            let evicted = if remaining > 0 {
                trajectories.evict_oldest_active(remaining)?
            } else {
                0
            };
            Ok(flushed + evicted)
        });
        self.finish(component, requested, started, work).await
    }

    async fn finish(
        &self,
        component: AlertComponent,
        requested: usize,
        started: Instant,
        work: JoinHandle<Result<usize>>,
    ) -> ComponentEvictionResult {
        match tokio::time::timeout(self.handler_timeout(), work).await {
            Ok(Ok(Ok(evicted))) => ComponentEvictionResult {
                component,
                requested,
                evicted,
                success: true,
                error: None,
                duration_ms: elapsed_ms(started),
                timed_out: false,
            },
            Ok(Ok(Err(e))) => failed(component, requested, started, e, false),
            Ok(Err(join)) => failed(
                component,
                requested,
                started,
                anyhow!("eviction task failed: {join}"),
                false,
            ),
            Err(_) => failed(
                component,
                requested,
                started,
                anyhow!(
                    "eviction timed out after {}ms",
                    self.config.handler_timeout_ms
                ),
                true,
            ),
        }
    }
}

async fn size_of(cache: Arc<dyn CacheEvictor>) -> Result<usize> {
    tokio::task::spawn_blocking(move || cache.size())
        .await
        .map_err(|e| anyhow!("size task failed: {e}"))?
}

fn failed(
    component: AlertComponent,
    requested: usize,
    started: Instant,
    error: anyhow::Error,
    timed_out: bool,
) -> ComponentEvictionResult {
    ComponentEvictionResult {
        component,
        requested,
        evicted: 0,
        success: false,
        error: Some(format!("{error:#}")),
        duration_ms: elapsed_ms(started),
        timed_out,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
