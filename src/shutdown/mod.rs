//! Priority-tiered, timeout-bounded shutdown.
//!
//! Components register named teardown handlers in one of five tiers. On
//! [`ShutdownOrchestrator::shutdown`] the tiers run from `critical` down to
//! `cleanup`; handlers inside a tier run concurrently, each under its own
//! timeout, and the whole run is capped by a global deadline. The first call
//! starts the run; every call, concurrent or later, gets the same report.

pub mod signals;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;

use crate::config::ShutdownConfig;

/// Shutdown tier. Tiers run in declaration order: `Critical` first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Cleanup,
}

impl ShutdownPriority {
    pub const ALL: [ShutdownPriority; 5] = [
        Self::Critical,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for ShutdownPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What triggered the shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ShutdownReason {
    /// A termination signal, e.g. `SIGTERM`.
    Signal(String),
    /// An unrecoverable error reported by a running component.
    Fatal(String),
    Panic(String),
    /// Asked for programmatically.
    Requested,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "signal {name}"),
            Self::Fatal(detail) => write!(f, "fatal error: {detail}"),
            Self::Panic(detail) => write!(f, "panic: {detail}"),
            Self::Requested => f.write_str("requested"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Overrides the tier's default timeout.
    pub timeout: Option<Duration>,
    /// Owning component, for reporting.
    pub component: Option<String>,
}

impl HandlerOptions {
    pub fn component(component: impl Into<String>) -> Self {
        Self {
            component: Some(component.into()),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("shutdown handler already registered: {0}")]
    AlreadyRegistered(String),

    #[error("shutdown handler not registered: {0}")]
    NotRegistered(String),

    #[error("shutdown already in progress")]
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    Idle,
    ShuttingDown,
    Complete,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerOutcome {
    pub name: String,
    pub priority: ShutdownPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    pub success: bool,
    pub timed_out: bool,
    /// Never started because the global deadline passed first.
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub handlers: Vec<HandlerOutcome>,
    pub skipped_tiers: Vec<ShutdownPriority>,
    pub exit_code: i32,
}

impl ShutdownReport {
    pub fn outcome(&self, name: &str) -> Option<&HandlerOutcome> {
        self.handlers.iter().find(|h| h.name == name)
    }
}

#[derive(Debug, Clone)]
pub enum ShutdownEvent {
    Started(ShutdownReason),
    TierStarted(ShutdownPriority),
    Completed(Arc<ShutdownReport>),
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type HandlerFn = Arc<dyn Fn() -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
struct RegisteredHandler {
    name: String,
    priority: ShutdownPriority,
    options: HandlerOptions,
    run: HandlerFn,
}

impl RegisteredHandler {
    fn outcome(&self) -> HandlerOutcome {
        HandlerOutcome {
            name: self.name.clone(),
            priority: self.priority,
            component: self.options.component.clone(),
            success: false,
            timed_out: false,
            skipped: false,
            error: None,
            duration_ms: 0,
        }
    }
}

pub struct ShutdownOrchestrator {
    config: ShutdownConfig,
    // Lock order: `phase` before `handlers`.
    phase: Mutex<ShutdownPhase>,
    handlers: Mutex<Vec<RegisteredHandler>>,
    last_request: Mutex<Option<Instant>>,
    events: broadcast::Sender<ShutdownEvent>,
    report: watch::Sender<Option<Arc<ShutdownReport>>>,
}

impl ShutdownOrchestrator {
    pub fn new(config: ShutdownConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        let (report, _) = watch::channel(None);
        Arc::new(Self {
            config,
            phase: Mutex::new(ShutdownPhase::Idle),
            handlers: Mutex::new(Vec::new()),
            last_request: Mutex::new(None),
            events,
            report,
        })
    }

    fn phase_lock(&self) -> MutexGuard<'_, ShutdownPhase> {
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handlers_lock(&self) -> MutexGuard<'_, Vec<RegisteredHandler>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase_lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownEvent> {
        self.events.subscribe()
    }

    /// Register a teardown handler. Rejected on a duplicate name or once shutdown began.
    pub fn register<F, Fut>(
        &self,
        name: impl Into<String>,
        priority: ShutdownPriority,
        options: HandlerOptions,
        handler: F,
    ) -> Result<(), ShutdownError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let phase = self.phase_lock();
        if *phase != ShutdownPhase::Idle {
            return Err(ShutdownError::InProgress);
        }
        let mut handlers = self.handlers_lock();
        if handlers.iter().any(|h| h.name == name) {
            return Err(ShutdownError::AlreadyRegistered(name));
        }
        tracing::debug!(name = %name, priority = %priority, "shutdown handler registered");
        handlers.push(RegisteredHandler {
            name,
            priority,
            options,
            run: Arc::new(move || -> HandlerFuture { Box::pin(handler()) }),
        });
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<(), ShutdownError> {
        let phase = self.phase_lock();
        if *phase != ShutdownPhase::Idle {
            return Err(ShutdownError::InProgress);
        }
        let mut handlers = self.handlers_lock();
        let before = handlers.len();
        handlers.retain(|h| h.name != name);
        if handlers.len() == before {
            return Err(ShutdownError::NotRegistered(name.to_string()));
        }
        Ok(())
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers_lock().iter().map(|h| h.name.clone()).collect()
    }

    /// The report, if shutdown has completed.
    pub fn report(&self) -> Option<Arc<ShutdownReport>> {
        self.report.borrow().clone()
    }

    /// Run the shutdown sequence, or join the one already running.
    pub async fn shutdown(self: &Arc<Self>, reason: ShutdownReason) -> Arc<ShutdownReport> {
        let debounce = Duration::from_millis(self.config.debounce_ms);
        {
            let mut last = self
                .last_request
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match *last {
                Some(at) if at.elapsed() < debounce => {
                    tracing::debug!(reason = %reason, "shutdown request coalesced");
                }
                Some(_) => tracing::info!(reason = %reason, "shutdown already requested"),
                None => {}
            }
            *last = Some(Instant::now());
        }

        let first = {
            let mut phase = self.phase_lock();
            if *phase == ShutdownPhase::Idle {
                *phase = ShutdownPhase::ShuttingDown;
                true
            } else {
                false
            }
        };
        if first {
            let orchestrator = Arc::clone(self);
            let reason = reason.clone();
            tokio::spawn(async move { orchestrator.run(reason).await });
        }

        self.wait_for_report(reason).await
    }

    /// Wait for a shutdown started elsewhere to finish.
    pub async fn wait(&self) -> Arc<ShutdownReport> {
        self.wait_for_report(ShutdownReason::Requested).await
    }

    async fn wait_for_report(&self, reason: ShutdownReason) -> Arc<ShutdownReport> {
        let mut rx = self.report.subscribe();
        loop {
            if let Some(report) = rx.borrow_and_update().clone() {
                return report;
            }
            if rx.changed().await.is_err() {
                // The sender lives as long as `self`; this is unreachable in practice.
                return Arc::new(ShutdownReport {
                    reason,
                    started_at: Utc::now(),
                    duration_ms: 0,
                    success: false,
                    handlers: Vec::new(),
                    skipped_tiers: Vec::new(),
                    exit_code: 1,
                });
            }
        }
    }

    async fn run(self: Arc<Self>, reason: ShutdownReason) {
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.global_timeout_ms);
        let handlers = self.handlers_lock().clone();

        tracing::warn!(reason = %reason, handlers = handlers.len(), "shutdown started");
        let _ = self.events.send(ShutdownEvent::Started(reason.clone()));

        let mut outcomes = Vec::with_capacity(handlers.len());
        let mut skipped_tiers = Vec::new();
        for priority in ShutdownPriority::ALL {
            let tier: Vec<RegisteredHandler> = handlers
                .iter()
                .filter(|h| h.priority == priority)
                .cloned()
                .collect();
            if tier.is_empty() {
                continue;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::error!(tier = %priority, handlers = tier.len(), "global shutdown timeout reached, skipping tier");
                skipped_tiers.push(priority);
                outcomes.extend(tier.iter().map(|h| HandlerOutcome {
                    skipped: true,
                    error: Some("skipped: global shutdown timeout".to_string()),
                    ..h.outcome()
                }));
                continue;
            }

            tracing::info!(tier = %priority, handlers = tier.len(), "running shutdown tier");
            let _ = self.events.send(ShutdownEvent::TierStarted(priority));
            outcomes.extend(self.run_tier(tier, deadline).await);
        }

        let success = outcomes.iter().all(|o| o.success) && skipped_tiers.is_empty();
        let report = Arc::new(ShutdownReport {
            reason,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            success,
            handlers: outcomes,
            skipped_tiers,
            exit_code: if success { 0 } else { 1 },
        });

        for outcome in report.handlers.iter().filter(|o| !o.success) {
            tracing::error!(
                name = %outcome.name,
                tier = %outcome.priority,
                timed_out = outcome.timed_out,
                skipped = outcome.skipped,
                error = outcome.error.as_deref().unwrap_or(""),
                "shutdown handler failed"
            );
        }
        tracing::warn!(
            success = report.success,
            duration_ms = report.duration_ms,
            exit_code = report.exit_code,
            "shutdown complete"
        );

        *self.phase_lock() = ShutdownPhase::Complete;
        self.report.send_replace(Some(Arc::clone(&report)));
        let _ = self.events.send(ShutdownEvent::Completed(Arc::clone(&report)));

        if self.config.exit_process {
            std::process::exit(report.exit_code);
        }
    }

    /// Run one tier concurrently. Stops early, marking stragglers timed out, at `deadline`.
    ///
    /// A handler that overruns its timeout is reported and left running
    /// detached; cancelling it could stop a write halfway.
    async fn run_tier(
        &self,
        tier: Vec<RegisteredHandler>,
        deadline: tokio::time::Instant,
    ) -> Vec<HandlerOutcome> {
        let mut set = JoinSet::new();
        let mut pending: BTreeSet<String> = BTreeSet::new();

        for handler in &tier {
            let timeout = handler
                .options
                .timeout
                .unwrap_or_else(|| self.config.tier_timeout(handler.priority));
            let mut task = tokio::spawn((handler.run)());
            pending.insert(handler.name.clone());

            let template = handler.outcome();
            set.spawn(async move {
                let started = Instant::now();
                let (success, timed_out, error) = match tokio::time::timeout(timeout, &mut task).await {
                    Ok(Ok(Ok(()))) => (true, false, None),
                    Ok(Ok(Err(e))) => (false, false, Some(format!("{e:#}"))),
                    Ok(Err(join)) => (false, false, Some(format!("handler panicked: {join}"))),
                    Err(_) => (
                        false,
                        true,
                        Some(format!("timed out after {}ms", timeout.as_millis())),
                    ),
                };
                HandlerOutcome {
                    success,
                    timed_out,
                    error,
                    duration_ms: started.elapsed().as_millis() as u64,
                    ..template
                }
            });
        }

        let tier_started = Instant::now();
        let mut outcomes = Vec::with_capacity(tier.len());
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(outcome))) => {
                    pending.remove(&outcome.name);
                    outcomes.push(outcome);
                }
                Ok(Some(Err(e))) => {
                    tracing::error!(error = %e, "shutdown handler supervisor failed");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::error!(pending = pending.len(), "global shutdown timeout reached mid-tier");
                    // Drops the supervisors only; the handlers run on detached.
                    set.abort_all();
                    let elapsed = tier_started.elapsed().as_millis() as u64;
                    outcomes.extend(
                        tier.iter()
                            .filter(|h| pending.contains(&h.name))
                            .map(|h| HandlerOutcome {
                                timed_out: true,
                                error: Some("global shutdown timeout".to_string()),
                                duration_ms: elapsed,
                                ..h.outcome()
                            }),
                    );
                    break;
                }
            }
        }
        outcomes
    }
}
