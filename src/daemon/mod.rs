//! The daemon handle: owns storage, the listener, and the background tasks.
//!
//! [`Daemon::start`] is idempotent and refuses to share a storage directory with
//! another daemon: it takes the directory's ownership lock before touching
//! storage or binding (see [`liveness`]). [`Daemon::stop`] drains connections,
//! performs a final flush and removes the marker and socket file.

pub mod connection;
pub mod dispatch;
pub mod liveness;
pub mod state;
pub mod transport;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::DaemonConfig;
use crate::error::RpcError;
use crate::eviction::{CacheEvictor, EvictionManager};
use crate::monitor::{DaemonUsageProbe, MemoryMonitor};
use crate::protocol::{Response, PROTOCOL_VERSION};
use crate::shutdown::signals::FatalReporter;
use crate::shutdown::{HandlerOptions, ShutdownError, ShutdownOrchestrator, ShutdownPriority};
use crate::storage::Storage;
use crate::trajectory::{TrajectoryCache, TrajectoryTracker};
use connection::ConnectionManager;
use dispatch::{DaemonVitals, Dispatcher, StatusReport, StatusSource};
use liveness::{LivenessMarker, OwnershipLock};
use state::{ServerState, StateMachine};
pub use transport::BoundAddress;

/// How long a second daemon waits for the lock holder to write its marker.
const STARTUP_WAIT: Duration = Duration::from_secs(10);
const STARTUP_POLL: Duration = Duration::from_millis(25);

/// Result of [`Daemon::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub address: BoundAddress,
    /// Another live daemon already owns the storage directory; nothing was bound.
    pub already_running: bool,
}

/// Everything a running daemon serves requests with.
pub struct Services {
    pub storage: Storage,
    pub trajectories: Arc<TrajectoryTracker>,
    pub connections: Arc<ConnectionManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub monitor: Arc<MemoryMonitor>,
    pub eviction: Arc<EvictionManager>,
    pub address: BoundAddress,
    state: Arc<StateMachine>,
    max_frame_bytes: usize,
}

impl Services {
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Answer one decoded document. Only a `ready` daemon serves requests.
    pub async fn handle(&self, value: Value) -> Response {
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        match self.state.current() {
            ServerState::Ready => {}
            ServerState::ShuttingDown | ServerState::Stopped => {
                return Response::failure(id, &RpcError::ShuttingDown)
            }
            ServerState::Starting => {
                return Response::failure(id, &RpcError::Internal("daemon is starting".into()))
            }
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        match tokio::task::spawn_blocking(move || dispatcher.dispatch_value(value)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "request handler panicked");
                Response::failure(id, &RpcError::Internal("request handler panicked".into()))
            }
        }
    }

    pub fn status(&self) -> Result<StatusReport, RpcError> {
        self.dispatcher.status()
    }
}

struct Vitals {
    state: Arc<StateMachine>,
    address: String,
    connections: Arc<ConnectionManager>,
    eviction: Arc<EvictionManager>,
    started: Instant,
}

impl StatusSource for Vitals {
    fn vitals(&self) -> DaemonVitals {
        DaemonVitals {
            state: self.state.current(),
            address: Some(self.address.clone()),
            connected_clients: self.connections.active(),
            uptime_ms: self.started.elapsed().as_millis() as u64,
            eviction: Some(self.eviction.stats()),
        }
    }
}

struct Running {
    services: Arc<Services>,
    shutdown: watch::Sender<bool>,
    listener: JoinHandle<()>,
    flusher: JoinHandle<()>,
    ownership: OwnershipLock,
}

enum Lifecycle {
    Idle,
    Running(Running),
    Stopped,
}

struct DaemonInner {
    config: DaemonConfig,
    dir: PathBuf,
    embedding_cache: Option<Arc<dyn CacheEvictor>>,
    state: Arc<StateMachine>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    services: Mutex<Option<Arc<Services>>>,
    fatal: OnceLock<FatalReporter>,
    next_call_id: AtomicU64,
}

/// Cloneable handle to one daemon instance.
#[derive(Clone)]
pub struct Daemon {
    inner: Arc<DaemonInner>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self::build(config, None)
    }

    /// A daemon whose `embeddingCache` alerts evict from `cache`.
    pub fn with_embedding_cache(config: DaemonConfig, cache: Arc<dyn CacheEvictor>) -> Self {
        Self::build(config, Some(cache))
    }

    fn build(config: DaemonConfig, embedding_cache: Option<Arc<dyn CacheEvictor>>) -> Self {
        let dir = config.storage.resolved_dir();
        Self {
            inner: Arc::new(DaemonInner {
                config,
                dir,
                embedding_cache,
                state: Arc::new(StateMachine::new()),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::Idle),
                services: Mutex::new(None),
                fatal: OnceLock::new(),
                next_call_id: AtomicU64::new(1),
            }),
        }
    }

    /// Route listener failures to the shutdown orchestrator.
    pub fn set_fatal_reporter(&self, reporter: FatalReporter) {
        if self.inner.fatal.set(reporter).is_err() {
            tracing::debug!("fatal reporter already set");
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ServerState {
        self.inner.state.current()
    }

    fn services_lock(&self) -> MutexGuard<'_, Option<Arc<Services>>> {
        self.inner
            .services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Services of the most recent successful start.
    pub fn services(&self) -> Option<Arc<Services>> {
        self.services_lock().clone()
    }

    pub fn address(&self) -> Option<BoundAddress> {
        self.services().map(|s| s.address.clone())
    }

    pub fn storage(&self) -> Option<Storage> {
        self.services().map(|s| s.storage.clone())
    }

    pub fn status(&self) -> Option<StatusReport> {
        self.services().and_then(|s| s.status().ok())
    }

    /// Start serving. Idempotent; see [`StartOutcome`].
    pub async fn start(&self) -> Result<StartOutcome> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Running(running) => {
                return Ok(StartOutcome {
                    address: running.services.address.clone(),
                    already_running: false,
                })
            }
            Lifecycle::Stopped => {
                return Err(anyhow!("daemon handle has been stopped and cannot be restarted"))
            }
            Lifecycle::Idle => {}
        }

        let dir = self.inner.dir.clone();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create storage directory {}", dir.display()))?;

        let deadline = Instant::now() + STARTUP_WAIT;
        let ownership = loop {
            if let Some(lock) = OwnershipLock::try_acquire(&dir)? {
                break lock;
            }
            // The holder is starting or running; its marker appears once it is bound.
            if let Some(marker) = LivenessMarker::read(&dir)? {
                if marker.is_alive() {
                    let address = marker.address()?;
                    tracing::info!(pid = marker.pid, address = %address, "daemon already running");
                    return Ok(StartOutcome {
                        address,
                        already_running: true,
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "another daemon holds {} but never became ready",
                    dir.join(liveness::LOCK_FILE).display()
                ));
            }
            tokio::time::sleep(STARTUP_POLL).await;
        };

        if let Some(marker) = LivenessMarker::read(&dir)? {
            tracing::warn!(pid = marker.pid, "removing stale liveness marker");
            LivenessMarker::remove(&dir)?;
            let socket = dir.join(&self.inner.config.server.socket_name);
            if socket.exists() {
                std::fs::remove_file(&socket)
                    .with_context(|| format!("failed to remove stale socket {}", socket.display()))?;
            }
        }

        self.inner.state.transition(ServerState::Starting)?;
        match self.launch(&dir, ownership).await {
            Ok(running) => {
                let address = running.services.address.clone();
                *self.services_lock() = Some(Arc::clone(&running.services));
                *lifecycle = Lifecycle::Running(running);
                tracing::info!(address = %address, dir = %dir.display(), "daemon ready");
                Ok(StartOutcome {
                    address,
                    already_running: false,
                })
            }
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "daemon failed to start");
                self.inner.state.transition(ServerState::Stopped)?;
                Err(e)
            }
        }
    }

    async fn launch(&self, dir: &Path, ownership: OwnershipLock) -> Result<Running> {
        let config = &self.inner.config;

        let storage = {
            let dir = dir.to_path_buf();
            tokio::task::spawn_blocking(move || Storage::open(dir))
                .await
                .map_err(|e| anyhow!("storage load task failed: {e}"))??
        };

        let (listener, address) = transport::bind(&config.server, dir).await?;

        let trajectories = Arc::new(TrajectoryTracker::new());
        let connections = ConnectionManager::new(config.server.max_connections);

        let mut eviction = EvictionManager::new(config.eviction.clone())
            .with_episode_cache(Arc::new(storage.clone()))
            .with_trajectories(Arc::new(TrajectoryCache::new(
                Arc::clone(&trajectories),
                storage.clone(),
            )));
        if let Some(cache) = &self.inner.embedding_cache {
            eviction = eviction.with_embedding_cache(Arc::clone(cache));
        }
        let eviction = Arc::new(eviction);

        let probe = DaemonUsageProbe::new(
            storage.clone(),
            Arc::clone(&trajectories),
            self.inner.embedding_cache.clone(),
        );
        let monitor = Arc::new(MemoryMonitor::new(config.monitor.clone(), Arc::new(probe)));

        let vitals = Vitals {
            state: Arc::clone(&self.inner.state),
            address: address.to_string(),
            connections: Arc::clone(&connections),
            eviction: Arc::clone(&eviction),
            started: Instant::now(),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            storage.clone(),
            Arc::clone(&trajectories),
            Arc::new(vitals),
        ));

        let services = Arc::new(Services {
            storage,
            trajectories,
            connections,
            dispatcher,
            monitor,
            eviction,
            address: address.clone(),
            state: Arc::clone(&self.inner.state),
            max_frame_bytes: config.server.max_frame_bytes,
        });

        if let Err(e) = LivenessMarker::for_current_process(&address).write(dir) {
            remove_socket(&address);
            return Err(e.context("failed to write liveness marker"));
        }

        self.inner.state.transition(ServerState::Ready)?;

        let fatal = self.inner.fatal.get().cloned();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let flusher = spawn_supervised(
            "flusher",
            fatal.clone(),
            flush_periodically(
                services.storage.clone(),
                config.storage.flush_interval(),
                shutdown_rx.clone(),
            ),
        );

        if config.monitor.enabled {
            services.monitor.start();
            services.eviction.initialize(&services.monitor);
        }

        let listener = spawn_supervised("listener", fatal.clone(), {
            let services = Arc::clone(&services);
            async move {
                if let Err(e) = transport::serve(listener, services, shutdown_rx).await {
                    let detail = format!("{e:#}");
                    tracing::error!(error = %detail, "listener failed");
                    if let Some(fatal) = fatal {
                        fatal.report(detail);
                    }
                }
            }
        });

        Ok(Running {
            services,
            shutdown,
            listener,
            flusher,
            ownership,
        })
    }

    /// Stop serving and persist everything. A no-op unless running.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let running = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(running) => running,
            Lifecycle::Idle => {
                *lifecycle = Lifecycle::Idle;
                return Ok(());
            }
            Lifecycle::Stopped => return Ok(()),
        };

        self.inner.state.transition(ServerState::ShuttingDown)?;
        tracing::info!("daemon stopping");

        let Running {
            services,
            shutdown,
            mut listener,
            flusher,
            ownership,
        } = running;
        let _ = shutdown.send(true);
        services.eviction.stop();
        services.monitor.stop();

        let grace = self.inner.config.server.grace_period();
        if !services.connections.wait_idle(grace).await {
            let aborted = services.connections.abort_all();
            tracing::warn!(aborted, grace_ms = grace.as_millis() as u64, "connections did not drain in time");
        }
        if tokio::time::timeout(grace, &mut listener).await.is_err() {
            tracing::warn!("listener did not stop in time, aborting");
            listener.abort();
        }
        flusher.abort();

        let flushed = services.storage.flush_async().await;
        if let Err(e) = &flushed {
            tracing::error!(error = %format!("{e:#}"), "final flush failed");
        }

        if let Err(e) = LivenessMarker::remove(&self.inner.dir) {
            tracing::warn!(error = %format!("{e:#}"), "failed to remove liveness marker");
        }
        remove_socket(&services.address);
        drop(ownership);

        self.inner.state.transition(ServerState::Stopped)?;
        tracing::info!("daemon stopped");
        flushed.map(|_| ())
    }

    /// Dispatch a method in-process, exactly as a remote client would see it.
    pub async fn call(&self, method: &str, params: Value) -> Response {
        let id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let Some(services) = self.services() else {
            return Response::failure(
                Value::from(id),
                &RpcError::Internal("daemon is not running".into()),
            );
        };
        let envelope = json!({
            "version": PROTOCOL_VERSION,
            "method": method,
            "params": params,
            "id": id,
        });
        services.handle(envelope).await
    }

    /// Register this daemon's teardown with `orchestrator`.
    ///
    /// Storage is checkpointed first, then alert handling stops, then the
    /// daemon itself stops.
    pub fn register_shutdown_handlers(
        &self,
        orchestrator: &ShutdownOrchestrator,
    ) -> Result<(), ShutdownError> {
        let daemon = self.clone();
        orchestrator.register(
            "storage-checkpoint",
            ShutdownPriority::Critical,
            HandlerOptions::component("storage"),
            move || {
                let daemon = daemon.clone();
                async move {
                    match daemon.storage() {
                        Some(storage) => storage.flush_async().await.map(|_| ()),
                        None => Ok(()),
                    }
                }
            },
        )?;

        let daemon = self.clone();
        orchestrator.register(
            "eviction-manager",
            ShutdownPriority::High,
            HandlerOptions::component("eviction"),
            move || {
                let daemon = daemon.clone();
                async move {
                    if let Some(services) = daemon.services() {
                        services.eviction.stop();
                        services.monitor.stop();
                    }
                    Ok(())
                }
            },
        )?;

        let daemon = self.clone();
        orchestrator.register(
            "daemon",
            ShutdownPriority::Normal,
            HandlerOptions::component("daemon")
                .with_timeout(self.inner.config.server.grace_period() * 2 + Duration::from_secs(1)),
            move || {
                let daemon = daemon.clone();
                async move { daemon.stop().await }
            },
        )?;
        Ok(())
    }
}

/// Spawn a task the daemon cannot serve without. If it panics, the panic is
/// handed to `fatal` so the process shuts down in order. Aborting the returned
/// handle aborts the task.
fn spawn_supervised<F>(name: &'static str, fatal: Option<FatalReporter>, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let inner = tokio::spawn(task);
        let _abort = AbortOnDrop(inner.abort_handle());
        match inner.await {
            Err(e) if e.is_panic() => match &fatal {
                Some(fatal) => fatal.panicked(format!("{name} task: {e}")),
                None => tracing::error!(task = name, error = %e, "background task panicked"),
            },
            _ => {}
        }
    })
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn flush_periodically(storage: Storage, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = transport::stopped(&mut shutdown) => break,
            _ = interval.tick() => {
                if let Err(e) = storage.flush_async().await {
                    tracing::warn!(error = %format!("{e:#}"), "periodic flush failed, will retry");
                }
            }
        }
    }
}

fn remove_socket(address: &BoundAddress) {
    if let BoundAddress::Socket(path) = address {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove socket file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::signals::{test_reporter, Trigger};
    use crate::shutdown::ShutdownReason;

    #[tokio::test]
    async fn supervised_panic_is_reported() {
        let (fatal, mut rx) = test_reporter();
        let handle = spawn_supervised("listener", Some(fatal), async {
            panic!("accept loop bug");
        });
        handle.await.unwrap();

        match rx.recv().await {
            Some(Trigger::Report(ShutdownReason::Panic(detail))) => {
                assert!(detail.starts_with("listener task"), "{detail}");
            }
            other => panic!("expected a panic report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn aborting_the_supervisor_aborts_the_task() {
        let (fatal, mut rx) = test_reporter();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = spawn_supervised("flusher", Some(fatal), async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let _ = done_tx.send(());
        });
        tokio::task::yield_now().await;
        handle.abort();

        // The sender is dropped unsent once the inner task is cancelled.
        let outcome = tokio::time::timeout(Duration::from_secs(5), done_rx).await.unwrap();
        assert!(outcome.is_err());
        assert!(rx.try_recv().is_err());
    }
}
