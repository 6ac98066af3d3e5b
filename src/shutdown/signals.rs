//! Routes termination signals and fatal errors into the orchestrator.
//!
//! No panic hook is installed: a panic caught by the runtime (a request
//! handler, a shutdown handler) is recovered where it happens. Long-lived
//! tasks report their own panics through [`FatalReporter::panicked`].

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{ShutdownOrchestrator, ShutdownReason};

/// Exit code when a second signal arrives while shutdown is still running.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Something asking the process to shut down.
#[derive(Debug)]
pub(crate) enum Trigger {
    Signal(&'static str),
    Report(ShutdownReason),
}

/// Handle for reporting unrecoverable errors from running components.
#[derive(Clone)]
pub struct FatalReporter {
    tx: mpsc::UnboundedSender<Trigger>,
}

impl FatalReporter {
    pub fn report(&self, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::error!(detail = %detail, "fatal error reported");
        let _ = self.tx.send(Trigger::Report(ShutdownReason::Fatal(detail)));
    }

    /// A task the daemon cannot run without has panicked.
    pub fn panicked(&self, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::error!(detail = %detail, "background task panicked");
        let _ = self.tx.send(Trigger::Report(ShutdownReason::Panic(detail)));
    }
}

/// Wire SIGTERM, SIGINT, SIGHUP (Ctrl-C elsewhere) and fatal reports to
/// `orchestrator.shutdown`. A second signal during shutdown exits the process
/// with [`FORCED_EXIT_CODE`]. Must be called from within the runtime.
pub fn install(orchestrator: Arc<ShutdownOrchestrator>) -> Result<FatalReporter> {
    let mut signals = Signals::new()?;
    let (tx, rx) = mpsc::unbounded_channel();

    let forward = tx.clone();
    tokio::spawn(async move {
        loop {
            let name = signals.recv().await;
            if forward.send(Trigger::Signal(name)).is_err() {
                break;
            }
        }
    });

    listen(orchestrator, rx, || std::process::exit(FORCED_EXIT_CODE));
    Ok(FatalReporter { tx })
}

/// Serve triggers for the life of the process. The first one starts the
/// shutdown run; fatal reports after that join the same run. `force` runs on
/// the second signal.
fn listen<F>(
    orchestrator: Arc<ShutdownOrchestrator>,
    mut rx: mpsc::UnboundedReceiver<Trigger>,
    force: F,
) where
    F: Fn() + Send + 'static,
{
    tokio::spawn(async move {
        let mut signals_seen = 0u32;
        while let Some(trigger) = rx.recv().await {
            let reason = match trigger {
                Trigger::Signal(name) => {
                    signals_seen += 1;
                    if signals_seen > 1 {
                        tracing::error!(signal = name, "second signal during shutdown, exiting now");
                        force();
                        continue;
                    }
                    ShutdownReason::Signal(name.to_string())
                }
                Trigger::Report(reason) => reason,
            };
            if orchestrator.phase() != super::ShutdownPhase::Idle {
                tracing::warn!(reason = %reason, "shutdown already in progress");
                continue;
            }
            tracing::warn!(reason = %reason, "shutdown triggered");
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator.shutdown(reason).await;
            });
        }
    });
}

#[cfg(test)]
pub(crate) fn test_reporter() -> (FatalReporter, mpsc::UnboundedReceiver<Trigger>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FatalReporter { tx }, rx)
}

#[cfg(unix)]
struct Signals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> Result<Self> {
        use anyhow::Context;
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            term: signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?,
            int: signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?,
            hup: signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
            _ = self.hup.recv() => "SIGHUP",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
        "CTRL_C"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShutdownConfig;
    use crate::shutdown::{HandlerOptions, ShutdownPhase, ShutdownPriority};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn orchestrator() -> Arc<ShutdownOrchestrator> {
        ShutdownOrchestrator::new(ShutdownConfig {
            exit_process: false,
            ..ShutdownConfig::default()
        })
    }

    #[tokio::test]
    async fn fatal_report_triggers_shutdown() {
        let orchestrator = orchestrator();
        let (fatal, rx) = test_reporter();
        listen(orchestrator.clone(), rx, || {});

        fatal.report("listener died");
        let report = tokio::time::timeout(Duration::from_secs(5), orchestrator.wait())
            .await
            .unwrap();
        assert_eq!(report.reason, ShutdownReason::Fatal("listener died".into()));
        assert!(report.success);
    }

    #[tokio::test]
    async fn recovered_panic_does_not_shut_down() {
        let orchestrator = orchestrator();
        let _fatal = install(orchestrator.clone()).unwrap();

        let joined = tokio::task::spawn_blocking(|| panic!("handler bug")).await;
        assert!(joined.unwrap_err().is_panic());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orchestrator.phase(), ShutdownPhase::Idle);
    }

    #[tokio::test]
    async fn second_signal_forces_exit_and_later_reports_are_absorbed() {
        let orchestrator = orchestrator();
        orchestrator
            .register("slow", ShutdownPriority::Normal, HandlerOptions::default(), || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .unwrap();
        let forced = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let counter = forced.clone();
        listen(orchestrator.clone(), rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let fatal = FatalReporter { tx: tx.clone() };

        tx.send(Trigger::Signal("SIGTERM")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orchestrator.phase(), ShutdownPhase::ShuttingDown);

        fatal.report("late failure");
        tx.send(Trigger::Signal("SIGINT")).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), orchestrator.wait())
            .await
            .unwrap();
        assert_eq!(report.reason, ShutdownReason::Signal("SIGTERM".into()));
        assert_eq!(forced.load(Ordering::SeqCst), 1);

        // The listener outlives the run and keeps absorbing triggers.
        tx.send(Trigger::Signal("SIGTERM")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(forced.load(Ordering::SeqCst), 2);
    }
}
