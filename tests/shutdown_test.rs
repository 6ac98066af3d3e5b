mod helpers;

use anyhow::anyhow;
use helpers::{knowledge, start_socket_daemon};
use memoryd::config::ShutdownConfig;
use memoryd::daemon::liveness::LivenessMarker;
use memoryd::daemon::state::ServerState;
use memoryd::shutdown::{
    HandlerOptions, ShutdownEvent, ShutdownOrchestrator, ShutdownPhase, ShutdownPriority,
    ShutdownReason,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn quick_config() -> ShutdownConfig {
    ShutdownConfig {
        global_timeout_ms: 2_000,
        handler_timeout_ms: 500,
        debounce_ms: 100,
        exit_process: false,
        ..ShutdownConfig::default()
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A handler that logs `name` when it runs.
fn recorder(
    log: &Arc<Mutex<Vec<&'static str>>>,
    name: &'static str,
) -> impl Fn() -> HandlerFuture + Send + Sync + 'static {
    slow_recorder(log, name, name, Duration::ZERO)
}

/// A handler that logs `start`, sleeps for `delay`, then logs `done`.
fn slow_recorder(
    log: &Arc<Mutex<Vec<&'static str>>>,
    start: &'static str,
    done: &'static str,
    delay: Duration,
) -> impl Fn() -> HandlerFuture + Send + Sync + 'static {
    let log = Arc::clone(log);
    move || {
        let log = Arc::clone(&log);
        Box::pin(async move {
            log.lock().unwrap().push(start);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
                log.lock().unwrap().push(done);
            }
            Ok(())
        })
    }
}

#[tokio::test]
async fn tiers_run_in_priority_order() {
    let orchestrator = ShutdownOrchestrator::new(quick_config());
    let log = Arc::new(Mutex::new(Vec::new()));

    // Registered out of order on purpose.
    orchestrator
        .register("temp-files", ShutdownPriority::Cleanup, HandlerOptions::default(), recorder(&log, "cleanup"))
        .unwrap();
    orchestrator
        .register("metrics", ShutdownPriority::Low, HandlerOptions::default(), recorder(&log, "low"))
        .unwrap();
    // A later tier starting before the critical one finishes would land between start and done.
    orchestrator
        .register(
            "checkpoint",
            ShutdownPriority::Critical,
            HandlerOptions::default(),
            slow_recorder(&log, "critical-start", "critical-done", Duration::from_millis(50)),
        )
        .unwrap();
    orchestrator
        .register("listeners", ShutdownPriority::High, HandlerOptions::default(), recorder(&log, "high"))
        .unwrap();
    orchestrator
        .register("workers", ShutdownPriority::Normal, HandlerOptions::default(), recorder(&log, "normal"))
        .unwrap();

    let mut events = orchestrator.subscribe();
    let report = orchestrator.shutdown(ShutdownReason::Requested).await;

    assert!(report.success);
    assert_eq!(report.exit_code, 0);
    assert_eq!(
        *log.lock().unwrap(),
        ["critical-start", "critical-done", "high", "normal", "low", "cleanup"]
    );
    assert_eq!(orchestrator.phase(), ShutdownPhase::Complete);

    assert!(matches!(events.recv().await.unwrap(), ShutdownEvent::Started(ShutdownReason::Requested)));
    assert!(matches!(
        events.recv().await.unwrap(),
        ShutdownEvent::TierStarted(ShutdownPriority::Critical)
    ));
}

#[tokio::test]
async fn slow_handler_times_out_without_blocking_its_tier() {
    let orchestrator = ShutdownOrchestrator::new(quick_config());
    let log = Arc::new(Mutex::new(Vec::new()));

    orchestrator
        .register(
            "stuck",
            ShutdownPriority::Critical,
            HandlerOptions::component("storage").with_timeout(Duration::from_millis(50)),
            || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
        )
        .unwrap();
    orchestrator
        .register("sibling", ShutdownPriority::Critical, HandlerOptions::default(), recorder(&log, "sibling"))
        .unwrap();
    orchestrator
        .register("after", ShutdownPriority::Normal, HandlerOptions::default(), recorder(&log, "after"))
        .unwrap();

    let started = std::time::Instant::now();
    let report = orchestrator.shutdown(ShutdownReason::Requested).await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let stuck = report.outcome("stuck").unwrap();
    assert!(stuck.timed_out);
    assert!(!stuck.success);
    assert_eq!(stuck.component.as_deref(), Some("storage"));
    assert!(report.outcome("sibling").unwrap().success);
    assert!(report.outcome("after").unwrap().success);
    assert_eq!(*log.lock().unwrap(), ["sibling", "after"]);
    assert!(!report.success);
    assert_eq!(report.exit_code, 1);
}

#[tokio::test]
async fn timed_out_handler_is_left_to_finish() {
    let orchestrator = ShutdownOrchestrator::new(quick_config());
    let finished = Arc::new(AtomicBool::new(false));
    {
        let finished = Arc::clone(&finished);
        orchestrator
            .register(
                "slow-write",
                ShutdownPriority::Critical,
                HandlerOptions::default().with_timeout(Duration::from_millis(20)),
                move || {
                    let finished = Arc::clone(&finished);
                    async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .unwrap();
    }

    let report = orchestrator.shutdown(ShutdownReason::Requested).await;
    assert!(report.outcome("slow-write").unwrap().timed_out);
    assert!(!finished.load(Ordering::SeqCst));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn concurrent_requests_share_one_run() {
    let orchestrator = ShutdownOrchestrator::new(quick_config());
    let runs = Arc::new(Mutex::new(0u32));
    {
        let runs = Arc::clone(&runs);
        orchestrator
            .register("count", ShutdownPriority::Normal, HandlerOptions::default(), move || {
                let runs = Arc::clone(&runs);
                async move {
                    *runs.lock().unwrap() += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                }
            })
            .unwrap();
    }

    let (a, b, c) = tokio::join!(
        orchestrator.shutdown(ShutdownReason::Signal("SIGTERM".into())),
        orchestrator.shutdown(ShutdownReason::Signal("SIGINT".into())),
        orchestrator.wait(),
    );

    assert_eq!(*runs.lock().unwrap(), 1);
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &c));
    assert_eq!(a.reason, ShutdownReason::Signal("SIGTERM".into()));

    // Later callers get the finished report straight away.
    let late = orchestrator.shutdown(ShutdownReason::Requested).await;
    assert!(Arc::ptr_eq(&a, &late));
    assert!(Arc::ptr_eq(&a, &orchestrator.report().unwrap()));
}

#[tokio::test]
async fn global_deadline_skips_remaining_tiers() {
    let orchestrator = ShutdownOrchestrator::new(ShutdownConfig {
        global_timeout_ms: 100,
        handler_timeout_ms: 5_000,
        ..quick_config()
    });

    orchestrator
        .register("slow", ShutdownPriority::Critical, HandlerOptions::default(), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .unwrap();
    orchestrator
        .register("late", ShutdownPriority::Low, HandlerOptions::default(), || async { Ok(()) })
        .unwrap();

    let report = orchestrator.shutdown(ShutdownReason::Fatal("listener died".into())).await;

    assert!(report.outcome("slow").unwrap().timed_out);
    let late = report.outcome("late").unwrap();
    assert!(late.skipped);
    assert!(!late.success);
    assert_eq!(report.skipped_tiers, vec![ShutdownPriority::Low]);
    assert_eq!(report.exit_code, 1);
}

#[tokio::test]
async fn failures_are_reported_per_handler() {
    let orchestrator = ShutdownOrchestrator::new(quick_config());
    orchestrator
        .register("broken", ShutdownPriority::High, HandlerOptions::default(), || async {
            Err(anyhow!("socket already gone"))
        })
        .unwrap();
    orchestrator
        .register("fine", ShutdownPriority::High, HandlerOptions::default(), || async { Ok(()) })
        .unwrap();

    let report = orchestrator.shutdown(ShutdownReason::Requested).await;
    let broken = report.outcome("broken").unwrap();
    assert!(!broken.success);
    assert!(!broken.timed_out);
    assert_eq!(broken.error.as_deref(), Some("socket already gone"));
    assert!(report.outcome("fine").unwrap().success);
    assert_eq!(report.exit_code, 1);
}

#[tokio::test]
async fn daemon_handlers_flush_and_stop() {
    let tmp = TempDir::new().unwrap();
    let daemon = start_socket_daemon(tmp.path()).await;
    daemon
        .call("storeKnowledge", knowledge("survives shutdown", "a", &[]))
        .await;

    let orchestrator = ShutdownOrchestrator::new(quick_config());
    daemon.register_shutdown_handlers(&orchestrator).unwrap();
    let mut names = orchestrator.handler_names();
    names.sort();
    assert_eq!(names, ["daemon", "eviction-manager", "storage-checkpoint"]);

    let report = orchestrator
        .shutdown(ShutdownReason::Signal("SIGTERM".into()))
        .await;

    assert!(report.success, "{:?}", report.handlers);
    assert_eq!(daemon.state(), ServerState::Stopped);
    assert!(!LivenessMarker::path(tmp.path()).exists());
    let snapshot = std::fs::read_to_string(tmp.path().join("knowledge.json")).unwrap();
    assert!(snapshot.contains("survives shutdown"));
}
