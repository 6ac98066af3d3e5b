#![allow(dead_code)]

use memoryd::config::{DaemonConfig, TransportPreference};
use memoryd::daemon::Daemon;
use serde_json::Value;
use std::path::Path;

/// Config rooted at `dir` with short timers so tests finish quickly.
pub fn test_config(dir: &Path, transport: TransportPreference) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.storage.dir = dir.to_string_lossy().into_owned();
    config.storage.flush_interval_ms = 60_000;
    config.server.transport = transport;
    config.server.http_port = 0;
    config.server.grace_period_ms = 500;
    config.monitor.enabled = false;
    config.monitor.interval_ms = 60_000;
    config.shutdown.global_timeout_ms = 5_000;
    config.shutdown.handler_timeout_ms = 2_000;
    config.shutdown.exit_process = false;
    config
}

/// Start a socket daemon in `dir`.
pub async fn start_socket_daemon(dir: &Path) -> Daemon {
    start_daemon(test_config(dir, TransportPreference::Socket)).await
}

pub async fn start_daemon(config: DaemonConfig) -> Daemon {
    let daemon = Daemon::new(config);
    let outcome = daemon.start().await.unwrap();
    assert!(!outcome.already_running, "fresh directory should not have a live daemon");
    daemon
}

/// Params for a `storeKnowledge` call.
pub fn knowledge(content: &str, domain: &str, tags: &[&str]) -> Value {
    serde_json::json!({
        "content": content,
        "domain": domain,
        "tags": tags,
    })
}

/// The `result` of a successful response, panicking with the error otherwise.
pub fn result_of(response: memoryd::protocol::Response) -> Value {
    assert!(
        response.is_success(),
        "expected success, got {:?}",
        response.error
    );
    response.result.unwrap()
}
