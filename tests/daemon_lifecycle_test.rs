mod helpers;

use chrono::Utc;
use helpers::{knowledge, result_of, start_socket_daemon, test_config};
use memoryd::client;
use memoryd::config::TransportPreference;
use memoryd::daemon::liveness::LivenessMarker;
use memoryd::daemon::state::ServerState;
use memoryd::daemon::{BoundAddress, Daemon};
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn start_is_idempotent_on_the_same_handle() {
    let tmp = TempDir::new().unwrap();
    let daemon = start_socket_daemon(tmp.path()).await;
    let first = daemon.address().unwrap();

    let again = daemon.start().await.unwrap();
    assert!(!again.already_running);
    assert_eq!(again.address, first);
    assert_eq!(daemon.state(), ServerState::Ready);

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn second_daemon_defers_to_the_live_one() {
    let tmp = TempDir::new().unwrap();
    let daemon = start_socket_daemon(tmp.path()).await;

    let other = Daemon::new(test_config(tmp.path(), TransportPreference::Socket));
    let outcome = other.start().await.unwrap();
    assert!(outcome.already_running);
    assert_eq!(outcome.address, daemon.address().unwrap());
    assert_eq!(other.state(), ServerState::Stopped);

    // The reported address reaches the live daemon.
    let response = client::call(&outcome.address, "ping", json!({})).await.unwrap();
    assert_eq!(result_of(response)["state"], "ready");

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_starts_elect_one_owner() {
    let tmp = TempDir::new().unwrap();
    let a = Daemon::new(test_config(tmp.path(), TransportPreference::Socket));
    let b = Daemon::new(test_config(tmp.path(), TransportPreference::Socket));

    let (first, second) = tokio::join!(a.start(), b.start());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(
        [first.already_running, second.already_running]
            .iter()
            .filter(|deferred| !**deferred)
            .count(),
        1
    );
    assert_eq!(first.address, second.address);
    let ready = [a.state(), b.state()]
        .iter()
        .filter(|s| **s == ServerState::Ready)
        .count();
    assert_eq!(ready, 1);

    let response = client::call(&first.address, "ping", json!({})).await.unwrap();
    assert!(response.is_success());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn stale_marker_and_socket_are_replaced() {
    let tmp = TempDir::new().unwrap();

    // A pid that has certainly exited.
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();

    let socket = tmp.path().join("memoryd.sock");
    std::fs::write(&socket, b"").unwrap();
    LivenessMarker {
        pid: dead_pid,
        address: BoundAddress::Socket(socket.clone()).to_string(),
        started_at: Utc::now(),
        version: "0.0.0".into(),
    }
    .write(tmp.path())
    .unwrap();

    let daemon = start_socket_daemon(tmp.path()).await;
    let marker = LivenessMarker::read(tmp.path()).unwrap().unwrap();
    assert_eq!(marker.pid, std::process::id());

    let response = client::call(&daemon.address().unwrap(), "ping", json!({}))
        .await
        .unwrap();
    assert!(response.is_success());

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn stop_removes_marker_and_socket() {
    let tmp = TempDir::new().unwrap();
    let daemon = start_socket_daemon(tmp.path()).await;
    let socket = tmp.path().join("memoryd.sock");
    assert!(socket.exists());
    assert!(LivenessMarker::path(tmp.path()).exists());

    daemon.stop().await.unwrap();

    assert_eq!(daemon.state(), ServerState::Stopped);
    assert!(!socket.exists());
    assert!(!LivenessMarker::path(tmp.path()).exists());

    // A client now fails to connect instead of hanging.
    assert!(client::call(&BoundAddress::Socket(socket), "ping", json!({}))
        .await
        .is_err());
}

#[tokio::test]
async fn stop_is_a_noop_when_not_running() {
    let tmp = TempDir::new().unwrap();
    let daemon = Daemon::new(test_config(tmp.path(), TransportPreference::Socket));
    daemon.stop().await.unwrap();
    assert_eq!(daemon.state(), ServerState::Stopped);

    let daemon = start_socket_daemon(tmp.path()).await;
    daemon.stop().await.unwrap();
    daemon.stop().await.unwrap();
    assert_eq!(daemon.state(), ServerState::Stopped);
}

#[tokio::test]
async fn stopped_handle_refuses_restart() {
    let tmp = TempDir::new().unwrap();
    let daemon = start_socket_daemon(tmp.path()).await;
    daemon.stop().await.unwrap();

    assert!(daemon.start().await.is_err());
    assert!(!LivenessMarker::path(tmp.path()).exists());
}

#[tokio::test]
async fn in_process_calls_fail_once_stopped() {
    let tmp = TempDir::new().unwrap();
    let daemon = start_socket_daemon(tmp.path()).await;

    let stored = result_of(
        daemon
            .call("storeKnowledge", knowledge("cached answer", "project", &[]))
            .await,
    );
    assert_eq!(stored["stored"], true);

    daemon.stop().await.unwrap();
    let response = daemon.call("ping", json!({})).await;
    assert_eq!(response.error_code(), Some("SHUTTING_DOWN"));
}

#[tokio::test]
async fn status_reports_address_and_uptime() {
    let tmp = TempDir::new().unwrap();
    let daemon = start_socket_daemon(tmp.path()).await;

    let status = daemon.status().unwrap();
    assert_eq!(status.state, ServerState::Ready);
    assert_eq!(status.address, Some(daemon.address().unwrap().to_string()));
    assert_eq!(status.version, env!("CARGO_PKG_VERSION"));

    daemon.stop().await.unwrap();
}
