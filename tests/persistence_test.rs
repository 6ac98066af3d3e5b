mod helpers;

use helpers::{knowledge, result_of, start_socket_daemon};
use memoryd::storage::Storage;
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn knowledge_and_feedback_survive_a_restart() {
    let tmp = TempDir::new().unwrap();

    let daemon = start_socket_daemon(tmp.path()).await;
    let stored = result_of(
        daemon
            .call("storeKnowledge", knowledge("prefer thiserror in libraries", "rust/errors", &["errors"]))
            .await,
    );
    let id = stored["id"].as_str().unwrap().to_string();
    result_of(
        daemon
            .call("provideFeedback", json!({ "trajectoryId": "t-1", "quality": 0.2, "feedback": "too slow" }))
            .await,
    );
    // No explicit flush: stop performs the final one.
    daemon.stop().await.unwrap();

    assert!(tmp.path().join("knowledge.json").exists());
    assert!(tmp.path().join("feedback.json").exists());

    let restarted = start_socket_daemon(tmp.path()).await;
    let entry = result_of(restarted.call("getKnowledge", json!({ "id": id })).await);
    assert_eq!(entry["entry"]["content"], "prefer thiserror in libraries");
    assert_eq!(entry["entry"]["domain"], "rust/errors");

    let status = restarted.status().unwrap();
    assert_eq!(status.storage.knowledge_count, 1);
    assert_eq!(status.storage.feedback_count, 1);

    restarted.stop().await.unwrap();
}

#[tokio::test]
async fn flush_reports_whether_anything_was_written() {
    let tmp = TempDir::new().unwrap();
    let daemon = start_socket_daemon(tmp.path()).await;

    let clean = result_of(daemon.call("flush", json!({})).await);
    assert_eq!(clean["flushed"], false);

    daemon
        .call("storeKnowledge", knowledge("one", "a", &[]))
        .await;
    let dirty = result_of(daemon.call("flush", json!({})).await);
    assert_eq!(dirty["flushed"], true);
    assert!(!daemon.status().unwrap().storage.dirty);

    // The snapshot on disk matches what was flushed, before any shutdown.
    let reopened = Storage::open(tmp.path()).unwrap();
    assert_eq!(reopened.stats().unwrap().knowledge_count, 1);

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn corrupt_snapshot_starts_empty() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("knowledge.json"), b"{ not valid json").unwrap();

    let daemon = start_socket_daemon(tmp.path()).await;
    assert_eq!(daemon.status().unwrap().storage.knowledge_count, 0);

    daemon
        .call("storeKnowledge", knowledge("fresh start", "a", &[]))
        .await;
    daemon.stop().await.unwrap();

    let reopened = Storage::open(tmp.path()).unwrap();
    assert_eq!(reopened.stats().unwrap().knowledge_count, 1);
}

#[tokio::test]
async fn leftover_temp_files_are_ignored() {
    let tmp = TempDir::new().unwrap();

    let daemon = start_socket_daemon(tmp.path()).await;
    daemon
        .call("storeKnowledge", knowledge("committed", "a", &[]))
        .await;
    daemon.stop().await.unwrap();

    // A crash mid-write leaves a partial temp file next to the snapshot.
    let tmp_file = tmp.path().join("knowledge.json.tmp");
    std::fs::write(&tmp_file, b"{\"version\":1,\"entr").unwrap();

    let reopened = Storage::open(tmp.path()).unwrap();
    assert_eq!(reopened.stats().unwrap().knowledge_count, 1);
    assert!(!tmp_file.exists());
}
