//! Unit tests for the serialised stdin writer.

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

use discodex::rpc::message::request;
use discodex::rpc::writer::LineWriter;
use discodex::AppError;

#[tokio::test]
async fn each_send_writes_one_line() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let writer = LineWriter::new(ours, false);

    writer.send(&request(1, "initialize", json!({}))).await.unwrap();
    writer.send(&request(2, "shutdown", json!({}))).await.unwrap();

    let mut lines = BufReader::new(theirs).lines();
    let first: serde_json::Value =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    let second: serde_json::Value =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(first["id"], 1);
    assert_eq!(second["method"], "shutdown");
}

#[tokio::test]
async fn broken_pipe_is_a_write_failure() {
    let (ours, theirs) = tokio::io::duplex(64);
    drop(theirs);
    let writer = LineWriter::new(ours, false);

    let err = writer
        .send(&request(1, "tools/call", json!({})))
        .await
        .unwrap_err();

    assert!(err.is_write_failure(), "expected a write failure, got {err:?}");
}

#[tokio::test]
async fn send_after_close_is_a_write_failure() {
    let (ours, _theirs) = tokio::io::duplex(64);
    let writer = LineWriter::new(ours, false);

    writer.close().await;
    writer.close().await;
    assert!(writer.is_closed().await);

    let err = writer.send(&json!({})).await.unwrap_err();
    assert!(matches!(err, AppError::Write(_)));
}
