//! End-to-end tests against the `echo-engine` test double.

use std::time::Duration;

use bytes::Bytes;
use lintwire::{
    LintwireError, SidecarBuilder, SubprocessBuilder, Transport, TranspileRequest,
};
use serde_json::{json, Value};

const ENGINE: &str = env!("CARGO_BIN_EXE_echo-engine");

fn spawn_engine() -> Transport {
    SubprocessBuilder::new(ENGINE).spawn().unwrap()
}

#[tokio::test]
async fn test_lint_echo_then_close() {
    let engine = spawn_engine();

    let reply = engine
        .request("lint", json!({ "file": "a.ts" }))
        .await
        .unwrap();
    assert_eq!(reply, json!({ "echo": { "file": "a.ts" } }));

    engine.close().await;
    assert!(!engine.is_alive());
    let err = engine.request("lint", Value::Null).await.unwrap_err();
    assert!(matches!(err, LintwireError::Terminated { .. }));
}

#[tokio::test]
async fn test_handshake_and_exit() {
    let engine = spawn_engine();

    let info = engine.handshake().await.unwrap();
    assert_eq!(info, json!({ "version": "1.0.0", "ok": true }));

    engine.exit().await.unwrap();
    assert!(!engine.is_alive());
}

#[tokio::test]
async fn test_pipelined_out_of_order() {
    let engine = spawn_engine();

    let slow = engine.send("slow", json!({ "ms": 100 })).await.unwrap();
    let quick = engine.send("lint", json!({ "n": 1 })).await.unwrap();

    // The quick reply overtakes the slow one on the wire.
    let quick = quick.await.unwrap();
    assert_eq!(quick, json!({ "echo": { "n": 1 } }));
    let slow = slow.await.unwrap();
    assert_eq!(slow, json!({ "echo": { "ms": 100 } }));

    engine.close().await;
}

#[tokio::test]
async fn test_engine_error_rejects_only_its_request() {
    let engine = spawn_engine();

    let err = engine.request("fail", Value::Null).await.unwrap_err();
    match err {
        LintwireError::Engine { message } => assert_eq!(message, "requested failure"),
        other => panic!("unexpected error: {:?}", other),
    }

    let reply = engine.request("applyFixes", json!([])).await.unwrap();
    assert_eq!(reply, json!({ "echo": [] }));
    engine.close().await;
}

#[tokio::test]
async fn test_crash_rejects_in_flight_requests() {
    let engine = spawn_engine();

    let waiting = engine.send("slow", json!({ "ms": 5_000 })).await.unwrap();
    let crash = engine.send("crash", Value::Null).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("in-flight request was not rejected");
    assert!(outcome.unwrap_err().is_transport_failure());
    assert!(crash.await.unwrap_err().is_transport_failure());
    assert!(!engine.is_alive());
}

#[tokio::test]
async fn test_spawn_missing_program() {
    let err = SubprocessBuilder::new("/nonexistent/lint-engine")
        .api_mode()
        .spawn()
        .err()
        .expect("spawn should fail");
    assert!(matches!(err, LintwireError::Io(_)));
}

#[tokio::test]
async fn test_sidecar_echo_in_order() {
    let sidecar = SidecarBuilder::new(ENGINE).spawn().unwrap();

    let (a, b) = tokio::join!(sidecar.call("echo", "first"), sidecar.call("echo", "second"));
    assert_eq!(a.unwrap(), Bytes::from("first"));
    assert_eq!(b.unwrap(), Bytes::from("second"));

    sidecar.close().await;
    assert!(!sidecar.is_alive());
}

#[tokio::test]
async fn test_sidecar_transpile() {
    let dir = std::env::temp_dir();
    let sidecar = SidecarBuilder::new(ENGINE).cwd(&dir).spawn().unwrap();

    let out = sidecar
        .transpile(&TranspileRequest::new("/p/index.ts").module("commonjs"))
        .await
        .unwrap();
    assert_eq!(out.output_text, "// /p/index.ts (commonjs)\n");
    assert!(!out.has_error);

    let err = sidecar
        .transpile(&TranspileRequest::default())
        .await
        .unwrap_err();
    match err {
        LintwireError::Sidecar { method, message } => {
            assert_eq!(method, "transpile");
            assert!(message.contains("fileName is required"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // An error reply leaves the sidecar usable.
    let err = sidecar.call("format", Bytes::new()).await.unwrap_err();
    assert!(matches!(err, LintwireError::Sidecar { ref message, .. } if message == "unknown method"));
    let again = sidecar.call("echo", "still here").await.unwrap();
    assert_eq!(again, Bytes::from("still here"));

    sidecar.close().await;
}
