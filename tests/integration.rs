//! Integration tests for lintwire.
//!
//! These tests verify the integration between different modules.

use std::time::Duration;

use lintwire::handler::HandlerResult;
use lintwire::protocol::{
    decode_message, decode_tagged, encode_message, encode_tagged, FrameBuffer, Message,
    TaggedMessage,
};
use lintwire::transport::SandboxIo;
use lintwire::{
    channel_pair, BridgeBuilder, LintwireError, RequestContext, Result, Service, TransportConfig,
};
use proptest::prelude::*;
use serde_json::{json, Value};

fn payload_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(|n| json!(n)),
        ".{0,40}".prop_map(|s| json!(s)),
        (any::<bool>(), proptest::collection::vec("[a-z./]{1,12}", 0..6))
            .prop_map(|(fix, files)| json!({ "fix": fix, "files": files })),
    ]
}

fn message_strategy() -> impl Strategy<Value = Message> {
    (
        1u64..=u64::MAX,
        "[a-zA-Z.]{1,24}",
        payload_strategy(),
    )
        .prop_map(|(id, kind, payload)| Message::new(id, kind, payload))
}

fn tagged_strategy() -> impl Strategy<Value = TaggedMessage> {
    (
        prop_oneof![Just(1u8), Just(4u8), Just(5u8)],
        "[a-zA-Z]{0,16}",
        proptest::collection::vec(any::<u8>(), 0..600),
    )
        .prop_map(|(message_type, method, payload)| {
            TaggedMessage::new(message_type, method, payload)
        })
}

/// Split `bytes` at the given chunk sizes, cycling through them.
fn chunked(bytes: &[u8], sizes: &[usize]) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut at = 0;
    let mut i = 0;
    while at < bytes.len() {
        let size = sizes[i % sizes.len()].max(1);
        let end = (at + size).min(bytes.len());
        chunks.push(bytes[at..end].to_vec());
        at = end;
        i += 1;
    }
    chunks
}

proptest! {
    #[test]
    fn prop_length_prefixed_round_trip(message in message_strategy()) {
        let bytes = encode_message(&message).unwrap();
        let (decoded, consumed) = decode_message(&bytes, 0).unwrap().unwrap();
        prop_assert_eq!(consumed, bytes.len());
        prop_assert_eq!(decoded, message);
    }

    #[test]
    fn prop_tagged_round_trip(message in tagged_strategy()) {
        let bytes = encode_tagged(&message).unwrap();
        let (decoded, consumed) = decode_tagged(&bytes, 0).unwrap().unwrap();
        prop_assert_eq!(consumed, bytes.len());
        prop_assert_eq!(decoded, message);
    }

    #[test]
    fn prop_length_prefixed_chunking(
        messages in proptest::collection::vec(message_strategy(), 1..8),
        sizes in proptest::collection::vec(1usize..64, 1..8),
    ) {
        let mut stream = Vec::new();
        for message in &messages {
            stream.extend(encode_message(message).unwrap());
        }

        let whole = FrameBuffer::length_prefixed().push(&stream).unwrap();

        let mut buffer = FrameBuffer::length_prefixed();
        let mut pieces = Vec::new();
        for chunk in chunked(&stream, &sizes) {
            pieces.extend(buffer.push(&chunk).unwrap());
        }
        prop_assert!(buffer.finish().is_ok());
        prop_assert_eq!(&pieces, &whole);
        prop_assert_eq!(pieces, messages);
    }

    #[test]
    fn prop_tagged_chunking(
        messages in proptest::collection::vec(tagged_strategy(), 1..6),
        sizes in proptest::collection::vec(1usize..48, 1..8),
    ) {
        let mut stream = Vec::new();
        for message in &messages {
            stream.extend(encode_tagged(message).unwrap());
        }

        let mut buffer = FrameBuffer::tag_length();
        let mut pieces = Vec::new();
        for chunk in chunked(&stream, &sizes) {
            pieces.extend(buffer.push(&chunk).unwrap());
        }
        prop_assert!(buffer.is_empty());
        prop_assert_eq!(pieces, messages);
    }
}

/// Test one-byte-at-a-time delivery of a mixed stream.
#[test]
fn test_byte_at_a_time() {
    let messages = vec![
        Message::new(1, "handshake", json!({ "version": "1.0.0" })),
        Message::new(2, "lint", json!({ "files": ["a.ts", "b.ts"] })),
        Message::response(2, json!({ "diagnostics": [] })),
        Message::error(3, "boom"),
    ];
    let mut stream = Vec::new();
    for message in &messages {
        stream.extend(encode_message(message).unwrap());
    }

    let mut buffer = FrameBuffer::length_prefixed();
    let mut decoded = Vec::new();
    for byte in &stream {
        decoded.extend(buffer.push(std::slice::from_ref(byte)).unwrap());
    }
    assert_eq!(decoded, messages);
}

/// Test that an oversized announced frame is rejected before buffering.
#[test]
fn test_oversized_frame_rejected() {
    let mut buffer = FrameBuffer::new(lintwire::protocol::LengthPrefixed::new(1024));
    let err = buffer.push(&(4096u32).to_le_bytes()).unwrap_err();
    assert!(matches!(err, LintwireError::FrameTooLarge { size: 4096, max: 1024 }));
}

async fn echo(payload: Value, ctx: RequestContext) -> HandlerResult {
    ctx.respond(&json!({ "echo": payload })).await
}

#[derive(serde::Deserialize)]
struct Delay {
    ms: u64,
}

async fn delayed(req: Delay, ctx: RequestContext) -> HandlerResult {
    tokio::time::sleep(Duration::from_millis(req.ms)).await;
    ctx.respond(&req.ms).await
}

fn echo_service() -> Service {
    Service::builder()
        .handle("delay", delayed)
        .fallback(echo)
        .build()
}

/// Test the channel transport against the service.
#[tokio::test]
async fn test_channel_end_to_end() {
    let (transport, endpoint) = channel_pair(TransportConfig::default());
    let worker = tokio::spawn(async move { echo_service().serve_channel(endpoint).await });

    let info = transport.handshake().await.unwrap();
    assert_eq!(info["version"], "1.0.0");

    let reply = transport
        .request("lint", json!({ "file": "a.ts" }))
        .await
        .unwrap();
    assert_eq!(reply, json!({ "echo": { "file": "a.ts" } }));

    transport.exit().await.unwrap();
    assert!(!transport.is_alive());
    worker.await.unwrap().unwrap();
}

/// Test out-of-order replies reach the right callers.
#[tokio::test]
async fn test_channel_out_of_order() {
    let (transport, endpoint) = channel_pair(TransportConfig::default());
    tokio::spawn(async move { echo_service().serve_channel(endpoint).await });

    let slow = transport.send("delay", json!({ "ms": 80 })).await.unwrap();
    let fast = transport.send("delay", json!({ "ms": 1 })).await.unwrap();
    assert!(slow.id() < fast.id());

    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(slow.unwrap(), json!(80));
    assert_eq!(fast.unwrap(), json!(1));

    transport.close().await;
}

async fn service_engine(io: SandboxIo) -> Result<()> {
    let (stdin, stdout, _stderr, _fs) = io.into_split();
    echo_service().serve_stream(stdin, stdout).await
}

/// Test the bridge transport with a service running inside the sandbox.
#[tokio::test]
async fn test_bridge_end_to_end() {
    let transport = BridgeBuilder::new()
        .file("/src/a.ts", "let a:number = 20")
        .open(service_engine);

    let init = transport.request("init", Value::Null).await.unwrap();
    assert_eq!(init, json!({ "status": "ok" }));

    let replies = lint_many(&transport, 20).await;
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply, json!({ "echo": { "n": i } }));
    }

    transport.close().await;
    let err = transport.request("lint", Value::Null).await.unwrap_err();
    assert!(err.is_transport_failure());
}

/// Pipeline `count` lint requests, then await them in order.
async fn lint_many(transport: &lintwire::Transport, count: usize) -> Vec<Value> {
    let mut pending = Vec::with_capacity(count);
    for n in 0..count {
        pending.push(transport.send("lint", json!({ "n": n })).await.unwrap());
    }
    let mut replies = Vec::with_capacity(count);
    for p in pending {
        replies.push(p.await.unwrap());
    }
    replies
}

/// Test that a bridge engine without handlers reports unknown kinds.
#[tokio::test]
async fn test_bridge_unknown_kind() {
    async fn bare_engine(io: SandboxIo) -> Result<()> {
        let (stdin, stdout, _stderr, _fs) = io.into_split();
        Service::builder().build().serve_stream(stdin, stdout).await
    }

    let transport = BridgeBuilder::new().open(bare_engine);
    let err = transport
        .request("checker.getNodeType", json!({ "node": 1 }))
        .await
        .unwrap_err();
    match err {
        LintwireError::Engine { message } => {
            assert_eq!(message, "unknown message kind: checker.getNodeType")
        }
        other => panic!("unexpected error: {:?}", other),
    }
    transport.close().await;
}

async fn vfs_engine(io: SandboxIo) -> Result<()> {
    let (stdin, stdout, _stderr, fs) = io.into_split();
    Service::builder()
        .handle("readFile", move |path: String, ctx: RequestContext| {
            let fs = fs.clone();
            async move {
                let text = fs.read_to_string(&path)?;
                ctx.respond(&text).await
            }
        })
        .build()
        .serve_stream(stdin, stdout)
        .await
}

/// Test that an engine using the split handles still sees the snapshot.
#[tokio::test]
async fn test_bridge_split_engine_reads_vfs() {
    let transport = BridgeBuilder::new()
        .file("/src/a.ts", "let a:number = 20")
        .open(vfs_engine);

    let text = transport
        .request("readFile", json!("src\\a.ts"))
        .await
        .unwrap();
    assert_eq!(text, json!("let a:number = 20"));

    let missing = transport
        .request("readFile", json!("/src/b.ts"))
        .await
        .unwrap();
    assert_eq!(missing, Value::Null);

    transport.close().await;
}
