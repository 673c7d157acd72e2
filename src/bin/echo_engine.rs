//! Test-double engine.
//!
//! Default mode speaks format A on stdin/stdout:
//! - `handshake` / `exit`: built-in replies
//! - `slow`: waits `{ "ms": n }` milliseconds, then echoes
//! - `fail`: replies with an error
//! - `crash`: exits the process without replying
//! - anything else: `{ "echo": payload }`
//!
//! `--transpileServer` mode speaks format B and answers `echo` and
//! `transpile` requests in order.

use std::time::Duration;

use lintwire::protocol::{encode_tagged, message_type, FrameBuffer, TaggedMessage};
use lintwire::sidecar::{
    TranspileRequest, TranspileResponse, TRANSPILE_METHOD, TRANSPILE_SERVER_FLAG,
};
use lintwire::handler::HandlerResult;
use lintwire::{JsonCodec, LintwireError, RequestContext, Result, Service};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Deserialize)]
struct Slow {
    ms: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    if std::env::args().any(|arg| arg == TRANSPILE_SERVER_FLAG) {
        return serve_sidecar().await;
    }

    Service::builder()
        .handle("slow", slow)
        .handle("fail", fail)
        .handle("crash", crash)
        .fallback(echo)
        .build()
        .serve_stdio()
        .await
}

async fn slow(req: Slow, ctx: RequestContext) -> HandlerResult {
    tokio::time::sleep(Duration::from_millis(req.ms)).await;
    ctx.respond(&json!({ "echo": { "ms": req.ms } })).await
}

async fn fail(_: Value, _ctx: RequestContext) -> HandlerResult {
    Err(LintwireError::Engine {
        message: "requested failure".to_string(),
    })
}

async fn crash(_: Value, _ctx: RequestContext) -> HandlerResult {
    std::process::exit(3)
}

async fn echo(payload: Value, ctx: RequestContext) -> HandlerResult {
    ctx.respond(&json!({ "echo": payload })).await
}

async fn serve_sidecar() -> Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut frames = FrameBuffer::tag_length();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            return frames.finish();
        }
        for request in frames.push(&buf[..n])? {
            let reply = answer(request);
            stdout.write_all(&encode_tagged(&reply)?).await?;
        }
        stdout.flush().await?;
    }
}

fn answer(request: TaggedMessage) -> TaggedMessage {
    let error = |method: &str, text: &str| {
        TaggedMessage::new(message_type::ERROR, method, text.as_bytes().to_vec())
    };

    if request.message_type != message_type::REQUEST {
        return error(&request.method, "invalid request type");
    }
    match request.method.as_str() {
        "echo" => TaggedMessage::new(message_type::RESPONSE, "echo", request.payload),
        TRANSPILE_METHOD => match transpile(&request.payload) {
            Ok(body) => TaggedMessage::new(message_type::RESPONSE, TRANSPILE_METHOD, body),
            Err(e) => error(TRANSPILE_METHOD, &e.to_string()),
        },
        other => error(other, "unknown method"),
    }
}

fn transpile(payload: &[u8]) -> Result<bytes::Bytes> {
    let request: TranspileRequest = JsonCodec::decode(payload)?;
    if request.file_name.is_empty() {
        return Err(LintwireError::Protocol("fileName is required".to_string()));
    }
    JsonCodec::encode(&TranspileResponse {
        output_text: format!("// {} ({})\n", request.file_name, request.module),
        diagnostics_text: String::new(),
        has_error: false,
    })
}
