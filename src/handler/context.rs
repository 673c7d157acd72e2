//! Request context for handlers.
//!
//! Provides methods for answering a request:
//! - `respond` - send a `response` with a serializable payload
//! - `respond_value` - send a `response` with a ready JSON value
//! - `error` - send an `error` reply with `{"message": …}`
//!
//! Every request gets exactly one reply. If a handler returns without
//! replying, the service answers for it: `null` on `Ok`, the error text on
//! `Err`.
//!
//! # Example
//!
//! ```ignore
//! async fn lint_handler(req: LintRequest, ctx: RequestContext) -> Result<()> {
//!     let diagnostics = run_rules(&req)?;
//!     ctx.respond(&diagnostics).await
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::codec::JsonCodec;
use crate::error::{LintwireError, Result};
use crate::protocol::Message;
use crate::transport::WorkerReplies;

/// Where replies go: a framed byte stream or a worker channel.
#[derive(Clone)]
pub(crate) enum ReplySink {
    Stream(mpsc::Sender<Message>),
    Channel(WorkerReplies),
}

impl ReplySink {
    pub(crate) async fn send(&self, message: Message) -> Result<()> {
        match self {
            ReplySink::Stream(tx) => tx
                .send(message)
                .await
                .map_err(|_| LintwireError::terminated("reply stream is closed")),
            ReplySink::Channel(replies) => replies.send(message).await,
        }
    }
}

/// Context passed to request handlers.
///
/// `RequestContext` is `Clone` and can be moved into spawned tasks; all
/// clones share the replied flag.
#[derive(Clone)]
pub struct RequestContext {
    /// Id of the request being answered.
    id: u64,
    /// Kind of the request.
    kind: String,
    /// Reply destination.
    sink: Option<ReplySink>,
    replied: Arc<AtomicBool>,
}

impl RequestContext {
    /// Create a new request context (for testing without a reply sink).
    pub fn new(id: u64, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            sink: None,
            replied: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_sink(id: u64, kind: impl Into<String>, sink: ReplySink) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new(id, kind)
        }
    }

    /// Get the request id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the request kind.
    #[inline]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Check whether a reply has been sent.
    #[inline]
    pub fn has_replied(&self) -> bool {
        self.replied.load(Ordering::Acquire)
    }

    /// Send a response with the given payload.
    pub async fn respond<T: Serialize>(&self, payload: &T) -> Result<()> {
        let value = JsonCodec::to_value(payload)?;
        self.respond_value(value).await
    }

    /// Send a response with a ready JSON payload.
    pub async fn respond_value(&self, payload: Value) -> Result<()> {
        self.send(Message::response(self.id, payload)).await
    }

    /// Send an error reply.
    pub async fn error(&self, message: &str) -> Result<()> {
        self.send(Message::error(self.id, message)).await
    }

    async fn send(&self, message: Message) -> Result<()> {
        if self.replied.swap(true, Ordering::AcqRel) {
            return Err(LintwireError::Protocol(format!(
                "request {} was already answered",
                self.id
            )));
        }
        match &self.sink {
            Some(sink) => sink.send(message).await,
            // No sink configured (testing mode)
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_accessors() {
        let ctx = RequestContext::new(42, "lint");
        assert_eq!(ctx.id(), 42);
        assert_eq!(ctx.kind(), "lint");
        assert!(!ctx.has_replied());
    }

    #[tokio::test]
    async fn test_respond_without_sink() {
        let ctx = RequestContext::new(1, "lint");
        ctx.respond(&json!({ "ok": true })).await.unwrap();
        assert!(ctx.has_replied());
    }

    #[tokio::test]
    async fn test_second_reply_rejected() {
        let ctx = RequestContext::new(1, "lint");
        let clone = ctx.clone();

        ctx.respond_value(Value::Null).await.unwrap();
        let err = clone.error("too late").await.unwrap_err();
        assert!(err.to_string().contains("already answered"));
    }

    #[tokio::test]
    async fn test_reply_goes_to_stream_sink() {
        let (tx, mut rx) = mpsc::channel(4);
        let ctx = RequestContext::with_sink(7, "applyFixes", ReplySink::Stream(tx));

        ctx.error("no fixes").await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.id, 7);
        assert!(reply.is_error());
        assert_eq!(reply.error_message(), "no fixes");
    }
}
