//! Engine-side service builder and request loop.
//!
//! The [`ServiceBuilder`] registers handlers by message kind and builds a
//! [`Service`]. The service reads requests from a format A byte stream or a
//! [`WorkerEndpoint`], runs handlers concurrently and writes one reply per
//! request:
//!
//! - `handshake` is answered with `{version, ok: true}`
//! - `exit` is answered with `null`, then the loop stops
//! - kinds without a handler (and no fallback) get
//!   `unknown message kind: <kind>`
//!
//! # Example
//!
//! ```ignore
//! use lintwire::ServiceBuilder;
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> lintwire::error::Result<()> {
//!     ServiceBuilder::new()
//!         .handle("lint", |payload: Value, ctx| async move {
//!             ctx.respond(&json!({ "diagnostics": [] })).await
//!         })
//!         .build()
//!         .serve_stdio()
//!         .await
//! }
//! ```

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, warn};

use crate::error::{LintwireError, Result};
use crate::handler::{HandlerRegistry, HandlerResult, ReplySink, RequestContext};
use crate::protocol::{
    encode_message, kind, FrameBuffer, LengthPrefixed, Message, PROTOCOL_VERSION,
};
use crate::transport::{spawn_reader, spawn_writer, Inbound, TransportConfig, WorkerEndpoint};

/// Default maximum concurrent handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Builder for configuring and creating an engine-side service.
pub struct ServiceBuilder {
    registry: HandlerRegistry,
    config: TransportConfig,
    max_concurrent_handlers: usize,
}

impl ServiceBuilder {
    /// Create a new service builder.
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            config: TransportConfig::default(),
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
        }
    }

    /// Register a handler for `kind`.
    ///
    /// The handler receives the deserialized payload and a context for
    /// replying.
    pub fn handle<F, T, Fut>(mut self, kind: &str, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.register(kind, handler);
        self
    }

    /// Register the handler for kinds without a dedicated handler.
    pub fn fallback<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.set_fallback(handler);
        self
    }

    /// Set the maximum number of concurrent handlers.
    ///
    /// When this limit is reached, reading waits for a handler to finish.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.max_concurrent_handlers = limit.max(1);
        self
    }

    /// Replace the stream configuration.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Service {
        Service {
            registry: Arc::new(self.registry),
            semaphore: Arc::new(Semaphore::new(self.max_concurrent_handlers)),
            config: self.config,
        }
    }
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the loop keeps reading after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// A configured engine-side service.
pub struct Service {
    registry: Arc<HandlerRegistry>,
    semaphore: Arc<Semaphore>,
    config: TransportConfig,
}

impl Service {
    /// Create a new service builder.
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    /// Serve format A requests over the process's stdin/stdout.
    pub async fn serve_stdio(&self) -> Result<()> {
        self.serve_stream(tokio::io::stdin(), tokio::io::stdout())
            .await
    }

    /// Serve format A requests read from `reader`, replying on `writer`.
    ///
    /// Returns `Ok` after `exit` or a clean end of input, once every reply
    /// has been written.
    pub async fn serve_stream<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = self.config.channel_capacity.max(1);
        let (events, mut requests) = mpsc::channel(capacity);
        let (replies, replies_rx) = mpsc::channel(capacity);

        let writer_task = spawn_writer(replies_rx, writer, encode_message, events.clone());
        let reader_task = spawn_reader(
            reader,
            FrameBuffer::new(LengthPrefixed::new(self.config.max_frame_size)),
            self.config.read_buffer_size,
            events,
        );

        let sink = ReplySink::Stream(replies);
        let mut outcome = Ok(());
        while let Some(event) = requests.recv().await {
            match event {
                Inbound::Message(request) => {
                    if self.dispatch(request, &sink).await == Flow::Exit {
                        break;
                    }
                }
                Inbound::Closed => break,
                Inbound::Failed(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        // The writer drains once every in-flight handler has dropped its sink.
        drop(sink);
        reader_task.abort();
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if outcome.is_ok() => outcome = Err(e),
            Ok(Err(_)) => {}
            Err(e) => warn!("reply writer task failed: {}", e),
        }
        outcome
    }

    /// Serve requests from an in-process worker endpoint.
    pub async fn serve_channel(&self, mut endpoint: WorkerEndpoint) -> Result<()> {
        let sink = ReplySink::Channel(endpoint.replies());
        while let Some(request) = endpoint.recv().await {
            if self.dispatch(request, &sink).await == Flow::Exit {
                break;
            }
        }
        Ok(())
    }

    /// Route one request.
    async fn dispatch(&self, request: Message, sink: &ReplySink) -> Flow {
        let Message {
            id,
            kind: request_kind,
            payload,
        } = request;
        debug!(id, kind = %request_kind, "request received");
        let ctx = RequestContext::with_sink(id, request_kind.as_str(), sink.clone());

        if request_kind == kind::EXIT {
            // Answer before stopping so the host sees the exit acknowledged.
            if let Err(e) = ctx.respond_value(Value::Null).await {
                warn!("failed to acknowledge exit: {}", e);
            }
            return Flow::Exit;
        }

        // A dedicated handler wins; the fallback never sees handshakes.
        let use_fallback = !self.registry.contains(&request_kind)
            && request_kind != kind::HANDSHAKE
            && self.registry.fallback().is_some();
        if !self.registry.contains(&request_kind) && !use_fallback {
            let reply = if request_kind == kind::HANDSHAKE {
                ctx.respond_value(json!({ "version": PROTOCOL_VERSION, "ok": true }))
                    .await
            } else {
                ctx.error(&format!("unknown message kind: {}", request_kind))
                    .await
            };
            if let Err(e) = reply {
                warn!(id, "failed to reply: {}", e);
            }
            return Flow::Continue;
        }

        // Wait for a free slot rather than drop the request.
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                error!("handler semaphore closed");
                let _ = ctx.error("engine is shutting down").await;
                return Flow::Continue;
            }
        };

        let registry = self.registry.clone();
        tokio::spawn(async move {
            // Permit is held until this task completes
            let _permit = permit;

            let handler = if use_fallback {
                registry.fallback()
            } else {
                registry.get(ctx.kind())
            };
            let Some(handler) = handler else {
                return;
            };
            let outcome = handler.call(payload, ctx.clone()).await;

            if ctx.has_replied() {
                if let Err(e) = outcome {
                    warn!(id = ctx.id(), kind = ctx.kind(), "handler failed after replying: {}", e);
                }
                return;
            }
            let reply = match outcome {
                Ok(()) => ctx.respond_value(Value::Null).await,
                Err(LintwireError::Engine { message }) => ctx.error(&message).await,
                Err(e) => ctx.error(&e.to_string()).await,
            };
            if let Err(e) = reply {
                warn!(id = ctx.id(), "failed to reply: {}", e);
            }
        });

        Flow::Continue
    }
}
