//! Transport module - one request/response core over several links.
//!
//! A [`Transport`] is a cheap, cloneable handle to a session task. The
//! session owns the [`Correlator`] and a [`Link`]: a message sink, an event
//! source and a closer. Each variant only supplies its link:
//!
//! - [`SubprocessBuilder`] - engine child process, format A over stdin/stdout
//! - [`channel_pair`] - in-process worker, whole messages, no framing
//! - [`BridgeBuilder`] - sandboxed engine behind a descriptor 0/1/2 shim
//!
//! ```text
//! caller ─► Transport ─┬─► commands ─► session (Correlator) ◄─ link.inbound
//!                      └─► link.outbound ─► engine
//! ```

mod bridge;
mod channel;
mod io;
mod subprocess;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::codec::JsonCodec;
use crate::correlator::{Completion, Correlator, IdAllocator};
use crate::error::{LintwireError, Result};
use crate::protocol::{kind, Message, DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION};

pub use bridge::{
    BridgeBuilder, SandboxIo, SandboxStderr, SandboxStdin, SandboxStdout, VirtualFs,
};
pub use channel::{channel_pair, WorkerEndpoint, WorkerReplies};
pub use subprocess::SubprocessBuilder;

pub(crate) use io::{spawn_reader, spawn_writer};

/// Boxed future used at trait-object seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Default capacity of the outbound and inbound message channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default size of the read buffer used on byte streams.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration shared by all transport variants.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest frame body accepted from the engine.
    pub max_frame_size: usize,
    /// Capacity of the outbound and inbound message channels.
    pub channel_capacity: usize,
    /// Size of a single read from the engine's output stream.
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Event delivered from the engine side of a link.
#[derive(Debug)]
pub enum Inbound<T = Message> {
    /// A complete message from the engine.
    Message(T),
    /// The engine side closed cleanly.
    Closed,
    /// The link failed and cannot be used any more.
    Failed(LintwireError),
}

/// Releases whatever a link holds open (child process, worker task).
pub trait Closer: Send {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Closer for links that own nothing.
pub struct NoopCloser;

impl Closer for NoopCloser {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// The engine-facing half of a transport.
pub struct Link {
    /// Requests going to the engine.
    pub outbound: mpsc::Sender<Message>,
    /// Replies and lifecycle events coming from the engine.
    pub inbound: mpsc::Receiver<Inbound>,
    /// Called once when the session ends.
    pub closer: Box<dyn Closer>,
}

enum Command {
    /// Track a completion for a request about to be sent.
    Register {
        id: u64,
        tx: oneshot::Sender<Result<Value>>,
    },
    /// Reject everything, release the link, then acknowledge.
    Close { done: oneshot::Sender<()> },
}

/// Handle to a running transport session.
///
/// Cloning the handle shares the session. The session closes its link when
/// [`Transport::close`] is called or when the last handle is dropped.
#[derive(Clone)]
pub struct Transport {
    commands: mpsc::UnboundedSender<Command>,
    outbound: mpsc::Sender<Message>,
    ids: Arc<IdAllocator>,
    alive: Arc<AtomicBool>,
}

impl Transport {
    /// Start a session over an already established link.
    pub fn from_link(link: Link) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));

        let session = Session {
            correlator: Correlator::new(),
            closer: Some(link.closer),
            alive: alive.clone(),
        };
        tokio::spawn(session.run(command_rx, link.inbound));

        Self {
            commands,
            outbound: link.outbound,
            ids: Arc::new(IdAllocator::new()),
            alive,
        }
    }

    /// Send a request and return its pending completion.
    ///
    /// Waits only for room on the outbound channel, not for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`LintwireError::Terminated`] if the transport is closed.
    pub async fn send(&self, kind: &str, payload: Value) -> Result<PendingRequest> {
        if !self.is_alive() {
            return Err(LintwireError::terminated("transport is closed"));
        }

        // No await between registering and queueing: a dropped caller
        // leaves neither behind.
        let permit = self
            .outbound
            .reserve()
            .await
            .map_err(|_| LintwireError::terminated("engine link is closed"))?;

        let id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Register { id, tx })
            .map_err(|_| LintwireError::terminated("transport session has ended"))?;
        permit.send(Message::new(id, kind, payload));

        debug!(id, kind, "request sent");
        Ok(PendingRequest { id, rx })
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, kind: &str, payload: Value) -> Result<Value> {
        self.send(kind, payload).await?.await
    }

    /// Send a typed request and decode the typed reply.
    pub async fn request_typed<Req, Resp>(&self, kind: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = JsonCodec::to_value(request)?;
        let reply = self.request(kind, payload).await?;
        JsonCodec::from_value(reply)
    }

    /// Exchange protocol versions with the engine.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the engine does not answer `ok: true`.
    pub async fn handshake(&self) -> Result<Value> {
        let reply = self
            .request(kind::HANDSHAKE, json!({ "version": PROTOCOL_VERSION }))
            .await?;
        if reply.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(LintwireError::Protocol(format!(
                "engine rejected handshake: {}",
                reply
            )));
        }
        Ok(reply)
    }

    /// Ask the engine to stop, then close the transport.
    ///
    /// The engine may exit before replying; that is not an error.
    pub async fn exit(&self) -> Result<()> {
        match self.request(kind::EXIT, Value::Null).await {
            Ok(_) => {}
            Err(e) if e.is_transport_failure() => {
                debug!("engine went away during exit: {}", e);
            }
            Err(e) => return Err(e),
        }
        self.close().await;
        Ok(())
    }

    /// Close the transport.
    ///
    /// Every pending request is rejected with a terminated error and the
    /// link is released. Closing twice is a no-op.
    pub async fn close(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Close { done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Check whether the session can still carry requests.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// A request waiting for its reply.
///
/// Resolves to the reply payload, an engine error, or a terminated error.
/// Dropping it abandons the reply; the engine's answer is then discarded.
#[must_use = "the reply is lost if the pending request is dropped"]
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    rx: Completion,
}

impl PendingRequest {
    /// Id assigned to the request.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingRequest {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(LintwireError::terminated(
                "transport session has ended",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Session task state. Owns the correlator; nothing else touches it.
struct Session {
    correlator: Correlator,
    closer: Option<Box<dyn Closer>>,
    alive: Arc<AtomicBool>,
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::Receiver<Inbound>,
    ) {
        let mut inbound_open = true;

        loop {
            tokio::select! {
                // Commands first: a Register queued before its reply arrived
                // must be seen before that reply.
                biased;

                command = commands.recv() => match command {
                    Some(Command::Register { id, tx }) => {
                        if self.is_alive() {
                            let _ = self.correlator.insert(id, tx);
                        } else {
                            let _ = tx.send(Err(LintwireError::terminated("transport is closed")));
                        }
                    }
                    Some(Command::Close { done }) => {
                        self.shutdown(LintwireError::terminated("transport closed")).await;
                        inbound_open = false;
                        let _ = done.send(());
                    }
                    None => {
                        // Every handle is gone.
                        self.shutdown(LintwireError::terminated("transport dropped")).await;
                        return;
                    }
                },

                event = inbound.recv(), if inbound_open => match event {
                    Some(Inbound::Message(message)) => {
                        self.correlator.on_message(message);
                    }
                    Some(Inbound::Closed) | None => {
                        if !self.correlator.is_empty() {
                            warn!(
                                pending = self.correlator.len(),
                                "engine closed with requests in flight"
                            );
                        }
                        self.shutdown(LintwireError::terminated("engine closed the connection"))
                            .await;
                        inbound_open = false;
                    }
                    Some(Inbound::Failed(e)) => {
                        error!("transport failed: {}", e);
                        self.shutdown(e).await;
                        inbound_open = false;
                    }
                },
            }
        }
    }

    #[inline]
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark dead, reject everything pending, release the link. Idempotent.
    async fn shutdown(&mut self, reason: LintwireError) {
        self.alive.store(false, Ordering::Release);
        let rejected = self.correlator.reject_all(&reason);
        if rejected > 0 {
            debug!(rejected, "rejected pending requests: {}", reason);
        }
        if let Some(closer) = self.closer.take() {
            closer.close().await;
        }
    }
}
