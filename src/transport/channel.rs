//! In-process worker transport.
//!
//! Host and worker exchange whole [`Message`] values over tokio channels.
//! Nothing is framed or encoded.
//!
//! # Example
//!
//! ```
//! use lintwire::transport::channel_pair;
//! use lintwire::TransportConfig;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> lintwire::error::Result<()> {
//! let (transport, mut worker) = channel_pair(TransportConfig::default());
//!
//! tokio::spawn(async move {
//!     while let Some(request) = worker.recv().await {
//!         let _ = worker.reply(request.id, json!({ "seen": request.kind })).await;
//!     }
//! });
//!
//! let reply = transport.request("lint", json!({})).await?;
//! assert_eq!(reply, json!({ "seen": "lint" }));
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{BoxFuture, Closer, Inbound, Link, Transport, TransportConfig};
use crate::error::{LintwireError, Result};
use crate::protocol::Message;

/// Create a transport and the worker endpoint it talks to.
pub fn channel_pair(config: TransportConfig) -> (Transport, WorkerEndpoint) {
    let capacity = config.channel_capacity.max(1);
    let (outbound, requests) = mpsc::channel(capacity);
    let (events, inbound) = mpsc::channel(capacity);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let transport = Transport::from_link(Link {
        outbound,
        inbound,
        closer: Box::new(ChannelCloser {
            shutdown: shutdown_tx,
        }),
    });
    let endpoint = WorkerEndpoint {
        requests,
        shutdown: shutdown_rx,
        closed: false,
        replies: WorkerReplies { events },
    };
    (transport, endpoint)
}

/// Tells the worker endpoint that the host closed the transport.
struct ChannelCloser {
    shutdown: oneshot::Sender<()>,
}

impl Closer for ChannelCloser {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        let _ = self.shutdown.send(());
        Box::pin(async {})
    }
}

/// Worker side of a channel transport.
///
/// Dropping the endpoint (and every [`WorkerReplies`] clone) closes the
/// transport from the worker side.
pub struct WorkerEndpoint {
    requests: mpsc::Receiver<Message>,
    shutdown: oneshot::Receiver<()>,
    closed: bool,
    replies: WorkerReplies,
}

impl WorkerEndpoint {
    /// Receive the next request. `None` once the host has closed.
    pub async fn recv(&mut self) -> Option<Message> {
        if self.closed {
            return None;
        }
        tokio::select! {
            biased;

            _ = &mut self.shutdown => {
                debug!("host closed the channel transport");
                self.closed = true;
                None
            }
            request = self.requests.recv() => {
                if request.is_none() {
                    self.closed = true;
                }
                request
            }
        }
    }

    /// Cloneable sender for replies, for use from handler tasks.
    pub fn replies(&self) -> WorkerReplies {
        self.replies.clone()
    }

    /// Reply to request `id` with a payload.
    pub async fn reply(&self, id: u64, payload: Value) -> Result<()> {
        self.replies.send(Message::response(id, payload)).await
    }

    /// Reply to request `id` with an error.
    pub async fn reply_error(&self, id: u64, message: impl Into<String>) -> Result<()> {
        self.replies.send(Message::error(id, message)).await
    }

    /// Report a worker-level failure; every pending request is rejected.
    pub async fn fail(&self, err: LintwireError) {
        self.replies.fail(err).await;
    }
}

/// Reply half of a [`WorkerEndpoint`].
#[derive(Clone)]
pub struct WorkerReplies {
    events: mpsc::Sender<Inbound>,
}

impl WorkerReplies {
    /// Send a message to the host.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.events
            .send(Inbound::Message(message))
            .await
            .map_err(|_| LintwireError::terminated("host side of the channel is gone"))
    }

    /// Report a worker-level failure; every pending request is rejected.
    pub async fn fail(&self, err: LintwireError) {
        let _ = self.events.send(Inbound::Failed(err)).await;
    }
}
