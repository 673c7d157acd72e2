//! Request/response correlation.
//!
//! Every outgoing request gets an id from [`IdAllocator`] and a oneshot
//! completion registered in the [`Correlator`]. Replies carry the same id and
//! resolve exactly that completion; the engine may answer in any order.
//!
//! The correlator is owned by one session task, so it needs no locking. Ids
//! are allocated on the caller side through a shared atomic counter so that
//! a caller knows its id before the request is queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{LintwireError, Result};
use crate::protocol::Message;

/// Completion half handed to the caller.
pub type Completion = oneshot::Receiver<Result<Value>>;

/// Monotonic id source. The first id is 1; ids are never reused.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Take the next id.
    #[inline]
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Map from request id to its pending completion.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<u64, oneshot::Sender<Result<Value>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a completion for `id`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if `id` already has a pending completion.
    pub fn register(&mut self, id: u64) -> Result<Completion> {
        let (tx, rx) = oneshot::channel();
        self.insert(id, tx)?;
        Ok(rx)
    }

    /// Register an existing completion sender for `id`.
    ///
    /// On a duplicate id the sender is rejected immediately and the existing
    /// entry is left alone.
    pub fn insert(&mut self, id: u64, tx: oneshot::Sender<Result<Value>>) -> Result<()> {
        if self.pending.contains_key(&id) {
            let err = LintwireError::Protocol(format!("request id {} is already pending", id));
            let _ = tx.send(Err(err.replicate()));
            return Err(err);
        }
        self.pending.insert(id, tx);
        Ok(())
    }

    /// Drop the completion for `id` without resolving it.
    pub fn cancel(&mut self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Route a reply to its completion.
    ///
    /// An `error` reply rejects with the engine's message; anything else
    /// resolves with the payload. Returns `false` when no completion is
    /// waiting for the id, in which case the reply is dropped.
    pub fn on_message(&mut self, message: Message) -> bool {
        let Some(tx) = self.pending.remove(&message.id) else {
            debug!(id = message.id, kind = %message.kind, "dropping reply with unknown id");
            return false;
        };
        let outcome = if message.is_error() {
            Err(LintwireError::Engine {
                message: message.error_message(),
            })
        } else {
            Ok(message.payload)
        };
        // The caller may have stopped waiting.
        let _ = tx.send(outcome);
        true
    }

    /// Reject every pending completion with `err` and clear the map.
    ///
    /// Returns how many completions were rejected.
    pub fn reject_all(&mut self, err: &LintwireError) -> usize {
        let count = self.pending.len();
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(err.replicate()));
        }
        count
    }

    /// Check whether `id` is pending.
    #[inline]
    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of pending completions.
    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
