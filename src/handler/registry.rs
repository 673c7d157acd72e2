//! Handler registry for dispatching requests by kind.
//!
//! The registry maps message kinds to handlers. A fallback handler, if set,
//! receives every kind without a dedicated handler.
//!
//! # Example
//!
//! ```ignore
//! use lintwire::handler::{HandlerRegistry, RequestContext};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register("lint", |req: LintRequest, ctx| async move {
//!     ctx.respond(&lint(req)).await
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::RequestContext;
use crate::codec::JsonCodec;
use crate::error::{LintwireError, Result};
use crate::transport::BoxFuture;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request with its raw JSON payload.
    fn call(&self, payload: Value, ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that deserializes the payload before calling the handler.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, payload: Value, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match JsonCodec::from_value(payload) {
            Ok(v) => v,
            Err(e) => {
                let err = LintwireError::Engine {
                    message: format!("invalid payload for {}: {}", ctx.kind(), e),
                };
                return Box::pin(async move { Err(err) });
            }
        };
        Box::pin((self.handler)(parsed, ctx))
    }
}

/// Registry mapping message kinds to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    /// Handlers by kind.
    handlers: HashMap<String, Box<dyn Handler>>,
    /// Handler for kinds without a dedicated entry.
    fallback: Option<Box<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `kind`, replacing any previous one.
    pub fn register<F, T, Fut>(&mut self, kind: &str, handler: F)
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers
            .insert(kind.to_string(), Box::new(TypedHandler::new(handler)));
    }

    /// Register the handler for kinds without a dedicated entry.
    pub fn set_fallback<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.fallback = Some(Box::new(TypedHandler::new(handler)));
    }

    /// Get the dedicated handler for `kind`.
    pub fn get(&self, kind: &str) -> Option<&dyn Handler> {
        self.handlers.get(kind).map(|h| h.as_ref())
    }

    /// Get the fallback handler.
    pub fn fallback(&self) -> Option<&dyn Handler> {
        self.fallback.as_deref()
    }

    /// Check whether `kind` has a dedicated handler.
    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}
