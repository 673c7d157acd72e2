//! Handler module - engine-side request handling and dispatch.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps message kinds to handlers
//! - [`RequestContext`] - lets a handler answer its request
//!
//! # Example
//!
//! ```ignore
//! use lintwire::handler::{HandlerRegistry, RequestContext};
//! use serde_json::Value;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register("lint", |req: LintRequest, ctx| async move {
//!     ctx.respond(&lint(req)).await
//! });
//!
//! registry.set_fallback(|payload: Value, ctx| async move {
//!     ctx.respond(&payload).await
//! });
//! ```

mod context;
mod registry;

pub(crate) use context::ReplySink;
pub use context::RequestContext;
pub use registry::{Handler, HandlerRegistry, HandlerResult, TypedHandler};
