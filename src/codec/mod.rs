//! Codec module - serialization of typed payloads.
//!
//! - [`JsonCodec`] - serde_json for request/response payloads
//!
//! Codecs are marker structs with static methods rather than trait objects,
//! so callers pick the codec at compile time.

mod json;

pub use json::JsonCodec;
