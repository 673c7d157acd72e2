//! Protocol module - envelopes and stream reassembly.
//!
//! This module implements the two wire formats:
//! - Format A: `u32` LE length prefix + JSON message (lint engine)
//! - Format B: msgpack tag-length envelope (transpile sidecar)
//! - Frame buffer for accumulating partial reads of either format

mod frame_buffer;
mod tagged;
mod wire_format;

pub use frame_buffer::{FrameBuffer, FrameHeader, Framing, LengthPrefixed, TagLength};
pub use tagged::{
    decode_tagged, encode_tagged, message_type, TaggedMessage, ARRAY3_MARKER, TAGGED_HEADER_SIZE,
    U8_MARKER,
};
pub use wire_format::{
    decode_body, decode_message, encode_message, kind, read_length_prefix, Message,
    DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE, PROTOCOL_VERSION,
};
