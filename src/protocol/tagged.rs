//! Tag-length envelope (format B) used by the transpile sidecar.
//!
//! ```text
//! ┌──────┬──────┬──────────┬────────────────────┬────────────────────┐
//! │ 0x93 │ 0xCC │ msg type │ bin(method name)   │ bin(payload)       │
//! │      │      │ 1 byte   │ tag + len + bytes  │ tag + len + bytes  │
//! └──────┴──────┴──────────┴────────────────────┴────────────────────┘
//! ```
//!
//! The framing is a msgpack 3-array `[u8, bin, bin]`. Each `bin` picks its
//! width by size: bin8 below 256 bytes, bin16 below 65536, bin32 otherwise.
//! Lengths are big endian. Marker bytes are written with `rmp` and checked
//! positionally on decode; an unexpected marker is a protocol violation.

use bytes::Bytes;
use rmp::Marker;

use crate::error::{LintwireError, Result};

/// Array-arity marker: fixarray of 3.
pub const ARRAY3_MARKER: u8 = 0x93;

/// Integer-type marker: uint8.
pub const U8_MARKER: u8 = 0xCC;

/// Fixed header: array marker, u8 marker, message type.
pub const TAGGED_HEADER_SIZE: usize = 3;

/// Sidecar message types.
pub mod message_type {
    /// Host → sidecar request.
    pub const REQUEST: u8 = 1;
    /// Sidecar → host success reply.
    pub const RESPONSE: u8 = 4;
    /// Sidecar → host error reply, payload is the error text.
    pub const ERROR: u8 = 5;
}

/// A decoded sidecar message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMessage {
    /// Message type (see [`message_type`]).
    pub message_type: u8,
    /// Method name, e.g. `"transpile"`.
    pub method: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl TaggedMessage {
    /// Create a new message.
    pub fn new(message_type: u8, method: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            method: method.into(),
            payload: payload.into(),
        }
    }

    /// Create a request message.
    pub fn request(method: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(message_type::REQUEST, method, payload)
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.message_type == message_type::RESPONSE
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.message_type == message_type::ERROR
    }
}

/// Width of the length field that follows a bin marker.
fn bin_width(marker: Marker) -> Option<usize> {
    match marker {
        Marker::Bin8 => Some(1),
        Marker::Bin16 => Some(2),
        Marker::Bin32 => Some(4),
        _ => None,
    }
}

fn write_bin(buf: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| LintwireError::FrameTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;
    rmp::encode::write_bin_len(buf, len)
        .map_err(|e| LintwireError::Protocol(format!("bin length: {}", e)))?;
    buf.extend_from_slice(data);
    Ok(())
}

/// Encode a message to a complete frame.
///
/// # Example
///
/// ```
/// use lintwire::protocol::{encode_tagged, TaggedMessage};
///
/// let bytes = encode_tagged(&TaggedMessage::request("transpile", &b"{}"[..])).unwrap();
/// assert_eq!(&bytes[..3], &[0x93, 0xCC, 0x01]);
/// ```
pub fn encode_tagged(message: &TaggedMessage) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(
        TAGGED_HEADER_SIZE + 10 + message.method.len() + message.payload.len(),
    );
    rmp::encode::write_array_len(&mut buf, 3)
        .map_err(|e| LintwireError::Protocol(format!("array header: {}", e)))?;
    rmp::encode::write_u8(&mut buf, message.message_type)
        .map_err(|e| LintwireError::Protocol(format!("message type: {}", e)))?;
    write_bin(&mut buf, message.method.as_bytes())?;
    write_bin(&mut buf, &message.payload)?;
    Ok(buf)
}

/// Location of one bin field inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BinField {
    start: usize,
    len: usize,
}

impl BinField {
    fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Read a bin tag + length at `pos`. `Ok(None)` if the header bytes are not
/// all there yet.
fn read_bin_header(buf: &[u8], pos: usize, max: usize) -> Result<Option<BinField>> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    let width = bin_width(Marker::from_u8(tag)).ok_or_else(|| {
        LintwireError::Protocol(format!("invalid bin tag 0x{:02X} at offset {}", tag, pos))
    })?;
    let Some(len_bytes) = buf.get(pos + 1..pos + 1 + width) else {
        return Ok(None);
    };
    let len = len_bytes
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);
    if len > max {
        return Err(LintwireError::FrameTooLarge { size: len, max });
    }
    Ok(Some(BinField {
        start: pos + 1 + width,
        len,
    }))
}

/// Layout of a frame whose header (everything before the payload bytes) is
/// fully buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaggedLayout {
    pub message_type: u8,
    method: BinField,
    payload: BinField,
}

impl TaggedLayout {
    /// Bytes before the payload body.
    pub fn header_len(&self) -> usize {
        self.payload.start
    }

    /// Payload length.
    pub fn body_len(&self) -> usize {
        self.payload.len
    }

    pub fn method_range(&self) -> std::ops::Range<usize> {
        self.method.start..self.method.end()
    }
}

/// Walk the positional header of a frame.
///
/// Returns `Ok(None)` while bytes are missing; returns an error as soon as
/// any present marker byte is wrong.
pub(crate) fn parse_tagged_layout(buf: &[u8], max: usize) -> Result<Option<TaggedLayout>> {
    if let Some(&b) = buf.first() {
        if b != ARRAY3_MARKER {
            return Err(LintwireError::Protocol(format!(
                "invalid message header 0x{:02X}",
                b
            )));
        }
    }
    if let Some(&b) = buf.get(1) {
        if b != U8_MARKER {
            return Err(LintwireError::Protocol(format!(
                "invalid message type tag 0x{:02X}",
                b
            )));
        }
    }
    let Some(&message_type) = buf.get(2) else {
        return Ok(None);
    };

    let Some(method) = read_bin_header(buf, TAGGED_HEADER_SIZE, max)? else {
        return Ok(None);
    };
    if buf.len() < method.end() {
        return Ok(None);
    }
    let Some(payload) = read_bin_header(buf, method.end(), max)? else {
        return Ok(None);
    };

    Ok(Some(TaggedLayout {
        message_type,
        method,
        payload,
    }))
}

/// Build a message from a buffered header and its payload body.
pub(crate) fn assemble_tagged(
    layout: &TaggedLayout,
    header: &[u8],
    payload: Bytes,
) -> Result<TaggedMessage> {
    let method = std::str::from_utf8(&header[layout.method_range()])
        .map_err(|e| LintwireError::Protocol(format!("method name is not UTF-8: {}", e)))?;
    Ok(TaggedMessage {
        message_type: layout.message_type,
        method: method.to_string(),
        payload,
    })
}

/// Decode one frame starting at `offset`.
///
/// Returns `Ok(None)` if incomplete, `Err` on any marker mismatch.
pub fn decode_tagged(buf: &[u8], offset: usize) -> Result<Option<(TaggedMessage, usize)>> {
    let buf = buf.get(offset..).unwrap_or_default();
    let Some(layout) = parse_tagged_layout(buf, u32::MAX as usize)? else {
        return Ok(None);
    };
    let total = layout.header_len() + layout.body_len();
    if buf.len() < total {
        return Ok(None);
    }
    let payload = Bytes::copy_from_slice(&buf[layout.header_len()..total]);
    let message = assemble_tagged(&layout, buf, payload)?;
    Ok(Some((message, total)))
}
