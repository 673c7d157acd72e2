//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `AwaitingHeader`: need the complete envelope header
//! - `AwaitingBody`: header consumed, need N more body bytes
//!
//! The envelope is pluggable through [`Framing`]; [`LengthPrefixed`] reads
//! format A and [`TagLength`] reads format B.
//!
//! # Example
//!
//! ```
//! use lintwire::protocol::{encode_message, FrameBuffer, Message};
//! use serde_json::json;
//!
//! let bytes = encode_message(&Message::new(1, "lint", json!({"file": "a.ts"}))).unwrap();
//! let mut buffer = FrameBuffer::length_prefixed();
//!
//! // Data arrives in arbitrary chunks
//! assert!(buffer.push(&bytes[..3]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[3..]).unwrap();
//! assert_eq!(frames[0].id, 1);
//! ```

use bytes::{Bytes, BytesMut};

use super::tagged::{assemble_tagged, parse_tagged_layout, TaggedMessage};
use super::wire_format::{
    decode_body, read_length_prefix, Message, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE,
};
use crate::error::{LintwireError, Result};

/// Header of a frame, as far as the reassembler needs to know it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Bytes that precede the body.
    pub header_len: usize,
    /// Body length announced by the header.
    pub body_len: usize,
}

/// An envelope format the reassembler can split a byte stream on.
pub trait Framing {
    /// Decoded frame type.
    type Frame;

    /// Parse the header at the start of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed. An error means the stream is
    /// corrupt and cannot be resynchronized.
    fn parse_header(&self, buf: &[u8]) -> Result<Option<FrameHeader>>;

    /// Decode one frame from its header bytes and body bytes.
    fn decode(&self, header: &[u8], body: Bytes) -> Result<Self::Frame>;
}

/// Format A: `u32` LE length + JSON body.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixed {
    max_frame_size: usize,
}

impl LengthPrefixed {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for LengthPrefixed {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Framing for LengthPrefixed {
    type Frame = Message;

    fn parse_header(&self, buf: &[u8]) -> Result<Option<FrameHeader>> {
        let Some(body_len) = read_length_prefix(buf) else {
            return Ok(None);
        };
        // Checked before any body buffer is reserved.
        if body_len > self.max_frame_size {
            return Err(LintwireError::FrameTooLarge {
                size: body_len,
                max: self.max_frame_size,
            });
        }
        Ok(Some(FrameHeader {
            header_len: LENGTH_PREFIX_SIZE,
            body_len,
        }))
    }

    fn decode(&self, _header: &[u8], body: Bytes) -> Result<Message> {
        decode_body(&body)
    }
}

/// Format B: `0x93 0xCC <type>` + bin(method) + bin(payload).
#[derive(Debug, Clone, Copy)]
pub struct TagLength {
    max_frame_size: usize,
}

impl TagLength {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for TagLength {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Framing for TagLength {
    type Frame = TaggedMessage;

    fn parse_header(&self, buf: &[u8]) -> Result<Option<FrameHeader>> {
        Ok(
            parse_tagged_layout(buf, self.max_frame_size)?.map(|layout| FrameHeader {
                header_len: layout.header_len(),
                body_len: layout.body_len(),
            }),
        )
    }

    fn decode(&self, header: &[u8], body: Bytes) -> Result<TaggedMessage> {
        let layout = parse_tagged_layout(header, self.max_frame_size)?.ok_or_else(|| {
            LintwireError::Protocol("frame header vanished between phases".to_string())
        })?;
        assemble_tagged(&layout, header, body)
    }
}

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete header.
    AwaitingHeader,
    /// Header parsed and consumed, waiting for body bytes.
    AwaitingBody { header: Bytes, body_len: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Uses a state machine to handle partial reads efficiently.
/// All data is stored in a single `BytesMut` buffer to minimize allocations.
pub struct FrameBuffer<F: Framing = LengthPrefixed> {
    /// Accumulated bytes from stream reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Envelope format.
    framing: F,
}

impl FrameBuffer<LengthPrefixed> {
    /// Frame buffer for format A with the default size limit.
    pub fn length_prefixed() -> Self {
        Self::new(LengthPrefixed::default())
    }
}

impl FrameBuffer<TagLength> {
    /// Frame buffer for format B with the default size limit.
    pub fn tag_length() -> Self {
        Self::new(TagLength::default())
    }
}

impl<F: Framing> FrameBuffer<F> {
    /// Create a new frame buffer for the given envelope.
    ///
    /// Default capacity: 64KB.
    pub fn new(framing: F) -> Self {
        Self::with_capacity(64 * 1024, framing)
    }

    /// Create a new frame buffer with custom initial capacity.
    pub fn with_capacity(capacity: usize, framing: F) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::AwaitingHeader,
            framing,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns a vector of complete frames in arrival order. If data is
    /// fragmented, partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns error on a malformed header or an undecodable body. The buffer
    /// is not usable afterwards.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<F::Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if protocol violation
    fn try_extract_one(&mut self) -> Result<Option<F::Frame>> {
        loop {
            match &self.state {
                State::AwaitingHeader => {
                    let Some(header) = self.framing.parse_header(&self.buffer)? else {
                        return Ok(None);
                    };
                    let header_bytes = self.buffer.split_to(header.header_len).freeze();
                    self.state = State::AwaitingBody {
                        header: header_bytes,
                        body_len: header.body_len,
                    };
                }

                State::AwaitingBody { header, body_len } => {
                    let body_len = *body_len;
                    if self.buffer.len() < body_len {
                        // Reserve what the rest of the body needs once, not per chunk.
                        self.buffer.reserve(body_len - self.buffer.len());
                        return Ok(None);
                    }
                    let header = header.clone();
                    let body = self.buffer.split_to(body_len).freeze();
                    self.state = State::AwaitingHeader;
                    return self.framing.decode(&header, body).map(Some);
                }
            }
        }
    }

    /// Signal end of stream.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a partial frame is still buffered.
    pub fn finish(&mut self) -> Result<()> {
        let pending = match &self.state {
            State::AwaitingHeader => self.buffer.len(),
            State::AwaitingBody { header, .. } => header.len() + self.buffer.len(),
        };
        if pending > 0 {
            self.clear();
            return Err(LintwireError::Protocol(format!(
                "stream ended with {} bytes of an incomplete frame",
                pending
            )));
        }
        Ok(())
    }

    /// Get the number of buffered bytes not yet consumed by a header.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if nothing is buffered and no frame is in progress.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, State::AwaitingHeader)
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::AwaitingHeader;
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::AwaitingHeader => "AwaitingHeader",
            State::AwaitingBody { .. } => "AwaitingBody",
        }
    }
}

impl Default for FrameBuffer<LengthPrefixed> {
    fn default() -> Self {
        Self::length_prefixed()
    }
}
