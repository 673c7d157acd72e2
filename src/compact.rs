//! Compact source buffer decoder.
//!
//! The engine hands back compiler data as a fixed-layout buffer instead of a
//! serialized tree:
//!
//! ```text
//! ┌───────────────────────────── header (16 bytes) ─────────────────────────────┐
//! │ string offsets: u32 LE │ string data: u32 LE │ extended: u32 LE │ nodes: u32 LE │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! string offsets: [u32; count + 1], string i = data[offsets[i]..offsets[i + 1]]
//! nodes:          24-byte entries (kind, pos, end, next, parent, data), to the end
//! ```
//!
//! Node 1 is the source file. The low 24 bits of its `data` field point into
//! the extended region, where a `u32` names the string holding the file text.
//!
//! Every offset is checked against the buffer length before slicing.

use std::collections::HashMap;
use std::ops::Range;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::Value;

use crate::error::{LintwireError, Result};

/// Size of the buffer header.
pub const HEADER_SIZE: usize = 16;

/// Size of one node entry.
pub const NODE_SIZE: usize = 24;

/// Index of the source file node.
pub const SOURCE_FILE_NODE: usize = 1;

/// Mask for the extended-data offset in a node's `data` field.
pub const DATA_MASK: u32 = 0x00FF_FFFF;

/// Key of the encoded files in a lint response.
pub const ENCODED_SOURCE_FILES_KEY: &str = "encodedSourceFiles";

/// One node table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecord {
    pub kind: u32,
    pub pos: u32,
    pub end: u32,
    pub next: u32,
    pub parent: u32,
    pub data: u32,
}

impl NodeRecord {
    /// Offset into the extended region carried by `data`.
    #[inline]
    pub fn extended_offset(&self) -> u32 {
        self.data & DATA_MASK
    }
}

/// Read the source text out of a compact source buffer.
///
/// # Errors
///
/// [`LintwireError::OutOfBounds`] if any offset on the way points outside
/// the buffer, [`LintwireError::InvalidUtf8`] if the text is not UTF-8.
pub fn decode_source_text(buf: &[u8]) -> Result<&str> {
    CompactSourceFile::new(buf)?.source_text()
}

/// Borrowed view of a compact source buffer.
#[derive(Debug, Clone, Copy)]
pub struct CompactSourceFile<'a> {
    buf: &'a [u8],
    string_offsets: usize,
    string_data: usize,
    extended: usize,
    nodes: usize,
}

impl<'a> CompactSourceFile<'a> {
    /// Read the header. Region offsets are checked lazily, per access.
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        Ok(Self {
            string_offsets: read_u32(buf, 0)? as usize,
            string_data: read_u32(buf, 4)? as usize,
            extended: read_u32(buf, 8)? as usize,
            nodes: read_u32(buf, 12)? as usize,
            buf,
        })
    }

    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }

    /// Number of complete node entries.
    pub fn node_count(&self) -> usize {
        self.buf.len().saturating_sub(self.nodes) / NODE_SIZE
    }

    /// Node `index`.
    pub fn node(&self, index: usize) -> Result<NodeRecord> {
        let start = index
            .checked_mul(NODE_SIZE)
            .and_then(|n| n.checked_add(self.nodes))
            .ok_or_else(|| self.overflow(self.nodes))?;
        let entry = slice(self.buf, start, NODE_SIZE)?;
        let field = |i: usize| u32::from_le_bytes([
            entry[i * 4],
            entry[i * 4 + 1],
            entry[i * 4 + 2],
            entry[i * 4 + 3],
        ]);
        Ok(NodeRecord {
            kind: field(0),
            pos: field(1),
            end: field(2),
            next: field(3),
            parent: field(4),
            data: field(5),
        })
    }

    /// Number of strings in the string table.
    pub fn string_count(&self) -> usize {
        let entries = self.string_data.saturating_sub(self.string_offsets) / 4;
        entries.saturating_sub(1)
    }

    /// String `index` of the string table.
    pub fn string(&self, index: usize) -> Result<&'a str> {
        let range = self.string_range(index)?;
        Ok(std::str::from_utf8(&self.buf[range])?)
    }

    /// Text of the source file node.
    pub fn source_text(&self) -> Result<&'a str> {
        let node = self.node(SOURCE_FILE_NODE)?;
        let at = self
            .extended
            .checked_add(node.extended_offset() as usize)
            .ok_or_else(|| self.overflow(self.extended))?;
        let index = read_u32(self.buf, at)? as usize;
        self.string(index)
    }

    fn string_range(&self, index: usize) -> Result<Range<usize>> {
        // Offset words must come from the offsets region, nowhere else.
        if index >= self.string_count() {
            return Err(LintwireError::OutOfBounds {
                offset: self.string_offsets.saturating_add(index.saturating_mul(4)),
                end: self.string_data,
                len: self.buf.len(),
            });
        }
        let at = index
            .checked_mul(4)
            .and_then(|n| n.checked_add(self.string_offsets))
            .ok_or_else(|| self.overflow(self.string_offsets))?;
        let start = read_u32(self.buf, at)? as usize;
        let end = read_u32(self.buf, at + 4)? as usize;
        if end < start {
            return Err(LintwireError::OutOfBounds {
                offset: start,
                end,
                len: self.buf.len(),
            });
        }

        let abs_start = self
            .string_data
            .checked_add(start)
            .ok_or_else(|| self.overflow(self.string_data))?;
        let abs_end = self
            .string_data
            .checked_add(end)
            .ok_or_else(|| self.overflow(self.string_data))?;
        slice(self.buf, abs_start, abs_end - abs_start)?;
        Ok(abs_start..abs_end)
    }

    fn overflow(&self, offset: usize) -> LintwireError {
        LintwireError::OutOfBounds {
            offset,
            end: usize::MAX,
            len: self.buf.len(),
        }
    }
}

fn slice(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    let end = offset
        .checked_add(len)
        .ok_or(LintwireError::OutOfBounds {
            offset,
            end: usize::MAX,
            len: buf.len(),
        })?;
    buf.get(offset..end).ok_or(LintwireError::OutOfBounds {
        offset,
        end,
        len: buf.len(),
    })
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let bytes = slice(buf, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Extract the base64 `encodedSourceFiles` map from a lint response.
///
/// A missing or `null` field yields an empty map.
pub fn encoded_source_files(response: &Value) -> Result<HashMap<String, Bytes>> {
    let files = match response.get(ENCODED_SOURCE_FILES_KEY) {
        None | Some(Value::Null) => return Ok(HashMap::new()),
        Some(Value::Object(files)) => files,
        Some(other) => {
            return Err(LintwireError::Protocol(format!(
                "{} must be an object, got {}",
                ENCODED_SOURCE_FILES_KEY, other
            )))
        }
    };

    let mut decoded = HashMap::with_capacity(files.len());
    for (path, encoded) in files {
        let Some(text) = encoded.as_str() else {
            return Err(LintwireError::Protocol(format!(
                "encoded source file {} is not a string",
                path
            )));
        };
        decoded.insert(path.clone(), Bytes::from(STANDARD.decode(text)?));
    }
    Ok(decoded)
}
