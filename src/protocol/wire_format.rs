//! Length-prefixed envelope (format A).
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────┐
//! │ Length L     │ Body                                 │
//! │ 4 bytes      │ L bytes                              │
//! │ uint32 LE    │ JSON {"id":…, "kind":…, "data":…}    │
//! └──────────────┴──────────────────────────────────────┘
//! ```
//!
//! Used between the host and the lint engine over subprocess pipes and the
//! sandbox bridge. The channel transport moves [`Message`] values directly
//! and never touches these bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LintwireError, Result};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum frame body size (256 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Protocol version exchanged in the handshake.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Well-known message kinds.
pub mod kind {
    /// Initial connection check.
    pub const HANDSHAKE: &str = "handshake";
    /// Lint request.
    pub const LINT: &str = "lint";
    /// Apply fixes to a file's content.
    pub const APPLY_FIXES: &str = "applyFixes";
    /// Successful reply.
    pub const RESPONSE: &str = "response";
    /// Error reply, payload is `{"message": …}`.
    pub const ERROR: &str = "error";
    /// Ask the engine to stop.
    pub const EXIT: &str = "exit";
    /// Sandbox bridge setup (bridge transport only).
    pub const INIT: &str = "init";

    pub const CHECKER_GET_NODE_TYPE: &str = "checker.getNodeType";
    pub const CHECKER_GET_NODE_SYMBOL: &str = "checker.getNodeSymbol";
    pub const CHECKER_GET_NODE_SIGNATURE: &str = "checker.getNodeSignature";
    pub const CHECKER_GET_NODE_FLOW_NODE: &str = "checker.getNodeFlowNode";
    pub const CHECKER_GET_NODE_INFO: &str = "checker.getNodeInfo";
}

/// One protocol message.
///
/// The payload travels under the `data` key. `payload` is accepted as an
/// alias on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Request identifier, echoed back by the reply.
    pub id: u64,
    /// Message kind (see [`kind`]).
    pub kind: String,
    /// Opaque payload.
    #[serde(
        rename = "data",
        alias = "payload",
        default,
        skip_serializing_if = "Value::is_null"
    )]
    pub payload: Value,
}

impl Message {
    /// Create a new message.
    pub fn new(id: u64, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            kind: kind.into(),
            payload,
        }
    }

    /// Successful reply to request `id`.
    pub fn response(id: u64, payload: Value) -> Self {
        Self::new(id, kind::RESPONSE, payload)
    }

    /// Error reply to request `id`.
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self::new(
            id,
            kind::ERROR,
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Check if this is an error reply.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.kind == kind::ERROR
    }

    /// The engine's error text, `"Unknown error"` if the payload has none.
    pub fn error_message(&self) -> String {
        self.payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string()
    }
}

/// Encode a message to a complete frame (prefix + JSON body).
///
/// # Example
///
/// ```
/// use lintwire::protocol::{encode_message, Message};
/// use serde_json::json;
///
/// let bytes = encode_message(&Message::new(1, "lint", json!({"file": "a.ts"}))).unwrap();
/// let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
/// assert_eq!(len, bytes.len() - 4);
/// ```
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len()).map_err(|_| LintwireError::FrameTooLarge {
        size: body.len(),
        max: u32::MAX as usize,
    })?;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Read the body length at `buf[0..4]`. `None` if fewer than 4 bytes.
#[inline]
pub fn read_length_prefix(buf: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = buf.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(prefix) as usize)
}

/// Decode the JSON body of a frame (without its length prefix).
pub fn decode_body(body: &[u8]) -> Result<Message> {
    serde_json::from_slice(body)
        .map_err(|e| LintwireError::Protocol(format!("invalid message body: {}", e)))
}

/// Decode one frame starting at `offset`.
///
/// Returns:
/// - `Ok(Some((message, consumed)))` when a complete frame is present
/// - `Ok(None)` when more bytes are needed
/// - `Err(...)` when the body is not a valid message
pub fn decode_message(buf: &[u8], offset: usize) -> Result<Option<(Message, usize)>> {
    let buf = buf.get(offset..).unwrap_or_default();
    let Some(len) = read_length_prefix(buf) else {
        return Ok(None);
    };
    let total = LENGTH_PREFIX_SIZE + len;
    if buf.len() < total {
        return Ok(None);
    }
    let message = decode_body(&buf[LENGTH_PREFIX_SIZE..total])?;
    Ok(Some((message, total)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = Message::new(7, kind::LINT, json!({"files": ["a.ts", "b.ts"]}));
        let encoded = encode_message(&original).unwrap();
        let (decoded, consumed) = decode_message(&encoded, 0).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_length_prefix_is_little_endian() {
        let encoded = encode_message(&Message::new(1, "x", Value::Null)).unwrap();
        let body_len = encoded.len() - LENGTH_PREFIX_SIZE;
        assert_eq!(encoded[0] as usize, body_len & 0xFF);
        assert_eq!(encoded[1] as usize, (body_len >> 8) & 0xFF);
        assert_eq!(encoded[3], 0);
    }

    #[test]
    fn test_payload_travels_as_data() {
        let encoded = encode_message(&Message::new(3, "lint", json!({"a": 1}))).unwrap();
        let body: Value = serde_json::from_slice(&encoded[4..]).unwrap();
        assert_eq!(body["data"], json!({"a": 1}));
        assert_eq!(body["id"], 3);
        assert_eq!(body["kind"], "lint");
    }

    #[test]
    fn test_null_payload_is_omitted_and_restored() {
        let original = Message::new(2, kind::EXIT, Value::Null);
        let encoded = encode_message(&original).unwrap();
        let body: Value = serde_json::from_slice(&encoded[4..]).unwrap();
        assert!(body.get("data").is_none());
        let (decoded, _) = decode_message(&encoded, 0).unwrap().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_payload_alias_accepted() {
        let decoded = decode_body(br#"{"id":9,"kind":"response","payload":{"echo":1}}"#).unwrap();
        assert_eq!(decoded.payload, json!({"echo": 1}));
    }

    #[test]
    fn test_decode_incomplete_prefix() {
        assert!(decode_message(&[5, 0, 0], 0).unwrap().is_none());
        assert!(decode_message(&[], 0).unwrap().is_none());
    }

    #[test]
    fn test_decode_incomplete_body() {
        let encoded = encode_message(&Message::new(1, "lint", json!("abc"))).unwrap();
        assert!(decode_message(&encoded[..encoded.len() - 1], 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_decode_at_offset() {
        let first = encode_message(&Message::new(1, "a", Value::Null)).unwrap();
        let second = encode_message(&Message::new(2, "b", Value::Null)).unwrap();
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let (msg, consumed) = decode_message(&stream, first.len()).unwrap().unwrap();
        assert_eq!(msg.id, 2);
        assert_eq!(consumed, second.len());
        assert!(decode_message(&stream, stream.len() + 10).unwrap().is_none());
    }

    #[test]
    fn test_decode_malformed_body() {
        let mut frame = 3u32.to_le_bytes().to_vec();
        frame.extend_from_slice(b"{{{");
        let err = decode_message(&frame, 0).unwrap_err();
        assert!(err.to_string().contains("invalid message body"));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(Message::error(4, "boom").error_message(), "boom");
        assert_eq!(
            Message::new(4, kind::ERROR, json!({"code": 1})).error_message(),
            "Unknown error"
        );
        assert!(Message::error(4, "boom").is_error());
    }
}
