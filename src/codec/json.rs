//! JSON codec for typed payloads.
//!
//! Format A carries payloads as JSON values inside the message; format B
//! carries them as JSON text inside a bin field. Both go through here.
//!
//! # Example
//!
//! ```
//! use lintwire::codec::JsonCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! #[serde(rename_all = "camelCase")]
//! struct LintRequest {
//!     file_name: String,
//! }
//!
//! let req = LintRequest { file_name: "a.ts".to_string() };
//! let value = JsonCodec::to_value(&req).unwrap();
//! assert_eq!(value["fileName"], "a.ts");
//! let back: LintRequest = JsonCodec::from_value(value).unwrap();
//! assert_eq!(back, req);
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// JSON codec for structured payloads.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    /// Decode JSON bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Convert a typed value to a message payload.
    #[inline]
    pub fn to_value<T: Serialize>(value: &T) -> Result<Value> {
        Ok(serde_json::to_value(value)?)
    }

    /// Convert a message payload to a typed value.
    #[inline]
    pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LintwireError;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Diagnostic {
        rule_name: String,
        line: u32,
    }

    #[test]
    fn test_bytes_roundtrip() {
        let diag = Diagnostic {
            rule_name: "no-unused-vars".into(),
            line: 3,
        };
        let encoded = JsonCodec::encode(&diag).unwrap();
        assert!(std::str::from_utf8(&encoded).unwrap().contains("ruleName"));
        let decoded: Diagnostic = JsonCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, diag);
    }

    #[test]
    fn test_decode_wrong_shape() {
        let result: Result<Diagnostic> = JsonCodec::from_value(json!({"line": "x"}));
        assert!(matches!(result, Err(LintwireError::Json(_))));
    }

    #[test]
    fn test_decode_garbage() {
        let result: Result<Value> = JsonCodec::decode(b"\xff\xfe");
        assert!(result.is_err());
    }
}
