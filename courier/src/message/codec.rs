//! Payload serialization.
//!
//! Payloads are opaque bytes to the router. The dispatcher and the message
//! factory encode [`Request`](super::Request), [`Reply`](super::Reply) and
//! [`OneWayRequest`](super::OneWayRequest) through a [`MessageCodec`].

use crate::error::CodecError;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Pluggable payload serialization format.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a serializable value to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable value.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<String, _> = JsonCodec.decode(b"not json");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
