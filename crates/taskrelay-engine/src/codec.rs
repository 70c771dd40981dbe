//! Payload compression.
//!
//! Payloads are stored zlib-compressed. The reported compression ratio is
//! `compressed_size / original_size`, so smaller is better.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::error::EngineError;

/// A serialized and compressed payload.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub compressed: Vec<u8>,
    pub original_size: usize,
}

/// Serialize `payload`, reject it if larger than `max_bytes`, and compress it.
pub fn encode(payload: &Value, max_bytes: usize) -> Result<EncodedPayload, EngineError> {
    let serialized = serde_json::to_vec(payload)
        .map_err(|e| EngineError::Validation(format!("payload is not serializable: {e}")))?;
    if serialized.len() > max_bytes {
        return Err(EngineError::Validation(format!(
            "payload is {} bytes, maximum is {} bytes",
            serialized.len(),
            max_bytes
        )));
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&serialized)
        .and_then(|_| encoder.finish())
        .map(|compressed| EncodedPayload {
            compressed,
            original_size: serialized.len(),
        })
        .map_err(|e| EngineError::Validation(format!("failed to compress payload: {e}")))
}

/// Decompress and parse a stored payload.
pub fn decode(compressed: &[u8]) -> Result<Value, EngineError> {
    let mut json = Vec::new();
    ZlibDecoder::new(compressed)
        .read_to_end(&mut json)
        .map_err(|e| EngineError::Validation(format!("stored payload is corrupt: {e}")))?;
    serde_json::from_slice(&json)
        .map_err(|e| EngineError::Validation(format!("stored payload is not JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_repetitive_payload_compresses() {
        let payload = json!({ "prompt": "review ".repeat(500) });
        let encoded = encode(&payload, 1024 * 1024).unwrap();
        assert!(encoded.compressed.len() * 10 < encoded.original_size);
        assert_eq!(decode(&encoded.compressed).unwrap(), payload);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = json!({ "blob": "x".repeat(2 * 1024 * 1024) });
        let err = encode(&payload, 1024 * 1024).unwrap_err();
        assert!(matches!(err, EngineError::Validation(msg) if msg.contains("maximum")));
    }

    #[test]
    fn test_corrupt_payload() {
        assert!(decode(b"not zlib").is_err());
    }
}
