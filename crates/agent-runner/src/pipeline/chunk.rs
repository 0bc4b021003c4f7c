//! Transport chunk normalization
//!
//! Chunks reach the relay as decoded objects, JSON text or raw bytes. They
//! are folded into one decoder here so the rest of the pipeline only ever
//! sees `serde_json::Value` objects.

use bytes::Bytes;
use serde_json::{json, Value};

use crate::message::CanonicalMessage;

/// One unit read from an agent transport stream
#[derive(Debug, Clone)]
pub enum Chunk {
    Json(Value),
    Text(String),
    Bytes(Bytes),
}

impl From<Value> for Chunk {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<String> for Chunk {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Chunk {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Bytes> for Chunk {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<CanonicalMessage> for Chunk {
    fn from(message: CanonicalMessage) -> Self {
        match serde_json::to_value(&message) {
            Ok(value) => Self::Json(value),
            Err(e) => Self::Json(json!({ "raw": format!("unserializable message: {}", e) })),
        }
    }
}

/// Parse text as a JSON object, wrapping anything else as `{raw: text}`
pub fn parse_or_raw(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = trimmed.strip_prefix("data:").map(str::trim).unwrap_or(trimmed);
    match serde_json::from_str::<Value>(candidate) {
        Ok(value) if value.is_object() => Some(value),
        _ => Some(json!({ "raw": text })),
    }
}

/// Streaming decoder that holds back incomplete UTF-8 sequences
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one chunk; `None` when nothing complete is available yet
    pub fn decode(&mut self, chunk: Chunk) -> Option<Value> {
        match chunk {
            Chunk::Json(Value::String(text)) | Chunk::Text(text) => parse_or_raw(&text),
            Chunk::Json(value) if value.is_object() => Some(value),
            Chunk::Json(value) => Some(json!({ "raw": value.to_string() })),
            Chunk::Bytes(bytes) => {
                self.pending.extend_from_slice(&bytes);
                let text = self.take_complete();
                text.and_then(|text| parse_or_raw(&text))
            }
        }
    }

    /// Flush whatever is still buffered
    pub fn flush(&mut self) -> Option<Value> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).to_string();
        self.pending.clear();
        parse_or_raw(&text)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn take_complete(&mut self) -> Option<String> {
        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Truncated multi-byte sequence at the end: keep it for the next chunk
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // Genuinely invalid bytes: decode lossily rather than stall
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).to_string();
                self.pending.clear();
                return Some(text);
            }
        };
        if valid_up_to == 0 {
            return None;
        }
        let rest = self.pending.split_off(valid_up_to);
        let complete = std::mem::replace(&mut self.pending, rest);
        String::from_utf8(complete).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_text_and_object_chunks() {
        let mut decoder = ChunkDecoder::new();
        let from_text = decoder.decode(Chunk::from(r#"{"type":"error","error":"x"}"#)).unwrap();
        assert_eq!(from_text["type"], "error");

        let from_object = decoder.decode(Chunk::from(json!({"type": "result"}))).unwrap();
        assert_eq!(from_object["type"], "result");
    }

    #[test]
    fn test_invalid_json_is_wrapped_as_raw() {
        let mut decoder = ChunkDecoder::new();
        let value = decoder.decode(Chunk::from("compiling... {oops")).unwrap();
        assert_eq!(value, json!({"raw": "compiling... {oops"}));

        let scalar = decoder.decode(Chunk::from(json!(42))).unwrap();
        assert_eq!(scalar, json!({"raw": "42"}));
    }

    #[test]
    fn test_sse_prefixed_text_is_parsed() {
        let mut decoder = ChunkDecoder::new();
        let value = decoder.decode(Chunk::from("data: {\"type\":\"result\"}\n\n")).unwrap();
        assert_eq!(value["type"], "result");
    }

    #[test]
    fn test_split_multibyte_sequence_waits_for_next_chunk() {
        let mut decoder = ChunkDecoder::new();
        let text = "{\"raw\":\"héllo\"}".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;

        assert!(decoder.decode(Chunk::from(text[..split].to_vec())).is_some());
        assert!(decoder.has_pending());
        let rest = decoder.decode(Chunk::from(text[split..].to_vec())).unwrap();
        assert!(rest["raw"].as_str().unwrap().starts_with('é'));
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_flush_emits_buffered_bytes() {
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.decode(Chunk::from(vec![0xE2, 0x82])).is_none());
        let flushed = decoder.flush().unwrap();
        assert!(flushed.get("raw").is_some());
        assert!(decoder.flush().is_none());
    }
}
