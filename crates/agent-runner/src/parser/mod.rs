//! Normalizers from backend-native events to [`CanonicalMessage`]

use crate::message::CanonicalMessage;

pub mod claude;
pub mod codex;

/// Trait for normalizing a backend's raw event stream
pub trait EventNormalizer: Send {
    /// Normalize one raw event into zero or more canonical messages
    fn normalize(&mut self, raw: &serde_json::Value) -> Vec<CanonicalMessage>;

    /// Normalize one line of JSONL output
    ///
    /// Lines that are not JSON objects yield nothing.
    fn normalize_line(&mut self, line: &str) -> Vec<CanonicalMessage> {
        let trimmed = line.trim();
        if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
            return Vec::new();
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(raw) => self.normalize(&raw),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_json_line_is_ignored() {
        let mut normalizer = claude::ClaudeNormalizer::new();
        assert!(normalizer.normalize_line("warming up...").is_empty());
        assert!(normalizer.normalize_line("{not json}").is_empty());
    }
}
