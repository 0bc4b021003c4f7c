use serde_json::Value;

use super::EventNormalizer;
use crate::message::{CanonicalMessage, ContentBlock, MessageBody};

/// Normalizer for Claude Code `stream-json` output
///
/// The native shape already matches the canonical one, so this is a 1:1
/// mapping that drops block kinds the pipeline has no use for.
#[derive(Debug, Default)]
pub struct ClaudeNormalizer;

impl ClaudeNormalizer {
    pub fn new() -> Self {
        Self
    }
}

fn blocks(message: &Value) -> Vec<ContentBlock> {
    let Some(items) = message.get("content").and_then(|c| c.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item.get("type").and_then(|t| t.as_str()) {
            Some("text") => item
                .get("text")
                .and_then(|t| t.as_str())
                .map(|text| ContentBlock::Text {
                    text: text.to_string(),
                }),
            Some("thinking") => item
                .get("thinking")
                .and_then(|t| t.as_str())
                .filter(|t| !t.trim().is_empty())
                .map(|text| ContentBlock::Text {
                    text: text.to_string(),
                }),
            Some("tool_use") | Some("tool_result") => serde_json::from_value(item.clone()).ok(),
            _ => None,
        })
        .collect()
}

fn body(raw: &Value) -> Option<MessageBody> {
    let message = raw.get("message")?;
    let content = blocks(message);
    if content.is_empty() {
        return None;
    }
    let id = message
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    Some(MessageBody { id, content })
}

impl EventNormalizer for ClaudeNormalizer {
    fn normalize(&mut self, raw: &Value) -> Vec<CanonicalMessage> {
        match raw.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "assistant" => body(raw)
                .map(|message| vec![CanonicalMessage::Assistant { message }])
                .unwrap_or_default(),
            "user" => body(raw)
                .map(|message| vec![CanonicalMessage::User { message }])
                .unwrap_or_default(),
            "result" => {
                let is_error = raw.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false)
                    || raw
                        .get("subtype")
                        .and_then(|v| v.as_str())
                        .is_some_and(|s| s.starts_with("error"));
                let result = raw.get("result").and_then(|v| v.as_str()).map(str::to_string);
                if is_error {
                    let subtype = raw.get("subtype").and_then(|v| v.as_str()).unwrap_or("error");
                    vec![CanonicalMessage::error(
                        result.unwrap_or_else(|| format!("Agent run ended with {}", subtype)),
                    )]
                } else {
                    vec![CanonicalMessage::Result {
                        result,
                        usage: raw.get("usage").cloned(),
                    }]
                }
            }
            "error" => {
                let message = raw
                    .get("error")
                    .and_then(|e| e.get("message").or(Some(e)))
                    .and_then(|m| m.as_str())
                    .or_else(|| raw.get("message").and_then(|m| m.as_str()))
                    .unwrap_or("Unknown agent error");
                vec![CanonicalMessage::error(message)]
            }
            // system/init and stream deltas carry nothing the pipeline relays
            _ => Vec::new(),
        }
    }
}
