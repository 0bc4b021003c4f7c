//! Canonical message schema shared by every agent backend

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A content block inside an assistant or user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain assistant text (reasoning included)
    Text { text: String },

    /// Agent invoked a tool
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },

    /// A tool returned a value
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
}

/// Body of an assistant or user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default = "generated_id")]
    pub id: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

fn generated_id() -> String {
    Uuid::new_v4().to_string()
}

/// The normalized unit flowing from an agent backend into the build pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalMessage {
    /// Assistant output: text or tool-use blocks
    Assistant { message: MessageBody },

    /// Tool results fed back to the agent
    User { message: MessageBody },

    /// Final payload of a run or turn
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<serde_json::Value>,
    },

    /// Backend failure
    Error { error: String },

    /// Session bookkeeping: the thread a multi-turn backend is running on
    System { thread_id: String },
}

impl CanonicalMessage {
    /// Assistant message with a single text block
    pub fn assistant_text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Assistant {
            message: MessageBody {
                id: id.into(),
                content: vec![ContentBlock::Text { text: text.into() }],
            },
        }
    }

    /// Assistant message with a single tool-use block
    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        let id = id.into();
        Self::Assistant {
            message: MessageBody {
                id: id.clone(),
                content: vec![ContentBlock::ToolUse {
                    id,
                    name: name.into(),
                    input,
                }],
            },
        }
    }

    /// User message with a single tool-result block
    pub fn tool_result(tool_use_id: impl Into<String>, content: serde_json::Value, is_error: bool) -> Self {
        Self::User {
            message: MessageBody {
                id: generated_id(),
                content: vec![ContentBlock::ToolResult {
                    tool_use_id: tool_use_id.into(),
                    content,
                    is_error,
                }],
            },
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error { error: error.into() }
    }

    /// Concatenated text of all assistant text blocks
    pub fn assistant_text_content(&self) -> Option<String> {
        match self {
            Self::Assistant { message } => {
                let text: Vec<&str> = message
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                if text.is_empty() {
                    None
                } else {
                    Some(text.join("\n"))
                }
            }
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_use_serialization() {
        let msg = CanonicalMessage::tool_use("call-1", "Bash", serde_json::json!({"command": "ls"}));
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "assistant");
        assert_eq!(json["message"]["content"][0]["type"], "tool_use");
        assert_eq!(json["message"]["content"][0]["id"], "call-1");
    }

    #[test]
    fn test_deserialize_stream_json_user_message() {
        let json = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#;
        let msg: CanonicalMessage = serde_json::from_str(json).unwrap();

        match msg {
            CanonicalMessage::User { message } => {
                assert!(!message.id.is_empty());
                assert_eq!(
                    message.content[0],
                    ContentBlock::ToolResult {
                        tool_use_id: "t1".to_string(),
                        content: serde_json::json!("ok"),
                        is_error: false,
                    }
                );
            }
            other => panic!("Expected user message, got {:?}", other),
        }
    }

    #[test]
    fn test_assistant_text_content_skips_tool_blocks() {
        let msg = CanonicalMessage::Assistant {
            message: MessageBody {
                id: "m1".to_string(),
                content: vec![
                    ContentBlock::Text { text: "one".to_string() },
                    ContentBlock::ToolUse {
                        id: "t".to_string(),
                        name: "Read".to_string(),
                        input: serde_json::Value::Null,
                    },
                    ContentBlock::Text { text: "two".to_string() },
                ],
            },
        };

        assert_eq!(msg.assistant_text_content().as_deref(), Some("one\ntwo"));
        assert_eq!(CanonicalMessage::error("x").assistant_text_content(), None);
    }
}
