use serde_json::{json, Value};
use uuid::Uuid;

use super::EventNormalizer;
use crate::message::CanonicalMessage;

const TYPE_FIELDS: &[&str] = &["type", "item_type", "itemType", "kind"];
const ID_FIELDS: &[&str] = &["id", "item_id", "itemId", "call_id", "callId"];

/// Logical kind of a Codex thread item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Text,
    Command,
    FileChange,
    Tool,
    Other,
}

impl ItemKind {
    fn resolve(item: &Value) -> Self {
        let raw = TYPE_FIELDS
            .iter()
            .find_map(|field| item.get(*field).and_then(|v| v.as_str()))
            .unwrap_or("");

        match raw {
            "agent_message" | "assistant_message" | "message" | "reasoning" | "text" => Self::Text,
            "command_execution" | "command" | "local_shell_call" => Self::Command,
            "file_change" | "fileChange" | "file-change" | "patch" => Self::FileChange,
            "mcp_tool_call" | "tool_call" | "function_call" | "web_search" => Self::Tool,
            _ => Self::Other,
        }
    }

    fn is_tool(&self) -> bool {
        matches!(self, Self::Command | Self::FileChange | Self::Tool)
    }
}

fn item_id(item: &Value) -> String {
    ID_FIELDS
        .iter()
        .find_map(|field| item.get(*field).and_then(|v| v.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn tool_name(kind: ItemKind, item: &Value) -> String {
    match kind {
        ItemKind::Command => "Bash".to_string(),
        ItemKind::FileChange => "Edit".to_string(),
        _ => item
            .get("tool")
            .or_else(|| item.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or("tool")
            .to_string(),
    }
}

fn tool_input(kind: ItemKind, item: &Value) -> Value {
    match kind {
        ItemKind::Command => json!({ "command": item.get("command").cloned().unwrap_or(Value::Null) }),
        ItemKind::FileChange => json!({ "changes": item.get("changes").cloned().unwrap_or(Value::Null) }),
        _ => item
            .get("arguments")
            .or_else(|| item.get("input"))
            .or_else(|| item.get("query"))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

fn tool_output(item: &Value) -> Value {
    ["aggregated_output", "output", "result", "changes"]
        .iter()
        .find_map(|field| item.get(*field))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Nonzero exit code or a failed status marks a tool result as an error
fn tool_failed(item: &Value) -> bool {
    let exit_code = item
        .get("exit_code")
        .or_else(|| item.get("exitCode"))
        .and_then(|v| v.as_i64());
    if let Some(code) = exit_code {
        if code != 0 {
            return true;
        }
    }
    matches!(
        item.get("status").and_then(|v| v.as_str()),
        Some("failed") | Some("error")
    )
}

fn item_text(item: &Value) -> Option<&str> {
    item.get("text")
        .or_else(|| item.get("content"))
        .and_then(|v| v.as_str())
}

/// Normalizer for `codex exec --json` thread events
#[derive(Debug, Default)]
pub struct CodexNormalizer {
    thread_id: Option<String>,
}

impl CodexNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread id announced by the backend, if seen
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }
}

impl EventNormalizer for CodexNormalizer {
    fn normalize(&mut self, raw: &Value) -> Vec<CanonicalMessage> {
        let event_type = raw.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let item = raw.get("item").unwrap_or(&Value::Null);

        match event_type {
            "thread.started" => {
                self.thread_id = raw
                    .get("thread_id")
                    .or_else(|| raw.get("threadId"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                Vec::new()
            }
            "item.started" => {
                let kind = ItemKind::resolve(item);
                if !kind.is_tool() {
                    return Vec::new();
                }
                vec![CanonicalMessage::tool_use(
                    item_id(item),
                    tool_name(kind, item),
                    tool_input(kind, item),
                )]
            }
            "item.completed" => {
                let kind = ItemKind::resolve(item);
                match kind {
                    ItemKind::Text => match item_text(item).map(str::trim) {
                        Some(text) if !text.is_empty() => {
                            vec![CanonicalMessage::assistant_text(item_id(item), text)]
                        }
                        _ => Vec::new(),
                    },
                    ItemKind::Other => Vec::new(),
                    _ => vec![CanonicalMessage::tool_result(
                        item_id(item),
                        tool_output(item),
                        tool_failed(item),
                    )],
                }
            }
            "turn.completed" => vec![CanonicalMessage::Result {
                result: None,
                usage: raw.get("usage").cloned(),
            }],
            "turn.failed" => {
                let message = raw
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("Turn failed");
                vec![CanonicalMessage::error(message)]
            }
            "error" => {
                let message = raw
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("Unknown agent error");
                vec![CanonicalMessage::error(message)]
            }
            _ => Vec::new(),
        }
    }
}
