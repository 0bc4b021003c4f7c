//! Agent message -> SSE-style wire frames

use serde_json::{json, Value};

use crate::message::{CanonicalMessage, ContentBlock};

/// Terminal sentinel frame
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Encode one wire event as an SSE frame
pub fn encode_frame(event: &Value) -> String {
    format!("data: {}\n\n", event)
}

fn block_event(message_id: &str, block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({
            "type": "text-delta",
            "id": message_id,
            "delta": text,
        }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool-input-available",
            "toolCallId": id,
            "toolName": name,
            "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => json!({
            "type": "tool-output-available",
            "toolCallId": tool_use_id,
            "output": content,
            "isError": is_error,
        }),
    }
}

/// Translate a parsed agent message into zero or more wire events
pub fn to_wire_events(message: &Value) -> Vec<Value> {
    if let Some(raw) = message.get("raw") {
        let text = raw.as_str().map(str::to_string).unwrap_or_else(|| raw.to_string());
        return vec![json!({ "type": "raw", "text": text })];
    }

    let canonical = match serde_json::from_value::<CanonicalMessage>(message.clone()) {
        Ok(canonical) => canonical,
        Err(_) => return vec![json!({ "type": "raw", "text": message.to_string() })],
    };

    match canonical {
        CanonicalMessage::Assistant { message } => message
            .content
            .iter()
            .map(|block| block_event(&message.id, block))
            .collect(),
        CanonicalMessage::User { message } => message
            .content
            .iter()
            .filter(|block| matches!(block, ContentBlock::ToolResult { .. }))
            .map(|block| block_event(&message.id, block))
            .collect(),
        CanonicalMessage::Result { result, usage } => {
            let mut event = json!({ "type": "finish" });
            if let Some(result) = result {
                event["result"] = Value::String(result);
            }
            if let Some(usage) = usage {
                event["usage"] = usage;
            }
            vec![event]
        }
        CanonicalMessage::Error { error } => vec![json!({ "type": "error", "errorText": error })],
        CanonicalMessage::System { thread_id } => vec![json!({ "type": "data-thread", "threadId": thread_id })],
    }
}
