//! Build stream relay: transport chunks -> wire frames

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::chunk::{Chunk, ChunkDecoder};
use super::frames::{encode_frame, to_wire_events, DONE_FRAME};

/// Destination for encoded frames
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: String);
}

/// What the relay observed while forwarding a build stream
#[derive(Debug, Clone, Default)]
pub struct RelayReport {
    /// Frames forwarded, terminal sentinel excluded
    pub frames: usize,
    pub tool_uses: usize,
    /// First backend error, if any
    pub failure: Option<String>,
    /// Final result text or the last assistant text
    pub summary: Option<String>,
    pub thread_id: Option<String>,
}

impl RelayReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    fn observe(&mut self, label: &str, message: &Value) {
        match message.get("type").and_then(|t| t.as_str()) {
            Some("assistant") => {
                let blocks = message
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_array())
                    .cloned()
                    .unwrap_or_default();
                for block in blocks {
                    match block.get("type").and_then(|t| t.as_str()) {
                        Some("tool_use") => {
                            self.tool_uses += 1;
                            info!(
                                command_id = label,
                                tool = block.get("name").and_then(|n| n.as_str()).unwrap_or("unknown"),
                                "Agent tool use"
                            );
                        }
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                self.summary = Some(text.to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }
            Some("result") => {
                if let Some(result) = message.get("result").and_then(|r| r.as_str()) {
                    self.summary = Some(result.to_string());
                }
            }
            Some("error") => {
                let error = message
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("Unknown agent error")
                    .to_string();
                warn!(command_id = label, "Agent reported error: {}", error);
                if self.failure.is_none() {
                    self.failure = Some(error);
                }
            }
            Some("system") => {
                self.thread_id = message
                    .get("thread_id")
                    .and_then(|t| t.as_str())
                    .map(str::to_string);
            }
            _ => {}
        }
    }
}

/// Reads a transport stream chunk by chunk and forwards wire frames
pub struct BuildRelay {
    label: String,
    decoder: ChunkDecoder,
    first_chunk_logged: bool,
    report: RelayReport,
}

impl BuildRelay {
    /// `label` identifies the build in logs (the command id)
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            decoder: ChunkDecoder::new(),
            first_chunk_logged: false,
            report: RelayReport::default(),
        }
    }

    async fn forward(&mut self, message: Value, sink: &dyn FrameSink) {
        self.report.observe(&self.label, &message);
        for event in to_wire_events(&message) {
            sink.send_frame(encode_frame(&event)).await;
            self.report.frames += 1;
        }
    }

    /// Relay every chunk, flush the decoder, then send the terminal sentinel
    pub async fn relay<S>(mut self, chunks: S, sink: &dyn FrameSink) -> RelayReport
    where
        S: Stream<Item = Chunk> + Send,
    {
        let mut chunks = std::pin::pin!(chunks);

        while let Some(chunk) = chunks.next().await {
            if !self.first_chunk_logged {
                self.first_chunk_logged = true;
                info!(command_id = %self.label, "First build chunk received");
            }
            if let Some(message) = self.decoder.decode(chunk) {
                self.forward(message, sink).await;
            }
        }

        if let Some(message) = self.decoder.flush() {
            debug!(command_id = %self.label, "Flushing buffered build stream bytes");
            self.forward(message, sink).await;
        }
        sink.send_frame(DONE_FRAME.to_string()).await;

        info!(
            command_id = %self.label,
            frames = self.report.frames,
            tool_uses = self.report.tool_uses,
            failed = !self.report.succeeded(),
            "Build stream finished"
        );
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CanonicalMessage;
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        frames: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FrameSink for CollectingSink {
        async fn send_frame(&self, frame: String) {
            self.frames.lock().await.push(frame);
        }
    }

    #[tokio::test]
    async fn test_relays_mixed_chunks_and_terminates() {
        let chunks = vec![
            Chunk::from(CanonicalMessage::assistant_text("m1", "Setting up")),
            Chunk::from("not json at all"),
            Chunk::from(serde_json::to_string(&CanonicalMessage::tool_use("t1", "Bash", json!({}))).unwrap()),
            Chunk::from(vec![0xF0, 0x9F]),
        ];
        let sink = CollectingSink::default();

        let report = BuildRelay::new("cmd-1")
            .relay(futures::stream::iter(chunks), &sink)
            .await;

        let frames = sink.frames.lock().await.clone();
        assert_eq!(frames.len(), 5);
        assert!(frames[0].contains("\"text-delta\""));
        assert!(frames[1].contains("\"raw\"") && frames[1].contains("not json at all"));
        assert!(frames[2].contains("\"toolCallId\":\"t1\""));
        assert!(frames[3].contains("\"raw\""));
        assert_eq!(frames[4], DONE_FRAME);

        assert_eq!(report.frames, 4);
        assert_eq!(report.tool_uses, 1);
        assert!(report.succeeded());
        assert_eq!(report.summary.as_deref(), Some("Setting up"));
    }

    #[tokio::test]
    async fn test_error_message_marks_failure() {
        let chunks = vec![
            Chunk::from(CanonicalMessage::System {
                thread_id: "th_7".to_string(),
            }),
            Chunk::from(CanonicalMessage::error("rate limited")),
            Chunk::from(CanonicalMessage::error("second")),
        ];
        let sink = CollectingSink::default();

        let report = BuildRelay::new("cmd-2")
            .relay(futures::stream::iter(chunks), &sink)
            .await;

        assert_eq!(report.failure.as_deref(), Some("rate limited"));
        assert_eq!(report.thread_id.as_deref(), Some("th_7"));
    }

    #[tokio::test]
    async fn test_empty_stream_still_sends_sentinel() {
        let sink = CollectingSink::default();
        let report = BuildRelay::new("cmd-3")
            .relay(futures::stream::iter(Vec::<Chunk>::new()), &sink)
            .await;

        assert_eq!(*sink.frames.lock().await, vec![DONE_FRAME.to_string()]);
        assert_eq!(report.frames, 0);
    }
}
