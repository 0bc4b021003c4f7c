//! Build pipeline: canonical messages -> transport chunks -> wire frames

use std::path::Path;

use futures::StreamExt;
use tracing::{info, warn};

use crate::adapter::CanonicalStream;

pub mod chunk;
pub mod frames;
pub mod relay;
pub mod run_command;

pub use chunk::{Chunk, ChunkDecoder};
pub use frames::{encode_frame, to_wire_events, DONE_FRAME};
pub use relay::{BuildRelay, FrameSink, RelayReport};
pub use run_command::detect_run_command;

/// Result of a relayed build
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub report: RelayReport,
    /// Detected only for successful builds
    pub run_command: Option<String>,
}

/// Relay an adapter's output and, on success, detect the run command
pub async fn run_build(
    label: &str,
    messages: CanonicalStream,
    working_dir: &Path,
    sink: &dyn FrameSink,
) -> BuildOutcome {
    let report = BuildRelay::new(label)
        .relay(messages.map(Chunk::from), sink)
        .await;

    let run_command = if report.succeeded() {
        match detect_run_command(working_dir).await {
            Ok(Some(command)) => {
                info!(command_id = label, "Detected run command: {}", command);
                Some(command)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(command_id = label, "Run command detection failed: {}", e);
                None
            }
        }
    } else {
        None
    };

    BuildOutcome { report, run_command }
}
