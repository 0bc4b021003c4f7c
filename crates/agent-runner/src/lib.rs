//! Agent Runner - agent backends and build stream relay
//!
//! This crate drives AI coding-agent CLIs, normalizes their native output
//! into one canonical message schema and relays it as SSE-style frames.

mod error;
mod message;
mod process;

pub mod adapter;
pub mod parser;
pub mod pipeline;

pub use adapter::{AgentBackend, AgentRequest, CanonicalStream, MultiTurnAdapter, StreamingAdapter};
pub use error::{AgentError, Result};
pub use message::{CanonicalMessage, ContentBlock, MessageBody};
pub use pipeline::{run_build, BuildOutcome, Chunk, FrameSink, RelayReport, DONE_FRAME};
pub use process::{AgentKind, CliInvocation, CliProcess, ExitSummary};
