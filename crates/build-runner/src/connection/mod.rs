//! Broker session: connect, heartbeat, liveness, reconnect

use async_trait::async_trait;

use crate::protocol::{Command, Event};

mod backoff;
mod manager;
mod sender;

pub use backoff::{Backoff, LivenessMonitor};
pub use manager::{ConnectionManager, ConnectionSettings};
pub use sender::EventSender;

/// Receives every decoded command from the session
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Must emit the command's `ack` before returning
    async fn handle(&self, command: Command);

    /// Status snapshot sent on every successful connect
    async fn status(&self) -> Event;
}
