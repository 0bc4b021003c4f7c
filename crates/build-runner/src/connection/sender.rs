//! Outbound event handle shared by every handler

use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::protocol::Event;

/// Sends events over the currently open session
///
/// When no session is open the event is logged and dropped.
#[derive(Clone, Default)]
pub struct EventSender {
    inner: Arc<RwLock<Option<mpsc::UnboundedSender<Event>>>>,
}

impl EventSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route events into `tx` until detached
    pub async fn attach(&self, tx: mpsc::UnboundedSender<Event>) {
        *self.inner.write().await = Some(tx);
    }

    pub async fn detach(&self) {
        *self.inner.write().await = None;
    }

    #[cfg(test)]
    pub async fn is_open(&self) -> bool {
        self.inner
            .read()
            .await
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Returns whether the event was queued on an open session
    pub async fn send(&self, event: Event) -> bool {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(tx) => match tx.send(event) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Session closed, dropping {} event", e.0.type_name());
                    false
                }
            },
            None => {
                debug!("No open session, dropping {} event", event.type_name());
                false
            }
        }
    }

    /// Sender wired to a plain channel, for handler tests
    #[cfg(test)]
    pub async fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = Self::new();
        sender.attach(tx).await;
        (sender, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventKind;

    fn heartbeat() -> Event {
        Event::new(EventKind::RunnerHeartbeat {
            runner_id: "r".to_string(),
        })
    }

    #[tokio::test]
    async fn test_drops_when_not_open() {
        let sender = EventSender::new();
        assert!(!sender.is_open().await);
        assert!(!sender.send(heartbeat()).await);

        let (tx, rx) = mpsc::unbounded_channel();
        sender.attach(tx).await;
        drop(rx);
        assert!(!sender.is_open().await);
        assert!(!sender.send(heartbeat()).await);
    }

    #[tokio::test]
    async fn test_delivers_when_attached() {
        let (sender, mut rx) = EventSender::channel().await;
        assert!(sender.send(heartbeat()).await);
        assert_eq!(rx.recv().await.unwrap().type_name(), "runner-heartbeat");

        sender.detach().await;
        assert!(!sender.send(heartbeat()).await);
    }
}
