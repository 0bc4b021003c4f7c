//! Connection manager for the broker WebSocket session

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use super::backoff::{Backoff, LivenessMonitor};
use super::sender::EventSender;
use super::CommandHandler;
use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::protocol::{Command, Event, EventKind};

type BrokerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// 1.5 x the ping interval
pub const LIVENESS_DEADLINE: Duration = Duration::from_secs(45);

/// Session timing
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub ping_interval: Duration,
    pub liveness_deadline: Duration,
    pub backoff: Backoff,
}

impl ConnectionSettings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            heartbeat_interval: config.heartbeat_interval,
            ping_interval: PING_INTERVAL,
            liveness_deadline: LIVENESS_DEADLINE,
            backoff: Backoff::default(),
        }
    }
}

/// Why a session ended
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    LivenessTimeout,
    Shutdown,
}

pub struct ConnectionManager {
    broker_url: String,
    shared_secret: String,
    runner_id: String,
    settings: ConnectionSettings,
    events: EventSender,
    handler: Arc<dyn CommandHandler>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionManager {
    pub fn new(
        config: &RunnerConfig,
        settings: ConnectionSettings,
        events: EventSender,
        handler: Arc<dyn CommandHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker_url: config.broker_url.clone(),
            shared_secret: config.shared_secret.clone(),
            runner_id: config.runner_id.clone(),
            settings,
            events,
            handler,
            shutdown,
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run sessions until shutdown or until reconnect attempts run out
    pub async fn run(mut self) -> Result<()> {
        loop {
            if self.shutting_down() {
                info!("Shutdown requested, not connecting");
                return Ok(());
            }

            match self.connect().await {
                Ok(stream) => {
                    self.settings.backoff.reset();
                    info!(runner_id = %self.runner_id, "Connected to broker");
                    let end = self.run_session(stream).await;
                    info!("Broker session ended: {:?}", end);
                    if end == SessionEnd::Shutdown {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!("Failed to connect to broker: {}", e);
                }
            }

            if self.shutting_down() {
                return Ok(());
            }

            let Some(delay) = self.settings.backoff.next_delay() else {
                let attempts = self.settings.backoff.attempts();
                error!(attempts, "Reconnect attempts exhausted, giving up");
                return Err(RunnerError::ReconnectExhausted { attempts });
            };
            info!(
                attempt = self.settings.backoff.attempts(),
                "Reconnecting in {}ms",
                delay.as_millis()
            );

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("Shutdown requested during reconnect wait");
                    return Ok(());
                }
            }
        }
    }

    fn request_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.broker_url)
            .map_err(|e| RunnerError::InvalidConfig(format!("broker url {}: {}", self.broker_url, e)))?;
        url.query_pairs_mut().append_pair("runnerId", &self.runner_id);
        Ok(url)
    }

    async fn connect(&self) -> Result<BrokerStream> {
        let url = self.request_url()?;
        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.shared_secret))
            .map_err(|e| RunnerError::InvalidConfig(format!("shared secret: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!("Connecting to {}", self.broker_url);
        let (stream, _) = timeout(self.settings.handshake_timeout, connect_async(request))
            .await
            .map_err(|_| RunnerError::HandshakeTimeout {
                seconds: self.settings.handshake_timeout.as_secs(),
            })??;
        Ok(stream)
    }

    async fn run_session(&self, stream: BrokerStream) -> SessionEnd {
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        self.events.attach(tx).await;
        self.events.send(self.handler.status().await).await;

        let heartbeat_every = self.settings.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ping_every = self.settings.ping_interval;
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Fresh baseline per session
        let mut liveness = LivenessMonitor::new(self.settings.liveness_deadline);
        let mut shutdown = self.shutdown.clone();

        let end = loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("Failed to serialize {} event: {}", event.type_name(), e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(json.into())).await {
                        warn!("Failed to send to broker: {}", e);
                        break SessionEnd::Closed;
                    }
                }

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        liveness.record_response();
                        match serde_json::from_str::<Command>(&text) {
                            Ok(command) => {
                                debug!(
                                    command_id = %command.id,
                                    project_id = %command.project_id,
                                    "Received {}",
                                    command.command_type.as_str()
                                );
                                self.handler.handle(command).await;
                            }
                            Err(e) => warn!("Failed to parse command: {}", e),
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                        liveness.record_response();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("Broker sent close frame: {:?}", frame);
                        break SessionEnd::Closed;
                    }
                    Some(Ok(_)) => {
                        debug!("Ignoring non-text frame from broker");
                    }
                    Some(Err(e)) => {
                        warn!("Broker connection error: {}", e);
                        break SessionEnd::Closed;
                    }
                    None => break SessionEnd::Closed,
                },

                _ = heartbeat.tick() => {
                    self.events
                        .send(Event::new(EventKind::RunnerHeartbeat {
                            runner_id: self.runner_id.clone(),
                        }))
                        .await;
                }

                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                        warn!("Failed to ping broker: {}", e);
                        break SessionEnd::Closed;
                    }
                }

                _ = sleep_until(liveness.deadline_at()) => {
                    warn!(
                        "No broker response for {}s, closing silent session",
                        liveness.silent_for().as_secs()
                    );
                    let _ = write.send(Message::Close(None)).await;
                    break SessionEnd::LivenessTimeout;
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Closing broker session for shutdown");
                        // Drain events queued before the close
                        while let Ok(event) = rx.try_recv() {
                            if let Ok(json) = serde_json::to_string(&event) {
                                let _ = write.send(Message::Text(json.into())).await;
                            }
                        }
                        let _ = write.send(Message::Close(None)).await;
                        break SessionEnd::Shutdown;
                    }
                }
            }
        };

        self.events.detach().await;
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerOptions;
    use async_trait::async_trait;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    struct RecordingHandler {
        events: EventSender,
        commands: Mutex<Vec<Command>>,
    }

    #[async_trait]
    impl CommandHandler for RecordingHandler {
        async fn handle(&self, command: Command) {
            self.events.send(Event::ack(&command)).await;
            self.commands.lock().await.push(command);
        }

        async fn status(&self) -> Event {
            Event::new(EventKind::RunnerStatus {
                runner_id: "test-runner".to_string(),
                status: "ready".to_string(),
                version: "0.0.0".to_string(),
                uptime_seconds: 0,
                active_projects: vec![],
            })
        }
    }

    fn config_for(url: String) -> RunnerConfig {
        let options = RunnerOptions {
            broker_url: Some(url),
            shared_secret: Some("s3cret".to_string()),
            runner_id: Some("test-runner".to_string()),
            ..Default::default()
        };
        RunnerConfig::resolve(options, |_| None).unwrap()
    }

    fn fast_settings(max_attempts: u32) -> ConnectionSettings {
        ConnectionSettings {
            handshake_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(60),
            ping_interval: Duration::from_secs(60),
            liveness_deadline: Duration::from_secs(90),
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(20), max_attempts),
        }
    }

    #[tokio::test]
    async fn test_handshake_sends_auth_status_and_acks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = config_for(format!("ws://{}/ws/runner", addr));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = EventSender::new();
        let handler = Arc::new(RecordingHandler {
            events: events.clone(),
            commands: Mutex::new(Vec::new()),
        });
        let manager = ConnectionManager::new(
            &config,
            fast_settings(3),
            events,
            handler.clone(),
            shutdown_rx,
        );
        let runner = tokio::spawn(manager.run());

        let (tcp, _) = listener.accept().await.unwrap();
        let seen = Arc::new(std::sync::Mutex::new((String::new(), String::new())));
        let seen_in_callback = seen.clone();
        let mut ws = tokio_tungstenite::accept_hdr_async(tcp, move |req: &Request, resp: Response| {
            let auth = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let query = req.uri().query().unwrap_or_default().to_string();
            *seen_in_callback.lock().unwrap() = (auth, query);
            Ok::<Response, ErrorResponse>(resp)
        })
        .await
        .unwrap();

        {
            let (auth, query) = seen.lock().unwrap().clone();
            assert_eq!(auth, "Bearer s3cret");
            assert_eq!(query, "runnerId=test-runner");
        }

        let first = ws.next().await.unwrap().unwrap();
        let status: serde_json::Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert_eq!(status["type"], "runner-status");
        assert_eq!(status["runnerId"], "test-runner");

        let command = r#"{"id":"c1","type":"runner-health-check","projectId":"p1","payload":{}}"#;
        ws.send(Message::Text(command.to_string().into())).await.unwrap();

        let ack = loop {
            let msg = ws.next().await.unwrap().unwrap();
            if let Message::Text(text) = msg {
                break serde_json::from_str::<serde_json::Value>(&text).unwrap();
            }
        };
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["commandId"], "c1");
        assert_eq!(handler.commands.lock().await.len(), 1);

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_silent_broker_is_dropped_and_reconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = config_for(format!("ws://{}/ws/runner", addr));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = EventSender::new();
        let handler = Arc::new(RecordingHandler {
            events: events.clone(),
            commands: Mutex::new(Vec::new()),
        });

        let mut settings = fast_settings(1);
        settings.ping_interval = Duration::from_millis(50);
        settings.liveness_deadline = Duration::from_millis(100);
        let manager = ConnectionManager::new(&config, settings, events, handler, shutdown_rx);
        let runner = tokio::spawn(manager.run());

        // The server never reads, so pings go unanswered. With one retry
        // allowed, a third session only happens if each open resets the backoff.
        let mut silent = Vec::new();
        for session in 0..3 {
            let (tcp, _) = timeout(Duration::from_secs(5), listener.accept())
                .await
                .unwrap_or_else(|_| panic!("no connection for session {}", session))
                .unwrap();
            silent.push(tokio_tungstenite::accept_async(tcp).await.unwrap());
        }

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // Bind then drop to get a port nothing listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let config = config_for(format!("ws://{}/ws/runner", addr));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = EventSender::new();
        let handler = Arc::new(RecordingHandler {
            events: events.clone(),
            commands: Mutex::new(Vec::new()),
        });

        let manager = ConnectionManager::new(&config, fast_settings(2), events, handler, shutdown_rx);
        let result = manager.run().await;
        assert!(matches!(result, Err(RunnerError::ReconnectExhausted { attempts: 2 })));
    }

    #[tokio::test]
    async fn test_shutdown_before_connect_returns_ok() {
        let config = config_for("ws://127.0.0.1:9/ws/runner".to_string());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        let events = EventSender::new();
        let handler = Arc::new(RecordingHandler {
            events: events.clone(),
            commands: Mutex::new(Vec::new()),
        });

        let manager = ConnectionManager::new(&config, fast_settings(2), events, handler, shutdown_rx);
        assert!(manager.run().await.is_ok());
    }
}
