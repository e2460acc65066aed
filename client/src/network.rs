//! WebSocket connection supervision: connect, heartbeat, reconnect, send.
//!
//! The [`Supervisor`] owns the socket and the [`EventBus`]. Applications
//! register handlers on the bus, keep a [`SupervisorHandle`] for outbound
//! traffic, and hand the supervisor to a task running [`Supervisor::run`].
//! Dropped connections are retried with exponential backoff up to a
//! configurable attempt limit; an explicit disconnect exhausts the limit so
//! no reconnect can follow it.

use crate::events::EventBus;
use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{ClientEnvelope, ClientMessage, ServerEnvelope};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub url: String,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// Base delay; attempt n waits `base * 2^(n-1)`.
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            auto_reconnect: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

enum Command {
    Send(ClientMessage),
    Disconnect,
}

/// Cheap handle for sending through a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SupervisorHandle {
    /// Queues a message. Returns false once the supervisor is gone.
    pub fn send(&self, message: ClientMessage) -> bool {
        self.tx.send(Command::Send(message)).is_ok()
    }

    /// Asks the supervisor to close the connection for good.
    pub fn disconnect(&self) -> bool {
        self.tx.send(Command::Disconnect).is_ok()
    }
}

/// Backoff for reconnect attempt `attempt` (1-based).
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

pub struct Supervisor {
    config: SupervisorConfig,
    bus: EventBus,
    status: ConnectionStatus,
    reconnect_attempts: u32,
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: mpsc::UnboundedReceiver<Command>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            config,
            bus: EventBus::new(),
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            command_tx,
            command_rx,
        }
    }

    /// Register handlers here before calling [`Supervisor::run`].
    pub fn bus_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            tx: self.command_tx.clone(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Connects and services the socket until an explicit disconnect or the
    /// reconnect budget runs out. Messages queued on the handle before the
    /// connection is up are delivered once it is.
    pub async fn run(&mut self) {
        loop {
            self.status = ConnectionStatus::Connecting;
            match connect_async(self.config.url.as_str()).await {
                Ok((ws, _)) => {
                    info!("Connected to {}", self.config.url);
                    self.reconnect_attempts = 0;
                    self.status = ConnectionStatus::Connected;
                    if self.drive(ws).await {
                        // Explicit disconnect burns the remaining attempts
                        self.reconnect_attempts = self.config.max_reconnect_attempts;
                        self.status = ConnectionStatus::Disconnected;
                        return;
                    }
                    warn!("Connection to {} lost", self.config.url);
                    self.status = ConnectionStatus::Error;
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", self.config.url, e);
                    self.status = ConnectionStatus::Error;
                }
            }

            if !self.config.auto_reconnect
                || self.reconnect_attempts >= self.config.max_reconnect_attempts
            {
                self.status = ConnectionStatus::Disconnected;
                return;
            }
            self.reconnect_attempts += 1;
            let delay = reconnect_delay(self.config.reconnect_delay, self.reconnect_attempts);
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, self.reconnect_attempts, self.config.max_reconnect_attempts
            );
            tokio::select! {
                _ = sleep(delay) => {}
                command = self.command_rx.recv() => match command {
                    Some(Command::Send(_)) => {
                        debug!("Dropping outbound message while disconnected");
                    }
                    Some(Command::Disconnect) | None => {
                        self.reconnect_attempts = self.config.max_reconnect_attempts;
                        self.status = ConnectionStatus::Disconnected;
                        return;
                    }
                },
            }
        }
    }

    /// Services one live connection. Returns true when the application asked
    /// to disconnect, false when the socket dropped on its own.
    async fn drive(&mut self, ws: WsStream) -> bool {
        let (mut sink, mut source) = ws.split();
        let mut heartbeat = interval(self.config.heartbeat_interval);
        // The first tick fires immediately
        heartbeat.tick().await;

        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(_))) | None => return false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Read error: {}", e);
                        return false;
                    }
                },
                _ = heartbeat.tick() => {
                    if !send_message(&mut sink, ClientMessage::Ping {}).await {
                        return false;
                    }
                }
                command = self.command_rx.recv() => match command {
                    Some(Command::Send(message)) => {
                        if !send_message(&mut sink, message).await {
                            return false;
                        }
                    }
                    Some(Command::Disconnect) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return true;
                    }
                },
            }
        }
    }

    /// Decode failures are logged and swallowed; a bad frame must not kill
    /// the connection.
    fn dispatch(&mut self, text: &str) {
        match serde_json::from_str::<ServerEnvelope>(text) {
            Ok(envelope) => self.bus.emit(&envelope.message),
            Err(e) => warn!("Undecodable server frame: {}", e),
        }
    }
}

async fn send_message<S>(sink: &mut S, message: ClientMessage) -> bool
where
    S: Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(&ClientEnvelope::new(message)) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode message: {}", e);
            return true;
        }
    };
    sink.send(Message::Text(text)).await.is_ok()
}
