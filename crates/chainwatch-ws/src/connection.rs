//! Streaming connection manager.
//!
//! A single background task owns the socket. Callers talk to it through an
//! ordered command channel and observe its lifecycle through a watch channel.

use std::fmt::Display;
use std::sync::Arc;

use futures::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chainwatch_core::config::{EngineConfig, HeartbeatConfig, API_KEY_PLACEHOLDER};
use chainwatch_core::credentials::{redact, ActiveCredential, CredentialPool};
use chainwatch_core::error::{ConnectionError, CredentialError};
use chainwatch_core::policy::{ReconnectConfig, ReconnectPolicy};
use chainwatch_core::protocol::ControlFrame;
use chainwatch_core::registry::AddressRegistry;
use chainwatch_core::types::ConnectionState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Endpoint with an `{api_key}` placeholder.
    pub url_template: String,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
}

impl ConnectionConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            url_template: config.ws_url.clone(),
            heartbeat: config.heartbeat.clone(),
            reconnect: config.reconnect.clone(),
        }
    }
}

/// Command sent from the control surface to the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Close,
}

/// Why a session (or connection attempt) ended.
enum SessionEnd {
    /// Close requested or every handle dropped.
    Shutdown,
    Dropped(ConnectionError),
}

/// Substitute `key` into the endpoint template.
pub fn endpoint_url(template: &str, key: &str) -> String {
    template.replace(API_KEY_PLACEHOLDER, key)
}

/// Owns everything the connection task needs. Consumed by [`spawn`](Self::spawn).
pub struct ConnectionManager {
    config: ConnectionConfig,
    credentials: Arc<CredentialPool>,
    registry: AddressRegistry,
    frames: mpsc::UnboundedSender<String>,
}

impl ConnectionManager {
    /// `frames` receives every inbound text frame, in arrival order.
    pub fn new(
        config: ConnectionConfig,
        credentials: Arc<CredentialPool>,
        registry: AddressRegistry,
        frames: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            config,
            credentials,
            registry,
            frames,
        }
    }

    /// Start the background task.
    ///
    /// The handle reports `Connecting` from the moment it is returned.
    pub fn spawn(self) -> ConnectionHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let task = tokio::spawn(self.run(cmd_rx, state_tx));
        ConnectionHandle {
            cmd_tx,
            state: state_rx,
            task: Some(task),
        }
    }

    async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
        state_tx: watch::Sender<ConnectionState>,
    ) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            publish(&state_tx, ConnectionState::Connecting);
            let err = match self.attempt(&mut cmd_rx, &state_tx, &mut policy).await {
                SessionEnd::Shutdown => {
                    publish(&state_tx, ConnectionState::Disconnected);
                    return;
                }
                SessionEnd::Dropped(err) => err,
            };

            let Some(mut delay) = policy.next_delay() else {
                tracing::error!(
                    attempts = policy.attempts(),
                    error = %err,
                    "reconnect attempts exhausted, giving up"
                );
                publish(&state_tx, ConnectionState::Terminated);
                return;
            };
            if let ConnectionError::Credentials(CredentialError::Exhausted { retry_in }) = &err {
                delay = delay.max(*retry_in);
            }

            publish(&state_tx, ConnectionState::Reconnecting);
            tracing::warn!(
                attempt = policy.attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "connection lost, reconnecting"
            );

            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = until_close(&mut cmd_rx) => {
                    publish(&state_tx, ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    /// One handshake plus, if it succeeds, one session.
    async fn attempt(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<ConnCommand>,
        state_tx: &watch::Sender<ConnectionState>,
        policy: &mut ReconnectPolicy,
    ) -> SessionEnd {
        let credential = match self.credentials.active() {
            Ok(c) => c,
            Err(e) => return SessionEnd::Dropped(e.into()),
        };
        self.credentials.record_call();

        let handshake = tokio::select! {
            res = self.handshake(&credential) => res,
            _ = until_close(cmd_rx) => return SessionEnd::Shutdown,
        };

        match handshake {
            Ok(ws) => self.session(ws, cmd_rx, state_tx, policy).await,
            Err(e) => {
                if e.is_rate_limit() {
                    tracing::warn!(
                        key = %redact(&credential.key),
                        "handshake rate limited, rotating credential"
                    );
                    if let Err(err) = self.credentials.report_rate_limited(&credential) {
                        tracing::warn!(error = %err, "no credential available after rotation");
                    }
                }
                SessionEnd::Dropped(e)
            }
        }
    }

    async fn handshake(&self, credential: &ActiveCredential) -> Result<WsStream, ConnectionError> {
        let url = endpoint_url(&self.config.url_template, &credential.key);
        let limit = self.config.heartbeat.handshake_timeout();
        tracing::info!(
            endpoint = %self.config.url_template,
            key = %redact(&credential.key),
            "connecting via WebSocket"
        );
        match time::timeout(limit, connect_async(url.as_str())).await {
            Err(_) => Err(ConnectionError::HandshakeTimeout {
                ms: limit.as_millis() as u64,
            }),
            Ok(Err(e)) => Err(classify_handshake_error(e)),
            Ok(Ok((ws, _))) => Ok(ws),
        }
    }

    async fn session(
        &self,
        ws: WsStream,
        cmd_rx: &mut mpsc::UnboundedReceiver<ConnCommand>,
        state_tx: &watch::Sender<ConnectionState>,
        policy: &mut ReconnectPolicy,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let connected_at = Instant::now();
        publish(state_tx, ConnectionState::Connected);

        let end = self.drive(&mut sink, &mut stream, cmd_rx).await;

        if policy.record_connected(connected_at.elapsed()) {
            tracing::debug!("session outlived stability window, backoff reset");
        }
        end
    }

    async fn drive(
        &self,
        sink: &mut futures::stream::SplitSink<WsStream, Message>,
        stream: &mut futures::stream::SplitStream<WsStream>,
        cmd_rx: &mut mpsc::UnboundedReceiver<ConnCommand>,
    ) -> SessionEnd {
        // Deltas queued while disconnected are already in the snapshot.
        loop {
            match cmd_rx.try_recv() {
                Ok(ConnCommand::Close) | Err(TryRecvError::Disconnected) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
            }
        }

        let snapshot = self.registry.snapshot();
        if !snapshot.is_empty() {
            let count = snapshot.len();
            if let Err(e) = send_control(sink, ControlFrame::subscribe(snapshot)).await {
                return SessionEnd::Dropped(e);
            }
            tracing::info!(wallets = count, "subscribed tracked wallets");
        }

        let ping_every = self.config.heartbeat.ping_interval();
        let stale_after = self.config.heartbeat.stale_timeout();
        let mut heartbeat = time::interval_at(Instant::now() + ping_every, ping_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(ConnCommand::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                    Some(ConnCommand::Subscribe(addresses)) => {
                        if !addresses.is_empty() {
                            if let Err(e) = send_control(sink, ControlFrame::subscribe(addresses)).await {
                                return SessionEnd::Dropped(e);
                            }
                        }
                    }
                    Some(ConnCommand::Unsubscribe(addresses)) => {
                        if !addresses.is_empty() {
                            if let Err(e) = send_control(sink, ControlFrame::unsubscribe(addresses)).await {
                                return SessionEnd::Dropped(e);
                            }
                        }
                    }
                },
                msg = stream.next() => {
                    let msg = match msg {
                        None => return SessionEnd::Dropped(ConnectionError::Closed),
                        Some(Err(e)) => {
                            return SessionEnd::Dropped(ConnectionError::Transport(e.to_string()))
                        }
                        Some(Ok(msg)) => msg,
                    };
                    last_seen = Instant::now();
                    match msg {
                        Message::Text(text) => {
                            if !self.forward(text.to_string()) {
                                let _ = sink.send(Message::Close(None)).await;
                                return SessionEnd::Shutdown;
                            }
                        }
                        Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => {
                                if !self.forward(text) {
                                    let _ = sink.send(Message::Close(None)).await;
                                    return SessionEnd::Shutdown;
                                }
                            }
                            Err(_) => tracing::debug!("dropping non-UTF-8 binary frame"),
                        },
                        Message::Ping(payload) => {
                            if let Err(e) = sink.send(Message::Pong(payload)).await {
                                return SessionEnd::Dropped(ConnectionError::Transport(e.to_string()));
                            }
                        }
                        Message::Close(frame) => {
                            tracing::debug!(?frame, "provider closed the stream");
                            return SessionEnd::Dropped(ConnectionError::Closed);
                        }
                        Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
                _ = heartbeat.tick() => {
                    let idle = last_seen.elapsed();
                    if idle >= stale_after {
                        tracing::warn!(
                            idle_ms = idle.as_millis() as u64,
                            "no data within heartbeat window, forcing reconnect"
                        );
                        return SessionEnd::Dropped(ConnectionError::Stale {
                            ms: idle.as_millis() as u64,
                        });
                    }
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        return SessionEnd::Dropped(ConnectionError::Transport(e.to_string()));
                    }
                }
            }
        }
    }

    /// Hand a frame to the processor. `false` once the consumer is gone.
    fn forward(&self, text: String) -> bool {
        if self.frames.send(text).is_err() {
            tracing::debug!("frame consumer dropped, closing connection");
            return false;
        }
        true
    }
}

/// Handle onto a running connection task.
///
/// Dropping the handle asks the task to close.
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    /// Queue a subscribe delta. Returns `false` if the task has exited.
    pub fn subscribe(&self, addresses: Vec<String>) -> bool {
        self.cmd_tx.send(ConnCommand::Subscribe(addresses)).is_ok()
    }

    /// Queue an unsubscribe delta. Returns `false` if the task has exited.
    pub fn unsubscribe(&self, addresses: Vec<String>) -> bool {
        self.cmd_tx.send(ConnCommand::Unsubscribe(addresses)).is_ok()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// `true` once the task has returned (closed or terminated).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Close the connection and wait for the task to exit.
    pub async fn shutdown(mut self) {
        let _ = self.cmd_tx.send(ConnCommand::Close);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "connection task ended abnormally");
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(ConnCommand::Close);
    }
}

/// Resolves once a close is requested or every sender is gone. Deltas are
/// discarded; the next session subscribes from the registry snapshot.
async fn until_close(cmd_rx: &mut mpsc::UnboundedReceiver<ConnCommand>) {
    while let Some(cmd) = cmd_rx.recv().await {
        if cmd == ConnCommand::Close {
            return;
        }
    }
}

async fn send_control<S>(sink: &mut S, frame: ControlFrame) -> Result<(), ConnectionError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    tracing::debug!(action = ?frame.action, count = frame.addresses.len(), "sending control frame");
    sink.send(Message::Text(frame.to_json().into()))
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))
}

fn classify_handshake_error(e: WsError) -> ConnectionError {
    match e {
        WsError::Http(resp) if resp.status().as_u16() == 429 => ConnectionError::RateLimited,
        WsError::Http(resp) => ConnectionError::Handshake(format!("HTTP {}", resp.status())),
        other => ConnectionError::Handshake(other.to_string()),
    }
}

fn publish(state_tx: &watch::Sender<ConnectionState>, next: ConnectionState) {
    let mut previous = next;
    let changed = state_tx.send_if_modified(|state| {
        if *state == next {
            return false;
        }
        previous = std::mem::replace(state, next);
        true
    });
    if changed {
        tracing::info!(from = %previous, to = %next, "connection state changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_substitutes_key() {
        assert_eq!(
            endpoint_url("wss://host/?api-key={api_key}", "abc"),
            "wss://host/?api-key=abc"
        );
        assert_eq!(endpoint_url("wss://host/", "abc"), "wss://host/");
    }

    #[test]
    fn publish_only_notifies_on_change() {
        let (tx, mut rx) = watch::channel(ConnectionState::Disconnected);
        publish(&tx, ConnectionState::Disconnected);
        assert!(!rx.has_changed().unwrap());
        publish(&tx, ConnectionState::Connecting);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn until_close_skips_deltas() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ConnCommand::Subscribe(vec!["W1".into()])).unwrap();
        tx.send(ConnCommand::Close).unwrap();
        tx.send(ConnCommand::Unsubscribe(vec!["W1".into()])).unwrap();
        until_close(&mut rx).await;
        assert_eq!(rx.try_recv().unwrap(), ConnCommand::Unsubscribe(vec!["W1".into()]));
    }
}
