//! Reconnecting WebSocket transport.
//!
//! The socket is the only reader of raw frames: every text frame is decoded
//! into a [`ServerEvent`] and handed to the receiver returned by
//! [`WebSocketClient::connect`], together with connection state changes.

use crate::error::{Error, Result};
use crate::protocol::{self, ClientFrame, ServerEvent};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Event(ServerEvent),
    State(ConnectionState),
}

/// Outbound half of the real-time connection.
pub trait Transport: Send + Sync {
    /// Hands a frame to the connection. Fails with `Error::Transport` when
    /// not connected; frames are never queued for a later connection.
    fn send(&self, frame: &ClientFrame) -> Result<()>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// Delay between reconnect attempts. Doubles after each failed attempt up to
/// `max_delay`; with `max_delay == delay` the delay is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay, max_delay: delay }
    }

    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay).max(self.delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(3))
    }
}

struct Shared {
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
    state: Mutex<ConnectionState>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState, events: &mpsc::UnboundedSender<TransportEvent>) {
        let changed = {
            let mut current = self.state.lock();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            let _ = events.send(TransportEvent::State(state));
        }
    }
}

enum Exit {
    Reconnect,
    Shutdown,
}

pub struct WebSocketClient {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl WebSocketClient {
    /// Starts the connection loop on the current tokio runtime.
    pub fn connect(
        url: &str,
        token: &str,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            sender: Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
        });

        tokio::spawn(connection_loop(
            url.to_string(),
            token.to_string(),
            policy,
            shared.clone(),
            events_tx,
            shutdown_rx,
        ));

        (
            Self {
                shared,
                shutdown: shutdown_tx,
            },
            events_rx,
        )
    }

    /// Closes the socket and stops reconnecting.
    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Transport for WebSocketClient {
    fn send(&self, frame: &ClientFrame) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::Transport("not connected".into()));
        }
        let text = frame.encode()?;
        match &*self.shared.sender.lock() {
            Some(tx) => tx
                .send(text)
                .map_err(|_| Error::Transport("connection closed".into())),
            None => Err(Error::Transport("not connected".into())),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn connection_loop(
    url: String,
    token: String,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay = policy.delay;

    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.set_state(ConnectionState::Connecting, &events);

        let exit = match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                delay = policy.delay;
                run_session(stream, &token, &shared, &events, &mut shutdown).await
            }
            Err(e) => {
                tracing::warn!("WebSocket connect to {} failed: {}", url, e);
                Exit::Reconnect
            }
        };

        *shared.sender.lock() = None;
        shared.set_state(ConnectionState::Disconnected, &events);

        if matches!(exit, Exit::Shutdown) || *shutdown.borrow() {
            break;
        }

        tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting WebSocket");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
        delay = policy.next_delay(delay);
    }

    tracing::debug!("WebSocket loop stopped");
}

async fn run_session<S>(
    stream: S,
    token: &str,
    shared: &Shared,
    events: &mpsc::UnboundedSender<TransportEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Exit
where
    S: futures::Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = stream.split();

    // The auth envelope is always the first frame of a connection.
    let auth = match (ClientFrame::Auth { token: token.to_string() }).encode() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode auth frame: {}", e);
            return Exit::Shutdown;
        }
    };
    if let Err(e) = write.send(WsMessage::Text(auth)).await {
        tracing::warn!("Failed to authenticate WebSocket: {}", e);
        return Exit::Reconnect;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *shared.sender.lock() = Some(tx);
    shared.set_state(ConnectionState::Connected, events);
    tracing::info!("WebSocket connected");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return Exit::Shutdown;
            }
            outgoing = rx.recv() => {
                let Some(text) = outgoing else {
                    return Exit::Reconnect;
                };
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    tracing::warn!("WebSocket write failed: {}", e);
                    return Exit::Reconnect;
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => match protocol::decode(&text) {
                    Ok(event) => {
                        if events.send(TransportEvent::Event(event)).is_err() {
                            tracing::debug!("Event receiver dropped, closing WebSocket");
                            let _ = write.send(WsMessage::Close(None)).await;
                            return Exit::Shutdown;
                        }
                    }
                    Err(e) => tracing::warn!("Dropping malformed frame: {}", e),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::info!(?frame, "WebSocket closed by server");
                    return Exit::Reconnect;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("WebSocket read failed: {}", e);
                    return Exit::Reconnect;
                }
                None => {
                    tracing::info!("WebSocket stream ended");
                    return Exit::Reconnect;
                }
            },
        }
    }
}
