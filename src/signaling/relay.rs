//! Relay signaling channel over a shared WebSocket endpoint
//!
//! The relay forwards every frame to all other connected clients and knows
//! nothing about rooms; scoping and addressing live in the message envelope.
//! The channel redials with a capped, linearly growing delay and goes
//! permanently closed once the attempt budget is spent. Messages sent while
//! not connected are dropped and logged, never queued.

use crate::config::ReconnectPolicy;
use crate::signaling::message::SignalingMessage;
use crate::Result;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Relay channel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Dialing the relay
    Connecting,
    /// Live connection
    Open,
    /// No connection; terminal once the redial budget is spent
    Closed,
}

/// Relay signaling channel bound to one peer in one room
pub struct RelayChannel {
    peer_id: String,
    room: String,
    state: Arc<RwLock<RelayState>>,
    outbound: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayChannel {
    /// Open the channel and keep it connected per `policy`
    ///
    /// Filtered inbound traffic is forwarded into `inbound`. Presence is
    /// announced automatically on every successful (re)connection.
    pub fn open(
        url: &str,
        peer_id: &str,
        room: &str,
        policy: ReconnectPolicy,
        inbound: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Self {
        let state = Arc::new(RwLock::new(RelayState::Connecting));
        let outbound: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>> =
            Arc::new(RwLock::new(None));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(Self::supervisor_task(
            url.to_string(),
            peer_id.to_string(),
            room.to_string(),
            policy,
            inbound,
            Arc::clone(&state),
            Arc::clone(&outbound),
            shutdown_rx,
        ));

        Self {
            peer_id: peer_id.to_string(),
            room: room.to_string(),
            state,
            outbound,
            shutdown_tx,
        }
    }

    /// Announce presence to the room through the relay
    pub async fn announce(&self) -> Result<()> {
        self.send(SignalingMessage::join(&self.peer_id, &self.room))
            .await
    }

    /// Queue a message for the relay
    ///
    /// Dropped with a warning when the channel is not open.
    pub async fn send(&self, message: SignalingMessage) -> Result<()> {
        let guard = self.outbound.read().await;
        let Some(tx) = guard.as_ref() else {
            warn!(
                "Relay not connected, dropping {} message",
                message.kind.as_str()
            );
            return Ok(());
        };
        let json = message.to_json()?;
        if tx.send(Message::Text(json)).is_err() {
            warn!(
                "Relay writer gone, dropping {} message",
                message.kind.as_str()
            );
        }
        Ok(())
    }

    /// Emit a leave message, then close the connection for good
    pub async fn close(&self) -> Result<()> {
        self.send(SignalingMessage::leave(&self.peer_id, &self.room))
            .await?;
        let _ = self.shutdown_tx.send(());
        Ok(())
    }

    /// Whether the channel currently has a live relay connection
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == RelayState::Open
    }

    /// Current channel state
    pub async fn state(&self) -> RelayState {
        *self.state.read().await
    }

    /// Supervisor task: dial, pump, redial until the budget is spent
    #[allow(clippy::too_many_arguments)]
    async fn supervisor_task(
        url: String,
        peer_id: String,
        room: String,
        policy: ReconnectPolicy,
        inbound: mpsc::UnboundedSender<SignalingMessage>,
        state: Arc<RwLock<RelayState>>,
        outbound: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut attempts = 0u32;

        'supervisor: loop {
            *state.write().await = RelayState::Connecting;

            let connect_result = tokio::select! {
                result = connect_async(&url) => result,
                _ = shutdown_rx.recv() => break 'supervisor,
            };

            let ws_stream = match connect_result {
                Ok((stream, _)) => stream,
                Err(e) => {
                    attempts += 1;
                    if !policy.should_retry(attempts) {
                        error!(
                            "Relay {} unreachable after {} attempts, giving up: {}",
                            url, attempts, e
                        );
                        break 'supervisor;
                    }
                    let delay = policy.delay_for(attempts);
                    warn!(
                        "Relay connect failed (attempt {}/{}), retrying in {:?}: {}",
                        attempts, policy.max_attempts, delay, e
                    );
                    // Backoff reads as Closed, not as an in-progress dial
                    *state.write().await = RelayState::Closed;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue 'supervisor,
                        _ = shutdown_rx.recv() => break 'supervisor,
                    }
                }
            };

            info!("Connected to relay {}", url);
            attempts = 0;

            let (mut write, mut read) = ws_stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

            // Presence must be re-announced on every connection
            if let Ok(json) = SignalingMessage::join(&peer_id, &room).to_json() {
                let _ = tx.send(Message::Text(json));
            }

            *outbound.write().await = Some(tx);
            *state.write().await = RelayState::Open;

            // true = connection lost, false = deliberate stop
            let lost = loop {
                tokio::select! {
                    outgoing = rx.recv() => match outgoing {
                        Some(msg) => {
                            if let Err(e) = write.send(msg).await {
                                error!("Relay write failed: {}", e);
                                break true;
                            }
                        }
                        None => break true,
                    },
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                            Ok(msg) if msg.accepts(&peer_id, &room) => {
                                if inbound.send(msg).is_err() {
                                    break false;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Discarding invalid relay frame: {}", e),
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Relay connection closed by remote");
                            break true;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("Relay read error: {}", e);
                            break true;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        // Flush anything already queued (the final leave)
                        while let Ok(msg) = rx.try_recv() {
                            let _ = write.send(msg).await;
                        }
                        let _ = write.send(Message::Close(None)).await;
                        break false;
                    }
                }
            };

            *outbound.write().await = None;

            if !lost {
                break 'supervisor;
            }

            attempts += 1;
            if !policy.should_retry(attempts) {
                error!(
                    "Relay reconnect budget spent after {} attempts, staying offline",
                    attempts
                );
                break 'supervisor;
            }

            *state.write().await = RelayState::Closed;
            let delay = policy.delay_for(attempts);
            warn!(
                "Relay disconnected, retry {}/{} in {:?}",
                attempts, policy.max_attempts, delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => break 'supervisor,
            }
        }

        *outbound.write().await = None;
        *state.write().await = RelayState::Closed;
        debug!("Relay supervisor for {} stopped", peer_id);
    }
}
