//! Room-scoped local broadcast signaling channel
//!
//! In-process fan-out: every subscriber of a room receives every published
//! message, including the publisher itself. Receivers self-filter through
//! [`SignalingMessage::accepts`]. Delivery is fire-and-forget with no retry
//! and no persistence; a peer that never subscribed simply never sees the
//! message.

use crate::signaling::message::SignalingMessage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

/// Ring-buffer capacity of each room's fan-out channel
const ROOM_CHANNEL_CAPACITY: usize = 256;

/// Process-wide fan-out bus, keyed by room
///
/// Cheap to clone; clones share the same rooms.
#[derive(Clone, Default)]
pub struct LocalBus {
    rooms: Arc<Mutex<HashMap<String, broadcast::Sender<SignalingMessage>>>>,
}

impl LocalBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a room's traffic, creating the room on first use
    pub async fn subscribe(&self, room: &str) -> broadcast::Receiver<SignalingMessage> {
        self.sender_for(room).await.subscribe()
    }

    /// Publish a message into its room
    pub async fn publish(&self, message: SignalingMessage) {
        let sender = self.sender_for(&message.room).await;
        // A room without listeners is not an error
        let _ = sender.send(message);
    }

    async fn sender_for(&self, room: &str) -> broadcast::Sender<SignalingMessage> {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// Broadcast signaling channel bound to one peer in one room
///
/// Survivors of the receive filter are forwarded into the inbound queue
/// handed to [`BroadcastChannel::open`]; the hybrid coordinator consumes
/// that queue.
pub struct BroadcastChannel {
    peer_id: String,
    room: String,
    bus: LocalBus,
    recv_task: tokio::task::JoinHandle<()>,
}

impl BroadcastChannel {
    /// Open the channel and start forwarding filtered room traffic into `inbound`
    pub async fn open(
        bus: LocalBus,
        peer_id: &str,
        room: &str,
        inbound: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Self {
        let mut rx = bus.subscribe(room).await;
        let local = peer_id.to_string();
        let room_name = room.to_string();

        let recv_task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if !msg.accepts(&local, &room_name) {
                            continue;
                        }
                        if inbound.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "Broadcast receiver for {} lagged, {} messages dropped",
                            local, skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Broadcast receive task for {} stopped", local);
        });

        Self {
            peer_id: peer_id.to_string(),
            room: room.to_string(),
            bus,
            recv_task,
        }
    }

    /// Announce presence to all current room listeners
    pub async fn announce(&self) {
        self.send(SignalingMessage::join(&self.peer_id, &self.room))
            .await;
    }

    /// Fan a message out to all current room listeners, including self
    pub async fn send(&self, message: SignalingMessage) {
        self.bus.publish(message).await;
    }

    /// Emit a leave message, then detach from the room
    pub async fn close(&self) {
        self.send(SignalingMessage::leave(&self.peer_id, &self.room))
            .await;
        self.recv_task.abort();
    }
}
