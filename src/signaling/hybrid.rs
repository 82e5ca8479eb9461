//! Dual-path signaling coordinator
//!
//! Every outbound message rides both the in-process broadcast bus and the
//! relay WebSocket. Inbound traffic from the two paths converges into one
//! decoded event stream; join/leave seen on both paths collapse to a single
//! discovery event via a shared roster.

use crate::config::PeerDropConfig;
use crate::signaling::broadcast::{BroadcastChannel, LocalBus};
use crate::signaling::message::{CandidateInit, SignalKind, SignalingMessage};
use crate::signaling::relay::RelayChannel;
use crate::Result;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Decoded inbound signaling traffic
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// SDP offer addressed to this peer
    Offer { from: String, sdp: String },
    /// SDP answer addressed to this peer
    Answer { from: String, sdp: String },
    /// Trickled ICE candidate addressed to this peer
    Candidate {
        from: String,
        candidate: CandidateInit,
    },
    /// A peer announced itself in the room
    PeerJoined { peer_id: String },
    /// A previously seen peer left the room
    PeerLeft { peer_id: String },
}

/// Health of the two signaling paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    /// In-process broadcast bus, always reachable
    pub local: bool,
    /// Relay WebSocket connection
    pub remote: bool,
}

/// Signaling facade combining the broadcast bus and the relay
pub struct HybridSignaling {
    peer_id: String,
    room: String,
    local: BroadcastChannel,
    relay: RelayChannel,
    router_task: tokio::task::JoinHandle<()>,
}

impl HybridSignaling {
    /// Attach to the bus and start the relay connection
    pub async fn open(
        bus: LocalBus,
        config: &PeerDropConfig,
        peer_id: &str,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let local = BroadcastChannel::open(bus, peer_id, &config.room, inbound_tx.clone()).await;
        let relay = RelayChannel::open(
            &config.relay_url,
            peer_id,
            &config.room,
            config.reconnect.clone(),
            inbound_tx,
        );

        let router_task = tokio::spawn(Self::router_task(peer_id.to_string(), inbound_rx, events));

        Self {
            peer_id: peer_id.to_string(),
            room: config.room.clone(),
            local,
            relay,
            router_task,
        }
    }

    /// Announce presence on both paths
    pub async fn announce(&self) -> Result<()> {
        self.local.announce().await;
        self.relay.announce().await
    }

    /// Send an SDP offer to `to` on both paths
    pub async fn send_offer(&self, to: &str, sdp: &str) -> Result<()> {
        self.fan_out(SignalingMessage::offer(&self.peer_id, to, &self.room, sdp))
            .await
    }

    /// Send an SDP answer to `to` on both paths
    pub async fn send_answer(&self, to: &str, sdp: &str) -> Result<()> {
        self.fan_out(SignalingMessage::answer(&self.peer_id, to, &self.room, sdp))
            .await
    }

    /// Send an ICE candidate to `to` on both paths
    pub async fn send_candidate(&self, to: &str, candidate: &CandidateInit) -> Result<()> {
        self.fan_out(SignalingMessage::ice_candidate(
            &self.peer_id,
            to,
            &self.room,
            candidate,
        )?)
        .await
    }

    /// Report reachability of each path
    pub async fn status(&self) -> ChannelStatus {
        ChannelStatus {
            local: true,
            remote: self.relay.is_connected().await,
        }
    }

    /// Identifier this channel signs outbound messages with
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Emit leave on both paths and stop routing
    pub async fn close(&self) -> Result<()> {
        self.local.close().await;
        self.relay.close().await?;
        self.router_task.abort();
        Ok(())
    }

    async fn fan_out(&self, message: SignalingMessage) -> Result<()> {
        self.local.send(message.clone()).await;
        self.relay.send(message).await
    }

    /// Decode inbound frames and collapse duplicate discovery events
    async fn router_task(
        peer_id: String,
        mut inbound: mpsc::UnboundedReceiver<SignalingMessage>,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) {
        let mut roster: HashSet<String> = HashSet::new();

        while let Some(message) = inbound.recv().await {
            let event = match message.kind {
                SignalKind::Join => {
                    if !roster.insert(message.from.clone()) {
                        continue;
                    }
                    debug!("Peer {} discovered by {}", message.from, peer_id);
                    SignalingEvent::PeerJoined {
                        peer_id: message.from,
                    }
                }
                SignalKind::Leave => {
                    if !roster.remove(&message.from) {
                        continue;
                    }
                    SignalingEvent::PeerLeft {
                        peer_id: message.from,
                    }
                }
                SignalKind::Offer => match message.sdp() {
                    Ok(sdp) => SignalingEvent::Offer {
                        from: message.from,
                        sdp,
                    },
                    Err(e) => {
                        warn!("Dropping malformed offer: {}", e);
                        continue;
                    }
                },
                SignalKind::Answer => match message.sdp() {
                    Ok(sdp) => SignalingEvent::Answer {
                        from: message.from,
                        sdp,
                    },
                    Err(e) => {
                        warn!("Dropping malformed answer: {}", e);
                        continue;
                    }
                },
                SignalKind::IceCandidate => match message.candidate() {
                    Ok(candidate) => SignalingEvent::Candidate {
                        from: message.from,
                        candidate,
                    },
                    Err(e) => {
                        warn!("Dropping malformed candidate: {}", e);
                        continue;
                    }
                },
            };

            if events.send(event).is_err() {
                break;
            }
        }

        debug!("Signaling router for {} stopped", peer_id);
    }
}
