//! Point-to-point transport seam
//!
//! The connection manager drives negotiation against these traits and never
//! touches a concrete transport. `WebRtcLinkFactory` is the production
//! implementation; `MemoryLinkFactory` wires in-process pairs for tests and
//! same-process demos. A link reports everything asynchronous (state
//! transitions, locally gathered candidates, channel readiness, inbound
//! frames) through one shared `LinkEvent` stream owned by the manager.

use crate::signaling::message::CandidateInit;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport-level lifecycle of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, negotiation not started
    New,
    /// Negotiation or connectivity checks in progress
    Connecting,
    /// Transport established
    Connected,
    /// Transport lost after being established
    Disconnected,
    /// Negotiation or connectivity failed
    Failed,
    /// Locally closed
    Closed,
}

impl LinkState {
    /// Whether this state ends the link for good
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed
        )
    }
}

/// Asynchronous reports from a link to its owning manager
///
/// Every event names the remote peer so a single stream can serve all links
/// owned by one manager.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Transport state transition
    StateChanged { peer_id: String, state: LinkState },
    /// A locally gathered candidate ready to trickle to the remote side
    CandidateGathered {
        peer_id: String,
        candidate: CandidateInit,
    },
    /// The data channel toward this peer became writable
    ChannelOpen { peer_id: String },
    /// One inbound frame from the remote peer
    Frame { peer_id: String, payload: Bytes },
}

/// One point-to-point transport toward a single remote peer
///
/// Offer/answer methods mirror the session-negotiation halves: the dialing
/// side calls `create_offer` then `accept_answer`; the responding side calls
/// `create_answer`. Candidates may be added any time after a remote
/// description has been accepted.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Remote peer this link points at
    fn peer_id(&self) -> &str;

    /// Open the outbound channel eagerly and produce the local offer SDP
    async fn create_offer(&self) -> Result<String>;

    /// Accept a remote offer and produce the local answer SDP
    async fn create_answer(&self, remote_sdp: &str) -> Result<String>;

    /// Accept the remote answer to a previously created offer
    async fn accept_answer(&self, remote_sdp: &str) -> Result<()>;

    /// Apply a remote candidate
    ///
    /// Callers must hold candidates back until a remote description has been
    /// accepted; applying one earlier is an error.
    async fn add_candidate(&self, candidate: &CandidateInit) -> Result<()>;

    /// Whether the data channel is open for writes
    async fn is_channel_open(&self) -> bool;

    /// Write one frame to the remote peer
    ///
    /// Fails when the channel is not open; callers decide whether to skip or
    /// surface the failure.
    async fn send(&self, payload: Bytes) -> Result<()>;

    /// Tear the link down
    async fn close(&self) -> Result<()>;
}

/// Produces links on demand
#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Create a link from `local_peer_id` toward `remote_peer_id`
    ///
    /// All asynchronous output of the link flows through `events`.
    async fn create_link(
        &self,
        local_peer_id: &str,
        remote_peer_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>>;
}
