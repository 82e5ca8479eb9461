//! Peer discovery and SDP exchange over two parallel paths
//!
//! This module implements the signaling layer:
//! - an in-process broadcast bus for peers sharing a runtime
//! - a reconnecting WebSocket relay channel for everyone else
//! - a hybrid coordinator that fans outbound traffic to both and merges
//!   inbound traffic into one deduplicated event stream

pub mod broadcast;
pub mod hybrid;
pub mod message;
pub mod relay;
pub mod server;

pub use broadcast::{BroadcastChannel, LocalBus};
pub use hybrid::{ChannelStatus, HybridSignaling, SignalingEvent};
pub use message::{CandidateInit, SignalKind, SignalingMessage};
pub use relay::{RelayChannel, RelayState};
pub use server::RelayServer;
