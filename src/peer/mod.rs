//! Peer connection management
//!
//! Drives session negotiation per remote peer over the signaling layer and
//! owns the resulting data channels. The transport itself sits behind the
//! `PeerLink`/`LinkFactory` seam: `webrtc` carries real traffic, `memory`
//! wires in-process pairs for tests and same-process demos.

pub mod link;
pub mod manager;
pub mod memory;
pub mod webrtc;

pub use link::{LinkEvent, LinkFactory, LinkState, PeerLink};
pub use manager::{ConnectionManager, ConnectionStatus, PeerEvent, PeerStatus};
pub use memory::{MemoryHub, MemoryLink, MemoryLinkFactory};
pub use webrtc::WebRtcLinkFactory;
