//! Peer-to-peer file drop over WebRTC data channels
//!
//! Peers in the same room discover each other over two redundant signaling
//! paths, negotiate direct connections, and move files across the resulting
//! data channels in fixed-size chunks with an explicit offer/accept handshake.
//!
//! # Features
//!
//! - **Dual-path signaling**: an in-process broadcast bus plus a reconnecting
//!   WebSocket relay, merged with duplicate suppression
//! - **Per-peer negotiation**: offer/answer/candidate exchange tolerant of
//!   duplicated and out-of-order delivery
//! - **Chunked transfers**: 16 KiB chunks, accept-gated, with progress and
//!   throughput reporting and verified reassembly
//! - **Chat messages**: lightweight text broadcast to connected peers
//! - **Relay dev server**: a small WebSocket fan-out endpoint so the relay
//!   path runs without third-party infrastructure
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  PeerDropClient                                      │
//! │  ├─ ConnectionManager (per-peer negotiation)         │
//! │  │   ├─ HybridSignaling                              │
//! │  │   │   ├─ BroadcastChannel (in-process bus)        │
//! │  │   │   └─ RelayChannel (WebSocket, reconnecting)   │
//! │  │   └─ PeerLink per peer (webrtc / memory)          │
//! │  └─ FileTransferManager (offer/accept, chunks)       │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use peerdrop::config::PeerDropConfig;
//!
//! let config = PeerDropConfig::default()
//!     .with_room("demo")
//!     .with_peer_id("alice");
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.room, "demo");
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use peerdrop::{ClientEvent, PeerDropClient, PeerDropConfig};
//!
//! # async fn example() -> peerdrop::Result<()> {
//! let config = PeerDropConfig::default().with_room("demo");
//! let (client, mut events) = PeerDropClient::start(config).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ClientEvent::PeerDiscovered { peer_id } = event {
//!         client.connect_to_peer(&peer_id).await?;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod peer;
pub mod signaling;
pub mod transfer;

// Re-exports for public API
pub use client::{ClientEvent, PeerDropClient};
pub use config::{PeerDropConfig, ReconnectPolicy, TurnServerConfig};
pub use error::{Error, Result};
pub use peer::{ConnectionManager, ConnectionStatus, PeerEvent};
pub use signaling::{ChannelStatus, HybridSignaling, LocalBus, RelayServer, SignalingMessage};
pub use transfer::{
    FileTransferManager, PendingOffer, TransferEvent, TransferRecord, TransferStatus, CHUNK_SIZE,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
