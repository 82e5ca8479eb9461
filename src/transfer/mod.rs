//! Chunked file transfer over established data channels
//!
//! The `protocol` module defines the wire messages; `manager` runs the
//! offer/accept handshake, the paced sender, and receive-side reassembly.

pub mod manager;
pub mod protocol;

pub use manager::{
    FileTransferManager, OutboundSink, PendingOffer, TransferDirection, TransferEvent,
    TransferRecord, TransferStatus,
};
pub use protocol::{total_chunks, PeerMessage, CHUNK_SIZE};
