//! Wire messages exchanged over a peer's data channel
//!
//! Everything riding a data channel is one [`PeerMessage`], JSON-encoded.
//! Chunk payloads serialize as arrays of raw byte values; the channel is
//! binary-safe so no text encoding layer sits in between.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Fixed chunk size for file transfers, in bytes
pub const CHUNK_SIZE: usize = 16384;

/// Number of chunks a file of `file_size` bytes splits into
///
/// Zero-byte files produce zero chunks; the transfer completes on
/// acceptance alone.
pub fn total_chunks(file_size: u64) -> u32 {
    file_size.div_ceil(CHUNK_SIZE as u64) as u32
}

/// Application-level messages between connected peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PeerMessage {
    /// Free-form chat message broadcast to connected peers
    TestMessage {
        /// Message text
        text: String,
    },

    /// Proposes a file transfer; no bytes move until the peer accepts
    FileOffer {
        /// Transfer this offer opens
        transfer_id: String,
        /// Name of the offered file
        file_name: String,
        /// Size of the offered file in bytes
        file_size: u64,
    },

    /// Accepts a previously offered transfer
    FileAccept {
        /// Transfer being accepted
        transfer_id: String,
    },

    /// Declines a previously offered transfer
    FileReject {
        /// Transfer being declined
        transfer_id: String,
    },

    /// One slice of file content
    FileChunk {
        /// Transfer this chunk belongs to
        transfer_id: String,
        /// Zero-based position of this chunk
        chunk_index: u32,
        /// Total number of chunks in the transfer
        total_chunks: u32,
        /// Name of the file, repeated for receivers joining mid-stream
        file_name: String,
        /// Size of the file in bytes
        file_size: u64,
        /// Raw chunk content, at most [`CHUNK_SIZE`] bytes
        bytes: Vec<u8>,
    },
}

impl PeerMessage {
    /// Transfer this message refers to, if any
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            PeerMessage::TestMessage { .. } => None,
            PeerMessage::FileOffer { transfer_id, .. }
            | PeerMessage::FileAccept { transfer_id }
            | PeerMessage::FileReject { transfer_id }
            | PeerMessage::FileChunk { transfer_id, .. } => Some(transfer_id),
        }
    }

    /// Serialize for the data channel
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize peer message: {}", e))
        })
    }

    /// Deserialize a data channel frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            Error::SerializationError(format!("Failed to deserialize peer message: {}", e))
        })
    }
}
