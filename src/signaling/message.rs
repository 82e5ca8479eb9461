//! Signaling message envelope shared by the broadcast and relay channels
//!
//! Every message carries its room and sender so that receivers can filter
//! self-echo and cross-room traffic; directed kinds additionally carry the
//! target peer. The relay endpoint itself is room-unaware, it just forwards
//! frames, so all routing state lives in the envelope.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Kind of signaling message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Session offer, directed at one peer
    Offer,
    /// Session answer, directed at one peer
    Answer,
    /// Connectivity candidate, directed at one peer
    IceCandidate,
    /// Room presence announcement
    Join,
    /// Room departure announcement
    Leave,
}

impl SignalKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::Join => "join",
            SignalKind::Leave => "leave",
        }
    }

    /// Whether this kind is addressed to a single peer
    pub fn is_directed(&self) -> bool {
        matches!(
            self,
            SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate
        )
    }
}

/// ICE candidate payload exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateInit {
    /// The candidate-attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,

    /// Index of the media description this candidate belongs to
    #[serde(
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Envelope for all signaling traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    /// Message kind
    #[serde(rename = "type")]
    pub kind: SignalKind,

    /// Sender peer ID
    pub from: String,

    /// Target peer ID (present for directed kinds, absent for join/leave)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to: Option<String>,

    /// Room this message belongs to
    pub room: String,

    /// Kind-specific payload
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<serde_json::Value>,
}

impl SignalingMessage {
    /// Build a session offer carrying an SDP string
    pub fn offer(from: &str, to: &str, room: &str, sdp: &str) -> Self {
        Self {
            kind: SignalKind::Offer,
            from: from.to_string(),
            to: Some(to.to_string()),
            room: room.to_string(),
            payload: Some(serde_json::json!({ "sdp": sdp })),
        }
    }

    /// Build a session answer carrying an SDP string
    pub fn answer(from: &str, to: &str, room: &str, sdp: &str) -> Self {
        Self {
            kind: SignalKind::Answer,
            from: from.to_string(),
            to: Some(to.to_string()),
            room: room.to_string(),
            payload: Some(serde_json::json!({ "sdp": sdp })),
        }
    }

    /// Build an ICE candidate message
    pub fn ice_candidate(from: &str, to: &str, room: &str, candidate: &CandidateInit) -> Result<Self> {
        let payload = serde_json::to_value(candidate).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize ICE candidate: {}", e))
        })?;
        Ok(Self {
            kind: SignalKind::IceCandidate,
            from: from.to_string(),
            to: Some(to.to_string()),
            room: room.to_string(),
            payload: Some(payload),
        })
    }

    /// Build a join announcement
    pub fn join(from: &str, room: &str) -> Self {
        Self {
            kind: SignalKind::Join,
            from: from.to_string(),
            to: None,
            room: room.to_string(),
            payload: None,
        }
    }

    /// Build a leave announcement
    pub fn leave(from: &str, room: &str) -> Self {
        Self {
            kind: SignalKind::Leave,
            from: from.to_string(),
            to: None,
            room: room.to_string(),
            payload: None,
        }
    }

    /// Receiver-side delivery filter
    ///
    /// Rejects self-echo (`from` equals the local peer), messages from other
    /// rooms, and directed messages addressed to someone else.
    pub fn accepts(&self, local_peer_id: &str, room: &str) -> bool {
        if self.from == local_peer_id || self.room != room {
            return false;
        }
        if self.kind.is_directed() {
            return self.to.as_deref() == Some(local_peer_id);
        }
        true
    }

    /// Extract the SDP string from an offer or answer payload
    pub fn sdp(&self) -> Result<String> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("sdp"))
            .and_then(|s| s.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                Error::SignalingError(format!(
                    "{} message without sdp payload",
                    self.kind.as_str()
                ))
            })
    }

    /// Extract the ICE candidate from a candidate payload
    pub fn candidate(&self) -> Result<CandidateInit> {
        let payload = self.payload.clone().ok_or_else(|| {
            Error::SignalingError("ice-candidate message without payload".to_string())
        })?;
        serde_json::from_value(payload).map_err(|e| {
            Error::SerializationError(format!("Failed to parse ICE candidate: {}", e))
        })
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize signaling message: {}", e))
        })
    }

    /// Deserialize from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::SerializationError(format!("Failed to deserialize signaling message: {}", e))
        })
    }
}
