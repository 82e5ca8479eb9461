//! Configuration types for peerdrop clients and the relay channel

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a peerdrop client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDropConfig {
    /// WebSocket relay URL (ws:// or wss://)
    pub relay_url: String,

    /// Room name scoping discovery and signaling
    pub room: String,

    /// Local peer ID (auto-generated if None)
    pub peer_id: Option<String>,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Label for the data channel opened toward each peer (default: "fileTransfer")
    pub data_channel_label: String,

    /// Delay between consecutive file chunks in milliseconds (default: 10)
    pub chunk_pacing_ms: u64,

    /// Seconds before a peer stuck in `connecting` is torn down (default: 30, 0 disables)
    pub negotiation_timeout_secs: u64,

    /// Directory where completed inbound transfers are written (optional)
    pub download_dir: Option<PathBuf>,

    /// Relay reconnection policy
    pub reconnect: ReconnectPolicy,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Relay reconnection policy
///
/// Delays grow linearly: attempt `n` waits `delay_initial_ms * n`,
/// clamped to `delay_max_ms`. After `max_attempts` failed attempts the
/// relay channel closes for good and reports not-connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Maximum reconnection attempts (default: 5)
    pub max_attempts: u32,

    /// Base reconnection delay in milliseconds (default: 1000)
    pub delay_initial_ms: u64,

    /// Maximum reconnection delay in milliseconds (default: 30000)
    pub delay_max_ms: u64,
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = self
            .delay_initial_ms
            .saturating_mul(attempt.max(1) as u64)
            .min(self.delay_max_ms);
        Duration::from_millis(ms)
    }

    /// Whether another attempt is allowed after `attempts_made` failures
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_initial_ms: 1000,
            delay_max_ms: 30000,
        }
    }
}

impl Default for PeerDropConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9021".to_string(),
            room: "default-room".to_string(),
            peer_id: None,
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            data_channel_label: "fileTransfer".to_string(),
            chunk_pacing_ms: 10,
            negotiation_timeout_secs: 30,
            download_dir: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl PeerDropConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `relay_url` is not a valid WebSocket URL
    /// - `room` is empty
    /// - `stun_servers` is empty
    /// - `data_channel_label` is empty
    /// - `chunk_pacing_ms` exceeds 1000
    /// - `negotiation_timeout_secs` exceeds 600
    /// - the reconnect policy has a zero attempt budget or inverted delays
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.relay_url.starts_with("ws://") && !self.relay_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "relay_url must start with ws:// or wss://, got {}",
                self.relay_url
            )));
        }

        if self.room.is_empty() {
            return Err(Error::InvalidConfig("room must not be empty".to_string()));
        }

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if self.data_channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "data_channel_label must not be empty".to_string(),
            ));
        }

        if self.chunk_pacing_ms > 1000 {
            return Err(Error::InvalidConfig(format!(
                "chunk_pacing_ms must be in range 0-1000, got {}",
                self.chunk_pacing_ms
            )));
        }

        if self.negotiation_timeout_secs > 600 {
            return Err(Error::InvalidConfig(format!(
                "negotiation_timeout_secs must be in range 0-600, got {}",
                self.negotiation_timeout_secs
            )));
        }

        if self.reconnect.max_attempts == 0 || self.reconnect.max_attempts > 100 {
            return Err(Error::InvalidConfig(format!(
                "reconnect.max_attempts must be in range 1-100, got {}",
                self.reconnect.max_attempts
            )));
        }

        if self.reconnect.delay_initial_ms == 0 {
            return Err(Error::InvalidConfig(
                "reconnect.delay_initial_ms must be at least 1".to_string(),
            ));
        }

        if self.reconnect.delay_max_ms < self.reconnect.delay_initial_ms {
            return Err(Error::InvalidConfig(format!(
                "reconnect.delay_max_ms ({}) must not be below delay_initial_ms ({})",
                self.reconnect.delay_max_ms, self.reconnect.delay_initial_ms
            )));
        }

        Ok(())
    }

    /// Create a configuration preset optimized for low latency
    ///
    /// Best for peers on the same LAN where negotiation is fast and chunk
    /// pacing mostly wastes time.
    ///
    /// Settings:
    /// - Chunk pacing: 2ms
    /// - Negotiation timeout: 10 seconds
    /// - Reconnection: 3 quick attempts
    ///
    /// # Example
    ///
    /// ```
    /// use peerdrop::config::PeerDropConfig;
    ///
    /// let config = PeerDropConfig::low_latency_preset("ws://localhost:9021");
    /// assert_eq!(config.chunk_pacing_ms, 2);
    /// assert_eq!(config.negotiation_timeout_secs, 10);
    /// ```
    pub fn low_latency_preset(relay_url: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            chunk_pacing_ms: 2,
            negotiation_timeout_secs: 10,
            reconnect: ReconnectPolicy {
                max_attempts: 3,
                delay_initial_ms: 500,
                delay_max_ms: 5000,
            },
            ..Self::default()
        }
    }

    /// Create a configuration preset optimized for mobile networks
    ///
    /// Best for peers on cellular or otherwise flaky links where the relay
    /// connection drops often and data channels need gentler pacing.
    ///
    /// Settings:
    /// - Chunk pacing: 25ms
    /// - Negotiation timeout: 60 seconds (more time for cellular handoffs)
    /// - Reconnection: 8 attempts, up to 1 minute apart
    /// - Requires TURN servers (set via `with_turn_servers()`)
    ///
    /// # Example
    ///
    /// ```
    /// use peerdrop::config::{PeerDropConfig, TurnServerConfig};
    ///
    /// let config = PeerDropConfig::mobile_network_preset("ws://localhost:9021")
    ///     .with_turn_servers(vec![
    ///         TurnServerConfig {
    ///             url: "turn:turn.example.com:3478".to_string(),
    ///             username: "user".to_string(),
    ///             credential: "pass".to_string(),
    ///         }
    ///     ]);
    /// assert_eq!(config.chunk_pacing_ms, 25);
    /// ```
    pub fn mobile_network_preset(relay_url: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            chunk_pacing_ms: 25,
            negotiation_timeout_secs: 60,
            reconnect: ReconnectPolicy {
                max_attempts: 8,
                delay_initial_ms: 2000,
                delay_max_ms: 60000,
            },
            ..Self::default()
        }
    }

    /// Add TURN servers to this configuration
    ///
    /// Useful for chaining with preset methods.
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the peer ID for this configuration
    ///
    /// Useful for chaining with preset methods.
    pub fn with_peer_id(mut self, peer_id: &str) -> Self {
        self.peer_id = Some(peer_id.to_string());
        self
    }

    /// Set the room for this configuration
    ///
    /// Useful for chaining with preset methods.
    pub fn with_room(mut self, room: &str) -> Self {
        self.room = room.to_string();
        self
    }

    /// Set the directory where received files are written
    ///
    /// Useful for chaining with preset methods.
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = Some(dir.into());
        self
    }
}
