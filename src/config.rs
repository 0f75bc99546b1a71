//! Configuration for the signaling coordinator and the tracker client.

use std::time::Duration;

/// Tuning for the per-torrent signaling coordinator.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// STUN server handed to every peer connection. No TURN.
    pub stun_server: String,
    /// Label given to the data channel created on local offers.
    pub data_channel_label: String,
    /// Client fingerprint prefix for freshly minted peer ids.
    pub peer_id_prefix: String,
    /// How long a nascent connection may take to reach an open data
    /// channel before it is torn down.
    pub connection_deadline: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            stun_server: "stun:stun.l.google.com:19302".to_string(),
            data_channel_label: "webtorrent".to_string(),
            peer_id_prefix: "-WT0001-".to_string(),
            connection_deadline: Duration::from_secs(20),
        }
    }
}

/// Tuning for one WebSocket tracker client.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// User-Agent header sent on the WebSocket handshake.
    pub user_agent: String,
    /// When set, the User-Agent is suppressed unless the torrent is private.
    pub anonymous_mode: bool,
    /// Whether the torrent this client announces for is private.
    pub private_torrent: bool,
    /// Floor applied to the announce interval reported by the tracker.
    pub min_announce_interval: Duration,
    /// Soft cap on the outbound message queue; the oldest entry is dropped
    /// on overflow.
    pub max_pending_messages: usize,
    /// Upper bound on a single inbound WebSocket frame.
    pub max_frame_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("webtorrent-transport/{}", env!("CARGO_PKG_VERSION")),
            anonymous_mode: false,
            private_torrent: false,
            min_announce_interval: Duration::from_secs(60),
            max_pending_messages: 256,
            max_frame_size: 2 * 1024 * 1024,
        }
    }
}

impl TrackerConfig {
    /// The User-Agent to send, if any.
    pub(crate) fn effective_user_agent(&self) -> Option<&str> {
        if self.user_agent.is_empty() {
            return None;
        }
        if self.anonymous_mode && !self.private_torrent {
            return None;
        }
        Some(&self.user_agent)
    }
}
