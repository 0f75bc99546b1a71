//! WebRTC side of the transport: the engine seam, the signaling
//! coordinator and the data-channel byte stream.
//!
//! The underlying WebRTC engine (ICE, DTLS, SCTP) is consumed through the
//! [`RtcEngine`] family of traits so the coordinator and stream logic can
//! be exercised against the in-memory [`mock`] engine. Engine callbacks
//! fire on threads the engine owns; implementations reduce every callback
//! to a channel send, and the owning task drains those channels.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Error;

pub mod mock;
pub mod signaling;
pub mod stream;
pub mod webrtc;

/// Which half of an SDP exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

/// Lifecycle notifications for one nascent peer connection.
pub enum ConnectionEvent {
    /// ICE gathering finished; `sdp` is the complete local description.
    LocalDescription { sdp: String },
    /// A data channel reached the open state. `None` means the channel the
    /// local side created earlier; `Some` carries a remote-initiated one.
    ChannelOpen { pair: Option<RtcChannelPair> },
    /// The engine reported the connection as failed.
    Failed,
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::LocalDescription { sdp } => f
                .debug_struct("LocalDescription")
                .field("sdp_len", &sdp.len())
                .finish(),
            ConnectionEvent::ChannelOpen { pair } => f
                .debug_struct("ChannelOpen")
                .field("remote_initiated", &pair.is_some())
                .finish(),
            ConnectionEvent::Failed => f.write_str("Failed"),
        }
    }
}

/// Inbound traffic notifications for one data channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// One message received from the peer.
    Message(Vec<u8>),
    /// The channel was closed, locally or by the peer.
    Closed,
}

/// An open (or opening) data channel together with the receiver its engine
/// glue feeds inbound events into.
pub struct RtcChannelPair {
    pub channel: Arc<dyn RtcChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Everything the stream adapter needs to own a negotiated peer: the
/// connection keeps the transport alive, the channel pair carries data.
pub struct RtcStreamInit {
    pub connection: Arc<dyn RtcConnection>,
    pub channel: RtcChannelPair,
}

/// Factory for peer connections.
#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Creates a fresh peer connection and the receiver its lifecycle
    /// events arrive on.
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn RtcConnection>, mpsc::UnboundedReceiver<ConnectionEvent>), Error>;
}

/// One peer connection, consumed strictly through the surface the
/// signaling flow needs.
#[async_trait]
pub trait RtcConnection: Send + Sync {
    /// Creates a data channel on this connection. For an engine that
    /// negotiates automatically this also kicks off offer generation; the
    /// resulting description arrives as [`ConnectionEvent::LocalDescription`].
    async fn create_channel(&self, label: &str) -> Result<RtcChannelPair, Error>;

    /// Applies the remote description. Applying an offer triggers answer
    /// generation, reported the same way as offer generation.
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), Error>;

    /// Local transport address as `"ip:port"`, if the engine knows it.
    async fn local_address(&self) -> Option<String>;

    /// Remote transport address as `"ip:port"`, if the engine knows it.
    async fn remote_address(&self) -> Option<String>;

    async fn close(&self);
}

/// Send half of a data channel. Inbound messages arrive on the paired
/// [`ChannelEvent`] receiver, never through this trait.
#[async_trait]
pub trait RtcChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Hands one message to the channel, returning the number of bytes
    /// accepted (always the full message).
    async fn send(&self, data: Bytes) -> Result<usize, Error>;

    fn is_closed(&self) -> bool;

    async fn close(&self);
}
