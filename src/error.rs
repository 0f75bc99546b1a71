//! Error taxonomy for the transport core.
//!
//! Every failure surfaced to the embedding engine maps onto one of these
//! kinds; nothing in this crate is fatal to the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Operation on a closed stream or socket.
    #[error("not connected")]
    NotConnected,

    /// A pending operation was cancelled by `cancel` or `close`.
    #[error("operation aborted")]
    OperationAborted,

    /// A second read or write was issued while one was already pending, or
    /// the WebRTC engine did not expose the requested endpoint.
    #[error("operation not supported")]
    OperationNotSupported,

    /// The WebRTC engine reported an endpoint string that does not parse as
    /// `ip:port`.
    #[error("address family not supported")]
    AddressFamilyNotSupported,

    /// The WebRTC engine reported the connection as failed.
    #[error("connection refused")]
    ConnectionRefused,

    /// A nascent connection missed its negotiation deadline.
    #[error("timed out")]
    TimedOut,

    /// The far side of an internal channel is gone, usually because the
    /// owning actor shut down.
    #[error("channel closed")]
    ChannelClosed,

    /// A tracker frame could not be decoded: JSON parse failure, missing or
    /// mis-sized binary field, or a code point outside the Latin-1 range.
    #[error("malformed tracker message: {0}")]
    BadMessage(String),

    /// The tracker URL uses a scheme other than `wss`.
    #[error("unsupported tracker url: {0}")]
    UnsupportedUrl(String),

    #[error("invalid tracker url: {0}")]
    Url(#[from] url::ParseError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Failure reported by the underlying WebRTC engine.
    #[error("webrtc engine error: {0}")]
    Engine(String),
}

impl Error {
    pub(crate) fn engine(err: impl std::fmt::Display) -> Self {
        Error::Engine(err.to_string())
    }
}
