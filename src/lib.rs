//! WebTorrent-compatible peer discovery and peer transport.
//!
//! This crate is the browser-reachable edge of a BitTorrent engine: it
//! discovers peers whose only transport is a WebRTC data channel, brokered
//! by a WebSocket tracker speaking the WebTorrent JSON protocol, and hands
//! each negotiated channel to the engine as an ordinary byte stream.
//!
//! Three components cooperate:
//!
//! - [`RtcSignaling`] generates batches of WebRTC offers for one torrent,
//!   accepts remote offers and answers routed in from trackers, and
//!   delivers every opened data channel together with its peer id.
//! - [`RtcStream`] wraps an open data channel as a reliable, ordered
//!   duplex byte stream with TCP-socket semantics, so the BitTorrent
//!   protocol layer stays transport agnostic.
//! - [`WebsocketTracker`] keeps one persistent `wss://` connection per
//!   tracker and multiplexes announces and offer/answer exchanges for any
//!   number of swarms over it.
//!
//! The WebRTC engine itself is consumed behind the [`rtc::RtcEngine`]
//! seam; production code uses [`rtc::webrtc::WebRtcEngine`], tests drive
//! the deterministic [`rtc::mock`] engine.
//!
//! # Wiring
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use webtorrent_transport::rtc::webrtc::WebRtcEngine;
//! use webtorrent_transport::{RtcSignaling, SignalingConfig, RtcStream};
//!
//! # async fn wiring() {
//! let config = SignalingConfig::default();
//! let engine = WebRtcEngine::new(&config);
//! let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
//! let signaling = RtcSignaling::spawn(engine, config, peer_tx);
//!
//! // Offers go out with the next announce; negotiated peers come back.
//! let offers = signaling.generate_offers(3).await.unwrap();
//! while let Some(peer) = peer_rx.recv().await {
//!     let stream = RtcStream::new(peer.init);
//!     // hand (peer.peer_id, stream) to the torrent engine
//! }
//! # }
//! ```

pub mod config;
pub mod error;
pub mod latin1;
pub mod rtc;
pub mod tracker;
pub mod types;

pub use config::{SignalingConfig, TrackerConfig};
pub use error::Error;
pub use rtc::signaling::{IncomingPeer, RtcSignaling};
pub use rtc::stream::RtcStream;
pub use rtc::{RtcChannel, RtcChannelPair, RtcConnection, RtcEngine, RtcStreamInit, SdpKind};
pub use tracker::{
    AnnounceEvent, AnnounceRequest, TrackerAnswer, TrackerCallback, TrackerMessage,
    TrackerResponse, WebsocketTracker,
};
pub use types::{AnswerSink, InfoHash, OfferId, PeerId, RtcAnswer, RtcOffer};
