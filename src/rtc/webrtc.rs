//! Production engine backed by the `webrtc` crate.
//!
//! Every callback registered here fires on a thread owned by the engine;
//! the only thing a callback does is send on a channel. Offer and answer
//! generation (including the ICE gathering wait) runs in spawned tasks
//! that report back through the same event channel, so the signaling
//! coordinator sees the auto-negotiating surface described by
//! [`RtcConnection`](super::RtcConnection).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    ChannelEvent, ConnectionEvent, RtcChannel, RtcChannelPair, RtcConnection, RtcEngine, SdpKind,
};
use crate::config::SignalingConfig;
use crate::error::Error;

/// Engine that creates one `RTCPeerConnection` per [`connect`] call,
/// configured with the fixed STUN server from [`SignalingConfig`].
///
/// [`connect`]: RtcEngine::connect
pub struct WebRtcEngine {
    stun_server: String,
}

impl WebRtcEngine {
    pub fn new(config: &SignalingConfig) -> Arc<Self> {
        Arc::new(Self {
            stun_server: config.stun_server.clone(),
        })
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn RtcConnection>, mpsc::UnboundedReceiver<ConnectionEvent>), Error> {
        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.stun_server.clone()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(Error::engine)?,
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let tx = event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!(target: "rtc", ?state, "peer connection state changed");
                if state == RTCPeerConnectionState::Failed {
                    let _ = tx.send(ConnectionEvent::Failed);
                }
            })
        }));

        // A remote-initiated channel is reported once it reaches open.
        let tx = event_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                let pair = Arc::new(Mutex::new(Some(wrap_channel(dc.clone()))));
                dc.on_open(Box::new(move || {
                    let tx = tx.clone();
                    let pair = pair.clone();
                    Box::pin(async move {
                        if let Some(pair) = pair.lock().take() {
                            let _ = tx.send(ConnectionEvent::ChannelOpen { pair: Some(pair) });
                        }
                    })
                }));
            })
        }));

        let connection = Arc::new(WebRtcConnection {
            pc,
            events: event_tx,
        });
        Ok((connection, event_rx))
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl WebRtcConnection {
    /// Generates the local description of `kind` and reports it once ICE
    /// gathering has embedded every candidate.
    fn spawn_negotiation(&self, kind: SdpKind) {
        let pc = self.pc.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(err) = negotiate(&pc, &events, kind).await {
                warn!(target: "rtc", %kind, error = %err, "negotiation failed");
                let _ = events.send(ConnectionEvent::Failed);
            }
        });
    }
}

async fn negotiate(
    pc: &Arc<RTCPeerConnection>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
    kind: SdpKind,
) -> Result<(), Error> {
    match kind {
        SdpKind::Offer => {
            let offer = pc.create_offer(None).await.map_err(Error::engine)?;
            pc.set_local_description(offer).await.map_err(Error::engine)?;
        }
        SdpKind::Answer => {
            let answer = pc.create_answer(None).await.map_err(Error::engine)?;
            pc.set_local_description(answer)
                .await
                .map_err(Error::engine)?;
        }
    }

    // No trickle: wait for gathering so the description is complete.
    let mut gathered = pc.gathering_complete_promise().await;
    let _ = gathered.recv().await;

    let description = pc
        .local_description()
        .await
        .ok_or_else(|| Error::Engine("missing local description".into()))?;
    let _ = events.send(ConnectionEvent::LocalDescription {
        sdp: description.sdp,
    });
    Ok(())
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn create_channel(&self, label: &str) -> Result<RtcChannelPair, Error> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(Error::engine)?;

        let pair = wrap_channel(dc.clone());
        let tx = self.events.clone();
        dc.on_open(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ConnectionEvent::ChannelOpen { pair: None });
            })
        }));

        // Creating the channel is what starts a local offer.
        self.spawn_negotiation(SdpKind::Offer);
        Ok(pair)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), Error> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(Error::engine)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(Error::engine)?;

        if kind == SdpKind::Offer {
            self.spawn_negotiation(SdpKind::Answer);
        }
        Ok(())
    }

    async fn local_address(&self) -> Option<String> {
        let pair = self
            .pc
            .sctp()
            .transport()
            .ice_transport()
            .get_selected_candidate_pair()
            .await?;
        Some(format!("{}:{}", pair.local.address, pair.local.port))
    }

    async fn remote_address(&self) -> Option<String> {
        let pair = self
            .pc
            .sctp()
            .transport()
            .ice_transport()
            .get_selected_candidate_pair()
            .await?;
        Some(format!("{}:{}", pair.remote.address, pair.remote.port))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(target: "rtc", error = %err, "peer connection close failed");
        }
    }
}

/// Registers the message and close callbacks on a data channel and returns
/// it as a channel pair.
fn wrap_channel(dc: Arc<RTCDataChannel>) -> RtcChannelPair {
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let tx = event_tx.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(ChannelEvent::Message(message.data.to_vec()));
        })
    }));

    dc.on_close(Box::new(move || {
        let tx = event_tx.clone();
        Box::pin(async move {
            let _ = tx.send(ChannelEvent::Closed);
        })
    }));

    RtcChannelPair {
        channel: Arc::new(WebRtcChannel { dc }),
        events: event_rx,
    }
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl RtcChannel for WebRtcChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    async fn send(&self, data: Bytes) -> Result<usize, Error> {
        self.dc.send(&data).await.map_err(Error::engine)
    }

    fn is_closed(&self) -> bool {
        matches!(
            self.dc.ready_state(),
            RTCDataChannelState::Closing | RTCDataChannelState::Closed
        )
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            debug!(target: "rtc", error = %err, "data channel close failed");
        }
    }
}
