//! Deterministic in-memory engine used by the test suites.
//!
//! Nothing here touches the network. Gathering completion, channel opening
//! and connection failure only happen when a test triggers them, so
//! signaling and stream scenarios run without ICE or timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::{
    ChannelEvent, ConnectionEvent, RtcChannel, RtcChannelPair, RtcConnection, RtcEngine, SdpKind,
};
use crate::error::Error;

/// Engine that records every connection it creates so tests can drive them.
#[derive(Default)]
pub struct MockEngine {
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// The `index`-th connection created through this engine.
    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.connections.lock()[index].clone()
    }
}

#[async_trait]
impl RtcEngine for MockEngine {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn RtcConnection>, mpsc::UnboundedReceiver<ConnectionEvent>), Error> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(MockConnection {
            events: event_tx,
            state: Mutex::new(MockConnectionState::default()),
        });
        self.connections.lock().push(conn.clone());
        Ok((conn, event_rx))
    }
}

#[derive(Default)]
struct MockConnectionState {
    channels: Vec<MockChannelHandle>,
    remote_descriptions: Vec<(SdpKind, String)>,
    local_address: Option<String>,
    remote_address: Option<String>,
    closed: bool,
}

pub struct MockConnection {
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Mutex<MockConnectionState>,
}

impl MockConnection {
    /// Emits the local description, as if ICE gathering just finished.
    pub fn complete_gathering(&self, sdp: &str) {
        let _ = self.events.send(ConnectionEvent::LocalDescription {
            sdp: sdp.to_string(),
        });
    }

    /// Reports the locally created channel as open.
    pub fn open_channel(&self) {
        let _ = self.events.send(ConnectionEvent::ChannelOpen { pair: None });
    }

    /// Opens a remote-initiated channel and returns the test-side handle.
    pub fn open_remote_channel(&self, label: &str) -> MockChannelHandle {
        let (pair, handle) = mock_channel(label);
        let _ = self.events.send(ConnectionEvent::ChannelOpen { pair: Some(pair) });
        handle
    }

    /// Reports the connection as failed.
    pub fn fail(&self) {
        let _ = self.events.send(ConnectionEvent::Failed);
    }

    pub fn set_addresses(&self, local: Option<&str>, remote: Option<&str>) {
        let mut state = self.state.lock();
        state.local_address = local.map(str::to_string);
        state.remote_address = remote.map(str::to_string);
    }

    /// Remote descriptions applied so far, in order.
    pub fn remote_descriptions(&self) -> Vec<(SdpKind, String)> {
        self.state.lock().remote_descriptions.clone()
    }

    /// Handle for the `index`-th locally created channel.
    pub fn channel(&self, index: usize) -> MockChannelHandle {
        self.state.lock().channels[index].clone()
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl RtcConnection for MockConnection {
    async fn create_channel(&self, label: &str) -> Result<RtcChannelPair, Error> {
        let (pair, handle) = mock_channel(label);
        self.state.lock().channels.push(handle);
        Ok(pair)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), Error> {
        self.state
            .lock()
            .remote_descriptions
            .push((kind, sdp.to_string()));
        Ok(())
    }

    async fn local_address(&self) -> Option<String> {
        self.state.lock().local_address.clone()
    }

    async fn remote_address(&self) -> Option<String> {
        self.state.lock().remote_address.clone()
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

/// Builds a channel pair plus the handle tests use to inject inbound
/// traffic and inspect outbound traffic.
pub fn mock_channel(label: &str) -> (RtcChannelPair, MockChannelHandle) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let channel = Arc::new(MockChannel {
        label: label.to_string(),
        sent: Mutex::new(Vec::new()),
        closed: AtomicBool::new(false),
        stalled: AtomicBool::new(false),
        release: Notify::new(),
    });
    let pair = RtcChannelPair {
        channel: channel.clone(),
        events: event_rx,
    };
    let handle = MockChannelHandle { channel, event_tx };
    (pair, handle)
}

pub struct MockChannel {
    label: String,
    sent: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
    stalled: AtomicBool,
    release: Notify,
}

impl MockChannel {
    /// Everything sent through the channel so far.
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Makes subsequent sends block, as a channel with a full outbound
    /// buffer would.
    pub fn stall_sends(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Lets stalled sends proceed again.
    pub fn release_sends(&self) {
        self.stalled.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }
}

#[async_trait]
impl RtcChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<usize, Error> {
        while self.stalled.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let len = data.len();
        self.sent.lock().push(data);
        Ok(len)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Test-side view of a mock channel.
#[derive(Clone)]
pub struct MockChannelHandle {
    pub channel: Arc<MockChannel>,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl MockChannelHandle {
    /// Delivers one inbound message, as the engine's worker thread would.
    pub fn inject(&self, data: &[u8]) {
        let _ = self.event_tx.send(ChannelEvent::Message(data.to_vec()));
    }

    /// Reports the channel as closed by the remote side.
    pub fn close_remote(&self) {
        self.channel.closed.store(true, Ordering::SeqCst);
        let _ = self.event_tx.send(ChannelEvent::Closed);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.channel.sent()
    }
}
