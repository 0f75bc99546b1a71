//! JSON-over-WebSocket tracker client.
//!
//! One client holds one persistent `wss://` connection and multiplexes
//! announces and offer/answer exchanges for any number of swarms over it.
//! The cloneable [`WebsocketTracker`] handle feeds a single actor task
//! that owns the socket, the outbound queue and the per-swarm callback
//! table; the writer half of the socket lives in its own task and reports
//! completions back, so at most one write is ever outstanding.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::config::TrackerConfig;
use crate::error::Error;
use crate::types::{AnswerSink, InfoHash, PeerId, RtcAnswer, RtcOffer};

pub mod wire;

/// Retry hint handed to callbacks on any tracker failure. The embedding
/// engine owns the actual reconnect policy.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(120);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Announce event, when the announce is more than a periodic refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Completed,
    Started,
    Stopped,
    Paused,
}

impl AnnounceEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Paused => "paused",
        }
    }
}

/// One announce, including the WebRTC offers to distribute.
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub corrupt: u64,
    pub num_want: u32,
    /// Random key identifying this client across announces, transmitted
    /// as eight uppercase hex digits.
    pub key: u32,
    pub event: Option<AnnounceEvent>,
    pub offers: Vec<RtcOffer>,
}

/// Outbound reply to a remote offer. Fire and forget: no callback.
#[derive(Debug, Clone)]
pub struct TrackerAnswer {
    pub info_hash: InfoHash,
    /// Local peer id the remote side should address.
    pub peer_id: PeerId,
    pub answer: RtcAnswer,
}

/// The two kinds of outbound tracker traffic.
#[derive(Debug)]
pub enum TrackerMessage {
    Announce(AnnounceRequest),
    Answer(TrackerAnswer),
}

/// Scalar part of a tracker announce reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    pub interval: Duration,
    pub min_interval: Duration,
    pub complete: i64,
    pub incomplete: i64,
    pub downloaded: i64,
}

/// Callbacks a swarm registers with the tracker client. Offers and
/// answers pushed by the server are routed through the same interface as
/// direct announce replies.
pub trait TrackerCallback: Send + Sync {
    fn on_rtc_offer(&self, offer: RtcOffer);
    fn on_rtc_answer(&self, answer: RtcAnswer);
    fn on_tracker_response(&self, response: TrackerResponse);
    fn on_tracker_error(&self, error: &Error, retry_in: Duration);
}

/// Handle to a running tracker client.
#[derive(Clone)]
pub struct WebsocketTracker {
    commands: mpsc::UnboundedSender<Command>,
}

impl WebsocketTracker {
    /// Spawns the client actor for `url`. Only `wss://` URLs are
    /// accepted; connecting starts on [`start`](Self::start).
    pub fn spawn(url: &str, config: TrackerConfig) -> Result<Self, Error> {
        let url = Url::parse(url)?;
        if url.scheme() != "wss" {
            return Err(Error::UnsupportedUrl(url.to_string()));
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = TrackerInner::new(url, config, command_tx.clone());
        tokio::spawn(run(inner, command_rx, event_rx, event_tx));
        Ok(Self {
            commands: command_tx,
        })
    }

    /// Begins connecting unless already open or connecting.
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Closes the socket if it was open or connecting. Queued messages
    /// are kept for a later `start`.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Enqueues an announce. If the socket is open the queue is flushed.
    pub fn queue_request(&self, request: AnnounceRequest, callback: &Arc<dyn TrackerCallback>) {
        let _ = self.commands.send(Command::QueueRequest {
            request,
            callback: Arc::downgrade(callback),
        });
    }

    /// Enqueues an answer to a remote offer.
    pub fn queue_answer(&self, answer: TrackerAnswer) {
        let _ = self.commands.send(Command::QueueAnswer(answer));
    }
}

enum Command {
    Start,
    Close,
    QueueRequest {
        request: AnnounceRequest,
        callback: Weak<dyn TrackerCallback>,
    },
    QueueAnswer(TrackerAnswer),
}

enum Event {
    Connected(Box<WsStream>),
    ConnectFailed(Error),
    WriteDone,
    WriteFailed(Error),
}

enum SocketState {
    Idle,
    Connecting { task: JoinHandle<()> },
    Open {
        frames: mpsc::UnboundedSender<String>,
        writer: JoinHandle<()>,
    },
}

struct PendingSend {
    message: TrackerMessage,
    callback: Option<Weak<dyn TrackerCallback>>,
}

struct TrackerInner {
    url: Url,
    config: TrackerConfig,
    /// Handed to answer sinks so replies re-enter through the queue.
    commands: mpsc::UnboundedSender<Command>,
    pending: VecDeque<PendingSend>,
    /// The message currently on the wire, held outside `pending` so the
    /// overflow cap can never drop it. `Some` means a write is
    /// outstanding.
    in_flight: Option<PendingSend>,
    /// Routes server-pushed offers and answers to the swarm that last
    /// announced each info-hash. Entries outlive individual announces.
    callbacks: HashMap<InfoHash, Weak<dyn TrackerCallback>>,
    requester: Option<Weak<dyn TrackerCallback>>,
    state: SocketState,
}

async fn run(
    mut inner: TrackerInner,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<Event>,
    event_tx: mpsc::UnboundedSender<Event>,
) {
    let mut reader: Option<SplitStream<WsStream>> = None;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Start) => inner.start(&event_tx),
                Some(Command::Close) => {
                    inner.close_socket();
                    reader = None;
                }
                Some(Command::QueueRequest { request, callback }) => {
                    inner.queue_message(TrackerMessage::Announce(request), Some(callback));
                }
                Some(Command::QueueAnswer(answer)) => {
                    inner.queue_message(TrackerMessage::Answer(answer), None);
                }
                None => break,
            },
            Some(event) = events.recv() => match event {
                Event::Connected(socket) => reader = inner.on_connected(*socket, &event_tx),
                Event::ConnectFailed(error) | Event::WriteFailed(error) => {
                    inner.on_transport_error(error);
                    reader = None;
                }
                Event::WriteDone => inner.on_write_done(),
            },
            frame = next_frame(&mut reader), if reader.is_some() => match frame {
                Some(Ok(Message::Text(text))) => inner.on_frame(&text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => inner.on_frame(&text),
                    Err(_) => inner.report_bad_frame("frame is not valid UTF-8"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    inner.on_transport_error(Error::NotConnected);
                    reader = None;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    inner.on_transport_error(err.into());
                    reader = None;
                }
            },
        }
    }
    inner.close_socket();
    debug!(target: "tracker", "tracker client stopped");
}

async fn next_frame(
    reader: &mut Option<SplitStream<WsStream>>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match reader {
        Some(reader) => reader.next().await,
        None => std::future::pending().await,
    }
}

impl TrackerInner {
    fn new(url: Url, config: TrackerConfig, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            url,
            config,
            commands,
            pending: VecDeque::new(),
            in_flight: None,
            callbacks: HashMap::new(),
            requester: None,
            state: SocketState::Idle,
        }
    }

    fn start(&mut self, events: &mpsc::UnboundedSender<Event>) {
        if !matches!(self.state, SocketState::Idle) {
            return;
        }
        debug!(target: "tracker", url = %self.url, "connecting");
        let url = self.url.clone();
        let config = self.config.clone();
        let events = events.clone();
        let task = tokio::spawn(async move {
            match establish(&url, &config).await {
                Ok(socket) => {
                    let _ = events.send(Event::Connected(Box::new(socket)));
                }
                Err(err) => {
                    let _ = events.send(Event::ConnectFailed(err));
                }
            }
        });
        self.state = SocketState::Connecting { task };
    }

    fn close_socket(&mut self) {
        match std::mem::replace(&mut self.state, SocketState::Idle) {
            SocketState::Idle => {}
            SocketState::Connecting { task } => task.abort(),
            SocketState::Open { writer, .. } => writer.abort(),
        }
        // A write that never completed goes back to the front of the
        // queue, to be retried on the next connection.
        if let Some(in_flight) = self.in_flight.take() {
            self.pending.push_front(in_flight);
        }
    }

    fn on_connected(
        &mut self,
        socket: WsStream,
        events: &mpsc::UnboundedSender<Event>,
    ) -> Option<SplitStream<WsStream>> {
        if !matches!(self.state, SocketState::Connecting { .. }) {
            // Closed while the handshake was in flight.
            return None;
        }
        debug!(target: "tracker", url = %self.url, "connected");

        let (mut sink, stream) = socket.split();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
        let events = events.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                match sink.send(Message::Text(frame)).await {
                    Ok(()) => {
                        if events.send(Event::WriteDone).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = events.send(Event::WriteFailed(err.into()));
                        return;
                    }
                }
            }
        });

        self.state = SocketState::Open {
            frames: frame_tx,
            writer,
        };
        self.send_pending();
        Some(stream)
    }

    fn queue_message(&mut self, message: TrackerMessage, callback: Option<Weak<dyn TrackerCallback>>) {
        if self.pending.len() >= self.config.max_pending_messages {
            warn!(target: "tracker", "outbound queue full, dropping oldest message");
            self.pending.pop_front();
        }
        self.pending.push_back(PendingSend { message, callback });
        if matches!(self.state, SocketState::Open { .. }) {
            self.send_pending();
        }
    }

    /// Encodes and sends the head of the queue, parking it in the
    /// in-flight slot until the writer reports completion.
    fn send_pending(&mut self) {
        while self.in_flight.is_none() {
            let SocketState::Open { frames, .. } = &self.state else {
                return;
            };
            let Some(next) = self.pending.pop_front() else {
                return;
            };
            match wire::encode(&next.message) {
                Ok(frame) => {
                    debug!(target: "tracker", len = frame.len(), "writing frame");
                    if frames.send(frame).is_err() {
                        // Writer is gone; its failure event cleans up.
                        self.pending.push_front(next);
                        return;
                    }
                    self.in_flight = Some(next);
                }
                Err(err) => {
                    warn!(target: "tracker", error = %err, "dropping unencodable message");
                }
            }
        }
    }

    fn on_write_done(&mut self) {
        if let Some(sent) = self.in_flight.take() {
            if let Some(callback) = sent.callback {
                if callback.upgrade().is_some() {
                    self.requester = Some(callback.clone());
                    if let TrackerMessage::Announce(request) = &sent.message {
                        self.callbacks.insert(request.info_hash, callback);
                    }
                }
            }
        }
        self.send_pending();
    }

    /// Tears the connection down and tells every interested swarm, with
    /// the standard retry hint. The client is ready for a later `start`.
    fn on_transport_error(&mut self, error: Error) {
        warn!(target: "tracker", url = %self.url, error = %error, "tracker connection failed");
        self.close_socket();

        let mut notified: Vec<Arc<dyn TrackerCallback>> = Vec::new();
        let pending_callbacks = self
            .pending
            .drain(..)
            .filter_map(|send| send.callback)
            .collect::<Vec<_>>();
        for callback in pending_callbacks
            .iter()
            .chain(self.callbacks.values())
            .chain(self.requester.iter())
        {
            let Some(callback) = callback.upgrade() else {
                continue;
            };
            if notified.iter().any(|seen| Arc::ptr_eq(seen, &callback)) {
                continue;
            }
            callback.on_tracker_error(&error, RETRY_INTERVAL);
            notified.push(callback);
        }
    }

    fn report_bad_frame(&self, reason: &str) {
        let error = Error::BadMessage(reason.to_string());
        warn!(target: "tracker", url = %self.url, %reason, "bad tracker frame");
        if let Some(callback) = self.requester.as_ref().and_then(Weak::upgrade) {
            callback.on_tracker_error(&error, RETRY_INTERVAL);
        }
    }

    /// Dispatches one inbound frame: offer, answer and announce response
    /// parts may all be present on the same message.
    fn on_frame(&mut self, text: &str) {
        debug!(target: "tracker", len = text.len(), "read frame");
        let message = match wire::decode(text, self.config.min_announce_interval) {
            Ok(message) => message,
            Err(err) => {
                warn!(target: "tracker", error = %err, "undecodable tracker frame");
                if let Some(callback) = self.requester.as_ref().and_then(Weak::upgrade) {
                    callback.on_tracker_error(&err, RETRY_INTERVAL);
                }
                return;
            }
        };

        let Some(callback) = self
            .callbacks
            .get(&message.info_hash)
            .and_then(Weak::upgrade)
        else {
            debug!(
                target: "tracker",
                info_hash = %message.info_hash,
                "no callback registered for info hash"
            );
            return;
        };

        if let Some(offer) = message.offer {
            let commands = self.commands.clone();
            let info_hash = message.info_hash;
            let sink: AnswerSink = Box::new(move |local_pid, answer| {
                let _ = commands.send(Command::QueueAnswer(TrackerAnswer {
                    info_hash,
                    peer_id: local_pid,
                    answer,
                }));
            });
            callback.on_rtc_offer(RtcOffer {
                id: offer.offer_id,
                pid: offer.peer_id,
                sdp: offer.sdp,
                answer_sink: Some(sink),
            });
        }

        if let Some(answer) = message.answer {
            callback.on_rtc_answer(answer);
        }

        if let Some(response) = message.response {
            callback.on_tracker_response(response);
        }
    }
}

/// Resolves, connects, completes the TLS and WebSocket handshakes.
async fn establish(url: &Url, config: &TrackerConfig) -> Result<WsStream, Error> {
    let mut request = url.as_str().into_client_request()?;
    if let Some(user_agent) = config.effective_user_agent() {
        match HeaderValue::from_str(user_agent) {
            Ok(value) => {
                request.headers_mut().insert(USER_AGENT, value);
            }
            Err(_) => warn!(target: "tracker", "configured user agent is not a valid header"),
        }
    }

    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_frame_size),
        max_frame_size: Some(config.max_frame_size),
        ..Default::default()
    };
    let (socket, _response) = connect_async_with_config(request, Some(ws_config), false).await?;
    Ok(socket)
}
