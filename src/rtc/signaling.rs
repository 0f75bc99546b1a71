//! Signaling coordinator: drives batches of WebRTC offers and answers for
//! one torrent and hands every negotiated data channel to the engine.
//!
//! All state lives in a single actor task. The cloneable [`RtcSignaling`]
//! handle sends commands; per-connection engine events, deadlines and
//! failures arrive on an internal channel, so the connection table and the
//! batch queue are only ever touched from one place.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ConnectionEvent, RtcChannelPair, RtcConnection, RtcEngine, RtcStreamInit, SdpKind};
use crate::config::SignalingConfig;
use crate::error::Error;
use crate::types::{AnswerSink, OfferId, PeerId, RtcAnswer, RtcOffer};

/// A peer whose data channel just opened, ready to be wrapped in an
/// [`RtcStream`](crate::rtc::stream::RtcStream).
pub struct IncomingPeer {
    pub peer_id: PeerId,
    pub init: RtcStreamInit,
}

/// Handle to a running signaling coordinator.
#[derive(Clone)]
pub struct RtcSignaling {
    commands: mpsc::UnboundedSender<Command>,
}

impl RtcSignaling {
    /// Spawns the coordinator actor. Negotiated peers are delivered on
    /// `peers`; the actor stops when every handle is dropped.
    pub fn spawn(
        engine: Arc<dyn RtcEngine>,
        config: SignalingConfig,
        peers: mpsc::UnboundedSender<IncomingPeer>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let actor = Coordinator {
            engine,
            config,
            peers,
            events: event_tx,
            connections: HashMap::new(),
            batches: VecDeque::new(),
            next_batch: 0,
        };
        tokio::spawn(actor.run(command_rx, event_rx));
        Self {
            commands: command_tx,
        }
    }

    /// Generates up to `count` offers, resolving once every attempt has
    /// produced a description or failed. Requesting zero offers resolves
    /// immediately with an empty list.
    pub async fn generate_offers(&self, count: usize) -> Result<Vec<RtcOffer>, Error> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::GenerateOffers {
                count,
                reply: reply_tx,
            })
            .map_err(|_| Error::ChannelClosed)?;
        reply_rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Routes in a remote offer received from a tracker.
    pub fn process_offer(&self, offer: RtcOffer) {
        let _ = self.commands.send(Command::ProcessOffer(offer));
    }

    /// Routes in a remote answer received from a tracker. Answers for
    /// unknown or already answered offers are dropped.
    pub fn process_answer(&self, answer: RtcAnswer) {
        let _ = self.commands.send(Command::ProcessAnswer(answer));
    }
}

enum Command {
    GenerateOffers {
        count: usize,
        reply: oneshot::Sender<Vec<RtcOffer>>,
    },
    ProcessOffer(RtcOffer),
    ProcessAnswer(RtcAnswer),
}

enum Event {
    LocalDescription { offer_id: OfferId, sdp: String },
    ChannelOpen {
        offer_id: OfferId,
        pair: Option<RtcChannelPair>,
    },
    Failed { offer_id: OfferId, error: Error },
}

enum Role {
    /// We offered; the description feeds the tagged batch.
    Offerer { batch: u64, emitted: bool },
    /// We are answering a remote offer; the description feeds the sink.
    Answerer { sink: Option<AnswerSink> },
}

struct Connection {
    conn: Arc<dyn RtcConnection>,
    /// Kept so the engine does not collect the channel mid-negotiation.
    channel: Option<RtcChannelPair>,
    remote_pid: Option<PeerId>,
    local_pid: PeerId,
    role: Role,
    tasks: Vec<JoinHandle<()>>,
}

struct OfferBatch {
    seq: u64,
    target: usize,
    offers: Vec<RtcOffer>,
    failed: usize,
    reply: Option<oneshot::Sender<Vec<RtcOffer>>>,
}

impl OfferBatch {
    fn is_complete(&self) -> bool {
        self.offers.len() + self.failed >= self.target
    }
}

struct Coordinator {
    engine: Arc<dyn RtcEngine>,
    config: SignalingConfig,
    peers: mpsc::UnboundedSender<IncomingPeer>,
    events: mpsc::UnboundedSender<Event>,
    connections: HashMap<OfferId, Connection>,
    batches: VecDeque<OfferBatch>,
    next_batch: u64,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        debug!(target: "signaling", "coordinator started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        for (_, connection) in self.connections.drain() {
            for task in &connection.tasks {
                task.abort();
            }
            let conn = connection.conn;
            tokio::spawn(async move { conn.close().await });
        }
        debug!(target: "signaling", "coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::GenerateOffers { count, reply } => {
                self.generate_offers(count, reply).await;
            }
            Command::ProcessOffer(offer) => self.process_offer(offer).await,
            Command::ProcessAnswer(answer) => self.process_answer(answer).await,
        }
    }

    async fn generate_offers(&mut self, count: usize, reply: oneshot::Sender<Vec<RtcOffer>>) {
        debug!(target: "signaling", count, "generating offers");
        let seq = self.next_batch;
        self.next_batch += 1;
        self.batches.push_back(OfferBatch {
            seq,
            target: count,
            offers: Vec::new(),
            failed: 0,
            reply: Some(reply),
        });

        for _ in 0..count {
            let offer_id = self.allocate_offer_id();
            let local_pid = PeerId::generate(&self.config.peer_id_prefix);
            let role = Role::Offerer {
                batch: seq,
                emitted: false,
            };
            let conn = match self.open_connection(offer_id, local_pid, role).await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(target: "signaling", %offer_id, error = %err, "offer setup failed");
                    self.record_batch_failure(seq);
                    continue;
                }
            };

            match conn.create_channel(&self.config.data_channel_label).await {
                Ok(pair) => {
                    if let Some(connection) = self.connections.get_mut(&offer_id) {
                        connection.channel = Some(pair);
                    }
                }
                Err(err) => {
                    warn!(target: "signaling", %offer_id, error = %err, "channel setup failed");
                    self.remove_connection(offer_id);
                    self.record_batch_failure(seq);
                }
            }
        }
        self.complete_batches();
    }

    async fn process_offer(&mut self, offer: RtcOffer) {
        debug!(target: "signaling", offer_id = %offer.id, "processing remote offer");
        let RtcOffer {
            id,
            pid,
            sdp,
            answer_sink,
        } = offer;

        if self.connections.contains_key(&id) {
            warn!(target: "signaling", offer_id = %id, "connection already exists for remote offer");
            return;
        }

        let local_pid = PeerId::generate(&self.config.peer_id_prefix);
        let role = Role::Answerer { sink: answer_sink };
        let conn = match self.open_connection(id, local_pid, role).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(target: "signaling", offer_id = %id, error = %err, "answer setup failed");
                return;
            }
        };

        if let Some(connection) = self.connections.get_mut(&id) {
            connection.remote_pid = Some(pid);
        }
        if let Err(err) = conn.set_remote_description(SdpKind::Offer, &sdp).await {
            warn!(target: "signaling", offer_id = %id, error = %err, "remote offer rejected");
            self.remove_connection(id);
        }
    }

    async fn process_answer(&mut self, answer: RtcAnswer) {
        let Some(connection) = self.connections.get_mut(&answer.offer_id) else {
            debug!(target: "signaling", offer_id = %answer.offer_id, "answer does not match an offer");
            return;
        };
        if connection.remote_pid.is_some() {
            debug!(target: "signaling", offer_id = %answer.offer_id, "offer already answered");
            return;
        }

        debug!(target: "signaling", offer_id = %answer.offer_id, "processing remote answer");
        connection.remote_pid = Some(answer.pid);
        let conn = connection.conn.clone();
        if let Err(err) = conn
            .set_remote_description(SdpKind::Answer, &answer.sdp)
            .await
        {
            warn!(
                target: "signaling",
                offer_id = %answer.offer_id, error = %err, "remote answer rejected"
            );
            self.fail_connection(answer.offer_id);
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::LocalDescription { offer_id, sdp } => self.on_local_description(offer_id, sdp),
            Event::ChannelOpen { offer_id, pair } => self.on_channel_open(offer_id, pair),
            Event::Failed { offer_id, error } => {
                debug!(target: "signaling", %offer_id, error = %error, "connection failed");
                self.fail_connection(offer_id);
            }
        }
    }

    fn on_local_description(&mut self, offer_id: OfferId, sdp: String) {
        let Some(connection) = self.connections.get_mut(&offer_id) else {
            return;
        };
        match &mut connection.role {
            Role::Offerer { emitted: true, .. } => {}
            Role::Offerer { batch, emitted } => {
                *emitted = true;
                let batch = *batch;
                let offer = RtcOffer {
                    id: offer_id,
                    pid: connection.local_pid,
                    sdp,
                    answer_sink: None,
                };
                debug!(target: "signaling", %offer_id, "generated offer");
                self.add_batch_offer(batch, offer);
                self.complete_batches();
            }
            Role::Answerer { sink } => {
                let Some(sink) = sink.take() else {
                    warn!(target: "signaling", %offer_id, "remote offer has no answer sink");
                    return;
                };
                let remote_pid = connection
                    .remote_pid
                    .expect("answering connection always records the remote peer");
                debug!(target: "signaling", %offer_id, "generated answer");
                sink(
                    connection.local_pid,
                    RtcAnswer {
                        offer_id,
                        pid: remote_pid,
                        sdp,
                    },
                );
            }
        }
    }

    fn on_channel_open(&mut self, offer_id: OfferId, pair: Option<RtcChannelPair>) {
        let Some(connection) = self.connections.get_mut(&offer_id) else {
            debug!(target: "signaling", %offer_id, "data channel does not match a connection");
            return;
        };
        if let Some(pair) = pair {
            // Remote-initiated channel replaces the one we created, if any.
            connection.channel = Some(pair);
        }
        if connection.remote_pid.is_none() {
            warn!(target: "signaling", %offer_id, "data channel open without a peer id, dropping");
            return;
        }

        let connection = self.connections.remove(&offer_id).expect("present above");
        for task in &connection.tasks {
            task.abort();
        }
        let Some(channel) = connection.channel else {
            warn!(target: "signaling", %offer_id, "data channel open without a channel, dropping");
            return;
        };
        let peer_id = connection.remote_pid.expect("checked above");
        debug!(target: "signaling", %offer_id, %peer_id, "handing off data channel");
        let delivered = self.peers.send(IncomingPeer {
            peer_id,
            init: RtcStreamInit {
                connection: connection.conn,
                channel,
            },
        });
        if delivered.is_err() {
            debug!(target: "signaling", %offer_id, "peer receiver gone, dropping channel");
        }
    }

    /// Tears down a connection after a failure or deadline and lets its
    /// batch, if any, complete without it.
    fn fail_connection(&mut self, offer_id: OfferId) {
        let Some(connection) = self.connections.remove(&offer_id) else {
            return;
        };
        for task in &connection.tasks {
            task.abort();
        }
        let conn = connection.conn;
        tokio::spawn(async move { conn.close().await });

        if let Role::Offerer {
            batch,
            emitted: false,
        } = connection.role
        {
            self.record_batch_failure(batch);
            self.complete_batches();
        }
    }

    fn remove_connection(&mut self, offer_id: OfferId) {
        if let Some(connection) = self.connections.remove(&offer_id) {
            for task in &connection.tasks {
                task.abort();
            }
            let conn = connection.conn;
            tokio::spawn(async move { conn.close().await });
        }
    }

    /// Draws offer ids until one does not collide with a live connection.
    fn allocate_offer_id(&self) -> OfferId {
        loop {
            let id = OfferId::random();
            if !self.connections.contains_key(&id) {
                return id;
            }
        }
    }

    /// Creates the engine connection, registers it in the table and wires
    /// its event pump and deadline timer back into the actor.
    async fn open_connection(
        &mut self,
        offer_id: OfferId,
        local_pid: PeerId,
        role: Role,
    ) -> Result<Arc<dyn RtcConnection>, Error> {
        let (conn, mut conn_events) = self.engine.connect().await?;

        let events = self.events.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = conn_events.recv().await {
                let event = match event {
                    ConnectionEvent::LocalDescription { sdp } => {
                        Event::LocalDescription { offer_id, sdp }
                    }
                    ConnectionEvent::ChannelOpen { pair } => Event::ChannelOpen { offer_id, pair },
                    ConnectionEvent::Failed => Event::Failed {
                        offer_id,
                        error: Error::ConnectionRefused,
                    },
                };
                if events.send(event).is_err() {
                    return;
                }
            }
        });

        let events = self.events.clone();
        let deadline = self.config.connection_deadline;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = events.send(Event::Failed {
                offer_id,
                error: Error::TimedOut,
            });
        });

        match self.connections.entry(offer_id) {
            Entry::Vacant(slot) => {
                slot.insert(Connection {
                    conn: conn.clone(),
                    channel: None,
                    remote_pid: None,
                    local_pid,
                    role,
                    tasks: vec![pump, timer],
                });
                Ok(conn)
            }
            Entry::Occupied(_) => {
                pump.abort();
                timer.abort();
                tokio::spawn(async move { conn.close().await });
                Err(Error::Engine("offer id already in use".into()))
            }
        }
    }

    fn add_batch_offer(&mut self, seq: u64, offer: RtcOffer) {
        if let Some(batch) = self.batches.iter_mut().find(|b| b.seq == seq) {
            batch.offers.push(offer);
        }
    }

    fn record_batch_failure(&mut self, seq: u64) {
        if let Some(batch) = self.batches.iter_mut().find(|b| b.seq == seq) {
            batch.failed += 1;
        }
    }

    /// Pops completed batches off the front, firing each handler exactly
    /// once. Batches resolve in the order they were requested.
    fn complete_batches(&mut self) {
        while let Some(front) = self.batches.front_mut() {
            if !front.is_complete() {
                break;
            }
            let mut batch = self.batches.pop_front().expect("front exists");
            debug!(
                target: "signaling",
                offers = batch.offers.len(),
                failed = batch.failed,
                "offer batch complete"
            );
            if let Some(reply) = batch.reply.take() {
                let _ = reply.send(std::mem::take(&mut batch.offers));
            }
        }
    }
}
