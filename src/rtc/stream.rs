//! Byte-stream adapter over an open WebRTC data channel.
//!
//! The channel is message framed; BitTorrent peers expect a socket. The
//! adapter buffers inbound messages and re-segments them into whatever the
//! caller's read buffer holds, so the protocol layer above never learns
//! the peer is reached over WebRTC.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{ChannelEvent, RtcChannel, RtcConnection, RtcStreamInit};
use crate::error::Error;

/// Reliable, ordered duplex byte stream over a data channel.
///
/// At most one read and one write may be pending at a time; a second
/// concurrent call fails with [`Error::OperationNotSupported`]. Dropping
/// the stream closes the channel.
pub struct RtcStream {
    connection: Arc<dyn RtcConnection>,
    channel: Arc<dyn RtcChannel>,
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
}

struct Shared {
    state: Mutex<State>,
    readable: Notify,
    /// Only ever signalled by `cancel` and `close`, to interrupt a write
    /// blocked inside the channel's send.
    write_abort: Notify,
}

#[derive(Default)]
struct State {
    /// Messages delivered by the channel but not yet consumed. The front
    /// message may be partially consumed; `front_offset` tracks how far.
    incoming: VecDeque<Vec<u8>>,
    front_offset: usize,
    incoming_len: usize,
    read_pending: bool,
    write_pending: bool,
    closed: bool,
    /// Bumped by `cancel` and `close`; a waiter that observes a bump
    /// completes with `OperationAborted`.
    abort_epoch: u64,
}

impl State {
    /// Copies buffered bytes into `buf`, coalescing across messages and
    /// leaving any partial message queued for the next read.
    fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = self.incoming.front() else {
                break;
            };
            let rest = &front[self.front_offset..];
            let n = rest.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&rest[..n]);
            copied += n;
            self.incoming_len -= n;
            if n == rest.len() {
                self.incoming.pop_front();
                self.front_offset = 0;
            } else {
                self.front_offset += n;
            }
        }
        copied
    }
}

impl RtcStream {
    /// Wraps a negotiated connection and its open data channel.
    pub fn new(init: RtcStreamInit) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            readable: Notify::new(),
            write_abort: Notify::new(),
        });
        let pump = spawn_pump(Arc::downgrade(&shared), init.channel.events);
        Self {
            connection: init.connection,
            channel: init.channel.channel,
            shared,
            pump,
        }
    }

    /// Reads at least one byte into `buf`, waiting for the channel if
    /// nothing is buffered. An empty `buf` completes immediately with 0.
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let epoch = {
            let mut state = self.shared.state.lock();
            if state.closed && state.incoming_len == 0 {
                return Err(Error::NotConnected);
            }
            if buf.is_empty() {
                return Ok(0);
            }
            if state.read_pending {
                return Err(Error::OperationNotSupported);
            }
            state.read_pending = true;
            state.abort_epoch
        };
        let _guard = PendingGuard::read(&self.shared);

        loop {
            {
                let mut state = self.shared.state.lock();
                if state.abort_epoch != epoch {
                    return Err(Error::OperationAborted);
                }
                let n = state.drain_into(buf);
                if n > 0 {
                    return Ok(n);
                }
                if state.closed {
                    return Err(Error::NotConnected);
                }
            }
            self.shared.readable.notified().await;
        }
    }

    /// Hands the whole of `buf` to the channel. Completion means the data
    /// was accepted by the channel, not that the peer received it.
    pub async fn write_some(&self, buf: &[u8]) -> Result<usize, Error> {
        let epoch = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(Error::NotConnected);
            }
            if buf.is_empty() {
                return Ok(0);
            }
            if state.write_pending {
                return Err(Error::OperationNotSupported);
            }
            state.write_pending = true;
            state.abort_epoch
        };
        let _guard = PendingGuard::write(&self.shared);

        // The channel may block while its outbound buffer drains; a
        // cancel or close must still be able to abort the write.
        let mut send = self.channel.send(Bytes::copy_from_slice(buf));
        loop {
            tokio::select! {
                result = &mut send => {
                    result.map_err(|_| Error::NotConnected)?;
                    return Ok(buf.len());
                }
                _ = self.shared.write_abort.notified() => {
                    if self.shared.state.lock().abort_epoch != epoch {
                        return Err(Error::OperationAborted);
                    }
                }
            }
        }
    }

    /// Wakes any pending read or write with [`Error::OperationAborted`].
    /// The stream stays usable.
    pub fn cancel(&self) {
        self.shared.state.lock().abort_epoch += 1;
        self.shared.readable.notify_one();
        self.shared.write_abort.notify_one();
    }

    /// Cancels pending operations and closes the channel. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.abort_epoch += 1;
            state.closed = true;
            state.incoming.clear();
            state.front_offset = 0;
            state.incoming_len = 0;
        }
        self.shared.readable.notify_one();
        self.shared.write_abort.notify_one();
        self.channel.close().await;
        self.connection.close().await;
    }

    pub fn is_open(&self) -> bool {
        !self.shared.state.lock().closed && !self.channel.is_closed()
    }

    /// Bytes buffered and readable without waiting.
    pub fn available(&self) -> usize {
        self.shared.state.lock().incoming_len
    }

    /// Local transport address of the underlying connection.
    pub async fn local_endpoint(&self) -> Result<SocketAddr, Error> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }
        let addr = self
            .connection
            .local_address()
            .await
            .ok_or(Error::OperationNotSupported)?;
        parse_endpoint(&addr)
    }

    /// Remote transport address of the underlying connection.
    pub async fn remote_endpoint(&self) -> Result<SocketAddr, Error> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }
        let addr = self
            .connection
            .remote_address()
            .await
            .ok_or(Error::OperationNotSupported)?;
        parse_endpoint(&addr)
    }
}

impl Drop for RtcStream {
    fn drop(&mut self) {
        self.pump.abort();
        let channel = self.channel.clone();
        let connection = self.connection.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                channel.close().await;
                connection.close().await;
            });
        }
    }
}

/// Clears the pending-read or pending-write flag when the operation
/// completes or its future is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    write: bool,
}

impl<'a> PendingGuard<'a> {
    fn read(shared: &'a Shared) -> Self {
        Self {
            shared,
            write: false,
        }
    }

    fn write(shared: &'a Shared) -> Self {
        Self {
            shared,
            write: true,
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if self.write {
            state.write_pending = false;
        } else {
            state.read_pending = false;
        }
    }
}

/// Moves channel events into the shared buffer. Holds only a weak
/// reference so a late message after the stream is gone is a no-op.
fn spawn_pump(
    shared: Weak<Shared>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<ChannelEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = events.recv().await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            match event {
                Some(ChannelEvent::Message(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    {
                        let mut state = shared.state.lock();
                        if state.closed {
                            continue;
                        }
                        state.incoming_len += data.len();
                        state.incoming.push_back(data);
                    }
                    shared.readable.notify_one();
                }
                Some(ChannelEvent::Closed) | None => {
                    shared.state.lock().closed = true;
                    shared.readable.notify_one();
                    return;
                }
            }
        }
    })
}

/// Parses the `"ip:port"` form the WebRTC engine reports, tolerating
/// bracketed IPv6 literals.
fn parse_endpoint(addr: &str) -> Result<SocketAddr, Error> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or(Error::AddressFamilyNotSupported)?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::AddressFamilyNotSupported)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = host
        .parse()
        .map_err(|_| Error::AddressFamilyNotSupported)?;
    Ok(SocketAddr::new(ip, port))
}
