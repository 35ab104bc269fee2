//! One live peer: a read task decoding frames and a write task draining a
//! FIFO queue, both bound to the same socket.
//!
//! The [`Connection`] handle is cheap to clone and safe to use from any
//! thread. `write` only enqueues; the write task owns the socket's write half
//! and sends one frame at a time, so frames from concurrent writers never
//! interleave on the wire.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use clap::ValueEnum;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    select,
    sync::{Notify, mpsc, watch},
};
use tracing::{debug, trace, warn};

use crate::{
    error::{CloseReason, FrameError, TransportError},
    frame::{DEFAULT_MAX_FRAME_LEN, Frame, read_frame, write_frame},
};

pub type ConnectionId = u64;

/// What a bounded write queue does when a write arrives while it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OverflowPolicy {
    /// Discard the oldest frame that has not reached the socket yet.
    #[default]
    DropOldest,
    /// Discard the frame being written.
    DropNewest,
    /// Close the connection; a peer this slow is treated as gone.
    Disconnect,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Largest frame accepted from or sent to the peer, header included.
    pub max_frame_len: u32,
    /// Maximum number of frames waiting for the socket. `None` is unbounded.
    pub queue_limit: Option<usize>,
    pub overflow: OverflowPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            queue_limit: None,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Notifications a connection sends to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Message { id: ConnectionId, payload: Bytes },
    /// Sent exactly once per connection.
    Closed {
        id: ConnectionId,
        peer: SocketAddr,
        reason: CloseReason,
    },
}

#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: ConnectionId,
    peer: SocketAddr,
    max_frame_len: u32,
    queue: Mutex<OutboundQueue>,
    wake_writer: Notify,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Connection {
    /// Takes ownership of `stream` and starts its read and write tasks.
    pub fn spawn(
        id: ConnectionId,
        stream: TcpStream,
        options: ConnectionOptions,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%peer, ?error, "failed to disable nagle");
        }
        let (reader, writer) = stream.into_split();
        Ok(Self::spawn_io(id, peer, reader, writer, options, events))
    }

    /// Same as [`Connection::spawn`] over arbitrary stream halves.
    pub fn spawn_io<R, W>(
        id: ConnectionId,
        peer: SocketAddr,
        reader: R,
        writer: W,
        options: ConnectionOptions,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (close_signal, _) = watch::channel(false);
        let connection = Self {
            inner: Arc::new(Inner {
                id,
                peer,
                max_frame_len: options.max_frame_len,
                queue: Mutex::new(OutboundQueue::new(options.queue_limit, options.overflow)),
                wake_writer: Notify::new(),
                closed: AtomicBool::new(false),
                close_signal,
                events,
            }),
        };

        tokio::spawn(read_cycle(connection.clone(), reader));
        tokio::spawn(write_cycle(connection.clone(), writer));
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Frames accepted by `write` that have not been handed to the socket.
    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    /// Bound on frames waiting for the socket, if any.
    pub fn queue_limit(&self) -> Option<usize> {
        self.lock_queue().limit
    }

    /// Frames `payload` and queues it behind earlier writes.
    pub fn write(&self, payload: impl AsRef<[u8]>) -> Result<(), TransportError> {
        let frame = Frame::encode_limited(payload.as_ref(), self.inner.max_frame_len)?;
        self.send_frame(frame)
    }

    /// Queues an already encoded frame. Broadcasts encode once and share it.
    pub fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if frame.wire_len() > self.inner.max_frame_len as usize {
            return Err(FrameError::TooLarge {
                len: frame.wire_len() as u64,
                max: u64::from(self.inner.max_frame_len),
            }
            .into());
        }

        let outcome = {
            // Checked under the queue lock so a concurrent close either sees
            // this frame and clears it, or this push sees the close.
            let mut queue = self.lock_queue();
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            queue.push(frame)
        };
        match outcome {
            Push::Queued => {}
            Push::DroppedOldest => {
                trace!(id = self.id(), "write queue full, dropped oldest frame");
            }
            Push::DroppedNewest => {
                trace!(id = self.id(), "write queue full, dropped newest frame");
                return Ok(());
            }
            Push::Overflow => {
                warn!(
                    id = self.id(),
                    peer = %self.peer_addr(),
                    "write queue overflow, disconnecting"
                );
                self.close_with(CloseReason::QueueOverflow);
                return Err(TransportError::Closed);
            }
        }
        self.inner.wake_writer.notify_one();
        Ok(())
    }

    /// Stops both tasks. Calling it again is a no-op.
    pub fn close(&self) {
        self.close_with(CloseReason::Shutdown);
    }

    fn close_with(&self, reason: CloseReason) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.close_signal.send_replace(true);
        self.lock_queue().clear();

        debug!(id = self.id(), peer = %self.peer_addr(), %reason, "connection closed");
        // The owner may already be gone during teardown.
        let _ = self.inner.events.send(ConnectionEvent::Closed {
            id: self.id(),
            peer: self.peer_addr(),
            reason,
        });
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, OutboundQueue> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop_front(&self) -> Option<Frame> {
        self.lock_queue().frames.pop_front()
    }
}

async fn read_cycle<R>(connection: Connection, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut closed = connection.inner.close_signal.subscribe();
    let max_frame_len = connection.inner.max_frame_len;

    loop {
        let result = select! {
            _ = wait_closed(&mut closed) => return,
            result = read_frame(&mut reader, max_frame_len) => result,
        };

        let reason = match result {
            Ok(Some(frame)) => {
                let event = ConnectionEvent::Message {
                    id: connection.id(),
                    payload: frame.payload(),
                };
                if connection.inner.events.send(event).is_ok() {
                    continue;
                }
                CloseReason::Shutdown
            }
            Ok(None) => CloseReason::PeerClosed,
            Err(TransportError::Frame(err)) => CloseReason::Frame(err),
            Err(err) => CloseReason::Io(err.to_string()),
        };
        connection.close_with(reason);
        return;
    }
}

async fn write_cycle<W>(connection: Connection, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    let mut closed = connection.inner.close_signal.subscribe();

    loop {
        let frame = match connection.pop_front() {
            Some(frame) => frame,
            None => {
                select! {
                    _ = wait_closed(&mut closed) => return,
                    _ = connection.inner.wake_writer.notified() => {}
                }
                continue;
            }
        };

        let result = select! {
            _ = wait_closed(&mut closed) => return,
            result = write_frame(&mut writer, &frame) => result,
        };
        if let Err(err) = result {
            connection.close_with(CloseReason::Io(err.to_string()));
            return;
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // A dropped sender also means the connection is gone.
    let _ = closed.wait_for(|closed| *closed).await;
}

#[derive(Debug)]
struct OutboundQueue {
    frames: VecDeque<Frame>,
    limit: Option<usize>,
    policy: OverflowPolicy,
}

#[derive(Debug, PartialEq, Eq)]
enum Push {
    Queued,
    DroppedOldest,
    DroppedNewest,
    Overflow,
}

impl OutboundQueue {
    fn new(limit: Option<usize>, policy: OverflowPolicy) -> Self {
        Self {
            frames: VecDeque::new(),
            // A zero bound would drop everything; one frame is the minimum.
            limit: limit.map(|limit| limit.max(1)),
            policy,
        }
    }

    fn push(&mut self, frame: Frame) -> Push {
        let full = self.limit.is_some_and(|limit| self.frames.len() >= limit);
        if !full {
            self.frames.push_back(frame);
            return Push::Queued;
        }

        match self.policy {
            OverflowPolicy::DropOldest => {
                self.frames.pop_front();
                self.frames.push_back(frame);
                Push::DroppedOldest
            }
            OverflowPolicy::DropNewest => Push::DroppedNewest,
            OverflowPolicy::Disconnect => Push::Overflow,
        }
    }

    fn len(&self) -> usize {
        self.frames.len()
    }

    fn clear(&mut self) {
        self.frames.clear();
    }
}
