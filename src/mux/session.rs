//! Session lifecycle and frame dispatch
//!
//! A session owns the stream map, the accept queue of remotely-initiated
//! streams, the outbound record queue shared by all connection workers and
//! the optional inactivity timer. Streams whose close has been processed
//! leave a tombstone in the map so a late frame can never resurrect them.

use super::buffer::{InsertOutcome, RecvBuffer};
use super::datagram_buffer::DatagramBuffer;
use super::sorted_buffer::SortedBuffer;
use super::stream::Stream;
use super::switchboard;
use super::valve::Valve;
use super::{
    Closing, Frame, MuxError, ACCEPT_BACKLOG, CONTROL_STREAM_ID, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_PAYLOAD_LIMIT, SEND_QUEUE_DEPTH,
};
use crate::crypto::Obfuscator;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Session construction options
#[derive(Clone)]
pub struct SessionConfig {
    /// Cipher suite and key; see [`crate::crypto::make_obfuscator`]
    pub obfuscator: Arc<dyn Obfuscator>,
    /// Deliver payloads in arrival order instead of sequence order
    pub unordered: bool,
    /// Optional byte-rate limits shared by all connection workers
    pub valve: Option<Arc<Valve>>,
    /// Close the session after this long without any frame; `None` disables
    pub inactivity_timeout: Option<Duration>,
    /// Maximum frame payload carried on the wire
    pub payload_limit: usize,
    /// Hard upper bound on any received record
    pub max_frame_size: usize,
}

impl SessionConfig {
    pub fn new(obfuscator: Arc<dyn Obfuscator>) -> Self {
        Self {
            obfuscator,
            unordered: false,
            valve: None,
            inactivity_timeout: None,
            payload_limit: DEFAULT_PAYLOAD_LIMIT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_unordered(mut self, unordered: bool) -> Self {
        self.unordered = unordered;
        self
    }

    pub fn with_valve(mut self, valve: Arc<Valve>) -> Self {
        self.valve = Some(valve);
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn with_payload_limit(mut self, limit: usize) -> Self {
        self.payload_limit = limit;
        self
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }
}

pub(crate) struct SessionCore {
    pub(crate) id: u32,
    pub(crate) obfuscator: Arc<dyn Obfuscator>,
    unordered: bool,
    pub(crate) valve: Option<Arc<Valve>>,
    payload_limit: usize,
    pub(crate) max_frame_size: usize,
    /// `None` marks a recently-dead stream; late frames hit the tombstone
    /// and are dropped instead of resurrecting the id
    pub(crate) streams: DashMap<u32, Option<Stream>>,
    active_streams: AtomicUsize,
    next_stream_id: AtomicU32,
    accept_tx: mpsc::Sender<Stream>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    send_tx: mpsc::Sender<Bytes>,
    /// Shared by every send worker; locking it pops the queue head
    pub(crate) send_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Bytes>>>,
    closed: AtomicBool,
    pub(crate) cancel: CancellationToken,
    last_activity: Mutex<Instant>,
    pub(crate) connections: AtomicUsize,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_dropped: AtomicU64,
}

impl SessionCore {
    fn make_stream(self: &Arc<Self>, id: u32) -> Stream {
        let buffer: Box<dyn RecvBuffer> = if self.unordered {
            Box::new(DatagramBuffer::new())
        } else {
            Box::new(SortedBuffer::new())
        };
        Stream::new(
            id,
            self.id,
            buffer,
            self.send_tx.clone(),
            Arc::clone(&self.obfuscator),
            self.payload_limit,
            self.cancel.clone(),
            Arc::downgrade(self),
        )
    }

    /// Deobfuscate one received record and dispatch its frame
    pub(crate) async fn recv_data_from_remote(
        self: &Arc<Self>,
        record: &[u8],
    ) -> Result<(), MuxError> {
        let frame = self.obfuscator.deobfuscate(record)?;
        self.touch_activity();
        self.bytes_received
            .fetch_add(record.len() as u64, Ordering::Relaxed);

        if frame.stream_id == CONTROL_STREAM_ID {
            if frame.closing == Closing::Session {
                tracing::debug!(session = self.id, "received session close");
                self.close_internal(false).await;
            } else {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(());
        }

        let (stream, newly_created) = match self.streams.entry(frame.stream_id) {
            Entry::Occupied(entry) => match entry.get() {
                Some(stream) => (stream.clone(), false),
                None => {
                    // Recently dead; never resurrect.
                    self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            },
            Entry::Vacant(entry) => {
                let stream = self.make_stream(frame.stream_id);
                entry.insert(Some(stream.clone()));
                self.active_streams.fetch_add(1, Ordering::SeqCst);
                (stream, true)
            }
        };

        if newly_created {
            tracing::debug!(
                session = self.id,
                stream = frame.stream_id,
                "remote stream created"
            );
            // Backpressure: a full accept backlog suspends this connection's
            // recv worker until someone accepts or the session dies.
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = self.accept_tx.send(stream.clone()) => {}
            }
        }

        match stream.insert_frame(frame) {
            InsertOutcome::ClosedNow => {
                stream.mark_closed();
                self.retire_stream(stream.id());
                tracing::debug!(
                    session = self.id,
                    stream = stream.id(),
                    "remote stream closed"
                );
            }
            InsertOutcome::Dropped => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            InsertOutcome::Delivered => {}
        }
        Ok(())
    }

    /// Turn a live map entry into a tombstone, adjusting the live count
    pub(crate) fn retire_stream(&self, id: u32) {
        if let Some(mut entry) = self.streams.get_mut(&id) {
            if entry.take().is_some() {
                self.active_streams.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    pub(crate) async fn close_internal(self: &Arc<Self>, send_close_frame: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(session = self.id, "session closing");

        if send_close_frame {
            let frame = Frame::session_close();
            let mut record = vec![0u8; self.obfuscator.overhead()];
            if let Ok(n) = self.obfuscator.obfuscate(&frame, &mut record, 0) {
                record.truncate(n);
                let _ = self.send_tx.try_send(Bytes::from(record));
            }
        }

        // Mark every stream closed, preserving buffered data for drain.
        let ids: Vec<u32> = self.streams.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some(mut entry) = self.streams.get_mut(&id) {
                if let Some(stream) = entry.take() {
                    self.active_streams.fetch_sub(1, Ordering::SeqCst);
                    stream.mark_closed();
                    stream.close_buffer();
                }
            }
        }

        // Workers drain the outbound queue best-effort, then drop their
        // connection halves, which closes the underlying connections.
        self.cancel.cancel();
    }

    pub(crate) fn touch_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn record_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        self.touch_activity();
    }
}

/// A single logical multiplex instance spanning one or more connections
///
/// Cloneable handle; all clones drive the same session.
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    /// Construct a session with an empty stream map and connection pool
    pub fn new(id: u32, config: SessionConfig) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);

        let core = Arc::new(SessionCore {
            id,
            obfuscator: config.obfuscator,
            unordered: config.unordered,
            valve: config.valve,
            payload_limit: config.payload_limit,
            max_frame_size: config.max_frame_size,
            streams: DashMap::new(),
            active_streams: AtomicUsize::new(0),
            next_stream_id: AtomicU32::new(0),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            send_tx,
            send_rx: Arc::new(tokio::sync::Mutex::new(send_rx)),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            last_activity: Mutex::new(Instant::now()),
            connections: AtomicUsize::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        });

        if let Some(timeout) = config.inactivity_timeout {
            if !timeout.is_zero() {
                spawn_inactivity_timer(Arc::clone(&core), timeout);
            }
        }

        tracing::debug!(session = id, "session created");
        Session { core }
    }

    /// Session id, as agreed during the handshake
    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// Open a new locally-originated stream
    pub async fn open_stream(&self) -> Result<Stream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        let id = self.core.next_stream_id.fetch_add(1, Ordering::SeqCst);
        if id == CONTROL_STREAM_ID {
            // The id space wrapped; ids are never resurrected, so this
            // session is done.
            self.core.close_internal(true).await;
            return Err(MuxError::StreamIdExhausted);
        }

        let stream = self.core.make_stream(id);
        self.core.streams.insert(id, Some(stream.clone()));
        self.core.active_streams.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(session = self.core.id, stream = id, "stream opened");
        Ok(stream)
    }

    /// Dequeue the next remotely-initiated stream, in order of first
    /// appearance
    pub async fn accept_stream(&self) -> Result<Stream, MuxError> {
        let mut queue = self.core.accept_rx.lock().await;
        tokio::select! {
            _ = self.core.cancel.cancelled() => Err(MuxError::SessionClosed),
            stream = queue.recv() => stream.ok_or(MuxError::SessionClosed),
        }
    }

    /// Add an underlying connection to the pool, spawning its workers
    pub fn add_connection<C>(&self, conn: C)
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        switchboard::add_connection(Arc::clone(&self.core), conn);
    }

    /// Close the session; idempotent
    ///
    /// Emits one session-close frame, drains the outbound queue best
    /// effort, closes every connection and unblocks every waiter. Buffered
    /// stream data remains readable.
    pub async fn close(&self) {
        self.core.close_internal(true).await;
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    /// Number of live (not yet dead) streams
    pub fn stream_count(&self) -> usize {
        self.core.active_streams.load(Ordering::SeqCst)
    }

    /// Number of connections currently in the pool
    pub fn connection_count(&self) -> usize {
        self.core.connections.load(Ordering::SeqCst)
    }

    /// Total obfuscated bytes handed to the wire
    pub fn bytes_sent(&self) -> u64 {
        self.core.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total obfuscated bytes received from the wire
    pub fn bytes_received(&self) -> u64 {
        self.core.bytes_received.load(Ordering::Relaxed)
    }

    /// Frames discarded as duplicates, beyond-close or tombstone hits
    pub fn frames_dropped(&self) -> u64 {
        self.core.frames_dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }
}

fn spawn_inactivity_timer(core: Arc<SessionCore>, timeout: Duration) {
    tokio::spawn(async move {
        loop {
            let idle = core.last_activity.lock().elapsed();
            if idle >= timeout {
                tracing::debug!(session = core.id, "inactivity timeout");
                core.close_internal(true).await;
                return;
            }
            tokio::select! {
                _ = core.cancel.cancelled() => return,
                _ = tokio::time::sleep(timeout - idle) => {}
            }
        }
    });
}
