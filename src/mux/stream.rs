//! Logical stream endpoint multiplexed inside a session
//!
//! A `Stream` is a cheap cloneable handle; the session's stream map and
//! any reader/writer share the same state. Writes are split into frames,
//! obfuscated and pushed onto the session-wide send queue; reads drain the
//! stream's reassembly buffer.

use super::buffer::{sleep_until_opt, InsertOutcome, RecvBuffer};
use super::session::SessionCore;
use super::{Frame, MuxError};
use crate::crypto::Obfuscator;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Shared {
    id: u32,
    session_id: u32,
    buffer: Box<dyn RecvBuffer>,
    next_send_seq: AtomicU64,
    /// Set once the stream's close is complete in either direction
    closed: AtomicBool,
    write_deadline: Mutex<Option<Instant>>,
    write_waker: Notify,
    send_queue: mpsc::Sender<Bytes>,
    obfuscator: Arc<dyn Obfuscator>,
    payload_limit: usize,
    session_cancel: CancellationToken,
    session: Weak<SessionCore>,
}

/// A bidirectional byte channel multiplexed inside a session
#[derive(Clone)]
pub struct Stream {
    shared: Arc<Shared>,
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u32,
        session_id: u32,
        buffer: Box<dyn RecvBuffer>,
        send_queue: mpsc::Sender<Bytes>,
        obfuscator: Arc<dyn Obfuscator>,
        payload_limit: usize,
        session_cancel: CancellationToken,
        session: Weak<SessionCore>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                session_id,
                buffer,
                next_send_seq: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                write_deadline: Mutex::new(None),
                write_waker: Notify::new(),
                send_queue,
                obfuscator,
                payload_limit,
                session_cancel,
                session,
            }),
        }
    }

    /// Stream id within its session
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Whether the stream's close is complete (either direction)
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Read bytes from the stream
    ///
    /// Suspends while no data is deliverable. Fails with `Timeout` when the
    /// read deadline fires, and with `BrokenStream` once the stream has
    /// closed and its residual bytes are drained.
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize, MuxError> {
        if dst.is_empty() {
            return Ok(0);
        }
        let n = self.shared.buffer.read(dst).await?;
        if n == 0 {
            return Err(MuxError::BrokenStream);
        }
        Ok(n)
    }

    /// Write bytes to the stream
    ///
    /// Splits `src` across frames capped at the session payload limit and
    /// enqueues each for dispatch. Frames are atomic: a deadline mid-write
    /// surfaces `Timeout` but never truncates an enqueued frame.
    pub async fn write(&self, src: &[u8]) -> Result<usize, MuxError> {
        if self.shared.session_cancel.is_cancelled() {
            return Err(MuxError::SessionClosed);
        }
        if self.is_closed() {
            return Err(MuxError::BrokenStream);
        }
        if src.is_empty() {
            return Ok(0);
        }

        for chunk in src.chunks(self.shared.payload_limit) {
            let seq = self.shared.next_send_seq.fetch_add(1, Ordering::SeqCst);
            let frame = Frame::data(self.shared.id, seq, Bytes::copy_from_slice(chunk));
            let record = self.obfuscate_record(&frame)?;
            self.enqueue(record).await?;
        }
        Ok(src.len())
    }

    /// Close the stream; idempotent
    ///
    /// Emits one stream-close frame carrying the next sequence number,
    /// unblocks any pending reader (residual bytes stay readable) and
    /// removes the stream from its session.
    pub async fn close(&self) -> Result<(), MuxError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(
            session = self.shared.session_id,
            stream = self.shared.id,
            "stream closed locally"
        );

        let seq = self.shared.next_send_seq.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::stream_close(self.shared.id, seq);
        // Best effort: a session on its way down may no longer dispatch.
        if let Ok(record) = self.obfuscate_record(&frame) {
            let _ = self.enqueue(record).await;
        }

        self.shared.buffer.close();
        if let Some(core) = self.shared.session.upgrade() {
            core.retire_stream(self.shared.id);
        }
        Ok(())
    }

    /// Install, re-arm or clear (`None`) the read deadline
    ///
    /// A deadline already in the past wakes a blocked reader immediately.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.buffer.set_read_deadline(deadline);
    }

    /// Install, re-arm or clear (`None`) the write deadline
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.shared.write_deadline.lock() = deadline;
        self.shared.write_waker.notify_waiters();
    }

    fn obfuscate_record(&self, frame: &Frame) -> Result<Bytes, MuxError> {
        let mut record = vec![0u8; self.shared.obfuscator.overhead() + frame.payload.len()];
        let n = self.shared.obfuscator.obfuscate(frame, &mut record, 0)?;
        record.truncate(n);
        Ok(Bytes::from(record))
    }

    async fn enqueue(&self, record: Bytes) -> Result<(), MuxError> {
        loop {
            let notified = self.shared.write_waker.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = *self.shared.write_deadline.lock();
            if let Some(d) = deadline {
                if d <= Instant::now() {
                    return Err(MuxError::Timeout);
                }
            }

            tokio::select! {
                permit = self.shared.send_queue.reserve() => {
                    return match permit {
                        Ok(permit) => {
                            permit.send(record);
                            Ok(())
                        }
                        Err(_) => Err(MuxError::SessionClosed),
                    };
                }
                _ = self.shared.session_cancel.cancelled() => {
                    return Err(MuxError::SessionClosed);
                }
                _ = sleep_until_opt(deadline) => {}
                _ = &mut notified => {}
            }
        }
    }

    // Session-side entry points.

    /// Deliver a received frame to the reassembly buffer
    pub(crate) fn insert_frame(&self, frame: Frame) -> InsertOutcome {
        self.shared.buffer.insert(frame)
    }

    /// Mark the stream closed; returns whether this call made the transition
    pub(crate) fn mark_closed(&self) -> bool {
        !self.shared.closed.swap(true, Ordering::AcqRel)
    }

    /// Terminally close the buffer, unblocking readers while preserving
    /// residual bytes
    pub(crate) fn close_buffer(&self) {
        self.shared.buffer.close();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("session", &self.shared.session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
