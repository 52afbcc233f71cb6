//! In-order reassembly of a possibly-reordered frame arrival sequence
//!
//! Frames are keyed by sequence number; the reader only ever sees the
//! contiguous run starting at the next expected sequence. A stream-close
//! marker takes effect once the run reaches its sequence, at which point
//! the buffer reports end of stream once the run has been drained.

use super::buffer::{sleep_until_opt, InsertOutcome, RecvBuffer};
use super::{Closing, Frame, MuxError};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct Inner {
    /// Frames received ahead of the contiguous run, keyed by seq
    pending: BTreeMap<u64, bytes::Bytes>,
    /// Next sequence number the contiguous run is waiting for
    next_seq: u64,
    /// Sequence of the stream-close marker, once seen
    close_seq: Option<u64>,
    /// Contiguous bytes ready for the reader
    ready: BytesMut,
    /// Terminal: no further inserts will be accepted
    closed: bool,
    read_deadline: Option<Instant>,
}

impl Inner {
    fn end_reached(&self) -> bool {
        self.close_seq.is_some_and(|cs| self.next_seq > cs)
    }
}

pub(crate) struct SortedBuffer {
    inner: Mutex<Inner>,
    readable: Notify,
}

impl SortedBuffer {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            readable: Notify::new(),
        }
    }
}

#[async_trait]
impl RecvBuffer for SortedBuffer {
    fn insert(&self, frame: Frame) -> InsertOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return InsertOutcome::Dropped;
            }
            // A second close marker, however sequenced, is dropped whole.
            if frame.closing == Closing::Stream && inner.close_seq.is_some() {
                return InsertOutcome::Dropped;
            }
            if frame.seq < inner.next_seq || inner.pending.contains_key(&frame.seq) {
                return InsertOutcome::Dropped;
            }
            if let Some(cs) = inner.close_seq {
                if frame.seq >= cs {
                    return InsertOutcome::Dropped;
                }
            }

            let was_ended = inner.end_reached();
            if frame.closing == Closing::Stream {
                let cs = frame.seq;
                inner.close_seq = Some(cs);
                inner.pending.retain(|&seq, _| seq <= cs);
            }
            inner.pending.insert(frame.seq, frame.payload);

            loop {
                let next = inner.next_seq;
                match inner.pending.remove(&next) {
                    Some(payload) => {
                        inner.ready.extend_from_slice(&payload);
                        inner.next_seq += 1;
                    }
                    None => break,
                }
            }

            if !was_ended && inner.end_reached() {
                InsertOutcome::ClosedNow
            } else {
                InsertOutcome::Delivered
            }
        };
        self.readable.notify_waiters();
        outcome
    }

    async fn read(&self, dst: &mut [u8]) -> Result<usize, MuxError> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.inner.lock();
                if !inner.ready.is_empty() {
                    let n = dst.len().min(inner.ready.len());
                    dst[..n].copy_from_slice(&inner.ready[..n]);
                    inner.ready.advance(n);
                    return Ok(n);
                }
                if inner.end_reached() || inner.closed {
                    return Ok(0);
                }
                if let Some(d) = inner.read_deadline {
                    if d <= Instant::now() {
                        return Err(MuxError::Timeout);
                    }
                }
                inner.read_deadline
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until_opt(deadline) => {}
            }
        }
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.lock().read_deadline = deadline;
        self.readable.notify_waiters();
    }

    fn close(&self) {
        self.inner.lock().closed = true;
        self.readable.notify_waiters();
    }
}
