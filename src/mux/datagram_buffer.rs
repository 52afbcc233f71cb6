//! Arrival-order delivery for sessions in unordered mode
//!
//! Each frame's payload is handed to the reader as one message in the
//! order it arrived; sequence numbers are used only to drop duplicates.
//! A stream-close marker takes effect immediately on receipt.

use super::buffer::{sleep_until_opt, InsertOutcome, RecvBuffer};
use super::{Closing, Frame, MuxError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct Inner {
    /// Messages awaiting the reader, one per frame
    messages: VecDeque<Bytes>,
    /// Sequence numbers already delivered or queued
    seen: HashSet<u64>,
    /// A stream-close marker has been received
    close_received: bool,
    /// Terminal: no further inserts will be accepted
    closed: bool,
    read_deadline: Option<Instant>,
}

pub(crate) struct DatagramBuffer {
    inner: Mutex<Inner>,
    readable: Notify,
}

impl DatagramBuffer {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            readable: Notify::new(),
        }
    }
}

#[async_trait]
impl RecvBuffer for DatagramBuffer {
    fn insert(&self, frame: Frame) -> InsertOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed || inner.close_received {
                return InsertOutcome::Dropped;
            }
            if !inner.seen.insert(frame.seq) {
                return InsertOutcome::Dropped;
            }

            if !frame.payload.is_empty() {
                inner.messages.push_back(frame.payload);
            }
            if frame.closing == Closing::Stream {
                inner.close_received = true;
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
                if let Some(message) = inner.messages.pop_front() {
                    // One message per read; callers size `dst` to the
                    // session payload cap, anything beyond it is cut off.
                    let n = dst.len().min(message.len());
                    dst[..n].copy_from_slice(&message[..n]);
                    return Ok(n);
                }
                if inner.close_received || inner.closed {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn data(seq: u64, payload: &'static [u8]) -> Frame {
        Frame::data(1, seq, Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn test_arrival_order_delivery() {
        let buf = DatagramBuffer::new();
        buf.insert(data(5, b"first"));
        buf.insert(data(2, b"second"));

        let mut out = [0u8; 16];
        let n = buf.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"first");
        let n = buf.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"second");
    }

    #[tokio::test]
    async fn test_seq_deduplication() {
        let buf = DatagramBuffer::new();
        assert_eq!(buf.insert(data(3, b"once")), InsertOutcome::Delivered);
        assert_eq!(buf.insert(data(3, b"twice")), InsertOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_close_effective_immediately() {
        let buf = DatagramBuffer::new();
        buf.insert(data(0, b"msg"));
        assert_eq!(
            buf.insert(Frame::stream_close(1, 7)),
            InsertOutcome::ClosedNow
        );
        assert_eq!(buf.insert(data(1, b"late")), InsertOutcome::Dropped);

        let mut out = [0u8; 8];
        let n = buf.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"msg");
        assert_eq!(buf.read(&mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let buf = DatagramBuffer::new();
        buf.set_read_deadline(Some(Instant::now() - Duration::from_secs(1)));

        let mut out = [0u8; 1];
        let err = buf.read(&mut out).await.unwrap_err();
        assert!(matches!(err, MuxError::Timeout));
    }
}
