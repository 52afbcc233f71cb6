//! Receive-side buffer seam between session dispatch and stream readers

use super::{Frame, MuxError};
use async_trait::async_trait;
use tokio::time::Instant;

/// What happened to an inserted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertOutcome {
    /// Frame accepted (possibly held until the sequence gap fills)
    Delivered,
    /// Frame accepted and the stream's close marker has now taken effect
    ClosedNow,
    /// Duplicate or beyond-close frame discarded
    Dropped,
}

/// Per-stream reassembly buffer
///
/// One implementation delivers bytes in strict sequence order, the other
/// delivers whole payloads in arrival order. Both are driven by the recv
/// workers through `insert` and drained by stream readers through `read`.
#[async_trait]
pub(crate) trait RecvBuffer: Send + Sync {
    /// Hand one received frame to the buffer
    fn insert(&self, frame: Frame) -> InsertOutcome;

    /// Read available bytes into `dst`
    ///
    /// Suspends while nothing is deliverable. Returns `Ok(0)` once the
    /// stream has ended (close marker drained, or the buffer was closed
    /// and the residue consumed); the stream layer translates that signal
    /// into its own error contract.
    async fn read(&self, dst: &mut [u8]) -> Result<usize, MuxError>;

    /// Install, re-arm or clear (`None`) the read deadline
    fn set_read_deadline(&self, deadline: Option<Instant>);

    /// Stop accepting frames and unblock readers; buffered data stays
    /// readable until drained
    fn close(&self);
}

/// Sleeps until `deadline`, or forever when none is set
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
