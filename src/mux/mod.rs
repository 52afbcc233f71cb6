//! Multiplex engine - many logical streams over a pool of connections
//!
//! Provides:
//! - Frame encoding/decoding
//! - Per-stream reassembly (ordered and unordered)
//! - Session lifecycle and stream dispatch
//! - Work-stealing outbound dispatch with optional rate shaping

mod buffer;
mod datagram_buffer;
mod frame;
mod session;
mod sorted_buffer;
mod stream;
mod switchboard;
mod valve;

pub use frame::{Closing, Frame, CONTROL_STREAM_ID, HEADER_LEN};
pub use session::{Session, SessionConfig};
pub use stream::Stream;
pub use valve::Valve;

use crate::crypto::CryptoError;
use thiserror::Error;

/// Multiplex layer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("broken stream")]
    BrokenStream,

    #[error("session closed")]
    SessionClosed,

    #[error("deadline exceeded")]
    Timeout,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("local stream ids exhausted")]
    StreamIdExhausted,

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capacity of the queue of remotely-initiated streams awaiting `accept_stream`
pub const ACCEPT_BACKLOG: usize = 1024;

/// Depth of the session-wide outbound record queue
pub(crate) const SEND_QUEUE_DEPTH: usize = 1024;

/// Default maximum frame payload carried on the wire
pub const DEFAULT_PAYLOAD_LIMIT: usize = 16384;

/// Default hard upper bound on any decoded record
pub const DEFAULT_MAX_FRAME_SIZE: usize = 65535;
