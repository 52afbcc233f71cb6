//! Transport layer glue
//!
//! The engine treats an underlying connection as an opaque reliable byte
//! stream and applies a length-prefixed record framer on top of it; the
//! TLS-appearance wrapper around the raw socket is an external collaborator.

mod record;

pub use record::{RecordReader, RecordWriter};

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("record too large: {len} > {max}")]
    RecordTooLarge { len: usize, max: usize },
}
