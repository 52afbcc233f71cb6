//! Frame encoding/decoding for the multiplex protocol
//!
//! Header format (16 bytes, before obfuscation):
//! ```text
//! +--------+--------+--------+--------+
//! |           Stream ID (4B)          |
//! +--------+--------+--------+--------+
//! |                                   |
//! |         Sequence number (8B)      |
//! +--------+--------+--------+--------+
//! | Closing|      reserved (3B)       |
//! +--------+--------+--------+--------+
//! ```
//!
//! The reserved bytes are filled by the obfuscator and ignored on decode.

use super::MuxError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const HEADER_LEN: usize = 16;

/// Stream id reserved for session-level control frames
pub const CONTROL_STREAM_ID: u32 = 0xFFFF_FFFF;

/// Close marker carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Closing {
    /// Ordinary data frame
    Nothing = 0x00,
    /// The sending endpoint closed this stream; `seq` is the final sequence
    Stream = 0x01,
    /// The sending endpoint closed the whole session
    Session = 0x02,
}

impl TryFrom<u8> for Closing {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Closing::Nothing),
            0x01 => Ok(Closing::Stream),
            0x02 => Ok(Closing::Session),
            _ => Err(MuxError::MalformedFrame(format!(
                "unknown closing code: {}",
                value
            ))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream ID (`CONTROL_STREAM_ID` for session-level frames)
    pub stream_id: u32,
    /// Per-stream sequence number, strictly increasing from 0
    pub seq: u64,
    /// Close marker
    pub closing: Closing,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create an ordinary data frame
    pub fn data(stream_id: u32, seq: u64, payload: Bytes) -> Self {
        Self {
            stream_id,
            seq,
            closing: Closing::Nothing,
            payload,
        }
    }

    /// Create a stream-close frame carrying the final sequence number
    pub fn stream_close(stream_id: u32, seq: u64) -> Self {
        Self {
            stream_id,
            seq,
            closing: Closing::Stream,
            payload: Bytes::new(),
        }
    }

    /// Create a session-close frame
    pub fn session_close() -> Self {
        Self {
            stream_id: CONTROL_STREAM_ID,
            seq: 0,
            closing: Closing::Session,
            payload: Bytes::new(),
        }
    }

    /// Encode the 16-byte header into the front of `dst`
    ///
    /// Reserved bytes are written as zero; the obfuscator overwrites them.
    pub fn encode_header(&self, dst: &mut [u8]) {
        debug_assert!(dst.len() >= HEADER_LEN);
        let mut buf = &mut dst[..HEADER_LEN];
        buf.put_u32(self.stream_id);
        buf.put_u64(self.seq);
        buf.put_u8(self.closing as u8);
        buf.put_bytes(0, 3);
    }

    /// Encode header and payload into a fresh buffer
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.stream_id);
        buf.put_u64(self.seq);
        buf.put_u8(self.closing as u8);
        buf.put_bytes(0, 3);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame from header + payload bytes
    pub fn decode(src: &[u8]) -> Result<Self, MuxError> {
        let (stream_id, seq, closing) = Self::decode_header(src)?;
        Ok(Self {
            stream_id,
            seq,
            closing,
            payload: Bytes::copy_from_slice(&src[HEADER_LEN..]),
        })
    }

    /// Decode just the 16-byte header, returning its fields
    pub fn decode_header(src: &[u8]) -> Result<(u32, u64, Closing), MuxError> {
        if src.len() < HEADER_LEN {
            return Err(MuxError::MalformedFrame(format!(
                "header too short: {} bytes",
                src.len()
            )));
        }
        let mut buf = &src[..HEADER_LEN];
        let stream_id = buf.get_u32();
        let seq = buf.get_u64();
        let closing = Closing::try_from(buf.get_u8())?;
        Ok((stream_id, seq, closing))
    }
}
