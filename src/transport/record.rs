//! Length-prefixed record framing
//!
//! Every obfuscated record travels behind a 2-byte big-endian length
//! prefix. The reader enforces the session's hard record-size cap so an
//! oversized length never turns into an oversized allocation.

use super::TransportError;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Writes one record per call to the underlying byte stream
pub struct RecordWriter<W> {
    io: W,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(io: W) -> Self {
        Self { io }
    }

    /// Send one record: length prefix and body in a single write
    pub async fn send_record(&mut self, record: &[u8]) -> Result<(), TransportError> {
        if record.len() > u16::MAX as usize {
            return Err(TransportError::RecordTooLarge {
                len: record.len(),
                max: u16::MAX as usize,
            });
        }
        let mut buf = BytesMut::with_capacity(2 + record.len());
        buf.put_u16(record.len() as u16);
        buf.extend_from_slice(record);
        self.io.write_all(&buf).await?;
        self.io.flush().await?;
        Ok(())
    }
}

/// Reads one record per call from the underlying byte stream
pub struct RecordReader<R> {
    io: R,
    max_record: usize,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(io: R, max_record: usize) -> Self {
        Self { io, max_record }
    }

    /// Receive exactly one record
    pub async fn recv_record(&mut self) -> Result<BytesMut, TransportError> {
        let mut len_buf = [0u8; 2];
        self.io.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len > self.max_record {
            return Err(TransportError::RecordTooLarge {
                len,
                max: self.max_record,
            });
        }

        let mut record = BytesMut::zeroed(len);
        self.io.read_exact(&mut record).await?;
        Ok(record)
    }
}
