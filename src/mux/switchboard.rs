//! Connection pool workers
//!
//! Every added connection gets one send worker and one recv worker. Send
//! workers compete for the head of the session-wide record queue by taking
//! the shared receiver lock, which yields approximate round-robin dispatch
//! across the pool. Recv workers read one record at a time, deobfuscate
//! and hand the frame to session dispatch.
//!
//! Error severity: an I/O failure detaches that connection only; a
//! malformed or undecryptable record closes the whole session.

use super::session::SessionCore;
use crate::transport::{RecordReader, RecordWriter, TransportError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Decrements the session's connection count once both workers are gone
struct ConnGuard {
    core: Arc<SessionCore>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.core.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn add_connection<C>(core: Arc<SessionCore>, conn: C)
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(conn);
    let reader = RecordReader::new(read_half, core.max_frame_size);
    let writer = RecordWriter::new(write_half);

    core.connections.fetch_add(1, Ordering::SeqCst);
    let guard = Arc::new(ConnGuard {
        core: Arc::clone(&core),
    });
    let detach = core.cancel.child_token();

    tokio::spawn(send_worker(
        Arc::clone(&core),
        writer,
        detach.clone(),
        Arc::clone(&guard),
    ));
    tokio::spawn(recv_worker(core, reader, detach, guard));
}

async fn send_worker<W>(
    core: Arc<SessionCore>,
    mut writer: RecordWriter<W>,
    detach: CancellationToken,
    _guard: Arc<ConnGuard>,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        // Competing for the receiver lock is what spreads records across
        // the pool; stay cancellable while waiting for it.
        let mut queue = tokio::select! {
            _ = detach.cancelled() => break,
            queue = core.send_rx.lock() => queue,
        };
        let record = tokio::select! {
            _ = detach.cancelled() => break,
            record = queue.recv() => record,
        };
        drop(queue);
        let Some(record) = record else { break };

        if let Some(valve) = &core.valve {
            valve.consume_send(record.len()).await;
        }
        if let Err(e) = writer.send_record(&record).await {
            tracing::warn!(session = core.id, "send worker detaching: {}", e);
            detach.cancel();
            break;
        }
        core.record_sent(record.len());
    }

    // On session close, flush whatever is still queued, best effort. A
    // lone connection failure leaves queued records to the other workers.
    if core.cancel.is_cancelled() {
        if let Ok(mut queue) = core.send_rx.try_lock() {
            while let Ok(record) = queue.try_recv() {
                if writer.send_record(&record).await.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(session = core.id, "send worker exited");
}

async fn recv_worker<R>(
    core: Arc<SessionCore>,
    mut reader: RecordReader<R>,
    detach: CancellationToken,
    _guard: Arc<ConnGuard>,
) where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let record = tokio::select! {
            _ = detach.cancelled() => break,
            record = reader.recv_record() => record,
        };
        match record {
            Ok(record) => {
                if let Some(valve) = &core.valve {
                    valve.consume_recv(record.len()).await;
                }
                if let Err(e) = core.recv_data_from_remote(&record).await {
                    // Protocol corruption on any connection is fatal to
                    // the whole session.
                    tracing::error!(session = core.id, "defensive session close: {}", e);
                    core.close_internal(false).await;
                    break;
                }
            }
            Err(TransportError::RecordTooLarge { len, max }) => {
                tracing::error!(
                    session = core.id,
                    len,
                    max,
                    "oversized record, closing session"
                );
                core.close_internal(false).await;
                break;
            }
            Err(TransportError::Io(e)) => {
                tracing::debug!(session = core.id, "recv worker detaching: {}", e);
                break;
            }
        }
    }
    // Take the paired send worker down with this connection.
    detach.cancel();
    tracing::debug!(session = core.id, "recv worker exited");
}
