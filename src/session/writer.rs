//! Write loop for a session.
//!
//! Packets arrive on the outbound queue, get encoded by the session's codec
//! and leave in batches: every frame that is already queued (up to
//! [`MAX_BATCH_SIZE`] frames or the configured byte budget) goes out in one
//! vectored write.
//!
//! ```text
//! Session::write ─┐
//! Session::write ─┼─► mpsc::Sender<Packet> ─► write loop ─► encode ─► socket
//! Session::write ─┘
//! ```

use std::io::IoSlice;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use super::{wait_closed, Session};
use crate::error::{Result, SeqlinkError};
use crate::protocol::Packet;

/// Maximum frames to batch in a single write operation.
pub const MAX_BATCH_SIZE: usize = 64;

pub(super) async fn write_loop<W>(
    session: Arc<Session>,
    mut writer: W,
    mut outbound: mpsc::Receiver<Packet>,
    mut shutdown: watch::Receiver<bool>,
    max_batch_bytes: usize,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;
            _ = wait_closed(&mut shutdown) => break,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        // Collect additional ready frames (non-blocking)
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut batch_bytes = 0;
        let frame = session.codec.encode(&first);
        batch_bytes += frame.len();
        batch.push(frame);

        while batch.len() < MAX_BATCH_SIZE && batch_bytes < max_batch_bytes {
            match outbound.try_recv() {
                Ok(packet) => {
                    let frame = session.codec.encode(&packet);
                    batch_bytes += frame.len();
                    batch.push(frame);
                }
                Err(_) => break,
            }
        }

        let written = tokio::select! {
            biased;
            _ = wait_closed(&mut shutdown) => break,
            result = write_batch(&mut writer, &batch) => result,
        };

        if let Err(e) = written {
            tracing::warn!(peer = %session.peer, error = %e, "Write failed, closing session");
            break;
        }
    }

    session.close();
    let _ = writer.shutdown().await;
}

/// Write a batch of encoded frames using scatter/gather I/O, resuming from
/// the first unwritten byte after a short write.
pub(crate) async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(Bytes::len).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(SeqlinkError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after the first `skip_bytes` bytes.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut frame_start = 0;

    for frame in batch {
        let frame_end = frame_start + frame.len();
        if skip_bytes < frame_end && !frame.is_empty() {
            let start_in_frame = skip_bytes.saturating_sub(frame_start);
            slices.push(IoSlice::new(&frame[start_in_frame..]));
        }
        frame_start = frame_end;
    }

    slices
}
