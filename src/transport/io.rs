//! Byte pumps between a framed message channel and an async byte stream.
//!
//! ```text
//! Transport ─► mpsc::Sender<T> ─► writer task ─► engine stdin
//! Transport ◄─ mpsc::Receiver<Inbound<F>> ◄─ reader task ◄─ FrameBuffer ◄─ engine stdout
//! ```
//!
//! The writer batches whatever is ready into a single vectored write. The
//! reader feeds every chunk into a [`FrameBuffer`] and forwards whole frames.
//! Both report failures as [`Inbound::Failed`] so the session can tear down.

use std::io::IoSlice;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::Inbound;
use crate::error::{LintwireError, Result};
use crate::protocol::{FrameBuffer, Framing};

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Frame encoder used by the writer task.
pub(crate) type Encoder<T> = fn(&T) -> Result<Vec<u8>>;

/// Spawn a writer task that encodes messages from `rx` onto `writer`.
///
/// The task ends cleanly when `rx` closes. Write or encode failures are
/// reported on `events` before the task returns the error.
pub(crate) fn spawn_writer<W, T, F>(
    rx: mpsc::Receiver<T>,
    writer: W,
    encode: Encoder<T>,
    events: mpsc::Sender<Inbound<F>>,
) -> JoinHandle<Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
    T: Send + 'static,
    F: Send + 'static,
{
    tokio::spawn(async move {
        let result = writer_loop(rx, writer, encode).await;
        if let Err(e) = &result {
            error!("engine write failed: {}", e);
            let _ = events.send(Inbound::Failed(e.replicate())).await;
        }
        result
    })
}

/// Main writer loop - receives messages and writes them in batches.
async fn writer_loop<W, T>(
    mut rx: mpsc::Receiver<T>,
    mut writer: W,
    encode: Encoder<T>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(first) = rx.recv().await else {
            // Channel closed, clean shutdown
            return Ok(());
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(encode(&first)?);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(message) => batch.push(encode(&message)?),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
    }
}

/// Write a batch of encoded frames using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[Vec<u8>]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Vec::len).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(LintwireError::Io(std::io::Error::new(
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
fn remaining_slices(batch: &[Vec<u8>], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut start = 0;

    for frame in batch {
        let end = start + frame.len();
        if skip_bytes < end && !frame.is_empty() {
            let from = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&frame[from..]));
        }
        start = end;
    }

    slices
}

/// Spawn a reader task that splits `reader` into frames.
///
/// Emits one [`Inbound::Message`] per frame, then [`Inbound::Closed`] on a
/// clean end of stream or [`Inbound::Failed`] on an I/O or decode error.
pub(crate) fn spawn_reader<R, F>(
    reader: R,
    frames: FrameBuffer<F>,
    read_buffer_size: usize,
    events: mpsc::Sender<Inbound<F::Frame>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Framing + Send + 'static,
    F::Frame: Send + 'static,
{
    tokio::spawn(async move {
        let last = match reader_loop(reader, frames, read_buffer_size, &events).await {
            Ok(()) => Inbound::Closed,
            Err(e) => {
                error!("engine stream failed: {}", e);
                Inbound::Failed(e)
            }
        };
        let _ = events.send(last).await;
    })
}

async fn reader_loop<R, F>(
    mut reader: R,
    mut frames: FrameBuffer<F>,
    read_buffer_size: usize,
    events: &mpsc::Sender<Inbound<F::Frame>>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: Framing,
{
    let mut buf = vec![0u8; read_buffer_size.max(1)];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            debug!("engine stream reached end of file");
            return frames.finish();
        }

        for frame in frames.push(&buf[..n])? {
            if events.send(Inbound::Message(frame)).await.is_err() {
                // Session is gone, nobody is listening.
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_message, Message};
    use serde_json::json;
    use std::io::Cursor;
    use tokio::io::duplex;

    #[test]
    fn test_remaining_slices_no_skip() {
        let batch = vec![vec![1u8; 4], vec![2u8; 6]];
        let slices = remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_remaining_slices_partial_first() {
        let batch = vec![vec![1u8; 4], vec![2u8; 6]];
        let slices = remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 1);
        assert_eq!(slices[1].len(), 6);
    }

    #[test]
    fn test_remaining_slices_skip_first() {
        let batch = vec![vec![1u8; 4], vec![2u8; 6]];
        let slices = remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 5);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5u64)
            .map(|id| encode_message(&Message::new(id, "lint", json!(null))).unwrap())
            .collect();
        let expected: usize = batch.iter().map(Vec::len).sum();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), expected);
    }

    #[tokio::test]
    async fn test_writer_to_reader() {
        let (client, server) = duplex(64);
        let (tx, rx) = mpsc::channel::<Message>(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let writer = spawn_writer(rx, client, encode_message, events_tx.clone());
        spawn_reader(server, FrameBuffer::length_prefixed(), 7, events_tx);

        for id in 1..=10u64 {
            tx.send(Message::new(id, "lint", json!({ "file": format!("{}.ts", id) })))
                .await
                .unwrap();
        }
        drop(tx);

        for id in 1..=10u64 {
            match events_rx.recv().await.unwrap() {
                Inbound::Message(message) => assert_eq!(message.id, id),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        // Writer drops the stream half, reader sees a clean end of file.
        writer.await.unwrap().unwrap();
        assert!(matches!(events_rx.recv().await, Some(Inbound::Closed)));
    }

    #[tokio::test]
    async fn test_reader_reports_truncated_stream() {
        let frame = encode_message(&Message::new(1, "lint", json!("x"))).unwrap();
        let truncated = frame[..frame.len() - 2].to_vec();
        let (events_tx, mut events_rx) = mpsc::channel(4);

        spawn_reader(
            Cursor::new(truncated),
            FrameBuffer::length_prefixed(),
            1024,
            events_tx,
        );

        assert!(matches!(
            events_rx.recv().await,
            Some(Inbound::Failed(LintwireError::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn test_reader_reports_malformed_frame() {
        let mut bad = 2u32.to_le_bytes().to_vec();
        bad.extend_from_slice(b"]]");
        let (events_tx, mut events_rx) = mpsc::channel(4);

        spawn_reader(Cursor::new(bad), FrameBuffer::length_prefixed(), 1024, events_tx);

        match events_rx.recv().await {
            Some(Inbound::Failed(e)) => assert!(e.to_string().contains("invalid message body")),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
