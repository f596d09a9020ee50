//! Single-owner writer task for the agent's stdin.
//!
//! Every outbound frame, whether a user message, an outbound control
//! request, or a control response produced by a dispatcher task, goes
//! through one [`mpsc`] channel into [`run_writer`], the only code that
//! touches the sink.  Callers hold a cloneable [`FrameWriter`] and await an
//! acknowledgement that is sent only after the frame has been flushed, so
//! the order on the wire is the order in which `send` calls were made and
//! two producers can never interleave partial lines.

use futures_util::SinkExt;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::transport::codec::NdjsonCodec;
use crate::{AppError, Result};

/// Capacity of the writer's command queue.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Command consumed by the writer task.
#[derive(Debug)]
enum WriteCommand {
    /// Write one serialised line and report the flush result.
    Frame {
        line: String,
        ack: oneshot::Sender<Result<()>>,
    },
    /// Flush, shut the sink down (EOF for the agent), and stop.
    Close { ack: oneshot::Sender<Result<()>> },
}

/// Cloneable handle used by every producer of outbound frames.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    tx: mpsc::Sender<WriteCommand>,
}

impl FrameWriter {
    /// Create a writer handle and the receiving half for [`run_writer`].
    #[must_use]
    pub fn channel() -> (Self, WriterQueue) {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        (Self { tx }, WriterQueue { rx })
    }

    /// Serialise `value` as one line, write it, and wait until it is flushed.
    ///
    /// # Errors
    ///
    /// - [`AppError::BrokenPipe`] if the writer task has stopped or the
    ///   sink reports a broken pipe.
    /// - [`AppError::Io`] for any other write failure.
    pub async fn send(&self, value: &Value) -> Result<()> {
        let line = serde_json::to_string(value)
            .map_err(|e| AppError::Io(format!("failed to serialise outbound message: {e}")))?;

        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteCommand::Frame { line, ack })
            .await
            .map_err(|_| AppError::BrokenPipe("writer stopped: stdin is closed".into()))?;

        done.await
            .map_err(|_| AppError::BrokenPipe("writer stopped before flushing frame".into()))?
    }

    /// Flush pending frames and close the sink so the agent sees EOF.
    ///
    /// Idempotent: closing an already-stopped writer returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns the flush or shutdown error reported by the sink.
    pub async fn close(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self.tx.send(WriteCommand::Close { ack }).await.is_err() {
            return Ok(());
        }
        done.await.unwrap_or(Ok(()))
    }

    /// Whether the writer task is still accepting frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Receiving half of a [`FrameWriter`] channel, consumed by [`run_writer`].
#[derive(Debug)]
pub struct WriterQueue {
    rx: mpsc::Receiver<WriteCommand>,
}

/// Writer task: drains the queue into `sink`, one flushed line at a time.
///
/// The task exits when:
/// - `cancel` is triggered,
/// - a `close` command is processed,
/// - every [`FrameWriter`] is dropped, or
/// - a write fails (the failing caller receives the error; frames still
///   queued receive [`AppError::BrokenPipe`] when their acknowledgement is
///   dropped).
///
/// # Errors
///
/// Returns the first write error encountered.
pub async fn run_writer<W>(sink: W, queue: WriterQueue, cancel: CancellationToken) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let WriterQueue { mut rx } = queue;
    let mut framed = FramedWrite::new(sink, NdjsonCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("writer: cancellation received, stopping");
                break;
            }

            cmd = rx.recv() => {
                match cmd {
                    None => {
                        debug!("writer: all handles dropped, stopping");
                        break;
                    }
                    Some(WriteCommand::Frame { line, ack }) => {
                        trace!(bytes = line.len(), "writer: writing frame");
                        let result = framed.send(line).await;
                        let failed = result.as_ref().err().cloned();
                        // The caller may have been cancelled; the frame is on the wire regardless.
                        let _ = ack.send(result);
                        if let Some(err) = failed {
                            warn!(error = %err, "writer: write to stdin failed, stopping");
                            return Err(err);
                        }
                    }
                    Some(WriteCommand::Close { ack }) => {
                        debug!("writer: closing stdin");
                        let result = SinkExt::<String>::close(&mut framed).await;
                        let _ = ack.send(result);
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
