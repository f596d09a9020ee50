//! Reader task for the agent's stdout.
//!
//! Reads newline-delimited JSON from the agent, parses each line into an
//! [`Envelope`], and hands it to an [`InboundRouter`].  This is the single
//! logical reader of the process output; routing decisions (forward to the
//! host, resolve a pending request, spawn a dispatcher task) are made by the
//! router without ever awaiting host code, so a slow consumer or a slow tool
//! cannot stall unrelated control traffic.
//!
//! The reader is driven by [`FramedRead`] backed by [`NdjsonCodec`], which
//! enforces the per-line limit before any heap allocation for JSON parsing.
//!
//! # Routing
//!
//! | Envelope `type`          | Router callback                            |
//! |--------------------------|--------------------------------------------|
//! | `control_response`       | [`InboundRouter::on_control_response`]     |
//! | `control_request`        | [`InboundRouter::on_control_request`]      |
//! | `control_cancel_request` | [`InboundRouter::on_control_cancel`]       |
//! | *(anything else)*        | [`InboundRouter::on_stream_message`]       |
//! | unparseable line         | [`InboundRouter::on_recoverable_error`]    |

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::envelope::{self, ControlRequestFrame, ControlResponse, Envelope, Message};
use crate::transport::codec::{Frame, NdjsonCodec};
use crate::AppError;

/// Destination for everything the reader decodes.
///
/// Implementations must not block: each callback is invoked inline on the
/// reader task.
pub trait InboundRouter: Send + Sync {
    /// A conversation message, in emission order.
    fn on_stream_message(&self, message: Message);

    /// An agent-initiated control request.
    fn on_control_request(&self, frame: ControlRequestFrame);

    /// The answer to a host-initiated control request.
    fn on_control_response(&self, response: ControlResponse);

    /// The agent withdrew one of its control requests.
    fn on_control_cancel(&self, request_id: String);

    /// A per-line error; the stream continues after it.
    fn on_recoverable_error(&self, error: AppError);
}

/// Why the reader stopped.
#[derive(Debug, Clone)]
pub enum ReaderExit {
    /// The agent closed its stdout.
    Eof,
    /// The cancellation token fired.
    Cancelled,
    /// The underlying stream failed.
    Failed(AppError),
}

/// Reader task: decode lines from `stdout` and route them.
///
/// Malformed or oversized lines are reported through
/// [`InboundRouter::on_recoverable_error`] and skipped; they do **not**
/// terminate the reader.
///
/// # Cancellation
///
/// Respects `cancel`: when the token fires the reader exits without
/// consuming further input.
pub async fn run_reader<R>(
    stdout: R,
    max_line_bytes: usize,
    router: &dyn InboundRouter,
    cancel: CancellationToken,
) -> ReaderExit
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, NdjsonCodec::with_max_line_bytes(max_line_bytes));

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("reader: cancellation received, stopping");
                return ReaderExit::Cancelled;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("reader: EOF detected");
                        return ReaderExit::Eof;
                    }

                    Some(Err(e)) => {
                        warn!(error = %e, "reader: I/O error, stopping");
                        return ReaderExit::Failed(e);
                    }

                    Some(Ok(Frame::Oversized { limit })) => {
                        warn!(limit, "reader: line too long, skipping");
                        router.on_recoverable_error(AppError::MalformedFrame {
                            line: String::new(),
                            reason: format!("line too long: exceeded {limit} bytes"),
                        });
                    }

                    Some(Ok(Frame::Line(line))) => route_line(&line, router),
                }
            }
        }
    }
}

/// Parse one line and hand the result to `router`.
pub fn route_line(line: &str, router: &dyn InboundRouter) {
    match envelope::parse_line(line) {
        Ok(Some(Envelope::Stream(message))) => router.on_stream_message(message),
        Ok(Some(Envelope::ControlRequest(frame))) => router.on_control_request(frame),
        Ok(Some(Envelope::ControlResponse(response))) => router.on_control_response(response),
        Ok(Some(Envelope::ControlCancelRequest { request_id })) => {
            router.on_control_cancel(request_id);
        }
        Ok(None) => {
            // Blank line.
        }
        Err(e) => {
            warn!(error = %e, raw_line = %line, "reader: parse error, skipping line");
            router.on_recoverable_error(e);
        }
    }
}
