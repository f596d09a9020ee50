//! NDJSON codec for agent streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum line
//! length to prevent memory exhaustion caused by unterminated or maliciously
//! large messages from a misbehaving agent process.
//!
//! # Usage
//!
//! Use [`NdjsonCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`] (inbound) and
//! [`tokio_util::codec::FramedWrite`] (outbound).  Both directions enforce
//! UTF-8 line framing delimited by `\n`.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Default maximum line length accepted by the codec: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line without its terminator.
    Line(String),
    /// A line exceeded the length limit and was discarded.
    Oversized {
        /// The limit that was exceeded.
        limit: usize,
    },
}

/// NDJSON codec for bidirectional agent streams.
///
/// Delegates line-framing to [`LinesCodec`].  Each newline-terminated (`\n`)
/// UTF-8 string is one complete message.
///
/// # Decoder
///
/// Inbound lines longer than the limit decode as [`Frame::Oversized`]
/// rather than as an error: the codec discards input up to the next newline
/// and resumes, so one oversized message never ends the stream.  I/O errors
/// are mapped through `From<std::io::Error>`.
///
/// # Encoder
///
/// Outbound strings are encoded as `item\n`.  The max-length limit is a
/// decoder-side concern and is not enforced during encoding.
///
/// # Examples
///
/// ```rust,ignore
/// use tokio_util::codec::FramedRead;
/// use agent_conduit::transport::codec::NdjsonCodec;
///
/// let reader = FramedRead::new(child_stdout, NdjsonCodec::new());
/// ```
#[derive(Debug)]
pub struct NdjsonCodec {
    inner: LinesCodec,
    max_line_bytes: usize,
}

impl NdjsonCodec {
    /// Create a new `NdjsonCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line-length limit.
    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    fn map_decoded(
        &self,
        decoded: std::result::Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Frame>> {
        match decoded {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized {
                limit: self.max_line_bytes,
            })),
            Err(LinesCodecError::Io(io_err)) => Err(AppError::from(io_err)),
        }
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = Frame;
    type Error = AppError;

    /// Decode the next newline-terminated line from `src`.
    ///
    /// Returns `Ok(None)` when `src` contains no complete line yet (buffering).
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let decoded = self.inner.decode(src);
        self.map_decoded(decoded)
    }

    /// Decode the final line when the stream reaches EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let decoded = self.inner.decode_eof(src);
        self.map_decoded(decoded)
    }
}

impl Encoder<String> for NdjsonCodec {
    type Error = AppError;

    /// Encode `item` as a `\n`-terminated NDJSON line into `dst`.
    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.inner.encode(item, dst).map_err(|e| match e {
            LinesCodecError::Io(io_err) => AppError::from(io_err),
            LinesCodecError::MaxLineLengthExceeded => {
                AppError::Io("outbound line exceeded codec limit".into())
            }
        })
    }
}
