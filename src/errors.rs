//! Error types shared across the crate.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every transport and control-protocol failure.
///
/// Per-message errors ([`AppError::MalformedFrame`],
/// [`AppError::ProtocolViolation`]) are recoverable: the offending line is
/// skipped and the stream continues. Process-level errors end the session and
/// are broadcast to every outstanding awaiter. [`AppError::HandlerFailure`]
/// only ever affects the single control exchange that raised it.
#[derive(Debug, Clone)]
pub enum AppError {
    /// The external executable could not be found when spawning.
    ExecutableNotFound(String),
    /// The external process exited while the session still needed it.
    ProcessExited {
        /// Exit code, when the process exited normally.
        code: Option<i32>,
        /// Terminating signal number, when the process was signalled.
        signal: Option<i32>,
        /// Tail of the process's stderr output, if any was captured.
        stderr: Option<String>,
    },
    /// A write was attempted after the process stopped reading stdin.
    BrokenPipe(String),
    /// An inbound line was not a JSON object with a `type` discriminator.
    MalformedFrame {
        /// The raw line as received (possibly truncated for over-long lines).
        line: String,
        /// Why the line was rejected.
        reason: String,
    },
    /// Unknown control subtype or a missing/invalid required field.
    ProtocolViolation(String),
    /// A pending control request exceeded its deadline.
    RequestTimeout {
        /// Control subtype of the request that timed out.
        subtype: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// Operation attempted on a session that is closing or closed.
    SessionClosed(String),
    /// A host callback returned an error or panicked.
    HandlerFailure(String),
    /// The peer answered a control request with an error response.
    ControlError(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the error is confined to a single message or exchange.
    ///
    /// Recoverable errors may appear on the output sequence without ending it.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame { .. }
                | Self::ProtocolViolation(_)
                | Self::HandlerFailure(_)
                | Self::ControlError(_)
                | Self::RequestTimeout { .. }
        )
    }

    /// Exit code carried by a [`AppError::ProcessExited`] error.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ProcessExited { code, .. } => *code,
            _ => None,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExecutableNotFound(msg) => write!(f, "executable not found: {msg}"),
            Self::ProcessExited {
                code,
                signal,
                stderr,
            } => {
                match (code, signal) {
                    (Some(code), _) => write!(f, "process exited: exit code {code}")?,
                    (None, Some(signal)) => write!(f, "process exited: killed by signal {signal}")?,
                    (None, None) => write!(f, "process exited: stream closed")?,
                }
                if let Some(stderr) = stderr.as_deref().filter(|s| !s.is_empty()) {
                    write!(f, "\nstderr: {stderr}")?;
                }
                Ok(())
            }
            Self::BrokenPipe(msg) => write!(f, "broken pipe: {msg}"),
            Self::MalformedFrame { reason, .. } => write!(f, "malformed frame: {reason}"),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Self::RequestTimeout { subtype, timeout } => {
                write!(f, "request timeout: {subtype} after {timeout:?}")
            }
            Self::SessionClosed(msg) => write!(f, "session closed: {msg}"),
            Self::HandlerFailure(msg) => write!(f, "handler failure: {msg}"),
            Self::ControlError(msg) => write!(f, "control error: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                Self::BrokenPipe(err.to_string())
            }
            _ => Self::Io(err.to_string()),
        }
    }
}
