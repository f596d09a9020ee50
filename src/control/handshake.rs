//! `initialize` handshake.
//!
//! Sent once, right after the reader and writer tasks start.  The request
//! carries the host's protocol version and advertises its hook registrations
//! so the agent knows which `hook_callback` ids it may call back; the
//! agent's answer (supported commands, output styles, …) is kept verbatim by
//! the session, and the protocol version it reports is recorded next to it.
//!
//! ```json
//! {"subtype": "initialize", "protocolVersion": "1", "hooks": {"PreToolUse": [{"matcher": "Bash", "hookCallbackIds": ["hook_0"]}]}}
//! ```

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::control::correlator::Correlator;
use crate::control::registry::HandlerRegistry;
use crate::Result;

/// Control protocol version this host speaks.
pub const PROTOCOL_VERSION: &str = "1";

/// What the agent told us while acknowledging `initialize`.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    /// The agent's answer, verbatim.
    pub server_info: Value,
    /// Protocol version the agent reported, if any.
    pub protocol_version: Option<String>,
}

impl Handshake {
    /// Split an `initialize` answer into the info and the reported version.
    #[must_use]
    pub fn from_answer(server_info: Value) -> Self {
        let protocol_version = server_info
            .get("protocolVersion")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Self {
            server_info,
            protocol_version,
        }
    }
}

/// Build the `initialize` request body.
#[must_use]
pub fn initialize_request(registry: &HandlerRegistry) -> Value {
    json!({
        "subtype": "initialize",
        "protocolVersion": PROTOCOL_VERSION,
        "hooks": registry.hooks_config(),
    })
}

/// Perform the handshake and return what the agent answered.
///
/// A different protocol version is logged, not refused: agents that do not
/// report one are accepted as well.
///
/// # Errors
///
/// Any error of [`Correlator::send_request`]; notably
/// [`AppError::RequestTimeout`](crate::AppError::RequestTimeout) when the
/// agent never answers and
/// [`AppError::ProcessExited`](crate::AppError::ProcessExited) when it dies
/// first.
pub async fn initialize(
    correlator: &Correlator,
    registry: &HandlerRegistry,
    timeout: Duration,
) -> Result<Handshake> {
    debug!(has_hooks = registry.has_hooks(), has_tools = registry.has_tools(), "handshake: sending initialize");
    let answer = correlator
        .send_request(initialize_request(registry), timeout)
        .await?;
    let handshake = Handshake::from_answer(answer);

    match handshake.protocol_version.as_deref() {
        Some(PROTOCOL_VERSION) | None => {}
        Some(other) => {
            warn!(ours = PROTOCOL_VERSION, theirs = other, "handshake: agent speaks a different protocol version");
        }
    }
    info!(protocol_version = ?handshake.protocol_version, "handshake: agent acknowledged initialize");
    Ok(handshake)
}
