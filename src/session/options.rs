//! Runtime options for one session.

use std::time::Duration;

use crate::control::registry::HandlerRegistry;
use crate::models::permission::PermissionDefault;
use crate::transport::codec::MAX_LINE_BYTES;
use crate::transport::spawner::SpawnConfig;

/// Default time to wait for the `initialize` acknowledgement.
pub const DEFAULT_INITIALIZE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default time to wait for any other outbound control request.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(60);
/// Default bound on waiting for in-flight handlers during close.
pub const DEFAULT_HANDLER_DRAIN: Duration = Duration::from_secs(5);
/// Default flag the in-process tool servers are advertised under.
pub const DEFAULT_MCP_CONFIG_FLAG: &str = "--mcp-config";
/// Default bound on waiting for the first result before ending input.
pub const DEFAULT_STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything a session needs besides its handlers.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How to launch the agent process.
    pub spawn: SpawnConfig,
    /// `session_id` stamped on outgoing user messages.
    pub session_id: String,
    /// Deadline for the `initialize` handshake.
    pub initialize_timeout: Duration,
    /// Deadline for other outbound control requests.
    pub control_timeout: Duration,
    /// Bound on waiting for in-flight handlers during close.
    pub handler_drain: Duration,
    /// Bound on waiting for the first `result` in [`end_input`].
    ///
    /// [`end_input`]: crate::session::Session::end_input
    pub stream_close_timeout: Duration,
    /// Decision for `can_use_tool` without a permission handler.
    pub permission_default: PermissionDefault,
    /// Longest accepted stdout line.
    pub max_line_bytes: usize,
    /// Command-line flag that advertises the in-process tool servers;
    /// `None` leaves the command untouched.
    pub mcp_config_flag: Option<String>,
}

impl SessionOptions {
    /// Options for launching `program` with every other setting defaulted.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            spawn: SpawnConfig::new(program),
            session_id: "default".to_owned(),
            initialize_timeout: DEFAULT_INITIALIZE_TIMEOUT,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            handler_drain: DEFAULT_HANDLER_DRAIN,
            stream_close_timeout: DEFAULT_STREAM_CLOSE_TIMEOUT,
            permission_default: PermissionDefault::default(),
            max_line_bytes: MAX_LINE_BYTES,
            mcp_config_flag: Some(DEFAULT_MCP_CONFIG_FLAG.to_owned()),
        }
    }

    /// The launch command for a session serving `registry`: the configured
    /// command plus the tool-server advertisement, when enabled.
    #[must_use]
    pub fn spawn_config(&self, registry: &HandlerRegistry) -> SpawnConfig {
        let spawn = self.spawn.clone();
        match &self.mcp_config_flag {
            Some(flag) => spawn.args(registry.mcp_config_args(flag)),
            None => spawn,
        }
    }
}
