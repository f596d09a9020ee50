//! Configuration parsing and validation.
//!
//! ```toml
//! [process]
//! command = "claude"
//! args = ["--output-format", "stream-json", "--input-format", "stream-json"]
//! cwd = "/work/project"
//! inherit_env = false
//!
//! [process.env]
//! CLAUDE_CODE_ENTRYPOINT = "sdk-rust"
//!
//! [timeouts]
//! initialize_seconds = 60
//!
//! [permissions]
//! default = "deny"
//!
//! [framing]
//! max_line_bytes = 1048576
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::permission::PermissionDefault;
use crate::session::SessionOptions;
use crate::transport::codec::MAX_LINE_BYTES;
use crate::transport::spawner::SpawnConfig;
use crate::{AppError, Result};

/// Smallest accepted line limit; anything lower cannot carry a handshake.
const MIN_LINE_BYTES: usize = 1024;

/// How to launch the agent process.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProcessConfig {
    /// Program name or path.
    pub command: String,
    /// Arguments, passed verbatim.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; the current directory when absent.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Pass the full parent environment instead of the allowlist.  Off by
    /// default, as for [`SpawnConfig::new`](crate::transport::spawner::SpawnConfig::new).
    #[serde(default)]
    pub inherit_env: bool,
    /// `session_id` stamped on outgoing user messages.
    #[serde(default = "default_session_id")]
    pub session_id: String,
}

fn default_session_id() -> String {
    "default".into()
}

/// Timeouts, in seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// `initialize` handshake.
    #[serde(default = "default_sixty")]
    pub initialize_seconds: u64,
    /// Every other outbound control request.
    #[serde(default = "default_sixty")]
    pub control_request_seconds: u64,
    /// Between `SIGTERM` and kill on close.
    #[serde(default = "default_close_grace")]
    pub close_grace_seconds: u64,
    /// Waiting for in-flight handlers on close.
    #[serde(default = "default_handler_drain")]
    pub handler_drain_seconds: u64,
    /// Waiting for the first result before ending input.
    #[serde(default = "default_sixty")]
    pub stream_close_seconds: u64,
}

fn default_sixty() -> u64 {
    60
}

fn default_close_grace() -> u64 {
    2
}

fn default_handler_drain() -> u64 {
    5
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initialize_seconds: default_sixty(),
            control_request_seconds: default_sixty(),
            close_grace_seconds: default_close_grace(),
            handler_drain_seconds: default_handler_drain(),
            stream_close_seconds: default_sixty(),
        }
    }
}

/// Permission behaviour without a host permission handler.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PermissionConfig {
    /// `"allow"` or `"deny"`.
    #[serde(default)]
    pub default: PermissionDefault,
}

/// Stream framing limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct FramingConfig {
    /// Longest accepted stdout line.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Stderr lines kept for error reports.
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
}

fn default_max_line_bytes() -> usize {
    MAX_LINE_BYTES
}

fn default_stderr_tail_lines() -> usize {
    100
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            stderr_tail_lines: default_stderr_tail_lines(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConduitConfig {
    /// Agent process.
    pub process: ProcessConfig,
    /// Timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Permission default.
    #[serde(default)]
    pub permissions: PermissionConfig,
    /// Framing limits.
    #[serde(default)]
    pub framing: FramingConfig,
}

impl ConduitConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants and canonicalise the working directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the offending setting.
    pub fn validate(&mut self) -> Result<()> {
        if self.process.command.trim().is_empty() {
            return Err(AppError::Config("process.command must not be empty".into()));
        }

        if self.timeouts.initialize_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.initialize_seconds must be greater than zero".into(),
            ));
        }

        if self.timeouts.control_request_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.control_request_seconds must be greater than zero".into(),
            ));
        }

        if self.framing.max_line_bytes < MIN_LINE_BYTES {
            return Err(AppError::Config(format!(
                "framing.max_line_bytes must be at least {MIN_LINE_BYTES}"
            )));
        }

        if let Some(cwd) = &self.process.cwd {
            let canonical = cwd
                .canonicalize()
                .map_err(|err| AppError::Config(format!("process.cwd invalid: {err}")))?;
            if !canonical.is_dir() {
                return Err(AppError::Config(format!(
                    "process.cwd is not a directory: {}",
                    canonical.display()
                )));
            }
            self.process.cwd = Some(canonical);
        }

        Ok(())
    }

    /// Runtime options for a session.
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        let mut spawn = SpawnConfig::new(self.process.command.clone()).args(self.process.args.clone());
        spawn.env.clone_from(&self.process.env);
        spawn.inherit_env = self.process.inherit_env;
        spawn.cwd.clone_from(&self.process.cwd);
        spawn.stderr_tail_lines = self.framing.stderr_tail_lines;
        spawn.terminate_grace = Duration::from_secs(self.timeouts.close_grace_seconds);

        let mut options = SessionOptions::new(self.process.command.clone());
        options.spawn = spawn;
        options.session_id.clone_from(&self.process.session_id);
        options.initialize_timeout = Duration::from_secs(self.timeouts.initialize_seconds);
        options.control_timeout = Duration::from_secs(self.timeouts.control_request_seconds);
        options.handler_drain = Duration::from_secs(self.timeouts.handler_drain_seconds);
        options.stream_close_timeout = Duration::from_secs(self.timeouts.stream_close_seconds);
        options.permission_default = self.permissions.default;
        options.max_line_bytes = self.framing.max_line_bytes;
        options
    }
}
