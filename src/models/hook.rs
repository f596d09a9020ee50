//! Hook events, hook output directives, and invocation context.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Lifecycle point at which hooks run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookEvent {
    /// Before a tool executes.
    PreToolUse,
    /// After a tool executed.
    PostToolUse,
    /// When the user submits a prompt.
    UserPromptSubmit,
    /// When the agent finishes responding.
    Stop,
    /// When a sub-agent finishes.
    SubagentStop,
    /// Before context compaction.
    PreCompact,
    /// Agent notification.
    Notification,
    /// Event names this crate does not know, matched verbatim.
    Other(String),
}

impl HookEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::Stop => "Stop",
            Self::SubagentStop => "SubagentStop",
            Self::PreCompact => "PreCompact",
            Self::Notification => "Notification",
            Self::Other(name) => name,
        }
    }

    /// Parse a wire event name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "PreToolUse" => Self::PreToolUse,
            "PostToolUse" => Self::PostToolUse,
            "UserPromptSubmit" => Self::UserPromptSubmit,
            "Stop" => Self::Stop,
            "SubagentStop" => Self::SubagentStop,
            "PreCompact" => Self::PreCompact,
            "Notification" => Self::Notification,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Whether the event concerns a specific tool, so matchers apply to the
    /// tool name.
    #[must_use]
    pub fn is_tool_event(&self) -> bool {
        matches!(self, Self::PreToolUse | Self::PostToolUse)
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level decision field of a hook output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HookDecision {
    /// Explicitly approve the in-flight operation.
    Approve,
    /// Block the in-flight operation.
    Block,
}

/// Structured output returned by a hook.
///
/// Serialises with the field names the agent expects (`continue`, `async`,
/// camelCase for the rest). An all-`None` output means "no directive".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookOutput {
    /// `false` stops the agent after this hook.
    #[serde(rename = "continue", default, skip_serializing_if = "Option::is_none")]
    pub continue_: Option<bool>,
    /// Defer the hook result.
    #[serde(rename = "async", default, skip_serializing_if = "Option::is_none")]
    pub async_: Option<bool>,
    /// Hide the hook's output from the transcript.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppress_output: Option<bool>,
    /// Message shown when `continue` is `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// Approve or block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<HookDecision>,
    /// Warning surfaced to the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    /// Explanation for the decision, fed back to the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Event-specific payload, e.g. `permissionDecision` for `PreToolUse`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<Value>,
}

impl HookOutput {
    /// Block the in-flight operation with a reason.
    #[must_use]
    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            decision: Some(HookDecision::Block),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Deny a tool from a `PreToolUse` hook.
    #[must_use]
    pub fn deny_tool(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            hook_specific_output: Some(json!({
                "hookEventName": "PreToolUse",
                "permissionDecision": "deny",
                "permissionDecisionReason": reason,
            })),
            ..Self::default()
        }
    }

    /// Whether this output blocks the in-flight operation.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.decision == Some(HookDecision::Block)
            || self.continue_ == Some(false)
            || self
                .hook_specific_output
                .as_ref()
                .and_then(|v| v.get("permissionDecision"))
                .and_then(Value::as_str)
                == Some("deny")
    }

    /// Overlay `other` onto `self`; fields set in `other` win.
    pub fn merge(&mut self, other: Self) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        overlay!(
            continue_,
            async_,
            suppress_output,
            stop_reason,
            decision,
            system_message,
            reason,
            hook_specific_output
        );
    }

    /// Serialise into the `hook_callback` response payload.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
    }
}

/// Context handed to every hook invocation.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Event being dispatched.
    pub event: HookEvent,
    /// Correlation id of the inbound control request; shared by every hook
    /// invoked for the same dispatch.
    pub request_id: String,
    /// Fires when the agent withdraws the request or the session closes.
    pub cancel: CancellationToken,
}
