//! Tool permission requests and decisions.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

/// The proposed action carried by an inbound `can_use_tool` request.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PermissionRequest {
    /// Tool the agent wants to run.
    pub tool_name: String,
    /// Proposed tool input.
    #[serde(default)]
    pub input: Value,
    /// Permission updates the agent suggests the host could apply.
    #[serde(default, rename = "permission_suggestions")]
    pub suggestions: Option<Vec<Value>>,
    /// Conversation tool-use identifier, when the agent supplies one.
    #[serde(default)]
    pub tool_use_id: Option<String>,
    /// Path that triggered the check, for file-system tools.
    #[serde(default)]
    pub blocked_path: Option<String>,
}

/// Context handed to a permission handler alongside the request.
#[derive(Debug, Clone)]
pub struct PermissionContext {
    /// Correlation id of the inbound control request.
    pub request_id: String,
    /// Fires when the agent withdraws the request or the session closes.
    pub cancel: CancellationToken,
}

/// A host permission decision.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    /// Let the tool run, optionally with rewritten input or new rules.
    Allow {
        /// Replacement input; the original input is echoed when `None`.
        updated_input: Option<Value>,
        /// Permission rule updates to apply.
        updated_permissions: Option<Vec<Value>>,
    },
    /// Refuse the tool call.
    Deny {
        /// Explanation shown to the agent.
        message: String,
        /// Also interrupt the current turn.
        interrupt: bool,
    },
}

impl PermissionDecision {
    /// Allow with the original input.
    #[must_use]
    pub fn allow() -> Self {
        Self::Allow {
            updated_input: None,
            updated_permissions: None,
        }
    }

    /// Allow with a rewritten input.
    #[must_use]
    pub fn allow_with_input(input: Value) -> Self {
        Self::Allow {
            updated_input: Some(input),
            updated_permissions: None,
        }
    }

    /// Deny without interrupting.
    #[must_use]
    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    /// Whether the decision lets the tool run.
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    /// Serialise into the `can_use_tool` response payload.
    ///
    /// `original_input` is echoed as `updatedInput` when the decision does
    /// not rewrite it.
    #[must_use]
    pub fn to_response(&self, original_input: &Value) -> Value {
        match self {
            Self::Allow {
                updated_input,
                updated_permissions,
            } => {
                let mut body = Map::new();
                body.insert("behavior".into(), json!("allow"));
                body.insert(
                    "updatedInput".into(),
                    updated_input
                        .clone()
                        .unwrap_or_else(|| original_input.clone()),
                );
                if let Some(rules) = updated_permissions {
                    body.insert("updatedPermissions".into(), Value::Array(rules.clone()));
                }
                Value::Object(body)
            }
            Self::Deny { message, interrupt } => {
                let mut body = Map::new();
                body.insert("behavior".into(), json!("deny"));
                body.insert("message".into(), json!(message));
                if *interrupt {
                    body.insert("interrupt".into(), json!(true));
                }
                Value::Object(body)
            }
        }
    }
}

/// Decision applied to `can_use_tool` when no permission handler is registered.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDefault {
    /// Allow every tool with its original input.
    Allow,
    /// Deny every tool.
    #[default]
    Deny,
}

impl PermissionDefault {
    /// The decision this default stands for.
    #[must_use]
    pub fn decision(self) -> PermissionDecision {
        match self {
            Self::Allow => PermissionDecision::allow(),
            Self::Deny => PermissionDecision::deny("no permission handler registered"),
        }
    }
}
