//! In-process tool definitions and results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One block of tool output in the protocol's content-block shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// Text content.
        text: String,
    },
    /// Base64-encoded image.
    Image {
        /// Base64 payload.
        data: String,
        /// MIME type, e.g. `image/png`.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

/// Successful return value of a [`ToolHandler`](crate::control::registry::ToolHandler).
///
/// A tool may still report a domain-level failure by setting `is_error`; that
/// is distinct from the handler itself failing, which produces an error
/// control response instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolOutput {
    /// Ordered content blocks.
    pub content: Vec<ContentBlock>,
    /// Tool-level error flag, omitted from the wire when `false`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolOutput {
    /// Output consisting of one text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Output consisting of one text block flagged as a tool-level error.
    #[must_use]
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }

    /// Serialise into the `{content, is_error?}` result object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
    }
}

/// Arguments of an inbound `tool_call` control request.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    /// Registered tool name.
    pub tool_name: String,
    /// Tool arguments; `{}` when omitted.
    #[serde(default = "empty_object")]
    pub input: Value,
    /// Restrict the lookup to one tool server.
    #[serde(default)]
    pub server_name: Option<String>,
    /// Identifier of the tool use in the conversation.
    #[serde(default)]
    pub tool_use_id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Context handed to a tool handler alongside its input.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Correlation id of the inbound control request.
    pub request_id: String,
    /// Identifier of the tool use in the conversation, when known.
    pub tool_use_id: Option<String>,
    /// Fires when the agent withdraws the request or the session closes.
    pub cancel: tokio_util::sync::CancellationToken,
}
