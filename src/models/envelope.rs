//! Wire envelopes exchanged with the agent process.
//!
//! Every line on the agent's stdout is one JSON object with a `type`
//! discriminator. Conversation content (`user`, `assistant`, `system`,
//! `result`, `stream_event`) is carried opaquely as a [`Message`]; the three
//! control types are decoded far enough to route them:
//!
//! ```json
//! {"type":"control_request","request_id":"req_1_ab12cd34","request":{"subtype":"can_use_tool", "...": "..."}}
//! {"type":"control_response","response":{"subtype":"success","request_id":"req_1_ab12cd34","response":{}}}
//! {"type":"control_response","response":{"subtype":"error","request_id":"req_1_ab12cd34","error":"boom"}}
//! {"type":"control_cancel_request","request_id":"req_1_ab12cd34"}
//! ```

use serde_json::{json, Map, Value};

use crate::{AppError, Result};

/// Envelope `type` of an outbound or inbound control request.
pub const CONTROL_REQUEST: &str = "control_request";
/// Envelope `type` of a control response.
pub const CONTROL_RESPONSE: &str = "control_response";
/// Envelope `type` of a cancellation notice for an inbound control request.
pub const CONTROL_CANCEL_REQUEST: &str = "control_cancel_request";

/// Longest raw-line excerpt kept in a [`AppError::MalformedFrame`].
const MAX_RAW_EXCERPT: usize = 4096;

// ── Envelope ─────────────────────────────────────────────────────────────────

/// One decoded line of the agent's output.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Conversation content forwarded to the host.
    Stream(Message),
    /// A control request initiated by the agent process.
    ControlRequest(ControlRequestFrame),
    /// The answer to a control request initiated by the host.
    ControlResponse(ControlResponse),
    /// The agent withdrew one of its own control requests.
    ControlCancelRequest {
        /// Correlation id of the withdrawn request.
        request_id: String,
    },
}

/// Classification of a conversation message by its `type` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Echo of user input or tool results.
    User,
    /// Assistant content blocks.
    Assistant,
    /// System notices such as the `init` message.
    System,
    /// Final message of a conversational turn.
    Result,
    /// Partial streaming updates.
    StreamEvent,
    /// Any other `type`, passed through untouched.
    Other(String),
}

impl MessageKind {
    fn from_type(kind: &str) -> Self {
        match kind {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "system" => Self::System,
            "result" => Self::Result,
            "stream_event" => Self::StreamEvent,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// A conversation message, opaque to the transport beyond its kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    kind: MessageKind,
    raw: Value,
}

impl Message {
    /// Message kind derived from the `type` discriminator.
    #[must_use]
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// Whether this message ends a conversational turn.
    #[must_use]
    pub fn is_result(&self) -> bool {
        self.kind == MessageKind::Result
    }

    /// The `session_id` the agent attached to the message, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.raw.get("session_id").and_then(Value::as_str)
    }

    /// The full JSON object as received.
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.raw
    }
}

/// An inbound control request before subtype-specific decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequestFrame {
    /// Correlation id; `None` when the agent omitted it.
    pub request_id: Option<String>,
    /// The `request` object, including its `subtype`.
    pub request: Value,
}

/// A decoded control response.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlResponse {
    /// Correlation id of the request being answered.
    pub request_id: String,
    /// Success payload or error message.
    pub outcome: ControlOutcome,
}

/// Result half of a control response.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    /// Any subtype other than `error`; the `response` object (empty when absent).
    Success(Value),
    /// `subtype: "error"`; the `error` message.
    Error(String),
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// Parse a single NDJSON line into an [`Envelope`].
///
/// # Return value
///
/// - `Ok(Some(envelope))`: a well-formed message.
/// - `Ok(None)`: the line is empty or whitespace.
///
/// # Errors
///
/// - [`AppError::MalformedFrame`]: the line is not a JSON object with a
///   string `type` field.
/// - [`AppError::ProtocolViolation`]: a control envelope lacks a required
///   field.
pub fn parse_line(line: &str) -> Result<Option<Envelope>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| malformed(trimmed, format!("malformed json: {e}")))?;

    let Value::Object(mut object) = value else {
        return Err(malformed(trimmed, "expected a JSON object".to_owned()));
    };

    let Some(kind) = object.get("type").and_then(Value::as_str).map(str::to_owned) else {
        return Err(malformed(
            trimmed,
            "missing string `type` discriminator".to_owned(),
        ));
    };

    let envelope = match kind.as_str() {
        CONTROL_REQUEST => Envelope::ControlRequest(ControlRequestFrame {
            request_id: object
                .get("request_id")
                .and_then(Value::as_str)
                .map(str::to_owned),
            request: object.remove("request").unwrap_or(Value::Null),
        }),
        CONTROL_RESPONSE => Envelope::ControlResponse(parse_control_response(&mut object)?),
        CONTROL_CANCEL_REQUEST => {
            let request_id = object
                .get("request_id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AppError::ProtocolViolation(
                        "missing required field: `request_id` in control_cancel_request".into(),
                    )
                })?;
            Envelope::ControlCancelRequest {
                request_id: request_id.to_owned(),
            }
        }
        other => Envelope::Stream(Message {
            kind: MessageKind::from_type(other),
            raw: Value::Object(object),
        }),
    };

    Ok(Some(envelope))
}

fn parse_control_response(object: &mut Map<String, Value>) -> Result<ControlResponse> {
    let Some(Value::Object(mut response)) = object.remove("response") else {
        return Err(AppError::ProtocolViolation(
            "missing required field: `response` object in control_response".into(),
        ));
    };

    let request_id = response
        .get("request_id")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            AppError::ProtocolViolation(
                "missing required field: `response.request_id` in control_response".into(),
            )
        })?
        .to_owned();

    // Only `error` fails the request; any other subtype is an answer.
    let outcome = match response.get("subtype").and_then(Value::as_str) {
        Some("error") => ControlOutcome::Error(
            response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_owned(),
        ),
        _ => ControlOutcome::Success(
            response
                .remove("response")
                .filter(|v| !v.is_null())
                .unwrap_or_else(|| Value::Object(Map::new())),
        ),
    };

    Ok(ControlResponse {
        request_id,
        outcome,
    })
}

fn malformed(line: &str, reason: String) -> AppError {
    let mut excerpt = line.to_owned();
    if excerpt.len() > MAX_RAW_EXCERPT {
        let mut cut = MAX_RAW_EXCERPT;
        while !excerpt.is_char_boundary(cut) {
            cut -= 1;
        }
        excerpt.truncate(cut);
    }
    AppError::MalformedFrame {
        line: excerpt,
        reason,
    }
}

// ── Outbound builders ────────────────────────────────────────────────────────

/// Build an outbound `control_request` envelope.
#[must_use]
pub fn control_request(request_id: &str, request: Value) -> Value {
    json!({
        "type": CONTROL_REQUEST,
        "request_id": request_id,
        "request": request,
    })
}

/// Build a `control_response` envelope reporting success.
#[must_use]
pub fn success_response(request_id: &str, payload: Value) -> Value {
    json!({
        "type": CONTROL_RESPONSE,
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": payload,
        }
    })
}

/// Build a `control_response` envelope reporting an error.
#[must_use]
pub fn error_response(request_id: &str, message: &str) -> Value {
    json!({
        "type": CONTROL_RESPONSE,
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": message,
        }
    })
}

/// Build a `user` conversation message carrying plain text.
#[must_use]
pub fn user_message(content: &str, session_id: &str) -> Value {
    json!({
        "type": "user",
        "message": { "role": "user", "content": content },
        "parent_tool_use_id": null,
        "session_id": session_id,
    })
}
