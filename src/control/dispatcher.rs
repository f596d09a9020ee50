//! Inbound control request dispatch.
//!
//! The reader hands every agent-initiated `control_request` to
//! [`Dispatcher::dispatch`], which returns immediately after spawning a
//! task on the dispatcher's [`TaskTracker`].  Each task writes exactly one
//! `control_response` for its request, whatever happens to the handler:
//!
//! | Outcome                          | Response                              |
//! |----------------------------------|---------------------------------------|
//! | handler returned a value         | `success` with the serialised payload |
//! | handler error or panic           | `error` (`handler failure: …`)        |
//! | unknown subtype / missing field  | `error` (`protocol violation: …`)     |
//! | `control_cancel_request` or close| `error` (`request cancelled`)         |
//!
//! Requests without a `request_id` cannot be answered and are dropped.
//!
//! Each task runs in a `control_request` span carrying `request_id` and
//! `subtype`; handler invocations get a nested `tool`, `hook`, `permission`
//! or `mcp` span.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::control::mcp;
use crate::control::registry::{run_guarded, HandlerRegistry, HookCallback};
use crate::models::envelope::{self, ControlRequestFrame};
use crate::models::hook::{HookContext, HookEvent, HookOutput};
use crate::models::permission::{
    PermissionContext, PermissionDecision, PermissionDefault, PermissionRequest,
};
use crate::models::tool::{ToolCallRequest, ToolContext};
use crate::transport::writer::FrameWriter;
use crate::{AppError, Result};

/// Error message sent for withdrawn or abandoned requests.
pub const CANCELLED_MESSAGE: &str = "request cancelled";

/// Payload of an inbound `hook_callback` request.
#[derive(Debug, Deserialize)]
struct HookCallbackRequest {
    #[serde(default)]
    callback_id: Option<String>,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    tool_use_id: Option<String>,
}

/// Payload of an inbound `mcp_message` request.
#[derive(Debug, Deserialize)]
struct McpMessageRequest {
    server_name: String,
    message: Value,
}

/// Cancel handle of one running dispatcher task.
#[derive(Debug)]
struct InFlight {
    /// Distinguishes tasks that reused the same `request_id`.
    slot: u64,
    cancel: CancellationToken,
}

/// Routes inbound control requests to host handlers.
///
/// Cheap to clone; clones share in-flight bookkeeping.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    writer: FrameWriter,
    tracker: TaskTracker,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    next_slot: Arc<AtomicU64>,
    /// `tool_use_id`s a `PreToolUse` hook has blocked in the current turn.
    blocked_tool_uses: Arc<Mutex<HashSet<String>>>,
    permission_default: PermissionDefault,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher answering through `writer`.
    #[must_use]
    pub fn new(
        registry: Arc<HandlerRegistry>,
        writer: FrameWriter,
        permission_default: PermissionDefault,
    ) -> Self {
        Self {
            registry,
            writer,
            tracker: TaskTracker::new(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_slot: Arc::new(AtomicU64::new(0)),
            blocked_tool_uses: Arc::new(Mutex::new(HashSet::new())),
            permission_default,
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of dispatcher tasks still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Spawn a task that answers `frame`.  Never blocks.
    pub fn dispatch(&self, frame: ControlRequestFrame) {
        let Some(request_id) = frame.request_id else {
            warn!(request = %frame.request, "dispatcher: control request without request_id, dropping");
            return;
        };

        let subtype = frame
            .request
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();
        let cancel = self.shutdown.child_token();
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&request_id) {
                warn!(%request_id, "dispatcher: duplicate request_id while still in flight");
            }
            in_flight.insert(
                request_id.clone(),
                InFlight {
                    slot,
                    cancel: cancel.clone(),
                },
            );
        }

        let span = info_span!("control_request", %request_id, %subtype);
        let this = self.clone();
        let task = async move {
            debug!("dispatcher: handling control request");

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = this.handle(&request_id, &subtype, frame.request, cancel.clone()) => Some(result),
            };
            this.forget(&request_id, slot);

            let response = match outcome {
                Some(Ok(payload)) => envelope::success_response(&request_id, payload),
                Some(Err(err)) => {
                    warn!(%request_id, %subtype, error = %err, "dispatcher: control request failed");
                    envelope::error_response(&request_id, &err.to_string())
                }
                None => {
                    info!(%request_id, %subtype, "dispatcher: control request cancelled");
                    envelope::error_response(&request_id, CANCELLED_MESSAGE)
                }
            };

            if let Err(err) = this.writer.send(&response).await {
                warn!(%request_id, error = %err, "dispatcher: failed to write control response");
            }
        };
        self.tracker.spawn(task.instrument(span));
    }

    /// Drop the cancel handle of task `slot`, unless a newer task with the
    /// same id has replaced it.
    fn forget(&self, request_id: &str, slot: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(request_id).is_some_and(|entry| entry.slot == slot) {
            in_flight.remove(request_id);
        }
    }

    /// Cancel the in-flight request `request_id`, if any.
    pub fn cancel(&self, request_id: &str) {
        match self.in_flight.lock().get(request_id) {
            Some(entry) => {
                debug!(request_id, "dispatcher: cancelling in-flight request");
                entry.cancel.cancel();
            }
            None => debug!(request_id, "dispatcher: cancel for unknown request, ignoring"),
        }
    }

    /// The current turn ended: forget the tool uses its hooks blocked.
    pub fn end_turn(&self) {
        let mut blocked = self.blocked_tool_uses.lock();
        if !blocked.is_empty() {
            debug!(count = blocked.len(), "dispatcher: clearing blocked tool uses");
            blocked.clear();
        }
    }

    /// Wait up to `drain` for in-flight tasks, then cancel the rest and wait
    /// up to `drain` again for their cancellation responses.
    ///
    /// Returns `true` if every task finished.
    pub async fn shutdown(&self, drain: Duration) -> bool {
        self.tracker.close();
        if tokio::time::timeout(drain, self.tracker.wait()).await.is_ok() {
            return true;
        }
        warn!(remaining = self.tracker.len(), "dispatcher: drain timed out, cancelling handlers");
        self.shutdown.cancel();
        tokio::time::timeout(drain, self.tracker.wait()).await.is_ok()
    }

    /// Cancel every in-flight handler without waiting.
    pub fn abort(&self) {
        self.tracker.close();
        self.shutdown.cancel();
    }

    // ── Subtype handlers ─────────────────────────────────────────────────────

    async fn handle(
        &self,
        request_id: &str,
        subtype: &str,
        request: Value,
        cancel: CancellationToken,
    ) -> Result<Value> {
        match subtype {
            "tool_call" => self.handle_tool_call(request_id, request, cancel).await,
            "hook_callback" => self.handle_hook_callback(request_id, request, cancel).await,
            "can_use_tool" => self.handle_can_use_tool(request_id, request, cancel).await,
            "mcp_message" => self.handle_mcp_message(request_id, request, cancel).await,
            "" => Err(AppError::ProtocolViolation(
                "missing required field: `request.subtype`".into(),
            )),
            other => Err(AppError::ProtocolViolation(format!(
                "unsupported control request subtype: {other}"
            ))),
        }
    }

    async fn handle_tool_call(
        &self,
        request_id: &str,
        request: Value,
        cancel: CancellationToken,
    ) -> Result<Value> {
        let call: ToolCallRequest = decode("tool_call", request)?;
        let tool = self
            .registry
            .find_tool(&call.tool_name, call.server_name.as_deref())
            .ok_or_else(|| AppError::HandlerFailure(format!("tool not found: {}", call.tool_name)))?;

        let handler = tool.handler.clone();
        let ctx = ToolContext {
            request_id: request_id.to_owned(),
            tool_use_id: call.tool_use_id,
            cancel,
        };
        let input = call.input;
        let span = info_span!("tool", tool_name = %call.tool_name, server_name = ?call.server_name);
        let output = run_guarded(
            &format!("tool '{}'", call.tool_name),
            async move { handler.call(input, ctx).await }.instrument(span),
        )
        .await?;

        Ok(output.to_value())
    }

    async fn handle_hook_callback(
        &self,
        request_id: &str,
        request: Value,
        cancel: CancellationToken,
    ) -> Result<Value> {
        let call: HookCallbackRequest = decode("hook_callback", request)?;
        let event_name = call.input.get("hook_event_name").and_then(Value::as_str);

        if event_name == Some(HookEvent::PostToolUse.as_str()) {
            if let Some(tool_use_id) = &call.tool_use_id {
                self.blocked_tool_uses.lock().remove(tool_use_id);
            }
        }

        let callbacks = if let Some(id) = call.callback_id.as_deref() {
            let callback = self.registry.callback(id).ok_or_else(|| {
                AppError::ProtocolViolation(format!("no hook callback registered for id '{id}'"))
            })?;
            vec![callback.clone()]
        } else {
            let event = HookEvent::from_name(event_name.ok_or_else(|| {
                AppError::ProtocolViolation(
                    "missing required field: `input.hook_event_name` in hook_callback".into(),
                )
            })?);
            let tool_name = call.input.get("tool_name").and_then(Value::as_str);
            self.registry.matching_hooks(&event, tool_name)
        };

        let mut merged = HookOutput::default();
        for callback in callbacks {
            let event = event_name.map_or_else(|| callback.event.clone(), HookEvent::from_name);
            let ctx = HookContext {
                event: event.clone(),
                request_id: request_id.to_owned(),
                cancel: cancel.clone(),
            };
            let Some(output) = run_hook(&callback, call.input.clone(), call.tool_use_id.clone(), ctx).await
            else {
                continue;
            };

            if output.is_blocking() {
                debug!(request_id, callback_id = %callback.id, %event, "dispatcher: hook blocked, skipping remaining hooks");
                if event == HookEvent::PreToolUse {
                    if let Some(tool_use_id) = &call.tool_use_id {
                        self.blocked_tool_uses.lock().insert(tool_use_id.clone());
                    }
                }
                return Ok(output.to_value());
            }
            merged.merge(output);
        }

        Ok(merged.to_value())
    }

    async fn handle_can_use_tool(
        &self,
        request_id: &str,
        request: Value,
        cancel: CancellationToken,
    ) -> Result<Value> {
        let permission: PermissionRequest = decode("can_use_tool", request)?;
        let original_input = permission.input.clone();

        let blocked = permission
            .tool_use_id
            .as_ref()
            .is_some_and(|id| self.blocked_tool_uses.lock().remove(id));
        if blocked {
            debug!(request_id, tool_name = %permission.tool_name, "dispatcher: tool use already blocked by hook");
            return Ok(PermissionDecision::deny("blocked by PreToolUse hook").to_response(&original_input));
        }

        let decision = match self.registry.permission_handler() {
            Some(handler) => {
                let handler = handler.clone();
                let tool_name = permission.tool_name.clone();
                let ctx = PermissionContext {
                    request_id: request_id.to_owned(),
                    cancel,
                };
                let span = info_span!("permission", tool_name = %tool_name);
                run_guarded(
                    &format!("permission check for '{tool_name}'"),
                    async move { handler.check(permission, ctx).await }.instrument(span),
                )
                .await?
            }
            None => {
                debug!(request_id, tool_name = %permission.tool_name, default = ?self.permission_default, "dispatcher: no permission handler, applying default");
                self.permission_default.decision()
            }
        };

        Ok(decision.to_response(&original_input))
    }

    async fn handle_mcp_message(
        &self,
        request_id: &str,
        request: Value,
        cancel: CancellationToken,
    ) -> Result<Value> {
        let call: McpMessageRequest = decode("mcp_message", request)?;
        let ctx = ToolContext {
            request_id: request_id.to_owned(),
            tool_use_id: None,
            cancel,
        };
        let span = info_span!("mcp", server_name = %call.server_name);
        let response = mcp::handle_message(&self.registry, &call.server_name, &call.message, ctx)
            .instrument(span)
            .await;
        Ok(json!({ "mcp_response": response }))
    }
}

/// Invoke one hook; failures and timeouts count as "no directive".
async fn run_hook(
    callback: &HookCallback,
    input: Value,
    tool_use_id: Option<String>,
    ctx: HookContext,
) -> Option<HookOutput> {
    let handler = callback.handler.clone();
    let what = format!("hook '{}'", callback.id);
    let span = info_span!("hook", callback_id = %callback.id, event = %ctx.event);
    let invocation = run_guarded(
        &what,
        async move { handler.call(input, tool_use_id, ctx).await }.instrument(span),
    );

    let result = match callback.timeout {
        Some(limit) => match tokio::time::timeout(limit, invocation).await {
            Ok(result) => result,
            Err(_) => Err(AppError::HandlerFailure(format!(
                "hook '{}' exceeded {limit:?}",
                callback.id
            ))),
        },
        None => invocation.await,
    };

    match result {
        Ok(output) => Some(output),
        Err(err) => {
            warn!(callback_id = %callback.id, error = %err, "dispatcher: hook failed, ignoring");
            None
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(subtype: &str, request: Value) -> Result<T> {
    serde_json::from_value(request)
        .map_err(|e| AppError::ProtocolViolation(format!("invalid {subtype} request: {e}")))
}
