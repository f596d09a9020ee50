//! Unit tests for the domain models: lifecycle states, hook outputs,
//! permission decisions, and tool outputs.

use serde_json::json;

use agent_conduit::models::hook::{HookDecision, HookEvent, HookOutput};
use agent_conduit::models::permission::{PermissionDecision, PermissionDefault, PermissionRequest};
use agent_conduit::models::session::SessionState;
use agent_conduit::models::tool::{ContentBlock, ToolCallRequest, ToolOutput};

// ── SessionState ─────────────────────────────────────────────────────────────

/// The documented lifecycle edges are allowed and nothing leaves `Closed`.
#[test]
fn session_state_transitions() {
    use SessionState::{Active, Closed, Closing, Interrupting, Starting};

    let allowed = [
        (Starting, Active),
        (Active, Interrupting),
        (Interrupting, Active),
        (Active, Closing),
        (Interrupting, Closing),
        (Starting, Closing),
        (Closing, Closed),
        (Starting, Closed),
        (Active, Closed),
        (Interrupting, Closed),
    ];
    for (from, to) in allowed {
        assert!(from.can_transition_to(to), "{from} -> {to} should be allowed");
    }

    let forbidden = [
        (Closed, Active),
        (Closed, Closing),
        (Closing, Active),
        (Starting, Interrupting),
        (Active, Starting),
        (Interrupting, Interrupting),
    ];
    for (from, to) in forbidden {
        assert!(!from.can_transition_to(to), "{from} -> {to} should be rejected");
    }
}

/// Input is accepted only while active or interrupting.
#[test]
fn session_state_predicates() {
    assert!(SessionState::Active.accepts_input());
    assert!(SessionState::Interrupting.accepts_input());
    assert!(!SessionState::Starting.accepts_input());
    assert!(!SessionState::Closing.accepts_input());
    assert!(SessionState::Closing.is_shutting_down());
    assert!(SessionState::Closed.is_shutting_down());
    assert!(SessionState::Closed.is_closed());
    assert!(!SessionState::Closing.is_closed());
    assert_eq!(SessionState::Interrupting.to_string(), "interrupting");
}

// ── Hooks ────────────────────────────────────────────────────────────────────

/// Event names round-trip and unknown names are preserved.
#[test]
fn hook_event_names() {
    assert_eq!(HookEvent::from_name("PreToolUse"), HookEvent::PreToolUse);
    assert_eq!(HookEvent::PreCompact.as_str(), "PreCompact");
    assert_eq!(
        HookEvent::from_name("SessionStart"),
        HookEvent::Other("SessionStart".into())
    );
    assert!(HookEvent::PostToolUse.is_tool_event());
    assert!(!HookEvent::Stop.is_tool_event());
}

/// Blocking is signalled by `decision`, `continue: false`, or a deny
/// permission decision.
#[test]
fn hook_output_blocking() {
    assert!(!HookOutput::default().is_blocking());
    assert!(HookOutput::block("nope").is_blocking());
    assert!(HookOutput::deny_tool("nope").is_blocking());
    assert!(HookOutput {
        continue_: Some(false),
        ..HookOutput::default()
    }
    .is_blocking());
    assert!(!HookOutput {
        decision: Some(HookDecision::Approve),
        ..HookOutput::default()
    }
    .is_blocking());
}

/// Outputs serialise with the agent's field names and omit unset fields.
#[test]
fn hook_output_wire_names() {
    let output = HookOutput {
        continue_: Some(true),
        async_: Some(false),
        suppress_output: Some(true),
        stop_reason: Some("done".into()),
        decision: Some(HookDecision::Approve),
        system_message: Some("note".into()),
        reason: Some("why".into()),
        hook_specific_output: Some(json!({ "hookEventName": "Stop" })),
    };
    assert_eq!(
        output.to_value(),
        json!({
            "continue": true,
            "async": false,
            "suppressOutput": true,
            "stopReason": "done",
            "decision": "approve",
            "systemMessage": "note",
            "reason": "why",
            "hookSpecificOutput": { "hookEventName": "Stop" },
        })
    );
    assert_eq!(HookOutput::default().to_value(), json!({}));
}

/// Merging overlays only the fields the later output sets.
#[test]
fn hook_output_merge_overlays_set_fields() {
    let mut merged = HookOutput {
        system_message: Some("first".into()),
        reason: Some("kept".into()),
        ..HookOutput::default()
    };
    merged.merge(HookOutput {
        system_message: Some("second".into()),
        suppress_output: Some(true),
        ..HookOutput::default()
    });

    assert_eq!(merged.system_message.as_deref(), Some("second"));
    assert_eq!(merged.reason.as_deref(), Some("kept"));
    assert_eq!(merged.suppress_output, Some(true));
}

// ── Permissions ──────────────────────────────────────────────────────────────

/// Allow echoes or replaces the input; deny carries its message.
#[test]
fn permission_decision_responses() {
    let input = json!({ "command": "ls" });

    assert_eq!(
        PermissionDecision::allow().to_response(&input),
        json!({ "behavior": "allow", "updatedInput": { "command": "ls" } })
    );
    assert_eq!(
        PermissionDecision::allow_with_input(json!({ "command": "ls -la" })).to_response(&input),
        json!({ "behavior": "allow", "updatedInput": { "command": "ls -la" } })
    );
    assert_eq!(
        PermissionDecision::Allow {
            updated_input: None,
            updated_permissions: Some(vec![json!({ "type": "addRules" })]),
        }
        .to_response(&input),
        json!({ "behavior": "allow", "updatedInput": { "command": "ls" }, "updatedPermissions": [{ "type": "addRules" }] })
    );
    assert_eq!(
        PermissionDecision::deny("not here").to_response(&input),
        json!({ "behavior": "deny", "message": "not here" })
    );
    assert_eq!(
        PermissionDecision::Deny {
            message: "stop".into(),
            interrupt: true,
        }
        .to_response(&input),
        json!({ "behavior": "deny", "message": "stop", "interrupt": true })
    );
}

/// The default permission behaviour is deny.
#[test]
fn permission_default_is_deny() {
    assert_eq!(PermissionDefault::default(), PermissionDefault::Deny);
    assert!(!PermissionDefault::Deny.decision().is_allow());
    assert!(PermissionDefault::Allow.decision().is_allow());
}

/// `can_use_tool` payloads decode with optional fields absent.
#[test]
fn permission_request_decodes() {
    let request: PermissionRequest = serde_json::from_value(json!({
        "subtype": "can_use_tool",
        "tool_name": "Write",
        "input": { "path": "a" },
        "permission_suggestions": [{ "type": "setMode" }],
        "blocked_path": "/etc",
    }))
    .expect("decode");
    assert_eq!(request.tool_name, "Write");
    assert_eq!(request.suggestions.as_ref().map(Vec::len), Some(1));
    assert_eq!(request.blocked_path.as_deref(), Some("/etc"));
    assert!(request.tool_use_id.is_none());
}

// ── Tools ────────────────────────────────────────────────────────────────────

/// Tool output uses content blocks and omits `is_error` when false.
#[test]
fn tool_output_shape() {
    assert_eq!(
        ToolOutput::text("ok").to_value(),
        json!({ "content": [{ "type": "text", "text": "ok" }] })
    );
    assert_eq!(
        ToolOutput::error_text("bad").to_value(),
        json!({ "content": [{ "type": "text", "text": "bad" }], "is_error": true })
    );
    let image = ToolOutput {
        content: vec![ContentBlock::Image {
            data: "aGk=".into(),
            mime_type: "image/png".into(),
        }],
        is_error: false,
    };
    assert_eq!(
        image.to_value(),
        json!({ "content": [{ "type": "image", "data": "aGk=", "mimeType": "image/png" }] })
    );
}

/// `tool_call` input defaults to an empty object.
#[test]
fn tool_call_request_defaults_input() {
    let call: ToolCallRequest =
        serde_json::from_value(json!({ "subtype": "tool_call", "tool_name": "add" })).expect("decode");
    assert_eq!(call.input, json!({}));
    assert!(call.server_name.is_none());
}
