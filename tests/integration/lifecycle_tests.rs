//! Integration tests for the session lifecycle: interrupt, close, and
//! host-initiated control requests.

use std::time::Duration;

use serde_json::json;

use agent_conduit::models::session::SessionState;
use agent_conduit::{AppError, HandlerRegistry};

use super::test_helpers::{connect, connect_with, next_item, next_message, test_options};

// ── Interrupt ────────────────────────────────────────────────────────────────

/// Interrupt moves the session to `Interrupting` until the agent
/// acknowledges, then back to `Active`.
#[tokio::test]
async fn interrupt_round_trip_updates_state() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;
    let mut states = session.state_changes();

    let agent_side = async {
        let (id, request) = agent.expect_request("interrupt").await;
        assert_eq!(request, json!({ "subtype": "interrupt" }));
        assert_eq!(session.state(), SessionState::Interrupting);
        agent.respond_success(&id, json!({})).await;
    };

    let (result, ()) = tokio::join!(session.interrupt(), agent_side);
    result.expect("interrupt acknowledged");
    assert_eq!(session.state(), SessionState::Active);

    assert_eq!(*states.borrow_and_update(), SessionState::Active);

    session.close().await;
}

/// Concurrent interrupt calls share one request and one outcome.
#[tokio::test]
async fn concurrent_interrupts_share_one_request() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;

    let agent_side = async {
        let (id, _) = agent.expect_request("interrupt").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.respond_success(&id, json!({})).await;
    };

    let (first, second, third, ()) = tokio::join!(
        session.interrupt(),
        session.interrupt(),
        session.interrupt(),
        agent_side
    );
    first.expect("first caller");
    second.expect("second caller");
    third.expect("third caller");

    let agent_side = async {
        let (id, _) = agent.expect_request("mcp_status").await;
        agent.respond_success(&id, json!({ "mcpServers": [] })).await;
    };
    let (status, ()) = tokio::join!(session.mcp_status(), agent_side);
    assert_eq!(
        status.expect("mcp status"),
        json!({ "mcpServers": [] }),
        "the next request on the wire is not another interrupt"
    );

    session.close().await;
}

/// A rejected interrupt is reported to the caller and the session returns to
/// `Active`.
#[tokio::test]
async fn rejected_interrupt_returns_control_error() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;

    let agent_side = async {
        let (id, _) = agent.expect_request("interrupt").await;
        agent.respond_error(&id, "nothing to interrupt").await;
    };
    let (result, ()) = tokio::join!(session.interrupt(), agent_side);

    match result {
        Err(AppError::ControlError(message)) => assert_eq!(message, "nothing to interrupt"),
        other => panic!("expected ControlError, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Active);

    session.close().await;
}

/// Interrupting a closed session does nothing.
#[tokio::test]
async fn interrupt_after_close_is_a_noop() {
    let (session, _agent) = connect(HandlerRegistry::empty()).await;
    session.close().await;

    session.interrupt().await.expect("no-op on closed session");
    assert_eq!(session.state(), SessionState::Closed);
}

/// Output emitted before the interrupt acknowledgement is still delivered,
/// in order, followed by output of the next turn.
#[tokio::test]
async fn interrupt_keeps_buffered_output() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;
    let mut messages = session.messages().expect("message stream");

    let agent_side = async {
        let (id, _) = agent.expect_request("interrupt").await;
        for n in 0..3 {
            agent.emit("assistant", json!({ "n": n })).await;
        }
        agent.respond_success(&id, json!({})).await;
        agent.emit_result().await;
    };
    let (result, ()) = tokio::join!(session.interrupt(), agent_side);
    result.expect("interrupt");

    for n in 0..3 {
        assert_eq!(next_message(&mut messages).await.as_value()["n"], n);
    }
    assert!(next_message(&mut messages).await.is_result());

    session.send_user_message("next").await.expect("send after interrupt");
    assert_eq!(agent.recv().await["type"], "user");

    session.close().await;
}

// ── Close ────────────────────────────────────────────────────────────────────

/// Close is idempotent and concurrent callers all complete.
#[tokio::test]
async fn close_is_idempotent() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;
    let mut messages = session.messages().expect("message stream");

    tokio::join!(session.close(), session.close());
    assert_eq!(session.state(), SessionState::Closed);
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.terminal_error().is_none(), "close is not a failure");

    agent.expect_eof().await;
    assert!(
        next_item(&mut messages).await.is_none(),
        "output ends on close"
    );
}

/// Close fails every pending outbound request with `SessionClosed`.
#[tokio::test]
async fn close_fails_pending_requests() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;

    let closer = async {
        let _ = agent.expect_request("mcp_status").await;
        session.close().await;
    };
    let (status, ()) = tokio::join!(session.mcp_status(), closer);

    match status {
        Err(AppError::SessionClosed(_)) => {}
        other => panic!("expected SessionClosed, got {other:?}"),
    }
    assert_eq!(session.pending_request_count(), 0);
}

/// Requests after close are refused without touching the wire.
#[tokio::test]
async fn request_after_close_is_rejected() {
    let (session, _agent) = connect(HandlerRegistry::empty()).await;
    session.close().await;

    let err = session
        .set_model(Some("claude-sonnet"))
        .await
        .expect_err("closed session refuses requests");
    assert!(matches!(err, AppError::SessionClosed(_)), "got {err:?}");
}

// ── Outbound requests ────────────────────────────────────────────────────────

/// Each convenience method sends its documented request body.
#[tokio::test]
async fn outbound_requests_have_expected_shape() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;

    let agent_side = async {
        let (id, request) = agent.expect_request("set_permission_mode").await;
        assert_eq!(request, json!({ "subtype": "set_permission_mode", "mode": "acceptEdits" }));
        agent.respond_success(&id, json!({})).await;
    };
    let (result, ()) = tokio::join!(session.set_permission_mode("acceptEdits"), agent_side);
    result.expect("set_permission_mode");

    let agent_side = async {
        let (id, request) = agent.expect_request("set_model").await;
        assert_eq!(request, json!({ "subtype": "set_model", "model": "claude-opus" }));
        agent.respond_success(&id, json!({})).await;
        let (id, request) = agent.expect_request("set_model").await;
        assert_eq!(request, json!({ "subtype": "set_model", "model": null }));
        agent.respond_success(&id, json!({})).await;
    };
    let (result, ()) = tokio::join!(
        async {
            session.set_model(Some("claude-opus")).await?;
            session.set_model(None).await
        },
        agent_side
    );
    result.expect("set_model");

    let agent_side = async {
        let (id, request) = agent.expect_request("rewind_files").await;
        assert_eq!(request, json!({ "subtype": "rewind_files", "user_message_id": "msg_7" }));
        agent.respond_success(&id, json!({})).await;
    };
    let (result, ()) = tokio::join!(session.rewind_files("msg_7"), agent_side);
    result.expect("rewind_files");

    session.close().await;
}

/// Outbound request ids are unique and carry the `req_` prefix.
#[tokio::test]
async fn outbound_request_ids_are_unique() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;

    let agent_side = async {
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (id, _) = agent.expect_request("mcp_status").await;
            agent.respond_success(&id, json!({})).await;
            ids.push(id);
        }
        ids
    };
    let (results, ids) = tokio::join!(
        async {
            for _ in 0..3 {
                session.mcp_status().await?;
            }
            Ok::<_, AppError>(())
        },
        agent_side
    );
    results.expect("mcp_status calls");

    assert!(ids.iter().all(|id| id.starts_with("req_")), "ids: {ids:?}");
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), ids.len(), "ids must be unique: {ids:?}");

    session.close().await;
}

/// An error response surfaces as `ControlError` with the agent's message.
#[tokio::test]
async fn error_response_maps_to_control_error() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;

    let agent_side = async {
        let (id, _) = agent.expect_request("set_permission_mode").await;
        agent.respond_error(&id, "invalid mode: yolo").await;
    };
    let (result, ()) = tokio::join!(session.set_permission_mode("yolo"), agent_side);

    let err = result.expect_err("agent rejected the mode");
    assert!(matches!(&err, AppError::ControlError(m) if m == "invalid mode: yolo"), "got {err:?}");
    assert_eq!(err.to_string(), "control error: invalid mode: yolo");
    assert_eq!(session.state(), SessionState::Active, "a control error is not terminal");

    session.close().await;
}

/// An unanswered request times out, leaves no pending entry, and a late
/// response is dropped without disturbing the session.
#[tokio::test]
async fn unanswered_request_times_out_and_late_response_is_dropped() {
    let mut options = test_options();
    options.control_timeout = Duration::from_millis(50);
    let (session, mut agent) = connect_with(options, HandlerRegistry::empty()).await;
    let mut messages = session.messages().expect("message stream");

    let (result, (late_id, _)) =
        tokio::join!(session.mcp_status(), agent.expect_request("mcp_status"));
    match result {
        Err(AppError::RequestTimeout { subtype, timeout }) => {
            assert_eq!(subtype, "mcp_status");
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("expected RequestTimeout, got {other:?}"),
    }
    assert_eq!(session.pending_request_count(), 0);

    agent.respond_success(&late_id, json!({ "late": true })).await;
    agent.emit("assistant", json!({ "after": "late" })).await;

    assert_eq!(
        next_message(&mut messages).await.as_value()["after"],
        "late",
        "late response produced no output item"
    );
    assert_eq!(session.state(), SessionState::Active);

    session.close().await;
}

/// Responses answered out of order reach their own callers.
#[tokio::test]
async fn out_of_order_responses_reach_their_callers() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;

    let agent_side = async {
        let (first, first_req) = agent.expect_request("mcp_status").await;
        let (second, second_req) = agent.expect_request("mcp_status").await;
        agent
            .respond_success(&second, json!({ "echo": second_req["tag"] }))
            .await;
        agent
            .respond_success(&first, json!({ "echo": first_req["tag"] }))
            .await;
    };

    let (a, b, ()) = tokio::join!(
        session.request(json!({ "subtype": "mcp_status", "tag": "a" })),
        session.request(json!({ "subtype": "mcp_status", "tag": "b" })),
        agent_side
    );
    assert_eq!(a.expect("a answered"), json!({ "echo": "a" }));
    assert_eq!(b.expect("b answered"), json!({ "echo": "b" }));
    assert_eq!(session.pending_request_count(), 0);

    session.close().await;
}
