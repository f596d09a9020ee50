//! Integration tests for the conversation stream: message ordering, per-line
//! error isolation, end-of-output handling, and the `initialize` handshake.

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use agent_conduit::control::handshake::PROTOCOL_VERSION;
use agent_conduit::control::registry::{hook_fn, BoxError};
use agent_conduit::models::envelope::MessageKind;
use agent_conduit::models::hook::{HookEvent, HookOutput};
use agent_conduit::models::session::SessionState;
use agent_conduit::{AppError, HandlerRegistry, HookMatcher, HookRegistration};

use super::test_helpers::{
    connect, connect_answering, connect_with, next_item, next_message, test_options,
};

// ── One turn ─────────────────────────────────────────────────────────────────

/// One user message answered by two stream messages and a result yields
/// exactly those three messages in order, then the stream ends normally.
#[tokio::test]
async fn single_turn_delivers_three_messages_then_completes() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;
    let mut messages = session.messages().expect("message stream");

    session
        .send_user_message("hello")
        .await
        .expect("send user message");

    let user = agent.recv().await;
    assert_eq!(
        user,
        json!({
            "type": "user",
            "message": { "role": "user", "content": "hello" },
            "parent_tool_use_id": null,
            "session_id": "test-session",
        }),
        "user turn must use the conversation message shape"
    );

    agent
        .emit("system", json!({ "subtype": "init", "model": "test" }))
        .await;
    agent
        .emit("assistant", json!({ "message": { "content": [{ "type": "text", "text": "hi" }] } }))
        .await;
    agent.emit_result().await;
    agent.close_stdout();

    let kinds = [
        next_message(&mut messages).await.kind().clone(),
        next_message(&mut messages).await.kind().clone(),
        next_message(&mut messages).await.kind().clone(),
    ];
    assert_eq!(
        kinds,
        [MessageKind::System, MessageKind::Assistant, MessageKind::Result]
    );

    assert!(
        next_item(&mut messages).await.is_none(),
        "stream must end after a completed turn and EOF"
    );
    session.closed().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(
        session.terminal_error().is_none(),
        "a completed turn followed by EOF is a normal end"
    );
}

/// Messages are delivered in exactly the order the agent emitted them.
#[tokio::test]
async fn output_order_matches_emission_order() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;
    let mut messages = session.messages().expect("message stream");

    for n in 0..200 {
        agent.emit("stream_event", json!({ "n": n })).await;
    }

    for expected in 0..200 {
        let message = next_message(&mut messages).await;
        assert_eq!(
            message.as_value()["n"],
            json!(expected),
            "message {expected} arrived out of order"
        );
    }

    session.close().await;
}

/// The output sequence is handed out once.
#[tokio::test]
async fn message_stream_is_available_once() {
    let (session, _agent) = connect(HandlerRegistry::empty()).await;

    assert!(session.messages().is_some(), "first call yields the stream");
    assert!(session.messages().is_none(), "second call yields nothing");

    session.close().await;
}

// ── Per-line errors ──────────────────────────────────────────────────────────

/// Unparseable lines surface as recoverable errors and the stream continues.
#[tokio::test]
async fn malformed_lines_are_isolated() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;
    let mut messages = session.messages().expect("message stream");

    agent.send_raw("this is not json\n").await;
    agent.emit("assistant", json!({ "n": 1 })).await;
    agent.send_raw("{\"no_type\": true}\n").await;
    agent.send_raw("[1, 2, 3]\n").await;
    agent.send_raw("\n").await;
    agent.emit("assistant", json!({ "n": 2 })).await;

    match next_item(&mut messages).await {
        Some(Err(AppError::MalformedFrame { line, .. })) => {
            assert_eq!(line, "this is not json", "raw line is carried in the error");
        }
        other => panic!("expected MalformedFrame, got {other:?}"),
    }
    assert_eq!(next_message(&mut messages).await.as_value()["n"], 1);
    assert!(matches!(
        next_item(&mut messages).await,
        Some(Err(AppError::MalformedFrame { .. }))
    ));
    assert!(matches!(
        next_item(&mut messages).await,
        Some(Err(AppError::MalformedFrame { .. }))
    ));
    assert_eq!(
        next_message(&mut messages).await.as_value()["n"],
        2,
        "blank lines are skipped and the stream continues"
    );
    assert_eq!(session.state(), SessionState::Active);

    session.close().await;
}

/// A control response missing its request id is a recoverable protocol
/// violation, not a session failure.
#[tokio::test]
async fn invalid_control_response_is_recoverable() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;
    let mut messages = session.messages().expect("message stream");

    agent
        .send(json!({ "type": "control_response", "response": { "subtype": "success" } }))
        .await;

    match next_item(&mut messages).await {
        Some(Err(err)) => {
            assert!(matches!(err, AppError::ProtocolViolation(_)), "got {err:?}");
            assert!(err.is_recoverable());
        }
        other => panic!("expected a protocol violation, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Active);

    session.close().await;
}

/// A control response whose subtype is anything but `error` answers the
/// pending request right away.
#[tokio::test]
async fn non_error_response_subtype_resolves_request() {
    let mut options = test_options();
    options.control_timeout = Duration::from_secs(2);
    let (session, mut agent) = connect_with(options, HandlerRegistry::empty()).await;

    let agent_side = async {
        let (id, _) = agent.expect_request("mcp_status").await;
        agent
            .send(json!({
                "type": "control_response",
                "response": { "subtype": "ok", "request_id": id, "response": { "mcpServers": [] } }
            }))
            .await;
    };
    let started = Instant::now();
    let (status, ()) = tokio::join!(session.mcp_status(), agent_side);

    assert_eq!(status.expect("answered"), json!({ "mcpServers": [] }));
    assert!(started.elapsed() < Duration::from_secs(1), "answered, not timed out");
    assert_eq!(session.pending_request_count(), 0);

    session.close().await;
}

// ── End of output ────────────────────────────────────────────────────────────

/// EOF while a turn is still open ends the stream with a terminal error.
#[tokio::test]
async fn eof_mid_turn_is_terminal() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;
    let mut messages = session.messages().expect("message stream");

    session.send_user_message("work").await.expect("send");
    let _ = agent.recv().await;
    agent.emit("assistant", json!({ "n": 1 })).await;
    agent.close_stdout();

    assert_eq!(next_message(&mut messages).await.kind(), &MessageKind::Assistant);
    match next_item(&mut messages).await {
        Some(Err(AppError::ProcessExited { .. })) => {}
        other => panic!("expected ProcessExited, got {other:?}"),
    }
    assert!(next_item(&mut messages).await.is_none());

    session.closed().await;
    assert!(matches!(
        session.terminal_error(),
        Some(AppError::ProcessExited { .. })
    ));
}

/// After the session ends, input is refused with the terminal error.
#[tokio::test]
async fn input_after_terminal_failure_reports_the_failure() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;

    session.send_user_message("work").await.expect("send");
    let _ = agent.recv().await;
    agent.close_stdout();
    session.closed().await;

    let err = session
        .send_user_message("again")
        .await
        .expect_err("closed session refuses input");
    assert!(matches!(err, AppError::ProcessExited { .. }), "got {err:?}");
}

/// Input after `close` is refused with `SessionClosed`.
#[tokio::test]
async fn input_after_close_is_rejected() {
    let (session, _agent) = connect(HandlerRegistry::empty()).await;
    session.close().await;

    let err = session
        .send_user_message("late")
        .await
        .expect_err("closed session refuses input");
    assert!(matches!(err, AppError::SessionClosed(_)), "got {err:?}");
}

/// `end_input` closes the agent's stdin right away when nothing can call
/// back.
#[tokio::test]
async fn end_input_closes_stdin() {
    let (session, mut agent) = connect(HandlerRegistry::empty()).await;

    session.end_input().await.expect("end input");
    agent.expect_eof().await;

    session.close().await;
}

/// With hooks registered, `end_input` waits for the first result.
#[tokio::test]
async fn end_input_waits_for_first_result_when_hooks_exist() {
    let registry = HandlerRegistry::builder()
        .hook(
            HookRegistration::new(HookEvent::Stop, HookMatcher::Any)
                .callback(hook_fn(|_, _, _| async { Ok::<_, BoxError>(HookOutput::default()) })),
        )
        .build()
        .expect("registry");
    let (session, mut agent) = connect(registry).await;

    session.send_user_message("go").await.expect("send");
    let _ = agent.recv().await;

    let ending = tokio::spawn(async move {
        session.end_input().await.expect("end input");
        session
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!ending.is_finished(), "input stays open until the result");

    agent.emit_result().await;
    let session = ending.await.expect("join");
    agent.expect_eof().await;

    session.close().await;
}

// ── Handshake ────────────────────────────────────────────────────────────────

/// The handshake advertises hook registrations and keeps the agent's answer.
#[tokio::test]
async fn initialize_advertises_hooks_and_keeps_server_info() {
    let noop = || hook_fn(|_, _, _| async { Ok::<_, BoxError>(HookOutput::default()) });
    let registry = HandlerRegistry::builder()
        .hook(
            HookRegistration::new(HookEvent::PreToolUse, HookMatcher::Exact("Bash".into()))
                .callback(noop())
                .callback(noop())
                .timeout(Duration::from_secs(30)),
        )
        .hook(HookRegistration::new(HookEvent::PostToolUse, HookMatcher::Any).callback(noop()))
        .build()
        .expect("registry");

    let (session, agent) = connect(registry).await;

    assert_eq!(
        agent.initialize,
        json!({
            "subtype": "initialize",
            "protocolVersion": PROTOCOL_VERSION,
            "hooks": {
                "PreToolUse": [
                    { "matcher": "Bash", "hookCallbackIds": ["hook_0", "hook_1"], "timeout": 30 }
                ],
                "PostToolUse": [
                    { "matcher": null, "hookCallbackIds": ["hook_2"] }
                ],
            },
        })
    );
    assert_eq!(
        session.server_info(),
        Some(&json!({ "commands": [], "output_style": "default" }))
    );
    assert_eq!(session.protocol_version(), None, "agent reported no version");
    assert_eq!(session.state(), SessionState::Active);

    session.close().await;
}

/// The protocol version the agent reports is recorded next to its answer.
#[tokio::test]
async fn initialize_records_agent_protocol_version() {
    let answer = json!({ "commands": [], "protocolVersion": "1" });
    let (session, agent) =
        connect_answering(test_options(), HandlerRegistry::empty(), answer.clone()).await;

    assert_eq!(agent.initialize["protocolVersion"], PROTOCOL_VERSION);
    assert_eq!(session.protocol_version(), Some("1"));
    assert_eq!(session.server_info(), Some(&answer));

    session.close().await;

    let newer = json!({ "protocolVersion": "2" });
    let (session, _agent) =
        connect_answering(test_options(), HandlerRegistry::empty(), newer).await;
    assert_eq!(session.protocol_version(), Some("2"), "a different version is kept, not refused");
    assert_eq!(session.state(), SessionState::Active);

    session.close().await;
}

/// Without hooks the handshake sends `hooks: null`.
#[tokio::test]
async fn initialize_without_hooks_sends_null() {
    let (session, agent) = connect(HandlerRegistry::empty()).await;

    assert_eq!(agent.initialize["hooks"], Value::Null);

    session.close().await;
}
