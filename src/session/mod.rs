//! Session facade.
//!
//! A [`Session`] owns one agent connection:
//!
//! - a writer task that is the only code touching the agent's stdin,
//! - a reader task that routes every stdout line without awaiting host code,
//! - a monitor task that fails pending requests when the process exits,
//! - the [`Correlator`] for outbound requests and the [`Dispatcher`] for
//!   inbound ones.
//!
//! Conversation output is delivered in emission order through the
//! [`MessageStream`] returned (once) by [`Session::messages`].  Per-line
//! errors appear on the stream as `Err` items and the stream continues; a
//! terminal error is delivered as the last item before the stream ends.
//!
//! Every background task, the handshake and each outbound request run inside
//! the session's `session` span.

pub mod options;
mod state;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::Stream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::control::correlator::Correlator;
use crate::control::dispatcher::Dispatcher;
use crate::control::handshake::{self, Handshake};
use crate::control::registry::HandlerRegistry;
use crate::models::envelope::{self, ControlRequestFrame, ControlResponse, Message};
use crate::models::session::SessionState;
use crate::transport::reader::{run_reader, InboundRouter, ReaderExit};
use crate::transport::spawner::{spawn_process, ProcessExit, SpawnedProcess, Supervisor};
use crate::transport::writer::{run_writer, FrameWriter};
use crate::{AppError, Result};

pub use options::SessionOptions;
use state::StateCell;

type InterruptFuture = Shared<BoxFuture<'static, Result<()>>>;

/// Extra time allowed on top of the terminate grace for the process to be
/// reaped during close.
const REAP_MARGIN: Duration = Duration::from_secs(1);

// ── Message stream ───────────────────────────────────────────────────────────

/// Ordered conversation output of a session.
///
/// Yields `Ok(message)` for each stream message, `Err` for recoverable
/// per-line errors and, last, for a terminal failure.  Ends when the session
/// closes or the agent's output ends.
#[derive(Debug)]
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<Result<Message>>,
}

impl MessageStream {
    /// Receive the next item.
    pub async fn next_message(&mut self) -> Option<Result<Message>> {
        self.rx.recv().await
    }
}

impl Stream for MessageStream {
    type Item = Result<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ── Core ─────────────────────────────────────────────────────────────────────

/// State shared by the facade and its background tasks.
struct Core {
    options: SessionOptions,
    registry: Arc<HandlerRegistry>,
    state: StateCell,
    writer: FrameWriter,
    correlator: Correlator,
    dispatcher: Dispatcher,
    supervisor: Option<Supervisor>,
    output: Mutex<Option<mpsc::UnboundedSender<Result<Message>>>>,
    /// A user turn was sent and its `result` has not arrived yet.
    awaiting_result: AtomicBool,
    /// Fires on the first `result` message.
    first_result: CancellationToken,
    handshake: OnceLock<Handshake>,
    interrupt: Mutex<Option<InterruptFuture>>,
    close_lock: tokio::sync::Mutex<()>,
    reader_cancel: CancellationToken,
    writer_cancel: CancellationToken,
    tasks: TaskTracker,
    span: Span,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("session_id", &self.options.session_id)
            .field("state", &self.state.get())
            .field("supervisor", &self.supervisor)
            .field("pending", &self.correlator.pending().len())
            .field("in_flight", &self.dispatcher.in_flight())
            .finish_non_exhaustive()
    }
}

impl Core {
    fn emit(&self, item: Result<Message>) {
        if let Some(tx) = self.output.lock().as_ref() {
            // The receiver may have been dropped; output is then discarded.
            let _ = tx.send(item);
        }
    }

    fn finish_output(&self) {
        if self.output.lock().take().is_some() {
            debug!("session: output stream ended");
        }
    }

    fn stderr_tail(&self) -> Option<String> {
        self.supervisor.as_ref().and_then(Supervisor::stderr_tail)
    }

    /// Terminal failure: record `err`, broadcast it, and tear down.
    fn fail(&self, err: AppError) {
        let recorded = self.state.fail(&err);
        self.correlator.fail_all(&err);
        self.dispatcher.abort();
        if recorded {
            if let Some(tx) = self.output.lock().take() {
                let _ = tx.send(Err(err));
            }
        } else {
            self.finish_output();
        }
        self.writer_cancel.cancel();
        self.reader_cancel.cancel();
        if let Some(supervisor) = &self.supervisor {
            supervisor.terminate();
        }
    }

    fn exit_error(&self, exit: Option<ProcessExit>) -> AppError {
        match exit {
            Some(exit) => exit.into_error(self.stderr_tail()),
            None => AppError::ProcessExited {
                code: None,
                signal: None,
                stderr: self.stderr_tail(),
            },
        }
    }

    async fn on_reader_exit(&self, exit: ReaderExit) {
        match exit {
            ReaderExit::Cancelled => return,
            ReaderExit::Failed(err) => {
                if self.state.get().is_shutting_down() {
                    self.finish_output();
                } else {
                    self.fail(err);
                }
                return;
            }
            ReaderExit::Eof => {}
        }

        if self.state.get().is_shutting_down() {
            self.finish_output();
            return;
        }

        let exit = match &self.supervisor {
            Some(supervisor) => {
                tokio::time::timeout(self.options.spawn.terminate_grace, supervisor.wait())
                    .await
                    .ok()
                    .flatten()
            }
            None => None,
        };

        if self.state.get().is_shutting_down() {
            self.finish_output();
            return;
        }

        let complete = !self.awaiting_result.load(Ordering::Acquire);
        let exited_cleanly = exit.map_or(self.supervisor.is_none(), |e| e.success());
        if complete && exited_cleanly {
            info!("session: agent output ended");
            self.correlator
                .fail_all(&AppError::SessionClosed("agent output ended".into()));
            self.dispatcher.abort();
            self.finish_output();
            self.writer_cancel.cancel();
            self.state.transition(SessionState::Closed);
        } else {
            self.fail(self.exit_error(exit));
        }
    }

    /// The error to report for a failed handshake.
    ///
    /// A write that fails because the agent already died is reported as the
    /// process exit, which carries the code and stderr tail.
    async fn handshake_error(&self, err: AppError) -> AppError {
        if let Some(terminal) = self.state.terminal_error() {
            return terminal;
        }
        match (&err, &self.supervisor) {
            (AppError::BrokenPipe(_), Some(supervisor)) => {
                match tokio::time::timeout(self.options.spawn.terminate_grace, supervisor.wait()).await {
                    Ok(Some(exit)) => self.exit_error(Some(exit)),
                    _ => err,
                }
            }
            _ => err,
        }
    }

    async fn monitor_exit(&self, supervisor: Supervisor) {
        let exit = supervisor.wait().await;
        if self.state.get().is_shutting_down() {
            return;
        }
        let err = self.exit_error(exit);
        info!(error = %err, "session: agent process exited");
        self.correlator.fail_all(&err);
    }

    async fn run_interrupt(self: Arc<Self>) -> Result<()> {
        let result = if self
            .state
            .transition_from(SessionState::Active, SessionState::Interrupting)
        {
            let sent = self
                .correlator
                .send_request(json!({ "subtype": "interrupt" }), self.options.control_timeout)
                .await;
            self.state
                .transition_from(SessionState::Interrupting, SessionState::Active);
            match sent {
                Ok(_) => {
                    info!("session: interrupt acknowledged");
                    Ok(())
                }
                Err(_) if self.state.get().is_shutting_down() => Ok(()),
                Err(err) => Err(err),
            }
        } else {
            debug!(state = %self.state.get(), "session: interrupt skipped");
            Ok(())
        };
        self.interrupt.lock().take();
        result
    }

    async fn close(&self) {
        let _guard = self.close_lock.lock().await;
        if !self.state.get().is_closed() {
            self.state.transition(SessionState::Closing);
        }

        if !self.dispatcher.shutdown(self.options.handler_drain).await {
            warn!("session: handlers still running after drain");
        }

        if let Err(err) = self.writer.close().await {
            debug!(error = %err, "session: stdin close failed");
        }

        if let Some(supervisor) = &self.supervisor {
            supervisor.terminate();
            let limit = self.options.spawn.terminate_grace + REAP_MARGIN;
            if tokio::time::timeout(limit, supervisor.wait()).await.is_err() {
                warn!(pid = ?supervisor.pid(), "session: agent process not reaped");
            }
        }

        self.correlator
            .fail_all(&AppError::SessionClosed("session closed".into()));
        self.reader_cancel.cancel();
        self.writer_cancel.cancel();
        self.finish_output();

        self.tasks.close();
        if tokio::time::timeout(self.options.handler_drain, self.tasks.wait())
            .await
            .is_err()
        {
            warn!("session: background tasks did not stop");
        }

        self.state.transition(SessionState::Closed);
    }
}

impl InboundRouter for Core {
    fn on_stream_message(&self, message: Message) {
        if message.is_result() {
            self.awaiting_result.store(false, Ordering::Release);
            self.dispatcher.end_turn();
            self.first_result.cancel();
        }
        self.emit(Ok(message));
    }

    fn on_control_request(&self, frame: ControlRequestFrame) {
        self.dispatcher.dispatch(frame);
    }

    fn on_control_response(&self, response: ControlResponse) {
        self.correlator.resolve(response);
    }

    fn on_control_cancel(&self, request_id: String) {
        self.dispatcher.cancel(&request_id);
    }

    fn on_recoverable_error(&self, error: AppError) {
        self.emit(Err(error));
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// A live connection to one agent process.
#[derive(Debug)]
pub struct Session {
    core: Arc<Core>,
    messages: Mutex<Option<MessageStream>>,
}

impl Session {
    /// Spawn the agent described by `options`, start the I/O tasks, and
    /// complete the `initialize` handshake.
    ///
    /// # Errors
    ///
    /// - [`AppError::ExecutableNotFound`] / [`AppError::Io`] /
    ///   [`AppError::Config`]: spawning failed.
    /// - [`AppError::ProcessExited`]: the agent died before acknowledging.
    /// - [`AppError::RequestTimeout`] / [`AppError::ControlError`]: the
    ///   handshake was not acknowledged.
    pub async fn connect(options: SessionOptions, registry: Arc<HandlerRegistry>) -> Result<Self> {
        let SpawnedProcess {
            stdin,
            stdout,
            supervisor,
        } = spawn_process(&options.spawn_config(&registry))?;
        info!(program = %options.spawn.program, pid = ?supervisor.pid(), "session: agent spawned");
        Self::start(stdout, stdin, Some(supervisor), options, registry).await
    }

    /// Like [`connect`](Self::connect), over already-open streams instead of
    /// a spawned process.
    ///
    /// # Errors
    ///
    /// Handshake errors as for [`connect`](Self::connect).
    pub async fn connect_with_io<R, W>(
        reader: R,
        writer: W,
        options: SessionOptions,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(reader, writer, None, options, registry).await
    }

    async fn start<R, W>(
        reader: R,
        writer: W,
        supervisor: Option<Supervisor>,
        options: SessionOptions,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let span = info_span!("session", session_id = %options.session_id);
        let (frame_writer, queue) = FrameWriter::channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            frame_writer.clone(),
            options.permission_default,
        );

        let core = Arc::new(Core {
            correlator: Correlator::new(frame_writer.clone()),
            writer: frame_writer,
            dispatcher,
            supervisor: supervisor.clone(),
            registry,
            state: StateCell::new(),
            output: Mutex::new(Some(out_tx)),
            awaiting_result: AtomicBool::new(false),
            first_result: CancellationToken::new(),
            handshake: OnceLock::new(),
            interrupt: Mutex::new(None),
            close_lock: tokio::sync::Mutex::new(()),
            reader_cancel: CancellationToken::new(),
            writer_cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            span,
            options,
        });

        let writer_cancel = core.writer_cancel.clone();
        core.tasks.spawn(
            async move {
                if let Err(err) = run_writer(writer, queue, writer_cancel).await {
                    warn!(error = %err, "session: writer stopped with error");
                }
            }
            .instrument(core.span.clone()),
        );

        let reader_core = Arc::clone(&core);
        core.tasks.spawn(
            async move {
                let exit = run_reader(
                    reader,
                    reader_core.options.max_line_bytes,
                    reader_core.as_ref(),
                    reader_core.reader_cancel.clone(),
                )
                .await;
                debug!(?exit, "session: reader stopped");
                reader_core.on_reader_exit(exit).await;
            }
            .instrument(core.span.clone()),
        );

        if let Some(supervisor) = supervisor {
            let monitor_core = Arc::clone(&core);
            core.tasks.spawn(
                async move { monitor_core.monitor_exit(supervisor).await }
                    .instrument(core.span.clone()),
            );
        }

        let handshake = handshake::initialize(
            &core.correlator,
            &core.registry,
            core.options.initialize_timeout,
        )
        .instrument(core.span.clone())
        .await;

        let handshake = match handshake {
            Ok(handshake) => handshake,
            Err(err) => {
                let err = core.handshake_error(err).await;
                core.close().await;
                return Err(err);
            }
        };
        let _ = core.handshake.set(handshake);

        if !core.state.transition(SessionState::Active) {
            let err = core
                .state
                .terminal_error()
                .unwrap_or_else(|| AppError::SessionClosed("closed during handshake".into()));
            core.close().await;
            return Err(err);
        }

        core.span.in_scope(|| info!("session: active"));
        Ok(Self {
            core,
            messages: Mutex::new(Some(MessageStream { rx: out_rx })),
        })
    }

    // ── Conversation ─────────────────────────────────────────────────────────

    /// The output sequence. Available once per session; later calls return
    /// `None`.
    pub fn messages(&self) -> Option<MessageStream> {
        self.messages.lock().take()
    }

    /// Send a plain-text user turn.
    ///
    /// # Errors
    ///
    /// - [`AppError::SessionClosed`] unless the session is `Active` or
    ///   `Interrupting`.
    /// - [`AppError::BrokenPipe`] if the agent stopped reading.
    pub async fn send_user_message(&self, content: &str) -> Result<()> {
        let message = envelope::user_message(content, &self.core.options.session_id);
        self.send_message(message).await
    }

    /// Send an arbitrary conversation message object.
    ///
    /// # Errors
    ///
    /// As for [`send_user_message`](Self::send_user_message), plus
    /// [`AppError::ProtocolViolation`] if `message` is not an object with a
    /// `type`.
    pub async fn send_message(&self, message: Value) -> Result<()> {
        let state = self.core.state.get();
        if !state.accepts_input() {
            return Err(self.closed_error(state));
        }
        let kind = message.get("type").and_then(Value::as_str).ok_or_else(|| {
            AppError::ProtocolViolation("outbound message needs a string `type`".into())
        })?;
        if kind == "user" {
            self.core.awaiting_result.store(true, Ordering::Release);
        }
        self.core.writer.send(&message).await
    }

    /// Close stdin so the agent sees end of input.
    ///
    /// With hooks or tools registered the agent may still need to call back,
    /// so this first waits (bounded by the stream-close timeout) for the
    /// first `result`.
    ///
    /// # Errors
    ///
    /// Returns the flush error reported by the writer.
    pub async fn end_input(&self) -> Result<()> {
        if self.core.registry.has_hooks() || self.core.registry.has_tools() {
            let limit = self.core.options.stream_close_timeout;
            if tokio::time::timeout(limit, self.core.first_result.cancelled())
                .await
                .is_err()
            {
                debug!(?limit, "session: no result before closing input");
            }
        }
        self.core.writer.close().await
    }

    // ── Control ──────────────────────────────────────────────────────────────

    /// Interrupt the current turn.
    ///
    /// Concurrent callers share one in-flight request.  A no-op on a session
    /// that is closing or closed.
    ///
    /// # Errors
    ///
    /// [`AppError::RequestTimeout`] or [`AppError::ControlError`] when the
    /// agent does not acknowledge.
    pub async fn interrupt(&self) -> Result<()> {
        let pending = {
            let mut slot = self.core.interrupt.lock();
            if let Some(pending) = slot.as_ref() {
                pending.clone()
            } else {
                if self.core.state.get().is_shutting_down() {
                    return Ok(());
                }
                let core = Arc::clone(&self.core);
                let span = core.span.clone();
                let pending = core.run_interrupt().instrument(span).boxed().shared();
                *slot = Some(pending.clone());
                pending
            }
        };
        pending.await
    }

    /// Change the agent's permission mode.
    ///
    /// # Errors
    ///
    /// Any outbound request error.
    pub async fn set_permission_mode(&self, mode: &str) -> Result<()> {
        self.request(json!({ "subtype": "set_permission_mode", "mode": mode }))
            .await
            .map(drop)
    }

    /// Switch the model; `None` restores the default.
    ///
    /// # Errors
    ///
    /// Any outbound request error.
    pub async fn set_model(&self, model: Option<&str>) -> Result<()> {
        self.request(json!({ "subtype": "set_model", "model": model }))
            .await
            .map(drop)
    }

    /// Connection status of the agent's MCP servers.
    ///
    /// # Errors
    ///
    /// Any outbound request error.
    pub async fn mcp_status(&self) -> Result<Value> {
        self.request(json!({ "subtype": "mcp_status" })).await
    }

    /// Restore tracked files to their state at `user_message_id`.
    ///
    /// # Errors
    ///
    /// Any outbound request error.
    pub async fn rewind_files(&self, user_message_id: &str) -> Result<()> {
        self.request(json!({ "subtype": "rewind_files", "user_message_id": user_message_id }))
            .await
            .map(drop)
    }

    /// Send a raw outbound control request and return the agent's answer.
    ///
    /// # Errors
    ///
    /// - [`AppError::SessionClosed`] (or the recorded terminal error) when
    ///   the session is closing or closed.
    /// - Any error of [`Correlator::send_request`].
    pub async fn request(&self, request: Value) -> Result<Value> {
        let state = self.core.state.get();
        if state.is_shutting_down() {
            return Err(self.closed_error(state));
        }
        self.core
            .correlator
            .send_request(request, self.core.options.control_timeout)
            .instrument(self.core.span.clone())
            .await
    }

    /// Close the session.  Idempotent; concurrent callers all wait for the
    /// same teardown.
    pub async fn close(&self) {
        self.core.close().instrument(self.core.span.clone()).await;
    }

    // ── Observation ──────────────────────────────────────────────────────────

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.core.state.get()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.core.state.subscribe()
    }

    /// Wait until the session is closed.
    pub async fn closed(&self) {
        self.core.state.closed().await;
    }

    /// The error that closed the session, if it ended abnormally.
    #[must_use]
    pub fn terminal_error(&self) -> Option<AppError> {
        self.core.state.terminal_error()
    }

    /// The agent's `initialize` answer.
    #[must_use]
    pub fn server_info(&self) -> Option<&Value> {
        self.core.handshake.get().map(|h| &h.server_info)
    }

    /// Protocol version the agent reported during `initialize`.
    #[must_use]
    pub fn protocol_version(&self) -> Option<&str> {
        self.core.handshake.get().and_then(|h| h.protocol_version.as_deref())
    }

    /// Outbound control requests still awaiting an answer.
    #[must_use]
    pub fn pending_request_count(&self) -> usize {
        self.core.correlator.pending().len()
    }

    /// Inbound control requests still being handled.
    #[must_use]
    pub fn in_flight_handlers(&self) -> usize {
        self.core.dispatcher.in_flight()
    }

    /// Subscribe to the agent's stderr lines; `None` without a process.
    #[must_use]
    pub fn subscribe_stderr(&self) -> Option<broadcast::Receiver<String>> {
        self.core.supervisor.as_ref().map(Supervisor::subscribe_stderr)
    }

    /// The retained stderr tail.
    #[must_use]
    pub fn stderr_tail(&self) -> Option<String> {
        self.core.stderr_tail()
    }

    /// OS process id of the agent.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.core.supervisor.as_ref().and_then(Supervisor::pid)
    }

    fn closed_error(&self, state: SessionState) -> AppError {
        self.core
            .state
            .terminal_error()
            .unwrap_or_else(|| AppError::SessionClosed(format!("session is {state}")))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.core.state.get().is_closed() {
            debug!("session: dropped without close, stopping agent");
        }
        self.core.dispatcher.abort();
        self.core.reader_cancel.cancel();
        self.core.writer_cancel.cancel();
        if let Some(supervisor) = &self.core.supervisor {
            supervisor.terminate();
        }
    }
}
