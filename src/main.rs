#![forbid(unsafe_code)]

//! `agent-conduit`: run one prompt through an agent process and print its
//! output as JSON lines.
//!
//! Ctrl-C interrupts the current turn; a second Ctrl-C (or `SIGTERM`) closes
//! the session.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::config::ConduitConfig;
use agent_conduit::{AppError, HandlerRegistry, MessageStream, Result, Session, SessionOptions};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conduit", about = "Drive an agent process over NDJSON", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Agent program, overriding `process.command`.
    #[arg(long)]
    command: Option<String>,

    /// Agent argument, repeatable; replaces `process.args` when given.
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Prompt sent as the first user turn.
    prompt: String,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

fn session_options(args: &Cli) -> Result<SessionOptions> {
    let mut options = match &args.config {
        Some(path) => ConduitConfig::load_from_path(path)?.session_options(),
        None => {
            let command = args.command.clone().ok_or_else(|| {
                AppError::Config("either --config or --command is required".into())
            })?;
            SessionOptions::new(command)
        }
    };

    if let Some(command) = &args.command {
        options.spawn.program.clone_from(command);
    }
    if !args.args.is_empty() {
        options.spawn.args.clone_from(&args.args);
    }
    Ok(options)
}

async fn run(args: Cli) -> Result<()> {
    let options = session_options(&args)?;
    info!(program = %options.spawn.program, "agent-conduit starting");

    let session = Session::connect(options, HandlerRegistry::empty()).await?;
    let mut messages = session
        .messages()
        .ok_or_else(|| AppError::SessionClosed("message stream unavailable".into()))?;

    session.send_user_message(&args.prompt).await?;

    let outcome = pump(&session, &mut messages).await;
    session.close().await;
    info!("session closed");

    outcome?;
    match session.terminal_error() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Print messages until the turn's result, the end of output, or shutdown.
async fn pump(session: &Session, messages: &mut MessageStream) -> Result<()> {
    let mut terminate = Terminate::register();
    let mut interrupted = false;
    let mut stdout = std::io::stdout().lock();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!(%err, "ctrl-c signal handler failed");
                    return Ok(());
                }
                if interrupted {
                    info!("second interrupt, closing");
                    return Ok(());
                }
                interrupted = true;
                info!("interrupting current turn");
                if let Err(err) = session.interrupt().await {
                    warn!(%err, "interrupt failed");
                }
            }

            () = terminate.recv() => {
                info!("termination signal received");
                return Ok(());
            }

            item = messages.next_message() => match item {
                Some(Ok(message)) => {
                    writeln!(stdout, "{}", message.as_value())?;
                    stdout.flush()?;
                    if message.is_result() {
                        return Ok(());
                    }
                }
                Some(Err(err)) if err.is_recoverable() => warn!(%err, "skipping bad output line"),
                Some(Err(err)) => return Err(err),
                None => return Ok(()),
            },
        }
    }
}

/// `SIGTERM` listener; pends forever where unsupported.
#[cfg(unix)]
struct Terminate(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl Terminate {
    fn register() -> Self {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Self(Some(signal)),
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        match self.0.as_mut() {
            Some(signal) => {
                signal.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(not(unix))]
struct Terminate;

#[cfg(not(unix))]
impl Terminate {
    fn register() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
