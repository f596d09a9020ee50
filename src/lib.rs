#![forbid(unsafe_code)]

//! Drive an external agent process over a newline-delimited JSON control
//! protocol.
//!
//! The [`session::Session`] facade spawns the agent, performs the
//! `initialize` handshake, streams conversation output in order, and answers
//! the agent's control requests with host-supplied tools, hooks, and
//! permission checks registered in a [`control::registry::HandlerRegistry`].

pub mod config;
pub mod control;
pub mod errors;
pub mod models;
pub mod session;
pub mod transport;

pub use config::ConduitConfig;
pub use control::registry::{HandlerRegistry, HookMatcher, HookRegistration, Tool, ToolServer};
pub use errors::{AppError, Result};
pub use session::{MessageStream, Session, SessionOptions};
