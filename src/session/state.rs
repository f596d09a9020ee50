//! Session lifecycle cell.
//!
//! The session facade is the only writer; every other component observes the
//! state through [`StateCell::subscribe`] or [`StateCell::get`].  A terminal
//! error is recorded at most once, on the transition that closed the session.

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::models::session::SessionState;
use crate::AppError;

/// Watch-backed state machine with a recorded terminal error.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<SessionState>,
    terminal: Mutex<Option<AppError>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Starting);
        Self {
            tx,
            terminal: Mutex::new(None),
        }
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move to `next` if the lifecycle allows it; returns whether it moved.
    pub(crate) fn transition(&self, next: SessionState) -> bool {
        let mut from = next;
        let moved = self.tx.send_if_modified(|current| {
            from = *current;
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(%from, to = %next, "session: state changed");
        }
        moved
    }

    /// Move from exactly `expected` to `next`.
    pub(crate) fn transition_from(&self, expected: SessionState, next: SessionState) -> bool {
        let moved = self.tx.send_if_modified(|current| {
            if *current == expected && current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(from = %expected, to = %next, "session: state changed");
        }
        moved
    }

    /// Record `err` as the terminal error and close.
    ///
    /// Returns `false` if the session was already closed; the first recorded
    /// error is kept.
    pub(crate) fn fail(&self, err: &AppError) -> bool {
        if self.get().is_closed() {
            return false;
        }
        {
            let mut terminal = self.terminal.lock();
            if terminal.is_none() {
                warn!(error = %err, "session: terminal failure");
                *terminal = Some(err.clone());
            }
        }
        self.transition(SessionState::Closed)
    }

    pub(crate) fn terminal_error(&self) -> Option<AppError> {
        self.terminal.lock().clone()
    }

    /// Wait until the session reaches `Closed`.
    pub(crate) async fn closed(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| s.is_closed()).await;
    }
}
