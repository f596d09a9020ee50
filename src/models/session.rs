//! Session lifecycle state.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
///
/// `Starting → Active → (Interrupting → Active)* → Closing → Closed`, with a
/// direct edge to `Closed` from every state on terminal failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Process spawned, `initialize` handshake in flight.
    Starting,
    /// Handshake acknowledged; input accepted.
    Active,
    /// An `interrupt` control request is awaiting acknowledgement.
    Interrupting,
    /// `close()` in progress; no new input accepted.
    Closing,
    /// Terminal state, reached by `close()` or by a fatal failure.
    Closed,
}

impl SessionState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting | Self::Interrupting, Self::Active)
                | (Self::Active, Self::Interrupting)
                | (
                    Self::Starting | Self::Active | Self::Interrupting,
                    Self::Closing
                )
                | (
                    Self::Starting | Self::Active | Self::Interrupting | Self::Closing,
                    Self::Closed
                )
        )
    }

    /// Whether conversation input may be written in this state.
    #[must_use]
    pub fn accepts_input(self) -> bool {
        matches!(self, Self::Active | Self::Interrupting)
    }

    /// Whether the session has reached its terminal state.
    #[must_use]
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// Whether the session has begun or finished shutting down.
    #[must_use]
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Interrupting => "interrupting",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}
