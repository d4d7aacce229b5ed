//! Loop state machine.
//!
//! ```text
//! Idle ──> Running <──> Paused
//!             │            │
//!             ├──> Cancelled <┘
//!             ├──> Completed
//!             └──> Errored
//! ```
//!
//! `Cancelled`, `Completed` and `Errored` are terminal.

use serde::{Deserialize, Serialize};

/// State of a supervised work loop.
///
/// # Example
///
/// ```
/// use tether::r#loop::state::LoopState;
///
/// assert!(LoopState::Idle.can_transition_to(LoopState::Running));
/// assert!(!LoopState::Completed.can_transition_to(LoopState::Running));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Session created, driver not started
    #[default]
    Idle,
    /// Driver is iterating
    Running,
    /// Driver is parked at a safe point
    Paused,
    /// Stopped by operator request
    Cancelled,
    /// Executor signalled completion (or the iteration limit was reached)
    Completed,
    /// Executor or driver failure
    Errored,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Idle => write!(f, "idle"),
            LoopState::Running => write!(f, "running"),
            LoopState::Paused => write!(f, "paused"),
            LoopState::Cancelled => write!(f, "cancelled"),
            LoopState::Completed => write!(f, "completed"),
            LoopState::Errored => write!(f, "errored"),
        }
    }
}

impl LoopState {
    /// All states, in declaration order.
    pub const ALL: [LoopState; 6] = [
        LoopState::Idle,
        LoopState::Running,
        LoopState::Paused,
        LoopState::Cancelled,
        LoopState::Completed,
        LoopState::Errored,
    ];

    /// Whether no further transition is permitted from this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopState::Cancelled | LoopState::Completed | LoopState::Errored
        )
    }

    /// Legality table for state transitions.
    #[must_use]
    pub fn can_transition_to(self, to: LoopState) -> bool {
        match self {
            LoopState::Idle => to == LoopState::Running,
            LoopState::Running => matches!(
                to,
                LoopState::Paused | LoopState::Cancelled | LoopState::Completed | LoopState::Errored
            ),
            LoopState::Paused => matches!(to, LoopState::Running | LoopState::Cancelled),
            LoopState::Cancelled | LoopState::Completed | LoopState::Errored => false,
        }
    }
}
