//! Interrupt (Ctrl+C) handling.
//!
//! A single interrupt opens a menu offering cancel, pause or continue. A
//! second interrupt inside the configured window forces an immediate exit
//! without checkpointing.

use std::str::FromStr;
use std::time::{Duration, Instant};

use super::Command;
use crate::error::TetherError;

/// Process exit code for a forced interrupt.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Prompt printed when the interrupt menu opens.
pub const MENU_PROMPT: &str =
    "Interrupted: [c]ancel with checkpoint, [p]ause, or Enter to continue (Ctrl+C again to force exit)";

/// What to do about an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    OpenMenu,
    /// Second interrupt inside the window. Lossy: no checkpoint is taken.
    ForceExit,
}

/// Tracks interrupt timing to detect a double Ctrl+C.
#[derive(Debug, Clone)]
pub struct InterruptTracker {
    window: Duration,
    last: Option<Instant>,
}

impl InterruptTracker {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Record an interrupt received at `now`.
    pub fn on_interrupt(&mut self, now: Instant) -> InterruptAction {
        match self.last {
            Some(last) if now.saturating_duration_since(last) <= self.window => {
                InterruptAction::ForceExit
            }
            _ => {
                self.last = Some(now);
                InterruptAction::OpenMenu
            }
        }
    }

    /// Forget the previous interrupt.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Operator choice from the interrupt menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    Cancel,
    Pause,
    Continue,
}

impl MenuChoice {
    /// Command to dispatch for this choice, if any.
    #[must_use]
    pub fn command(self) -> Option<Command> {
        match self {
            MenuChoice::Cancel => Some(Command::Cancel { checkpoint: true }),
            MenuChoice::Pause => Some(Command::Pause),
            MenuChoice::Continue => None,
        }
    }
}

impl FromStr for MenuChoice {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "c" | "cancel" => Ok(MenuChoice::Cancel),
            "p" | "pause" => Ok(MenuChoice::Pause),
            "" | "continue" => Ok(MenuChoice::Continue),
            other => Err(TetherError::usage(format!(
                "unknown menu choice {other:?}; expected cancel, pause or continue"
            ))),
        }
    }
}
