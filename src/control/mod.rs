//! Operator control surface.
//!
//! Commands arrive as lines (`/pause`, `/inject fix the flaky test`, ...),
//! are parsed into the closed [`Command`] enum, and are dispatched by
//! [`ControlSurface`] as thin synchronous calls onto the shared loop state,
//! the instruction queue and the rollback guard. Every error is returned to
//! the caller; nothing here can bring the driver thread down.

pub mod console;
pub mod interrupt;

pub use console::{run_console, run_detached, ConsoleExit};
pub use interrupt::{InterruptAction, InterruptTracker, MenuChoice};

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, info};

use crate::checkpoint::{RollbackGuard, RollbackOutcome};
use crate::error::{Result, TetherError};
use crate::r#loop::queue::{InstructionId, InstructionType, Priority};
use crate::r#loop::shared::{ResumeOutcome, SharedLoopState, StatusSnapshot};
use crate::r#loop::state::LoopState;

/// Command grammar shown by `/help` and on usage errors.
pub const USAGE: &str = "\
Commands:
  /pause                                   pause at the next iteration boundary
  /resume                                  resume a paused loop
  /cancel [--no-checkpoint]                checkpoint and stop (or stop immediately)
  /inject <text> [--priority <level>]      queue an instruction (low|normal|high|critical)
  /merge <text>                            queue a high-priority plan update
  /rollback <n>                            discard the last n commits on this branch
  /status                                  show state, iteration and queue depth
  /background                              continue in a background process
  /help                                    show this help";

// ============================================================================
// Commands
// ============================================================================

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Cancel { checkpoint: bool },
    Inject { text: String, priority: Priority },
    Merge { text: String },
    Rollback { count: u32 },
    Status,
    Background,
    Help,
}

impl Command {
    /// Parse one input line.
    ///
    /// # Errors
    ///
    /// Returns `Usage` for anything outside the grammar.
    ///
    /// # Example
    ///
    /// ```
    /// use tether::control::Command;
    /// use tether::r#loop::Priority;
    ///
    /// let cmd = Command::parse("/inject add retries --priority high").unwrap();
    /// assert_eq!(
    ///     cmd,
    ///     Command::Inject { text: "add retries".into(), priority: Priority::High }
    /// );
    /// assert!(Command::parse("/launch").is_err());
    /// ```
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let Some(body) = line.strip_prefix('/') else {
            return Err(TetherError::usage(format!(
                "commands start with '/': {line:?} (try /help)"
            )));
        };

        let (name, rest) = match body.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (body, ""),
        };

        match name {
            "pause" => no_args(Command::Pause, name, rest),
            "resume" => no_args(Command::Resume, name, rest),
            "status" => no_args(Command::Status, name, rest),
            "background" => no_args(Command::Background, name, rest),
            "help" => no_args(Command::Help, name, rest),
            "cancel" => match rest {
                "" => Ok(Command::Cancel { checkpoint: true }),
                "--no-checkpoint" => Ok(Command::Cancel { checkpoint: false }),
                other => Err(TetherError::usage(format!(
                    "unexpected argument to /cancel: {other}"
                ))),
            },
            "inject" => parse_inject(rest),
            "merge" if rest.is_empty() => Err(TetherError::usage("/merge needs text")),
            "merge" => Ok(Command::Merge {
                text: rest.to_string(),
            }),
            "rollback" => {
                let count = rest.parse::<u32>().map_err(|_| {
                    TetherError::usage(format!("/rollback needs a commit count, got {rest:?}"))
                })?;
                Ok(Command::Rollback { count })
            }
            other => Err(TetherError::usage(format!("unknown command /{other}"))),
        }
    }

    /// Command name without the slash.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Cancel { .. } => "cancel",
            Command::Inject { .. } => "inject",
            Command::Merge { .. } => "merge",
            Command::Rollback { .. } => "rollback",
            Command::Status => "status",
            Command::Background => "background",
            Command::Help => "help",
        }
    }
}

fn no_args(command: Command, name: &str, rest: &str) -> Result<Command> {
    if rest.is_empty() {
        Ok(command)
    } else {
        Err(TetherError::usage(format!("/{name} takes no arguments")))
    }
}

fn parse_inject(rest: &str) -> Result<Command> {
    let mut priority = Priority::Normal;
    let mut text = rest.to_string();

    // Cut each `--priority <level>` pair out of the text, leaving the rest as typed.
    while let Some(flag) = find_word(&text, "--priority") {
        let Some(level) = next_word(&text, flag.end) else {
            return Err(TetherError::usage("--priority needs a level"));
        };
        priority = text[level.clone()]
            .parse::<Priority>()
            .map_err(|e| TetherError::usage(e.to_string()))?;

        // The flag is whitespace-delimited, so `before` is empty or ends in whitespace.
        let before = &text[..flag.start];
        let after = text[level.end..].trim_start();
        text = format!("{before}{after}");
    }

    let text = text.trim();
    if text.is_empty() {
        return Err(TetherError::usage("/inject needs text"));
    }
    Ok(Command::Inject {
        text: text.to_string(),
        priority,
    })
}

/// Byte range of the first whitespace-delimited occurrence of `word`.
fn find_word(text: &str, word: &str) -> Option<Range<usize>> {
    let mut from = 0;
    while let Some(range) = next_word(text, from) {
        if &text[range.clone()] == word {
            return Some(range);
        }
        from = range.end;
    }
    None
}

/// Byte range of the next whitespace-delimited word at or after `from`.
fn next_word(text: &str, from: usize) -> Option<Range<usize>> {
    let tail = &text[from..];
    let start = from + tail.find(|c: char| !c.is_whitespace())?;
    let end = text[start..]
        .find(char::is_whitespace)
        .map_or(text.len(), |len| start + len);
    Some(start..end)
}

// ============================================================================
// Outcomes
// ============================================================================

/// Typed result of a dispatched command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// The driver will pause at its next safe point.
    PauseRequested,
    /// Outcome of `/resume`.
    Resumed(ResumeOutcome),
    /// The loop has stopped after a cancel request.
    Cancelled { state: LoopState, checkpointed: bool },
    /// A cancel was requested but not waited for.
    CancelRequested { checkpoint: bool },
    /// An instruction was queued.
    Queued {
        id: InstructionId,
        kind: InstructionType,
        priority: Priority,
        depth: usize,
    },
    RolledBack(RollbackOutcome),
    Status(StatusSnapshot),
    /// The caller should detach from the session.
    Detach,
    Help,
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::PauseRequested => {
                write!(f, "Pause requested; the loop stops after the current iteration")
            }
            CommandOutcome::Resumed(ResumeOutcome::Resumed) => write!(f, "Resumed"),
            CommandOutcome::Resumed(ResumeOutcome::PauseWithdrawn) => {
                write!(f, "Pending pause withdrawn; the loop keeps running")
            }
            CommandOutcome::Cancelled {
                state: LoopState::Cancelled,
                checkpointed: true,
            } => write!(f, "Cancelled; checkpoint saved"),
            CommandOutcome::Cancelled {
                state: LoopState::Cancelled,
                checkpointed: false,
            } => write!(f, "Cancelled; no checkpoint saved"),
            CommandOutcome::Cancelled { state, .. } => {
                write!(f, "Loop finished as {state} before the cancel took effect")
            }
            CommandOutcome::CancelRequested { checkpoint: true } => {
                write!(f, "Cancel requested; the loop checkpoints and stops at the next boundary")
            }
            CommandOutcome::CancelRequested { checkpoint: false } => write!(
                f,
                "Cancel requested without checkpoint; progress since the last checkpoint will be lost"
            ),
            CommandOutcome::Queued {
                id,
                kind,
                priority,
                depth,
            } => write!(
                f,
                "Queued {kind} {} ({priority}); {depth} waiting for the next iteration",
                id.short()
            ),
            CommandOutcome::RolledBack(outcome) => write!(f, "{}", outcome.summary()),
            CommandOutcome::Status(status) => write!(f, "{}", status.summary()),
            CommandOutcome::Detach => write!(
                f,
                "Detaching; the loop checkpoints after this iteration and continues in a background process"
            ),
            CommandOutcome::Help => write!(f, "{USAGE}"),
        }
    }
}

// ============================================================================
// Control Surface
// ============================================================================

/// Dispatches operator commands onto a running session.
#[derive(Debug)]
pub struct ControlSurface {
    shared: Arc<SharedLoopState>,
    rollback: RollbackGuard,
}

impl ControlSurface {
    #[must_use]
    pub fn new(shared: Arc<SharedLoopState>, rollback: RollbackGuard) -> Self {
        Self { shared, rollback }
    }

    /// The shared state this surface controls.
    #[must_use]
    pub fn shared(&self) -> &Arc<SharedLoopState> {
        &self.shared
    }

    /// Parse and dispatch one line.
    ///
    /// # Errors
    ///
    /// Returns `Usage` for malformed input, otherwise whatever
    /// [`dispatch`](Self::dispatch) returns.
    pub fn execute(&self, line: &str) -> Result<CommandOutcome> {
        self.dispatch(Command::parse(line)?)
    }

    /// Run a command.
    ///
    /// `Cancel { checkpoint: true }` blocks until the driver has finished its
    /// checkpoint-then-terminate sequence. `Rollback` may block while waiting
    /// for the loop to pause.
    ///
    /// # Errors
    ///
    /// Returns `Precondition` when the loop is in the wrong state, or
    /// `Rollback` when the guard refuses.
    pub fn dispatch(&self, command: Command) -> Result<CommandOutcome> {
        debug!(command = command.name(), "Dispatching command");
        match command {
            Command::Pause => {
                self.shared.request_pause()?;
                Ok(CommandOutcome::PauseRequested)
            }
            Command::Resume => Ok(CommandOutcome::Resumed(self.shared.resume()?)),
            Command::Cancel { checkpoint } => self.cancel(checkpoint),
            Command::Inject { text, priority } => {
                Ok(self.enqueue(text, InstructionType::UserInput, priority))
            }
            Command::Merge { text } => {
                Ok(self.enqueue(text, InstructionType::PlanUpdate, Priority::High))
            }
            Command::Rollback { count } => {
                Ok(CommandOutcome::RolledBack(self.rollback.rollback(count)?))
            }
            Command::Status => Ok(CommandOutcome::Status(self.shared.status())),
            Command::Background => Ok(CommandOutcome::Detach),
            Command::Help => Ok(CommandOutcome::Help),
        }
    }

    fn enqueue(&self, text: String, kind: InstructionType, priority: Priority) -> CommandOutcome {
        let instruction = self.shared.queue().enqueue(text, kind, priority);
        CommandOutcome::Queued {
            id: instruction.id,
            kind,
            priority,
            depth: self.shared.queue().len(),
        }
    }

    fn cancel(&self, checkpoint: bool) -> Result<CommandOutcome> {
        let state = self.shared.state();
        if state.is_terminal() {
            return Err(TetherError::precondition("cancel", state));
        }

        if !checkpoint {
            self.shared.request_cancel_without_checkpoint();
            return Ok(CommandOutcome::CancelRequested { checkpoint: false });
        }

        self.shared.request_cancel();
        if state == LoopState::Idle {
            // No driver yet; it cancels at its first safe point.
            return Ok(CommandOutcome::CancelRequested { checkpoint: true });
        }

        info!("Waiting for the loop to checkpoint and stop");
        let state = self.shared.wait_for_terminal(None);
        Ok(CommandOutcome::Cancelled {
            state,
            checkpointed: self.shared.cancellation_checkpointed(),
        })
    }
}
