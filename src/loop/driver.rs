//! Background loop driver.
//!
//! The [`LoopDriver`] owns the second thread of a session. Each pass of its
//! loop is one iteration:
//!
//! 1. **Safe point**: honor a pending cancel or pause before any work.
//! 2. **Merge**: drain the instruction queue and fold the merge block into
//!    the working context.
//! 3. **Execute**: hand the context to the [`IterationExecutor`].
//! 4. **Record**: append the summary, bump the iteration counter, and stop
//!    on a terminal outcome.
//! 5. **Checkpoint** every `checkpoint_interval` iterations.
//! 6. **Terminate on cancel**: checkpoint (unless skipped), then `Cancelled`.
//!
//! Executor failures end the loop in `Errored` without retry. Failures in the
//! driver's own bookkeeping are fatal and also end in `Errored`, as does a
//! panic anywhere in the loop, collaborators included.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use super::queue::format_for_prompt;
use super::shared::{OutputKind, SafePoint, SharedLoopState};
use super::state::LoopState;
use crate::checkpoint::{Checkpoint, CheckpointId, CheckpointReason, CheckpointStore};
use crate::error::{IntoTetherError, Result, TetherError};
use crate::testing::{IterationExecutor, IterationOutcome, IterationStatus};

/// Name given to the driver thread.
pub const DRIVER_THREAD_NAME: &str = "tether-driver";

// ============================================================================
// Configuration
// ============================================================================

/// Driver behavior knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Checkpoint every N completed iterations (0 disables periodic checkpoints).
    pub checkpoint_interval: u32,
    /// Complete the loop after this many iterations (0 = unlimited).
    pub max_iterations: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 5,
            max_iterations: 0,
        }
    }
}

impl DriverConfig {
    /// Create a new configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the periodic checkpoint interval.
    #[must_use]
    pub fn with_checkpoint_interval(mut self, interval: u32) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Set the iteration limit.
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }
}

// ============================================================================
// Report / Handle
// ============================================================================

/// What the driver thread returns when it exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverReport {
    /// Terminal state the loop ended in.
    pub final_state: LoopState,
    /// Completed iterations.
    pub iterations: u32,
    /// Checkpoint saved as part of cancellation, if any.
    pub cancellation_checkpoint: Option<CheckpointId>,
    /// Whether cancellation skipped its checkpoint on request.
    pub checkpoint_skipped: bool,
    /// Fatal error message, if the driver failed.
    pub error: Option<String>,
}

/// Handle to a running driver thread.
#[derive(Debug)]
pub struct DriverHandle {
    thread: JoinHandle<DriverReport>,
    shared: Arc<SharedLoopState>,
}

impl DriverHandle {
    /// Wait for the driver thread to exit.
    ///
    /// # Errors
    ///
    /// Returns `DriverFatal` if the thread died outside the loop's own panic
    /// handling; the loop is moved to a terminal state first.
    pub fn join(self) -> Result<DriverReport> {
        match self.thread.join() {
            Ok(report) => Ok(report),
            Err(_) => {
                let iteration = self.shared.iteration();
                error!(iteration, "Driver thread panicked");
                force_terminal(&self.shared);
                Err(TetherError::driver_fatal(iteration, "driver thread panicked"))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Move the loop to a terminal state from wherever it is. `Paused` can only
/// legally end in `Cancelled`.
fn force_terminal(shared: &SharedLoopState) -> LoopState {
    let target = match shared.state() {
        LoopState::Paused => LoopState::Cancelled,
        LoopState::Idle => return LoopState::Idle,
        state if state.is_terminal() => return state,
        _ => LoopState::Errored,
    };
    if let Err(e) = shared.transition(target) {
        error!("Could not move loop to {}: {}", target, e);
    }
    shared.state()
}

// ============================================================================
// Loop Driver
// ============================================================================

/// Runs iterations on a background thread until a terminal condition.
pub struct LoopDriver {
    shared: Arc<SharedLoopState>,
    executor: Arc<dyn IterationExecutor>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: DriverConfig,
}

impl std::fmt::Debug for LoopDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopDriver")
            .field("shared", &self.shared)
            .field("executor", &"<dyn IterationExecutor>")
            .field("checkpoints", &"<dyn CheckpointStore>")
            .field("config", &self.config)
            .finish()
    }
}

impl LoopDriver {
    /// Create a driver over the given shared state and collaborators.
    #[must_use]
    pub fn new(
        shared: Arc<SharedLoopState>,
        executor: Arc<dyn IterationExecutor>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            shared,
            executor,
            checkpoints,
            config: DriverConfig::default(),
        }
    }

    /// Replace the driver configuration.
    #[must_use]
    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    /// Move the loop `Idle -> Running` and start the driver thread.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the loop was not idle, or an IO error if
    /// the thread could not be spawned.
    pub fn spawn(self) -> Result<DriverHandle> {
        self.shared.transition(LoopState::Running)?;
        let shared = Arc::clone(&self.shared);

        let spawned = thread::Builder::new()
            .name(DRIVER_THREAD_NAME.to_string())
            .spawn(move || self.run());

        match spawned {
            Ok(thread) => Ok(DriverHandle { thread, shared }),
            Err(e) => {
                force_terminal(&shared);
                Err(e.into())
            }
        }
    }

    /// Drive the loop to a terminal state on the current thread.
    fn run(self) -> DriverReport {
        info!(
            iteration = self.shared.iteration(),
            checkpoint_interval = self.config.checkpoint_interval,
            max_iterations = self.config.max_iterations,
            "Driver started"
        );

        // A panicking collaborator must still leave the loop terminal.
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.drive()))
            .unwrap_or_else(|payload| {
                Err(TetherError::driver_fatal(
                    self.shared.iteration(),
                    format!("driver panicked: {}", panic_message(payload.as_ref())),
                ))
            });

        match result {
            Ok(report) => {
                info!(
                    state = %report.final_state,
                    iterations = report.iterations,
                    "Driver finished"
                );
                report
            }
            Err(e) => self.fail(e),
        }
    }

    fn drive(&self) -> Result<DriverReport> {
        loop {
            // 1. Safe point
            match self.shared.await_safe_point() {
                SafePoint::Proceed => {}
                SafePoint::Cancel => return self.terminate_on_cancel(),
                SafePoint::Stopped(state) => return Ok(self.report(state)),
            }

            let completed = self.shared.iteration();
            if self.config.max_iterations > 0 && completed >= self.config.max_iterations {
                self.shared.log(
                    OutputKind::Warning,
                    format!("Iteration limit ({}) reached", self.config.max_iterations),
                );
                self.finish(completed, LoopState::Completed)?;
                return Ok(self.report(LoopState::Completed));
            }

            // 2. Merge
            let context = self.merge_instructions(completed + 1);

            // 3. Execute
            debug!(iteration = completed + 1, "Executing iteration");
            let outcome = match self.executor.execute_iteration(&context) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(iteration = completed + 1, "Executor failed: {:#}", e);
                    IterationOutcome::errored("Executor failed", format!("{e:#}"))
                }
            };

            // 4. Record
            let iteration = self.shared.complete_iteration();
            if iteration <= completed {
                return Err(TetherError::driver_fatal(
                    iteration,
                    "iteration counter did not advance",
                ));
            }
            self.record(iteration, &outcome);

            match outcome.status {
                IterationStatus::Continue => {}
                IterationStatus::Completed => {
                    self.finish(iteration, LoopState::Completed)?;
                    return Ok(self.report(LoopState::Completed));
                }
                IterationStatus::Errored => {
                    self.finish(iteration, LoopState::Errored)?;
                    return Ok(self.report(LoopState::Errored));
                }
            }

            // 5. Periodic checkpoint
            if self.config.checkpoint_interval > 0
                && iteration % self.config.checkpoint_interval == 0
            {
                self.save_checkpoint(CheckpointReason::Interval)?;
            }
        }
    }

    /// Drain the queue and fold any instructions into the working context.
    fn merge_instructions(&self, iteration: u32) -> String {
        let instructions = self.shared.queue().dequeue_all();
        if instructions.is_empty() {
            return self.shared.context();
        }

        let block = format_for_prompt(&instructions);
        info!(
            iteration,
            count = instructions.len(),
            "Merged queued instructions"
        );
        self.shared.log(
            OutputKind::Info,
            format!(
                "Merged {} queued instruction(s) into iteration {}",
                instructions.len(),
                iteration
            ),
        );
        self.shared.merge_into_context(&block)
    }

    fn record(&self, iteration: u32, outcome: &IterationOutcome) {
        let (kind, text) = match outcome.status {
            IterationStatus::Continue => (
                OutputKind::Success,
                format!("Iteration {iteration}: {}", outcome.summary),
            ),
            IterationStatus::Completed => (
                OutputKind::Success,
                format!("Iteration {iteration} completed the work: {}", outcome.summary),
            ),
            IterationStatus::Errored if outcome.detail.is_empty() => (
                OutputKind::Error,
                format!("Iteration {iteration} errored: {}", outcome.summary),
            ),
            IterationStatus::Errored => (
                OutputKind::Error,
                format!(
                    "Iteration {iteration} errored: {} ({})",
                    outcome.summary, outcome.detail
                ),
            ),
        };
        self.shared.log(kind, text);
    }

    /// Apply a terminal transition reached from `Running`.
    fn finish(&self, iteration: u32, state: LoopState) -> Result<()> {
        self.shared
            .transition(state)
            .map_err(|e| TetherError::driver_fatal(iteration, e.to_string()))
    }

    fn save_checkpoint(&self, reason: CheckpointReason) -> Result<CheckpointId> {
        let checkpoint = Checkpoint::capture(&self.shared, reason);
        let id = checkpoint.id.clone();
        let iteration = checkpoint.iteration;
        self.checkpoints.save(&checkpoint).into_tether_checkpoint()?;
        debug!(iteration, %reason, id = %id.short(), "Checkpoint saved");
        self.shared.log(
            OutputKind::Info,
            format!("Checkpoint {} saved ({reason}, iteration {iteration})", id.short()),
        );
        Ok(id)
    }

    /// Checkpoint-then-terminate sequence for a cancel request.
    fn terminate_on_cancel(&self) -> Result<DriverReport> {
        let iteration = self.shared.iteration();
        let skipped = self.shared.skip_checkpoint_requested();

        let checkpoint = if skipped {
            warn!(iteration, "Cancelling without checkpoint");
            self.shared.log(
                OutputKind::Warning,
                format!("Cancelled after iteration {iteration} without checkpoint (progress since last checkpoint is lost)"),
            );
            None
        } else {
            let id = self.save_checkpoint(CheckpointReason::Cancellation)?;
            self.shared.mark_cancellation_checkpointed();
            self.shared.log(
                OutputKind::Info,
                format!("Cancelled after iteration {iteration}"),
            );
            Some(id)
        };

        self.shared
            .transition(LoopState::Cancelled)
            .map_err(|e| TetherError::driver_fatal(iteration, e.to_string()))?;

        Ok(DriverReport {
            final_state: LoopState::Cancelled,
            iterations: iteration,
            cancellation_checkpoint: checkpoint,
            checkpoint_skipped: skipped,
            error: None,
        })
    }

    fn report(&self, final_state: LoopState) -> DriverReport {
        DriverReport {
            final_state,
            iterations: self.shared.iteration(),
            cancellation_checkpoint: None,
            checkpoint_skipped: false,
            error: None,
        }
    }

    /// Fatal path: log everything, then end the loop.
    fn fail(&self, error: TetherError) -> DriverReport {
        let iteration = self.shared.iteration();
        let error = match error {
            e @ TetherError::DriverFatal { .. } => e,
            other => TetherError::driver_fatal(iteration, format!("{other:#}")),
        };

        error!(iteration, "Driver stopped on fatal error: {:#}", error);
        self.shared.log(OutputKind::Error, error.to_string());
        let final_state = force_terminal(&self.shared);

        DriverReport {
            final_state,
            iterations: iteration,
            cancellation_checkpoint: None,
            checkpoint_skipped: false,
            error: Some(error.to_string()),
        }
    }
}
