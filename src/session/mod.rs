//! Session wiring and recovery.
//!
//! A [`Session`] ties together the configuration, the shared loop state, the
//! collaborators and the two threads of execution:
//!
//! ```text
//! Session::open
//!   ├── SessionConfig (validated)
//!   ├── SharedLoopState (prompt file, or restored from the latest checkpoint)
//!   └── SessionDependencies (executor, git, checkpoint store)
//!
//! Session::run
//!   ├── driver thread:  LoopDriver
//!   └── control thread: console ──/background──> checkpoint, then
//!                                                 `tether run --resume --headless`
//!                                                 in a new process
//! ```
//!
//! # Recovery
//!
//! Resuming from a checkpoint restores the working context and iteration
//! counter and re-queues every instruction that had not been merged yet,
//! keeping its priority and original `queued_at`.

mod background;

pub use background::{background_command, resume_args, spawn_background};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::checkpoint::{
    Checkpoint, CheckpointId, CheckpointManager, CheckpointManagerConfig, CheckpointStore,
    RollbackGuard,
};
use crate::config::SessionConfig;
use crate::control::{run_console, run_detached, ConsoleExit, ControlSurface};
use crate::error::{IntoTetherError, Result, TetherError};
use crate::r#loop::driver::{DriverHandle, DriverReport, LoopDriver};
use crate::r#loop::operations::{ProcessExecutor, RealGitOperations};
use crate::r#loop::queue::InstructionQueue;
use crate::r#loop::shared::SharedLoopState;
use crate::r#loop::state::LoopState;
use crate::testing::{GitOperations, IterationExecutor};

/// Exit code for a cancelled session.
pub const CANCELLED_EXIT_CODE: i32 = 3;

// ============================================================================
// Dependencies
// ============================================================================

/// Collaborators injected into a session.
///
/// # Example
///
/// ```rust,ignore
/// use tether::session::SessionDependencies;
/// use tether::testing::{MockCheckpointStore, MockExecutor, MockGitOperations};
/// use std::sync::Arc;
///
/// let deps = SessionDependencies {
///     executor: Arc::new(MockExecutor::new()),
///     git: Arc::new(MockGitOperations::new().with_branch("feature/x")),
///     checkpoints: Arc::new(MockCheckpointStore::new()),
/// };
/// ```
#[derive(Clone)]
pub struct SessionDependencies {
    pub executor: Arc<dyn IterationExecutor>,
    pub git: Arc<dyn GitOperations>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl fmt::Debug for SessionDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDependencies")
            .field("executor", &"<dyn IterationExecutor>")
            .field("git", &"<dyn GitOperations>")
            .field("checkpoints", &"<dyn CheckpointStore>")
            .finish()
    }
}

impl SessionDependencies {
    /// Create real dependencies for production use.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the executor command cannot be found, or an error
    /// if the checkpoint directory cannot be created.
    pub fn real(project_dir: &Path, config: &SessionConfig) -> Result<Self> {
        let executor = ProcessExecutor::new(project_dir.to_path_buf(), config.executor.clone());
        if !executor.is_available() {
            return Err(TetherError::config(format!(
                "executor command '{}' not found on PATH",
                config.executor.command
            )));
        }

        let checkpoints = CheckpointManager::with_config(
            SessionConfig::checkpoints_dir(project_dir),
            CheckpointManagerConfig::new().with_max_checkpoints(config.max_checkpoints),
        )?;

        Ok(Self {
            executor: Arc::new(executor),
            git: Arc::new(RealGitOperations::new(project_dir.to_path_buf())),
            checkpoints: Arc::new(checkpoints),
        })
    }
}

// ============================================================================
// Summary
// ============================================================================

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    /// Terminal state, or the last observed state for a forced exit.
    pub final_state: LoopState,
    pub iterations: u32,
    pub cancellation_checkpoint: Option<CheckpointId>,
    /// True when the session ended without its cancellation checkpoint.
    pub checkpoint_skipped: bool,
    /// Ended by a double interrupt.
    pub forced: bool,
    pub error: Option<String>,
    /// PID of the process the session was handed to by `/background`.
    pub background_pid: Option<u32>,
}

impl SessionSummary {
    fn from_report(session_id: String, report: DriverReport) -> Self {
        Self {
            session_id,
            final_state: report.final_state,
            iterations: report.iterations,
            cancellation_checkpoint: report.cancellation_checkpoint,
            checkpoint_skipped: report.checkpoint_skipped,
            forced: false,
            error: report.error,
            background_pid: None,
        }
    }

    /// Process exit code for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.forced {
            return crate::control::interrupt::FORCED_EXIT_CODE;
        }
        if self.background_pid.is_some() {
            return 0;
        }
        if self.error.is_some() {
            return 1;
        }
        match self.final_state {
            LoopState::Completed => 0,
            LoopState::Cancelled => CANCELLED_EXIT_CODE,
            _ => 1,
        }
    }

    /// One-line description for the terminal.
    #[must_use]
    pub fn describe(&self) -> String {
        if self.forced {
            return format!(
                "Forced exit after iteration {} (state {}); checkpoint skipped",
                self.iterations, self.final_state
            );
        }
        if let Some(pid) = self.background_pid {
            return format!(
                "Session {} continues in background process {} after {} iteration(s); output in .tether/session.log",
                short_id(&self.session_id),
                pid,
                self.iterations
            );
        }
        let mut line = format!(
            "Session {} {} after {} iteration(s)",
            short_id(&self.session_id),
            self.final_state,
            self.iterations
        );
        if let Some(ref id) = self.cancellation_checkpoint {
            line.push_str(&format!("; checkpoint {}", id.short()));
        } else if self.checkpoint_skipped {
            line.push_str("; checkpoint skipped");
        } else if self.final_state == LoopState::Cancelled {
            line.push_str("; cancellation checkpoint NOT saved");
        }
        if let Some(ref error) = self.error {
            line.push_str(&format!("; {error}"));
        }
        line
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

// ============================================================================
// Session
// ============================================================================

/// One supervised work-loop session.
#[derive(Debug)]
pub struct Session {
    id: String,
    project_dir: PathBuf,
    config: SessionConfig,
    shared: Arc<SharedLoopState>,
    deps: SessionDependencies,
    resumed_from: Option<CheckpointId>,
}

impl Session {
    /// Create a fresh session with an explicit working context.
    #[must_use]
    pub fn new(
        project_dir: impl Into<PathBuf>,
        config: SessionConfig,
        context: impl Into<String>,
        deps: SessionDependencies,
    ) -> Self {
        let queue = InstructionQueue::new(config.queue_warn_threshold);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_dir: project_dir.into(),
            shared: Arc::new(SharedLoopState::with_queue(context, queue)),
            config,
            deps,
            resumed_from: None,
        }
    }

    /// Open a session for a project using real collaborators.
    ///
    /// With `resume`, the latest checkpoint replaces the prompt file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a bad configuration, `Config` if the
    /// prompt file or executor is missing, and `Usage` when resuming without
    /// any checkpoint.
    pub fn open(project_dir: &Path, config: SessionConfig, resume: bool) -> Result<Self> {
        config.validate()?;

        if resume {
            let deps = SessionDependencies::real(project_dir, &config)?;
            let checkpoint = deps
                .checkpoints
                .load()
                .into_tether_checkpoint()?
                .ok_or_else(|| TetherError::usage("no checkpoint to resume from"))?;
            return Self::from_checkpoint(project_dir, config, checkpoint, deps);
        }

        let prompt_path = config.prompt_path(project_dir);
        let context = std::fs::read_to_string(&prompt_path).map_err(|e| {
            TetherError::config_with_path(format!("cannot read prompt file: {e}"), prompt_path)
        })?;
        let deps = SessionDependencies::real(project_dir, &config)?;
        Ok(Self::new(project_dir, config, context, deps))
    }

    /// Rebuild a session from a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the iteration counter cannot be restored.
    pub fn from_checkpoint(
        project_dir: impl Into<PathBuf>,
        config: SessionConfig,
        checkpoint: Checkpoint,
        deps: SessionDependencies,
    ) -> Result<Self> {
        if !checkpoint.verify_context() {
            warn!(id = %checkpoint.id.short(), "Checkpoint context hash mismatch; resuming anyway");
        }

        let mut session = Self::new(project_dir, config, checkpoint.context.clone(), deps);
        session.shared.restore_iteration(checkpoint.iteration)?;
        let pending = checkpoint.pending.len();
        for instruction in checkpoint.pending {
            session.shared.queue().restore(instruction);
        }

        info!(
            id = %checkpoint.id.short(),
            reason = %checkpoint.reason,
            iteration = checkpoint.iteration,
            pending,
            "Resumed from checkpoint"
        );
        session.resumed_from = Some(checkpoint.id);
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn shared(&self) -> &Arc<SharedLoopState> {
        &self.shared
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Checkpoint this session was restored from, if any.
    #[must_use]
    pub fn resumed_from(&self) -> Option<&CheckpointId> {
        self.resumed_from.as_ref()
    }

    /// Build the operator control surface for this session.
    #[must_use]
    pub fn control_surface(&self) -> ControlSurface {
        let guard = RollbackGuard::new(
            Arc::clone(&self.deps.git),
            Arc::clone(&self.shared),
            Arc::clone(&self.deps.checkpoints),
        )
        .with_protected_branches(self.config.protected_branches.clone())
        .with_pause_timeout(self.config.pause_timeout());
        ControlSurface::new(Arc::clone(&self.shared), guard)
    }

    /// Start the driver thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop was already started.
    pub fn start(&self) -> Result<DriverHandle> {
        info!(
            session = %self.id,
            iteration = self.shared.iteration(),
            queued = self.shared.queue().len(),
            "Starting session"
        );
        LoopDriver::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.deps.executor),
            Arc::clone(&self.deps.checkpoints),
        )
        .with_config(self.config.driver_config())
        .spawn()
    }

    /// Run the session to completion.
    ///
    /// Interactive sessions read commands from stdin until the loop ends.
    /// `/background` hands the session to a headless background process; if
    /// stdin closes, this process keeps supervising without a console.
    /// Headless sessions go straight to the detached supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver cannot start, the session log cannot
    /// be written, the background process cannot be spawned, or the driver
    /// thread dies.
    pub async fn run(self, headless: bool) -> Result<SessionSummary> {
        let handle = self.start()?;
        let log_path = SessionConfig::session_log_path(&self.project_dir);
        let poll = self.config.output_poll();
        let window = self.config.interrupt_window();

        let exit = if headless {
            run_detached(Arc::clone(&self.shared), &log_path, poll, window).await?
        } else {
            let surface = Arc::new(self.control_surface());
            match run_console(surface, poll, window).await {
                Ok(ConsoleExit::Background) => return self.hand_off(handle).await,
                Ok(ConsoleExit::Detached) => {
                    println!("Output continues in {}", log_path.display());
                    run_detached(Arc::clone(&self.shared), &log_path, poll, window).await?
                }
                Ok(exit) => exit,
                Err(e) => {
                    warn!("Console failed: {}; continuing detached", e);
                    run_detached(Arc::clone(&self.shared), &log_path, poll, window).await?
                }
            }
        };

        if exit == ConsoleExit::ForcedExit {
            let status = self.shared.status();
            warn!(
                iteration = status.iteration,
                "Forced exit; cancellation checkpoint skipped"
            );
            return Ok(SessionSummary {
                session_id: self.id,
                final_state: status.state,
                iterations: status.iteration,
                cancellation_checkpoint: None,
                checkpoint_skipped: true,
                forced: true,
                error: None,
                background_pid: None,
            });
        }

        let report = join_driver(handle).await?;
        Ok(SessionSummary::from_report(self.id, report))
    }

    /// Checkpoint the loop at its next safe point and continue it in a
    /// background process.
    async fn hand_off(self, handle: DriverHandle) -> Result<SessionSummary> {
        println!("Waiting for the current iteration to finish before detaching...");
        let report = self.stop_for_handoff(handle).await?;

        if report.cancellation_checkpoint.is_none() {
            // Finished on its own, or the checkpoint failed: nothing to resume.
            warn!(state = %report.final_state, "Loop stopped without a checkpoint; not detaching");
            return Ok(SessionSummary::from_report(self.id, report));
        }

        let pid = spawn_background(&self.project_dir, &self.config)?;
        Ok(SessionSummary {
            background_pid: Some(pid),
            ..SessionSummary::from_report(self.id, report)
        })
    }

    /// Stop the in-process driver with a cancellation checkpoint.
    async fn stop_for_handoff(&self, handle: DriverHandle) -> Result<DriverReport> {
        info!(session = %self.id, "Stopping in-process loop for background handoff");
        self.shared.request_cancel();
        let report = join_driver(handle).await?;

        // Flush what the driver logged after the console closed.
        let log_path = SessionConfig::session_log_path(&self.project_dir);
        run_detached(
            Arc::clone(&self.shared),
            &log_path,
            self.config.output_poll(),
            self.config.interrupt_window(),
        )
        .await?;
        Ok(report)
    }
}

/// Join the driver thread without blocking the runtime.
async fn join_driver(handle: DriverHandle) -> Result<DriverReport> {
    tokio::task::spawn_blocking(move || handle.join())
        .await
        .map_err(|e| TetherError::Other(anyhow::anyhow!("driver join failed: {e}")))?
}
