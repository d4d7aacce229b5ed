//! Shared loop state.
//!
//! [`SharedLoopState`] is the only mutable state shared between the control
//! thread and the driver thread (besides the [`InstructionQueue`] it owns).
//! Every field sits behind one mutex; a single condition variable is signalled
//! on every change so the driver can park while paused and the control side
//! can wait for the driver to reach a state.
//!
//! The cancellation flag lives outside the mutex so it can be raised the
//! instant cancellation is requested, before the state machine moves.
//!
//! # Example
//!
//! ```
//! use tether::r#loop::shared::SharedLoopState;
//! use tether::r#loop::state::LoopState;
//!
//! let shared = SharedLoopState::new("Implement the plan.");
//! shared.transition(LoopState::Running).unwrap();
//! assert!(shared.transition(LoopState::Idle).is_err());
//! assert_eq!(shared.status().state, LoopState::Running);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::queue::InstructionQueue;
use super::state::LoopState;
use crate::error::{Result, TetherError};

// ============================================================================
// Output log
// ============================================================================

/// Category of an output log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Info,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputKind::Info => write!(f, "info"),
            OutputKind::Success => write!(f, "success"),
            OutputKind::Warning => write!(f, "warning"),
            OutputKind::Error => write!(f, "error"),
        }
    }
}

/// One line of streamed progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEntry {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputEntry {
    /// Create an entry stamped with the current time.
    #[must_use]
    pub fn new(kind: OutputKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Status / safe point results
// ============================================================================

/// Point-in-time view of the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: LoopState,
    pub iteration: u32,
    pub queued_count: usize,
    pub pause_requested: bool,
    pub cancel_requested: bool,
}

impl StatusSnapshot {
    /// One-line summary for display.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut line = format!(
            "state={} iteration={} queued={}",
            self.state, self.iteration, self.queued_count
        );
        if self.pause_requested {
            line.push_str(" (pause pending)");
        }
        if self.cancel_requested && !self.state.is_terminal() {
            line.push_str(" (cancel pending)");
        }
        line
    }
}

/// What the driver should do after its safe-point check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafePoint {
    /// Start the next iteration.
    Proceed,
    /// Cancellation was requested; checkpoint and terminate.
    Cancel,
    /// The loop already reached a terminal state.
    Stopped(LoopState),
}

/// Outcome of a resume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// `Paused -> Running` was applied.
    Resumed,
    /// The loop had not reached its safe point yet; the pause request was withdrawn.
    PauseWithdrawn,
}

// ============================================================================
// Shared Loop State
// ============================================================================

#[derive(Debug)]
struct Inner {
    state: LoopState,
    iteration: u32,
    output: VecDeque<OutputEntry>,
    context: String,
    pause_requested: bool,
    skip_checkpoint: bool,
    cancellation_checkpointed: bool,
}

/// Lock-protected state shared by the control surface and the loop driver.
#[derive(Debug)]
pub struct SharedLoopState {
    inner: Mutex<Inner>,
    changed: Condvar,
    cancel_requested: AtomicBool,
    queue: InstructionQueue,
}

impl SharedLoopState {
    /// Create an `Idle` session with the given working context.
    #[must_use]
    pub fn new(context: impl Into<String>) -> Self {
        Self::with_queue(context, InstructionQueue::default())
    }

    /// Create an `Idle` session with a preconfigured instruction queue.
    #[must_use]
    pub fn with_queue(context: impl Into<String>, queue: InstructionQueue) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: LoopState::Idle,
                iteration: 0,
                output: VecDeque::new(),
                context: context.into(),
                pause_requested: false,
                skip_checkpoint: false,
                cancellation_checkpointed: false,
            }),
            changed: Condvar::new(),
            cancel_requested: AtomicBool::new(false),
            queue,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The instruction queue owned by this session.
    #[must_use]
    pub fn queue(&self) -> &InstructionQueue {
        &self.queue
    }

    // ------------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------------

    /// Validate and apply a transition atomically.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` without side effects when the move is
    /// illegal from the current state.
    pub fn transition(&self, to: LoopState) -> Result<()> {
        let mut inner = self.lock();
        Self::apply_transition(&mut inner, to)?;
        drop(inner);
        self.changed.notify_all();
        Ok(())
    }

    fn apply_transition(inner: &mut Inner, to: LoopState) -> Result<()> {
        let from = inner.state;
        if !from.can_transition_to(to) {
            debug!(%from, %to, "Rejected state transition");
            return Err(TetherError::InvalidTransition { from, to });
        }
        inner.state = to;
        if to != LoopState::Running {
            inner.pause_requested = false;
        }
        info!(%from, %to, iteration = inner.iteration, "Loop state changed");
        Ok(())
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.lock().state
    }

    /// Number of completed iterations.
    #[must_use]
    pub fn iteration(&self) -> u32 {
        self.lock().iteration
    }

    /// Snapshot of state, iteration and queue depth.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let (state, iteration, pause_requested) = {
            let inner = self.lock();
            (inner.state, inner.iteration, inner.pause_requested)
        };
        StatusSnapshot {
            state,
            iteration,
            queued_count: self.queue.len(),
            pause_requested,
            cancel_requested: self.is_cancel_requested(),
        }
    }

    /// Record a completed iteration and return the new count.
    pub fn complete_iteration(&self) -> u32 {
        let mut inner = self.lock();
        inner.iteration = inner.iteration.saturating_add(1);
        let iteration = inner.iteration;
        drop(inner);
        self.changed.notify_all();
        iteration
    }

    /// Restore the iteration counter from a checkpoint. Only legal while `Idle`.
    ///
    /// # Errors
    ///
    /// Returns `Precondition` if the loop has already started.
    pub fn restore_iteration(&self, iteration: u32) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != LoopState::Idle {
            return Err(TetherError::precondition("restore iteration", inner.state));
        }
        inner.iteration = inner.iteration.max(iteration);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Pause / resume / cancel requests
    // ------------------------------------------------------------------------

    /// Ask the driver to pause at its next safe point.
    ///
    /// # Errors
    ///
    /// Returns `Precondition` unless the loop is `Running`.
    pub fn request_pause(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != LoopState::Running || self.is_cancel_requested() {
            return Err(TetherError::precondition("pause", inner.state));
        }
        inner.pause_requested = true;
        drop(inner);
        self.changed.notify_all();
        debug!("Pause requested");
        Ok(())
    }

    /// Resume a paused loop, or withdraw a pause that has not taken effect.
    ///
    /// # Errors
    ///
    /// Returns `Precondition` if there is nothing to resume.
    pub fn resume(&self) -> Result<ResumeOutcome> {
        let mut inner = self.lock();
        let outcome = match inner.state {
            LoopState::Paused if !self.is_cancel_requested() => {
                Self::apply_transition(&mut inner, LoopState::Running)?;
                ResumeOutcome::Resumed
            }
            LoopState::Running if inner.pause_requested => {
                inner.pause_requested = false;
                ResumeOutcome::PauseWithdrawn
            }
            state => return Err(TetherError::precondition("resume", state)),
        };
        drop(inner);
        self.changed.notify_all();
        Ok(outcome)
    }

    /// Raise the cancellation flag. Idempotent.
    ///
    /// Returns `true` if this call raised the flag.
    pub fn request_cancel(&self) -> bool {
        let newly = !self.cancel_requested.swap(true, Ordering::SeqCst);
        // Take the lock so a driver between its flag check and its wait
        // cannot miss the notification.
        drop(self.lock());
        self.changed.notify_all();
        if newly {
            info!("Cancellation requested");
        }
        newly
    }

    /// Raise the cancellation flag and ask the driver to skip its
    /// cancellation checkpoint.
    pub fn request_cancel_without_checkpoint(&self) -> bool {
        self.lock().skip_checkpoint = true;
        self.request_cancel()
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Whether the cancellation checkpoint should be skipped.
    #[must_use]
    pub fn skip_checkpoint_requested(&self) -> bool {
        self.lock().skip_checkpoint
    }

    /// Record that the cancellation checkpoint reached the store.
    pub fn mark_cancellation_checkpointed(&self) {
        self.lock().cancellation_checkpointed = true;
    }

    /// Whether a cancellation checkpoint was actually saved.
    #[must_use]
    pub fn cancellation_checkpointed(&self) -> bool {
        self.lock().cancellation_checkpointed
    }

    // ------------------------------------------------------------------------
    // Driver-side waits
    // ------------------------------------------------------------------------

    /// Safe-point check performed by the driver before every iteration.
    ///
    /// Applies a pending pause, then blocks on the condition variable (the
    /// mutex is released while waiting) until resumed or cancelled.
    pub fn await_safe_point(&self) -> SafePoint {
        let mut inner = self.lock();
        loop {
            if inner.state.is_terminal() {
                return SafePoint::Stopped(inner.state);
            }
            if self.is_cancel_requested() {
                return SafePoint::Cancel;
            }
            match inner.state {
                LoopState::Running if inner.pause_requested => {
                    // Running -> Paused is always legal here.
                    inner.pause_requested = false;
                    inner.state = LoopState::Paused;
                    let iteration = inner.iteration;
                    inner.output.push_back(OutputEntry::new(
                        OutputKind::Info,
                        format!("Paused after iteration {iteration}"),
                    ));
                    info!(iteration, "Loop paused at safe point");
                    self.changed.notify_all();
                }
                LoopState::Running => return SafePoint::Proceed,
                _ => {
                    inner = self
                        .changed
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Block until `predicate` holds for the current state or `timeout`
    /// elapses. Returns the state observed last.
    pub fn wait_for(
        &self,
        timeout: Option<Duration>,
        predicate: impl Fn(LoopState) -> bool,
    ) -> LoopState {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        while !predicate(inner.state) {
            match deadline {
                None => {
                    inner = self
                        .changed
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    inner = self
                        .changed
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        inner.state
    }

    /// Block until the loop reaches a terminal state (or `timeout` elapses).
    pub fn wait_for_terminal(&self, timeout: Option<Duration>) -> LoopState {
        self.wait_for(timeout, LoopState::is_terminal)
    }

    // ------------------------------------------------------------------------
    // Output log
    // ------------------------------------------------------------------------

    /// Append an entry to the output log.
    pub fn append_output(&self, entry: OutputEntry) {
        self.lock().output.push_back(entry);
    }

    /// Convenience wrapper around [`append_output`](Self::append_output).
    pub fn log(&self, kind: OutputKind, text: impl Into<String>) {
        self.append_output(OutputEntry::new(kind, text));
    }

    /// Remove and return every buffered entry in append order.
    pub fn drain_output(&self) -> Vec<OutputEntry> {
        self.lock().output.drain(..).collect()
    }

    // ------------------------------------------------------------------------
    // Working context
    // ------------------------------------------------------------------------

    /// Current working context handed to the executor.
    #[must_use]
    pub fn context(&self) -> String {
        self.lock().context.clone()
    }

    /// Fold a merge block into the working context and return the result.
    pub fn merge_into_context(&self, block: &str) -> String {
        let mut inner = self.lock();
        if !block.is_empty() {
            if !inner.context.is_empty() {
                inner.context.push_str("\n\n");
            }
            inner.context.push_str(block);
        }
        inner.context.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn running() -> SharedLoopState {
        let shared = SharedLoopState::new("ctx");
        shared.transition(LoopState::Running).unwrap();
        shared
    }

    #[test]
    fn test_new_is_idle() {
        let shared = SharedLoopState::new("ctx");
        let status = shared.status();
        assert_eq!(status.state, LoopState::Idle);
        assert_eq!(status.iteration, 0);
        assert_eq!(status.queued_count, 0);
    }

    #[test]
    fn test_illegal_transition_has_no_side_effects() {
        let shared = running();
        shared.transition(LoopState::Completed).unwrap();
        let err = shared.transition(LoopState::Running).unwrap_err();
        assert!(matches!(
            err,
            TetherError::InvalidTransition {
                from: LoopState::Completed,
                to: LoopState::Running
            }
        ));
        assert_eq!(shared.state(), LoopState::Completed);
    }

    #[test]
    fn test_transition_sequences_never_leave_terminal() {
        // Exhaustively walk every request sequence of length 4.
        let states = LoopState::ALL;
        let mut sequences: Vec<Vec<LoopState>> = vec![vec![]];
        for _ in 0..4 {
            sequences = sequences
                .into_iter()
                .flat_map(|seq| {
                    states.iter().map(move |s| {
                        let mut next = seq.clone();
                        next.push(*s);
                        next
                    })
                })
                .collect();
        }

        for seq in sequences {
            let shared = SharedLoopState::new("");
            let mut trace = vec![shared.state()];
            for to in seq {
                let _ = shared.transition(to);
                trace.push(shared.state());
            }
            for pair in trace.windows(2) {
                if pair[0].is_terminal() {
                    assert_eq!(pair[0], pair[1], "left terminal state in {trace:?}");
                }
            }
        }
    }

    #[test]
    fn test_request_pause_requires_running() {
        let shared = SharedLoopState::new("ctx");
        assert!(matches!(
            shared.request_pause(),
            Err(TetherError::Precondition { .. })
        ));
        shared.transition(LoopState::Running).unwrap();
        shared.request_pause().unwrap();
        assert!(shared.status().pause_requested);
        // Still running until the driver reaches a safe point.
        assert_eq!(shared.state(), LoopState::Running);
    }

    #[test]
    fn test_safe_point_applies_pause() {
        let shared = Arc::new(running());
        shared.request_pause().unwrap();

        let driver = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || shared.await_safe_point())
        };

        let state = shared.wait_for(Some(Duration::from_secs(5)), |s| s == LoopState::Paused);
        assert_eq!(state, LoopState::Paused);
        assert_eq!(shared.resume().unwrap(), ResumeOutcome::Resumed);
        assert_eq!(driver.join().unwrap(), SafePoint::Proceed);
    }

    #[test]
    fn test_resume_withdraws_pending_pause() {
        let shared = running();
        shared.request_pause().unwrap();
        assert_eq!(shared.resume().unwrap(), ResumeOutcome::PauseWithdrawn);
        assert_eq!(shared.await_safe_point(), SafePoint::Proceed);
    }

    #[test]
    fn test_resume_requires_paused() {
        let shared = running();
        assert!(matches!(
            shared.resume(),
            Err(TetherError::Precondition { .. })
        ));
    }

    #[test]
    fn test_cancel_wakes_paused_driver() {
        let shared = Arc::new(running());
        shared.request_pause().unwrap();

        let driver = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || shared.await_safe_point())
        };

        shared.wait_for(Some(Duration::from_secs(5)), |s| s == LoopState::Paused);
        assert!(shared.request_cancel());
        assert!(!shared.request_cancel(), "cancel must be idempotent");
        assert_eq!(driver.join().unwrap(), SafePoint::Cancel);
        assert_eq!(shared.state(), LoopState::Paused);
    }

    #[test]
    fn test_cancel_flag_visible_before_state_changes() {
        let shared = running();
        shared.request_cancel();
        assert!(shared.is_cancel_requested());
        assert_eq!(shared.state(), LoopState::Running);
        assert_eq!(shared.await_safe_point(), SafePoint::Cancel);
    }

    #[test]
    fn test_cancel_without_checkpoint_sets_flag() {
        let shared = running();
        assert!(!shared.skip_checkpoint_requested());
        shared.request_cancel_without_checkpoint();
        assert!(shared.skip_checkpoint_requested());
        assert!(shared.is_cancel_requested());
    }

    #[test]
    fn test_safe_point_reports_terminal() {
        let shared = running();
        shared.transition(LoopState::Errored).unwrap();
        assert_eq!(
            shared.await_safe_point(),
            SafePoint::Stopped(LoopState::Errored)
        );
    }

    #[test]
    fn test_output_drain_is_fifo() {
        let shared = running();
        shared.log(OutputKind::Info, "one");
        shared.log(OutputKind::Warning, "two");
        shared.log(OutputKind::Success, "three");

        let drained: Vec<_> = shared.drain_output().into_iter().map(|e| e.text).collect();
        assert_eq!(drained, vec!["one", "two", "three"]);
        assert!(shared.drain_output().is_empty());
    }

    #[test]
    fn test_iteration_only_increases() {
        let shared = running();
        assert_eq!(shared.complete_iteration(), 1);
        assert_eq!(shared.complete_iteration(), 2);
        assert_eq!(shared.iteration(), 2);
    }

    #[test]
    fn test_restore_iteration_only_while_idle() {
        let shared = SharedLoopState::new("");
        shared.restore_iteration(7).unwrap();
        assert_eq!(shared.iteration(), 7);
        shared.transition(LoopState::Running).unwrap();
        assert!(shared.restore_iteration(9).is_err());
    }

    #[test]
    fn test_merge_into_context_appends() {
        let shared = SharedLoopState::new("base");
        let merged = shared.merge_into_context("## Queued Instructions");
        assert_eq!(merged, "base\n\n## Queued Instructions");
        assert_eq!(shared.merge_into_context(""), merged);
    }

    #[test]
    fn test_wait_for_times_out() {
        let shared = running();
        let state = shared.wait_for_terminal(Some(Duration::from_millis(20)));
        assert_eq!(state, LoopState::Running);
    }

    #[test]
    fn test_status_summary() {
        let shared = running();
        shared.request_pause().unwrap();
        let summary = shared.status().summary();
        assert!(summary.contains("state=running"));
        assert!(summary.contains("pause pending"));
    }
}
