//! Mock implementations of the collaborator traits.
//!
//! These mocks provide controllable test doubles for external dependencies,
//! enabling deterministic unit and integration tests of the driver, the
//! rollback guard and the control surface.

use super::traits::{GitOperations, IterationExecutor, IterationOutcome};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Mock implementation of git operations.
///
/// # Example
///
/// ```rust,ignore
/// let git = MockGitOperations::new()
///     .with_branch("feature/timeouts")
///     .with_commits_since(3);
///
/// assert_eq!(git.commits_since("main").unwrap(), 3);
/// ```
#[derive(Debug)]
pub struct MockGitOperations {
    branch: String,
    default_branch: Option<String>,
    head: String,
    commits_since: u32,
    reset_error: Option<String>,
    resets: Mutex<Vec<u32>>,
}

impl Default for MockGitOperations {
    fn default() -> Self {
        Self {
            branch: "main".to_string(),
            default_branch: Some("main".to_string()),
            head: "0000000000000000000000000000000000000000".to_string(),
            commits_since: 0,
            reset_error: None,
            resets: Mutex::new(Vec::new()),
        }
    }
}

impl MockGitOperations {
    /// Create a new mock with default values (on `main`, no commits).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current branch name.
    #[must_use]
    pub fn with_branch(mut self, branch: &str) -> Self {
        self.branch = branch.to_string();
        self
    }

    /// Set the default branch name (`None` = undetermined).
    #[must_use]
    pub fn with_default_branch(mut self, branch: Option<&str>) -> Self {
        self.default_branch = branch.map(str::to_string);
        self
    }

    /// Set the HEAD hash.
    #[must_use]
    pub fn with_head(mut self, hash: &str) -> Self {
        self.head = hash.to_string();
        self
    }

    /// Set the number of commits since the branch point.
    #[must_use]
    pub fn with_commits_since(mut self, count: u32) -> Self {
        self.commits_since = count;
        self
    }

    /// Configure reset to fail with an error.
    #[must_use]
    pub fn with_reset_error(mut self, error: &str) -> Self {
        self.reset_error = Some(error.to_string());
        self
    }

    /// Counts passed to `reset_commits`, in call order.
    pub fn resets(&self) -> Vec<u32> {
        self.resets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl GitOperations for MockGitOperations {
    fn current_branch(&self) -> Result<String> {
        Ok(self.branch.clone())
    }

    fn default_branch(&self) -> Option<String> {
        self.default_branch.clone()
    }

    fn head_hash(&self) -> Result<String> {
        Ok(self.head.clone())
    }

    fn commits_since(&self, _base: &str) -> Result<u32> {
        Ok(self.commits_since)
    }

    fn reset_commits(&self, count: u32) -> Result<()> {
        self.resets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(count);
        if let Some(ref error) = self.reset_error {
            bail!("{}", error);
        }
        Ok(())
    }
}

/// Mock iteration executor.
///
/// Returns scripted outcomes in order, then `continue` forever. Every
/// context it receives is recorded.
///
/// # Example
///
/// ```rust,ignore
/// let executor = MockExecutor::new()
///     .with_outcome(IterationOutcome::proceed("one"))
///     .with_outcome(IterationOutcome::completed("done"));
/// ```
#[derive(Debug, Default)]
pub struct MockExecutor {
    script: Mutex<VecDeque<Result<IterationOutcome, String>>>,
    contexts: Mutex<Vec<String>>,
    delay: Option<Duration>,
    call_count: AtomicU32,
}

impl MockExecutor {
    /// Create a new mock that always continues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome to return.
    #[must_use]
    pub fn with_outcome(self, outcome: IterationOutcome) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(outcome));
        self
    }

    /// Queue an executor failure.
    #[must_use]
    pub fn with_failure(self, error: &str) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(error.to_string()));
        self
    }

    /// Sleep this long inside every call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times `execute_iteration` was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every context received, in call order.
    pub fn contexts(&self) -> Vec<String> {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl IterationExecutor for MockExecutor {
    fn execute_iteration(&self, context: &str) -> Result<IterationOutcome> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(context.to_string());

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(error)) => bail!("{}", error),
            None => Ok(IterationOutcome::proceed(format!("iteration {call} ok"))),
        }
    }
}

/// In-memory checkpoint store.
#[derive(Debug, Default)]
pub struct MockCheckpointStore {
    saved: Mutex<Vec<Checkpoint>>,
    save_error: Option<String>,
}

impl MockCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure every save to fail.
    #[must_use]
    pub fn with_save_error(mut self, error: &str) -> Self {
        self.save_error = Some(error.to_string());
        self
    }

    /// Every checkpoint saved, oldest first.
    pub fn saved(&self) -> Vec<Checkpoint> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CheckpointStore for MockCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(ref error) = self.save_error {
            bail!("{}", error);
        }
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(checkpoint.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Checkpoint>> {
        Ok(self.saved().last().cloned())
    }

    fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut all = self.saved();
        all.reverse();
        Ok(all)
    }
}
