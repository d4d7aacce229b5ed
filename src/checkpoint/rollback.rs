//! Guarded rollback of recent commits.
//!
//! [`RollbackGuard`] discards the last `n` commits on the current branch, but
//! only when that is safe:
//!
//! - the branch is not the repository's default branch or a protected one,
//! - at least `n` commits exist since the branch left the default branch,
//! - the loop is paused, so no iteration is writing to the tree.
//!
//! Branch and history checks run first, so a refused rollback leaves the loop
//! exactly as it was. When the loop is running the guard requests a pause and
//! waits for the driver's safe point. A `rollback` checkpoint is saved before
//! the reset. The loop stays paused afterwards until the operator resumes it.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether::checkpoint::RollbackGuard;
//!
//! let guard = RollbackGuard::new(git, shared, checkpoints)
//!     .with_protected_branches(vec!["main".into(), "release".into()]);
//!
//! let outcome = guard.rollback(2)?;
//! println!("{}", outcome.summary());
//! ```

use super::{Checkpoint, CheckpointId, CheckpointReason, CheckpointStore};
use crate::error::RollbackError;
use crate::r#loop::shared::SharedLoopState;
use crate::r#loop::state::LoopState;
use crate::testing::GitOperations;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default time to wait for the driver to reach a safe point.
pub const DEFAULT_PAUSE_TIMEOUT: Duration = Duration::from_secs(900);

type RollbackResult<T> = std::result::Result<T, RollbackError>;

// ============================================================================
// Rollback Outcome
// ============================================================================

/// Result of a successful rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// Branch the commits were discarded from.
    pub branch: String,

    /// HEAD before the reset.
    pub previous_hash: String,

    /// HEAD after the reset.
    pub restored_hash: String,

    /// Number of commits discarded.
    pub commits_discarded: u32,

    /// Whether the guard paused a running loop itself.
    pub paused_by_guard: bool,

    /// Checkpoint saved before the reset.
    pub checkpoint_id: CheckpointId,

    /// Non-fatal problems encountered.
    pub warnings: Vec<String>,
}

impl RollbackOutcome {
    /// Format a summary for display.
    #[must_use]
    pub fn summary(&self) -> String {
        let warnings = if self.warnings.is_empty() {
            String::new()
        } else {
            format!(" ({} warnings)", self.warnings.len())
        };

        format!(
            "Discarded {} commit(s) on {}: {} -> {} (checkpoint {}){}",
            self.commits_discarded,
            self.branch,
            short_hash(&self.previous_hash),
            short_hash(&self.restored_hash),
            self.checkpoint_id.short(),
            warnings
        )
    }
}

fn short_hash(hash: &str) -> &str {
    &hash[..8.min(hash.len())]
}

// ============================================================================
// Rollback Guard
// ============================================================================

/// Enforces the preconditions around discarding commits.
pub struct RollbackGuard {
    git: Arc<dyn GitOperations>,
    shared: Arc<SharedLoopState>,
    checkpoints: Arc<dyn CheckpointStore>,
    protected_branches: Vec<String>,
    pause_timeout: Duration,
}

impl std::fmt::Debug for RollbackGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackGuard")
            .field("git", &"<dyn GitOperations>")
            .field("checkpoints", &"<dyn CheckpointStore>")
            .field("protected_branches", &self.protected_branches)
            .field("pause_timeout", &self.pause_timeout)
            .finish()
    }
}

impl RollbackGuard {
    /// Create a guard protecting `main` and `master`.
    #[must_use]
    pub fn new(
        git: Arc<dyn GitOperations>,
        shared: Arc<SharedLoopState>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            git,
            shared,
            checkpoints,
            protected_branches: vec!["main".to_string(), "master".to_string()],
            pause_timeout: DEFAULT_PAUSE_TIMEOUT,
        }
    }

    /// Replace the protected branch list.
    #[must_use]
    pub fn with_protected_branches(mut self, branches: Vec<String>) -> Self {
        self.protected_branches = branches;
        self
    }

    /// Set how long to wait for a running loop to pause.
    #[must_use]
    pub fn with_pause_timeout(mut self, timeout: Duration) -> Self {
        self.pause_timeout = timeout;
        self
    }

    /// Discard the last `count` commits on the current branch.
    ///
    /// # Errors
    ///
    /// - `InvalidCount` for `count == 0`
    /// - `LoopFinished` if the loop is terminal or being cancelled
    /// - `UnsafeBranch` on the default or a protected branch (the reset is never attempted)
    /// - `InsufficientHistory` if fewer than `count` commits exist since branch creation
    /// - `PauseTimeout` if a running loop does not pause in time
    /// - `Checkpoint` / `Git` if a collaborator fails
    pub fn rollback(&self, count: u32) -> RollbackResult<RollbackOutcome> {
        if count == 0 {
            return Err(RollbackError::InvalidCount);
        }
        self.ensure_not_finished()?;

        let branch = self.check_branch()?;
        let base = self.base_branch()?;
        let available = self
            .git
            .commits_since(&base)
            .map_err(|e| RollbackError::git("rev-list", format!("{e:#}")))?;
        if available < count {
            return Err(RollbackError::InsufficientHistory {
                requested: count,
                available,
            });
        }

        let paused_by_guard = self.ensure_paused()?;

        let previous_hash = self
            .git
            .head_hash()
            .map_err(|e| RollbackError::git("rev-parse", format!("{e:#}")))?;

        let checkpoint = Checkpoint::capture(&self.shared, CheckpointReason::Rollback)
            .with_metadata("branch", branch.clone())
            .with_metadata("head", previous_hash.clone())
            .with_metadata("commits", count.to_string());
        self.checkpoints
            .save(&checkpoint)
            .map_err(|e| RollbackError::Checkpoint {
                message: format!("{e:#}"),
            })?;
        debug!(id = %checkpoint.id.short(), "Pre-rollback checkpoint saved");

        info!(%branch, count, "Discarding commits");
        self.git
            .reset_commits(count)
            .map_err(|e| RollbackError::git("reset", format!("{e:#}")))?;

        let mut warnings = Vec::new();
        let restored_hash = match self.git.head_hash() {
            Ok(hash) => hash,
            Err(e) => {
                let warning = format!("Could not read HEAD after reset: {e}");
                warn!("{}", warning);
                warnings.push(warning);
                String::new()
            }
        };

        let outcome = RollbackOutcome {
            branch,
            previous_hash,
            restored_hash,
            commits_discarded: count,
            paused_by_guard,
            checkpoint_id: checkpoint.id,
            warnings,
        };
        info!("Rollback complete: {}", outcome.summary());
        Ok(outcome)
    }

    /// Current branch, if rollback is allowed on it.
    ///
    /// # Errors
    ///
    /// Returns `UnsafeBranch` for a detached HEAD, the default branch or a
    /// protected branch.
    pub fn check_branch(&self) -> RollbackResult<String> {
        let branch = self
            .git
            .current_branch()
            .map_err(|e| RollbackError::git("branch", format!("{e:#}")))?;

        let is_default = self.git.default_branch().as_deref() == Some(branch.as_str());
        let is_protected = self.protected_branches.iter().any(|b| *b == branch);
        if branch.is_empty() || is_default || is_protected {
            warn!(%branch, "Rollback refused on protected branch");
            return Err(RollbackError::UnsafeBranch { branch });
        }
        Ok(branch)
    }

    /// Branch the history count is measured against.
    fn base_branch(&self) -> RollbackResult<String> {
        self.git
            .default_branch()
            .or_else(|| self.protected_branches.first().cloned())
            .ok_or_else(|| {
                RollbackError::git("default branch", "could not determine the default branch")
            })
    }

    fn ensure_not_finished(&self) -> RollbackResult<()> {
        let state = self.shared.state();
        if state.is_terminal() || self.shared.is_cancel_requested() {
            return Err(RollbackError::LoopFinished { state });
        }
        Ok(())
    }

    /// Make sure no iteration is in flight. Returns whether the guard paused
    /// the loop itself.
    fn ensure_paused(&self) -> RollbackResult<bool> {
        match self.shared.state() {
            LoopState::Paused | LoopState::Idle => return Ok(false),
            state if state.is_terminal() => return Err(RollbackError::LoopFinished { state }),
            _ => {}
        }

        if let Err(e) = self.shared.request_pause() {
            debug!("Pause request rejected: {}", e);
            // The loop may have paused between our read and the request.
            return match self.shared.state() {
                LoopState::Paused => Ok(false),
                state => Err(RollbackError::LoopFinished { state }),
            };
        }

        info!(timeout_secs = self.pause_timeout.as_secs(), "Waiting for loop to pause");
        let observed = self.shared.wait_for(Some(self.pause_timeout), |state| {
            state == LoopState::Paused || state.is_terminal()
        });

        match observed {
            LoopState::Paused => Ok(true),
            state if state.is_terminal() => Err(RollbackError::LoopFinished { state }),
            _ => {
                // Withdraw our request so the loop carries on as before.
                if let Err(e) = self.shared.resume() {
                    debug!("Could not withdraw pause request: {}", e);
                }
                Err(RollbackError::PauseTimeout {
                    waited_secs: self.pause_timeout.as_secs(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCheckpointStore, MockGitOperations};
    use std::thread;

    fn guard(
        git: MockGitOperations,
        shared: &Arc<SharedLoopState>,
    ) -> (RollbackGuard, Arc<MockGitOperations>, Arc<MockCheckpointStore>) {
        let git = Arc::new(git);
        let store = Arc::new(MockCheckpointStore::new());
        let guard = RollbackGuard::new(
            Arc::clone(&git) as Arc<dyn GitOperations>,
            Arc::clone(shared),
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
        );
        (guard, git, store)
    }

    fn paused_shared() -> Arc<SharedLoopState> {
        let shared = Arc::new(SharedLoopState::new("ctx"));
        shared.transition(LoopState::Running).unwrap();
        shared.transition(LoopState::Paused).unwrap();
        shared
    }

    #[test]
    fn test_rollback_on_default_branch_never_resets() {
        let shared = paused_shared();
        let (guard, git, store) = guard(MockGitOperations::new().with_commits_since(10), &shared);

        let err = guard.rollback(1).unwrap_err();
        assert_eq!(
            err,
            RollbackError::UnsafeBranch {
                branch: "main".into()
            }
        );
        assert!(git.resets().is_empty());
        assert!(store.saved().is_empty());
        assert_eq!(shared.state(), LoopState::Paused);
    }

    #[test]
    fn test_rollback_refuses_protected_branch() {
        let shared = paused_shared();
        let (guard, git, _store) = guard(
            MockGitOperations::new()
                .with_branch("release")
                .with_default_branch(None)
                .with_commits_since(3),
            &shared,
        );
        let guard = guard.with_protected_branches(vec!["release".into()]);

        assert!(matches!(
            guard.rollback(1),
            Err(RollbackError::UnsafeBranch { .. })
        ));
        assert!(git.resets().is_empty());
    }

    #[test]
    fn test_rollback_refuses_detached_head() {
        let shared = paused_shared();
        let (guard, git, _store) = guard(MockGitOperations::new().with_branch(""), &shared);
        assert!(matches!(
            guard.rollback(1),
            Err(RollbackError::UnsafeBranch { .. })
        ));
        assert!(git.resets().is_empty());
    }

    #[test]
    fn test_rollback_insufficient_history() {
        let shared = Arc::new(SharedLoopState::new("ctx"));
        shared.transition(LoopState::Running).unwrap();
        let (guard, git, _store) = guard(
            MockGitOperations::new()
                .with_branch("feature/x")
                .with_commits_since(2),
            &shared,
        );

        assert_eq!(
            guard.rollback(3).unwrap_err(),
            RollbackError::InsufficientHistory {
                requested: 3,
                available: 2
            }
        );
        assert!(git.resets().is_empty());
        // Refused before any pause was requested.
        assert_eq!(shared.state(), LoopState::Running);
        assert!(!shared.status().pause_requested);
    }

    #[test]
    fn test_rollback_zero_is_invalid() {
        let shared = paused_shared();
        let (guard, _git, _store) = guard(MockGitOperations::new(), &shared);
        assert_eq!(guard.rollback(0).unwrap_err(), RollbackError::InvalidCount);
    }

    #[test]
    fn test_rollback_when_paused() {
        let shared = paused_shared();
        let (guard, git, store) = guard(
            MockGitOperations::new()
                .with_branch("feature/x")
                .with_head("abcdef0123456789")
                .with_commits_since(4),
            &shared,
        );

        let outcome = guard.rollback(2).unwrap();
        assert_eq!(outcome.commits_discarded, 2);
        assert!(!outcome.paused_by_guard);
        assert_eq!(git.resets(), vec![2]);

        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].reason, CheckpointReason::Rollback);
        assert_eq!(saved[0].metadata.get("commits").map(String::as_str), Some("2"));
        assert_eq!(outcome.checkpoint_id, saved[0].id);
        assert_eq!(shared.state(), LoopState::Paused);
    }

    #[test]
    fn test_rollback_pauses_running_loop() {
        let shared = Arc::new(SharedLoopState::new("ctx"));
        shared.transition(LoopState::Running).unwrap();
        let (guard, git, _store) = guard(
            MockGitOperations::new()
                .with_branch("feature/x")
                .with_commits_since(1),
            &shared,
        );

        // Stand-in driver: reach one safe point.
        let driver_shared = Arc::clone(&shared);
        let driver = thread::spawn(move || {
            while !driver_shared.status().pause_requested {
                thread::sleep(Duration::from_millis(1));
            }
            driver_shared.await_safe_point()
        });

        let outcome = guard.rollback(1).unwrap();
        assert!(outcome.paused_by_guard);
        assert_eq!(git.resets(), vec![1]);
        assert_eq!(shared.state(), LoopState::Paused);

        shared.request_cancel();
        driver.join().unwrap();
    }

    #[test]
    fn test_rollback_pause_timeout_withdraws_request() {
        let shared = Arc::new(SharedLoopState::new("ctx"));
        shared.transition(LoopState::Running).unwrap();
        let (guard, git, _store) = guard(
            MockGitOperations::new()
                .with_branch("feature/x")
                .with_commits_since(1),
            &shared,
        );
        let guard = guard.with_pause_timeout(Duration::from_millis(20));

        assert!(matches!(
            guard.rollback(1),
            Err(RollbackError::PauseTimeout { .. })
        ));
        assert!(git.resets().is_empty());
        assert_eq!(shared.state(), LoopState::Running);
        assert!(!shared.status().pause_requested);
    }

    #[test]
    fn test_rollback_after_completion_refused() {
        let shared = Arc::new(SharedLoopState::new("ctx"));
        shared.transition(LoopState::Running).unwrap();
        shared.transition(LoopState::Completed).unwrap();
        let (guard, _git, _store) = guard(MockGitOperations::new().with_branch("feature/x"), &shared);

        assert_eq!(
            guard.rollback(1).unwrap_err(),
            RollbackError::LoopFinished {
                state: LoopState::Completed
            }
        );
    }

    #[test]
    fn test_reset_failure_surfaces_git_error() {
        let shared = paused_shared();
        let (guard, _git, store) = guard(
            MockGitOperations::new()
                .with_branch("feature/x")
                .with_commits_since(5)
                .with_reset_error("index.lock exists"),
            &shared,
        );

        match guard.rollback(1) {
            Err(RollbackError::Git { operation, message }) => {
                assert_eq!(operation, "reset");
                assert!(message.contains("index.lock"));
            }
            other => panic!("expected git error, got {other:?}"),
        }
        // The checkpoint was taken before the reset was attempted.
        assert_eq!(store.saved().len(), 1);
    }

    #[test]
    fn test_outcome_summary() {
        let outcome = RollbackOutcome {
            branch: "feature/x".into(),
            previous_hash: "1234567890abcdef".into(),
            restored_hash: "fedcba0987654321".into(),
            commits_discarded: 2,
            paused_by_guard: true,
            checkpoint_id: CheckpointId::from_string("cafebabe-0000"),
            warnings: vec![],
        };
        let summary = outcome.summary();
        assert!(summary.contains("Discarded 2 commit(s) on feature/x"));
        assert!(summary.contains("12345678 -> fedcba09"));
        assert!(summary.contains("cafebabe"));
    }
}
