//! Trait definitions for the loop's external collaborators.
//!
//! These traits abstract the per-iteration executor and version control so
//! the driver and rollback guard can be tested without spawning processes or
//! touching a real repository.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Result status reported by an iteration executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    /// Keep iterating.
    Continue,
    /// The work is done; the loop completes.
    Completed,
    /// The executor gave up; the loop ends in `Errored`.
    Errored,
}

/// Result of one iteration of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationOutcome {
    pub status: IterationStatus,
    /// One-line summary appended to the output log.
    pub summary: String,
    /// Free-form detail (stderr, failing command, ...).
    pub detail: String,
}

impl IterationOutcome {
    /// Create a `continue` outcome.
    #[must_use]
    pub fn proceed(summary: impl Into<String>) -> Self {
        Self {
            status: IterationStatus::Continue,
            summary: summary.into(),
            detail: String::new(),
        }
    }

    /// Create a `completed` outcome.
    #[must_use]
    pub fn completed(summary: impl Into<String>) -> Self {
        Self {
            status: IterationStatus::Completed,
            summary: summary.into(),
            detail: String::new(),
        }
    }

    /// Create an `errored` outcome.
    #[must_use]
    pub fn errored(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status: IterationStatus::Errored,
            summary: summary.into(),
            detail: detail.into(),
        }
    }
}

/// Abstraction for running one iteration of agent work.
///
/// Called synchronously from the driver thread. Implementations own their
/// retries, provider fallback and timeouts; they must not start the next
/// iteration themselves.
///
/// # Example
///
/// ```rust,ignore
/// use tether::testing::{IterationExecutor, IterationOutcome};
///
/// struct Echo;
///
/// impl IterationExecutor for Echo {
///     fn execute_iteration(&self, context: &str) -> anyhow::Result<IterationOutcome> {
///         Ok(IterationOutcome::proceed(format!("{} bytes of context", context.len())))
///     }
/// }
/// ```
pub trait IterationExecutor: Send + Sync {
    /// Run one iteration with the merged working context.
    ///
    /// # Errors
    ///
    /// Returns an error if the executor could not run at all. The driver
    /// records this as an errored iteration and does not retry.
    fn execute_iteration(&self, context: &str) -> Result<IterationOutcome>;
}

/// Abstraction for the git operations rollback needs.
pub trait GitOperations: Send + Sync {
    /// Get the current branch name. Empty for a detached HEAD.
    ///
    /// # Errors
    ///
    /// Returns an error if not in a git repository.
    fn current_branch(&self) -> Result<String>;

    /// Get the repository's default branch, if one can be determined.
    fn default_branch(&self) -> Option<String>;

    /// Get the current HEAD commit hash.
    ///
    /// # Errors
    ///
    /// Returns an error if git is not available or not in a repository.
    fn head_hash(&self) -> Result<String>;

    /// Count commits on HEAD that are not on `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if `base` cannot be resolved.
    fn commits_since(&self, base: &str) -> Result<u32>;

    /// Discard the last `count` commits on the current branch.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails.
    fn reset_commits(&self, count: u32) -> Result<()>;
}
