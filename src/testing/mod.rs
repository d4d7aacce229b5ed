//! Testing infrastructure for Tether.
//!
//! This module provides the collaborator traits the core depends on and mock
//! implementations for exercising the driver, rollback guard and control
//! surface without real processes or repositories.
//!
//! # Architecture
//!
//! - **Traits**: Abstractions for external collaborators (iteration executor, git)
//! - **Mocks**: Test doubles with controllable behavior, including an
//!   in-memory [`CheckpointStore`](crate::checkpoint::CheckpointStore)
//!
//! # Example
//!
//! ```rust,ignore
//! use tether::testing::{MockExecutor, MockGitOperations, IterationOutcome};
//!
//! let git = MockGitOperations::new()
//!     .with_branch("feature/retry")
//!     .with_commits_since(3);
//!
//! let executor = MockExecutor::new()
//!     .with_outcome(IterationOutcome::completed("all tasks done"));
//! ```

pub mod mocks;
pub mod traits;

// Re-export commonly used types
pub use mocks::*;
pub use traits::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_constructors() {
        assert_eq!(IterationOutcome::proceed("x").status, IterationStatus::Continue);
        assert_eq!(IterationOutcome::completed("x").status, IterationStatus::Completed);
        let errored = IterationOutcome::errored("tests failed", "3 failures");
        assert_eq!(errored.status, IterationStatus::Errored);
        assert_eq!(errored.detail, "3 failures");
    }

    #[test]
    fn test_mock_git_defaults_to_main() {
        let git = MockGitOperations::default();
        assert_eq!(git.current_branch().unwrap(), "main");
        assert_eq!(git.default_branch().as_deref(), Some("main"));
        assert_eq!(git.commits_since("main").unwrap(), 0);
    }
}
