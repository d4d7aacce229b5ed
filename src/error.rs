//! Custom error types for Tether.
//!
//! This module provides structured error types for the supervision core.
//! Control-surface errors are recoverable and returned synchronously to the
//! caller; driver errors are fatal and end the session in `Errored`.

use std::path::PathBuf;
use thiserror::Error;

use crate::r#loop::state::LoopState;

/// Main error type for Tether operations
#[derive(Error, Debug)]
pub enum TetherError {
    // =========================================================================
    // State Machine Errors
    // =========================================================================
    /// Requested state change is illegal from the current state
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: LoopState, to: LoopState },

    /// Command precondition not met
    #[error("Cannot {command} while loop is {state}")]
    Precondition { command: String, state: LoopState },

    // =========================================================================
    // Driver Errors
    // =========================================================================
    /// The driver's own bookkeeping failed
    #[error("Driver fatal error at iteration {iteration}: {message}")]
    DriverFatal { iteration: u32, message: String },

    /// Checkpoint collaborator failed
    #[error("Checkpoint error: {message}")]
    Checkpoint { message: String },

    // =========================================================================
    // Control Surface Errors
    // =========================================================================
    /// Unrecognized or malformed command
    #[error("Usage error: {message}")]
    Usage { message: String },

    /// Rollback refused or failed
    #[error(transparent)]
    Rollback(#[from] RollbackError),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the rollback guard.
///
/// All variants leave the loop state as it was when the guard detected them,
/// except that a guard-initiated pause is kept.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RollbackError {
    /// Current branch is the repository's default/primary branch
    #[error("Refusing to roll back on protected branch '{branch}'")]
    UnsafeBranch { branch: String },

    /// Fewer commits exist since the branch point than requested
    #[error("Cannot discard {requested} commits: only {available} since branch creation")]
    InsufficientHistory { requested: u32, available: u32 },

    /// Rollback count must be at least one
    #[error("Rollback count must be at least 1")]
    InvalidCount,

    /// The driver did not reach a safe point in time
    #[error("Loop did not pause within {waited_secs}s; rollback aborted")]
    PauseTimeout { waited_secs: u64 },

    /// The loop already finished
    #[error("Loop is {state}; nothing to roll back against")]
    LoopFinished { state: LoopState },

    /// Version control call failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    /// Pre-rollback checkpoint could not be saved
    #[error("Pre-rollback checkpoint failed: {message}")]
    Checkpoint { message: String },
}

impl RollbackError {
    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl TetherError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a usage error
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// Create a precondition error
    pub fn precondition(command: impl Into<String>, state: LoopState) -> Self {
        Self::Precondition {
            command: command.into(),
            state,
        }
    }

    /// Create a driver fatal error
    pub fn driver_fatal(iteration: u32, message: impl Into<String>) -> Self {
        Self::DriverFatal {
            iteration,
            message: message.into(),
        }
    }

    /// Create a checkpoint error
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error is recoverable (reported to the operator, loop unaffected)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::Precondition { .. }
                | Self::Usage { .. }
                | Self::Rollback(_)
        )
    }

    /// Check if this error is fatal (should end the loop in `Errored`)
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DriverFatal { .. } | Self::Checkpoint { .. })
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage { .. } | Self::Config { .. } | Self::InvalidConfig { .. } => 2,
            _ => 1,
        }
    }
}

/// Type alias for Tether results
pub type Result<T> = std::result::Result<T, TetherError>;

/// Extension trait for converting collaborator errors to TetherError
pub trait IntoTetherError<T> {
    fn into_tether_checkpoint(self) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> IntoTetherError<T> for std::result::Result<T, E> {
    fn into_tether_checkpoint(self) -> Result<T> {
        self.map_err(|e| TetherError::checkpoint(format!("{:#}", e.into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let err = TetherError::InvalidTransition {
            from: LoopState::Completed,
            to: LoopState::Running,
        };
        assert_eq!(err.to_string(), "Invalid transition: completed -> running");
    }

    #[test]
    fn test_rollback_error_display() {
        let err = RollbackError::InsufficientHistory {
            requested: 5,
            available: 2,
        };
        assert!(err.to_string().contains('5'));
        assert!(err.to_string().contains('2'));

        let err = RollbackError::UnsafeBranch {
            branch: "main".into(),
        };
        assert!(err.to_string().contains("main"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(TetherError::usage("bad").is_recoverable());
        assert!(TetherError::from(RollbackError::InvalidCount).is_recoverable());
        assert!(TetherError::precondition("pause", LoopState::Paused).is_recoverable());
        assert!(!TetherError::driver_fatal(3, "boom").is_recoverable());
    }

    #[test]
    fn test_is_fatal() {
        assert!(TetherError::driver_fatal(1, "x").is_fatal());
        assert!(TetherError::checkpoint("disk full").is_fatal());
        assert!(!TetherError::usage("x").is_fatal());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TetherError::usage("x").exit_code(), 2);
        assert_eq!(TetherError::invalid_config("a", "b").exit_code(), 2);
        assert_eq!(TetherError::driver_fatal(1, "x").exit_code(), 1);
    }

    #[test]
    fn test_into_tether_checkpoint() {
        let result: std::result::Result<(), anyhow::Error> = Err(anyhow::anyhow!("disk full"));
        let err = result.into_tether_checkpoint().unwrap_err();
        assert!(matches!(err, TetherError::Checkpoint { .. }));
        assert!(err.to_string().contains("disk full"));
    }
}
