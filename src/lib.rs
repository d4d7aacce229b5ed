//! Tether - supervised autonomous work loops
//!
//! Runs an agent's iteration loop on a background thread and lets an operator
//! steer it from a second thread without corrupting in-flight work.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`r#loop`] - Loop state machine, shared state, instruction queue and driver
//! - [`checkpoint`] - Durable snapshots, file-backed store and guarded rollback
//! - [`control`] - Operator commands, interrupt handling and the console
//! - [`session`] - Wiring of configuration, collaborators and threads
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Collaborator traits and mocks
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether::r#loop::{InstructionType, LoopDriver, Priority, SharedLoopState};
//! use tether::testing::{MockCheckpointStore, MockExecutor};
//!
//! let shared = Arc::new(SharedLoopState::new("Implement the plan."));
//! shared.queue().enqueue("add timeout", InstructionType::UserInput, Priority::Normal);
//!
//! let handle = LoopDriver::new(
//!     Arc::clone(&shared),
//!     Arc::new(MockExecutor::new()),
//!     Arc::new(MockCheckpointStore::new()),
//! )
//! .spawn()?;
//!
//! shared.request_cancel();
//! let report = handle.join()?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod control;
pub mod error;
pub mod r#loop;
pub mod session;
pub mod testing;

// Re-export commonly used types
pub use error::{IntoTetherError, Result, RollbackError, TetherError};

pub use config::{ExecutorConfig, SessionConfig};

pub use r#loop::{
    DriverConfig, DriverHandle, DriverReport, Instruction, InstructionQueue, InstructionType,
    LoopDriver, LoopState, OutputEntry, OutputKind, Priority, SharedLoopState, StatusSnapshot,
};

pub use checkpoint::{
    Checkpoint, CheckpointId, CheckpointManager, CheckpointManagerConfig, CheckpointReason,
    CheckpointStore, RollbackGuard, RollbackOutcome,
};

pub use control::{Command, CommandOutcome, ControlSurface};

pub use session::{Session, SessionDependencies, SessionSummary};

pub use testing::{
    GitOperations, IterationExecutor, IterationOutcome, IterationStatus, MockCheckpointStore,
    MockExecutor, MockGitOperations,
};
