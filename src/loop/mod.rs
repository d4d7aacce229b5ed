//! Loop supervision module.
//!
//! This module contains the core work-loop components:
//!
//! - [`state`] - Loop lifecycle states and the transition legality table
//! - [`shared`] - Lock-protected state shared by the control and driver threads
//! - [`queue`] - Operator instruction queue and merge-block formatting
//! - [`driver`] - Background thread that runs iterations between safe points
//! - [`operations`] - Real implementations of the collaborator traits
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  commands  ┌─────────────────┐  safe point  ┌─────────────┐
//! │ControlSurface│───────────>│ SharedLoopState │<────────────>│ LoopDriver  │
//! │ (control     │            │ + queue         │              │ (driver     │
//! │  thread)     │<───────────│ + output log    │─────────────>│  thread)    │
//! └──────────────┘   drain    └─────────────────┘   merge      └─────────────┘
//!                                                                    │
//!                                                                    v
//!                                                         ┌─────────────────────┐
//!                                                         │ IterationExecutor   │
//!                                                         │ CheckpointStore     │
//!                                                         └─────────────────────┘
//! ```

pub mod driver;
pub mod operations;
pub mod queue;
pub mod shared;
pub mod state;

// Re-exports for convenience
pub use driver::{DriverConfig, DriverHandle, DriverReport, LoopDriver};
pub use queue::{Instruction, InstructionQueue, InstructionType, Priority};
pub use shared::{OutputEntry, OutputKind, SharedLoopState, StatusSnapshot};
pub use state::LoopState;
