//! Session checkpoints.
//!
//! A [`Checkpoint`] is a durable snapshot sufficient to resume a session:
//! the working context, the loop state, instructions that were queued but not
//! yet merged, and why/when it was taken.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  capture  ┌──────────────────┐  save/load  ┌───────────────────┐
//! │ SharedLoopState │──────────>│ Checkpoint       │────────────>│ CheckpointStore   │
//! │ + queue         │           │ context, state,  │             │ (CheckpointManager│
//! └─────────────────┘           │ pending, reason  │             │  or a mock)       │
//!                               └──────────────────┘             └───────────────────┘
//! ```
//!
//! Checkpoints are taken at configured iteration intervals, on every
//! cancellation (unless explicitly skipped) and before every rollback.

pub mod manager;
pub mod rollback;

pub use manager::{CheckpointManager, CheckpointManagerConfig};
pub use rollback::{RollbackGuard, RollbackOutcome};

use crate::r#loop::queue::Instruction;
use crate::r#loop::shared::SharedLoopState;
use crate::r#loop::state::LoopState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Checkpoint ID
// ============================================================================

/// Unique identifier for a checkpoint.
///
/// Wraps a UUID v4 string for type safety and serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId(String);

impl CheckpointId {
    /// Create a new random checkpoint ID.
    ///
    /// # Example
    ///
    /// ```
    /// use tether::checkpoint::CheckpointId;
    ///
    /// let id = CheckpointId::new();
    /// assert!(!id.as_str().is_empty());
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a checkpoint ID from an existing string.
    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for display and file names.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Checkpoint Reason
// ============================================================================

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    /// Periodic checkpoint every N iterations.
    Interval,
    /// Taken as part of checkpoint-then-terminate on cancel.
    Cancellation,
    /// Taken before rolling back commits.
    Rollback,
}

impl fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointReason::Interval => write!(f, "interval"),
            CheckpointReason::Cancellation => write!(f, "cancellation"),
            CheckpointReason::Rollback => write!(f, "rollback"),
        }
    }
}

// ============================================================================
// Checkpoint
// ============================================================================

/// A snapshot of a work-loop session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique identifier.
    pub id: CheckpointId,

    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,

    /// Why the snapshot was taken.
    pub reason: CheckpointReason,

    /// Last completed iteration at the time of the snapshot.
    pub iteration: u32,

    /// Loop state at the time of the snapshot.
    pub state: LoopState,

    /// Working context (base prompt plus merged instruction blocks).
    pub context: String,

    /// SHA-256 of `context`, hex encoded.
    pub context_hash: String,

    /// Instructions queued but not yet merged, in merge order.
    #[serde(default)]
    pub pending: Vec<Instruction>,

    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Checkpoint {
    /// Create a checkpoint from its parts.
    #[must_use]
    pub fn new(
        reason: CheckpointReason,
        iteration: u32,
        state: LoopState,
        context: impl Into<String>,
        pending: Vec<Instruction>,
    ) -> Self {
        let context = context.into();
        Self {
            id: CheckpointId::new(),
            created_at: Utc::now(),
            reason,
            iteration,
            state,
            context_hash: hash_context(&context),
            context,
            pending,
            metadata: BTreeMap::new(),
        }
    }

    /// Snapshot the shared loop state.
    ///
    /// Reads the loop state and queue under their own locks, one after the
    /// other, never both at once.
    #[must_use]
    pub fn capture(shared: &SharedLoopState, reason: CheckpointReason) -> Self {
        let status = shared.status();
        let context = shared.context();
        let pending = shared.queue().pending();
        Self::new(reason, status.iteration, status.state, context, pending)
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the stored context still matches its hash.
    #[must_use]
    pub fn verify_context(&self) -> bool {
        hash_context(&self.context) == self.context_hash
    }

    /// One-line summary for listings.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} [{}] iteration {} ({}), {} pending, context {}",
            self.id.short(),
            self.reason,
            self.iteration,
            self.state,
            self.pending.len(),
            &self.context_hash[..12.min(self.context_hash.len())]
        )
    }
}

fn hash_context(context: &str) -> String {
    hex::encode(Sha256::digest(context.as_bytes()))
}

// ============================================================================
// Checkpoint Store
// ============================================================================

/// Persistence collaborator for checkpoints.
///
/// The core only decides when to call it; storage encoding is up to the
/// implementation.
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint could not be made durable.
    fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<()>;

    /// Load the most recent checkpoint, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read.
    fn load(&self) -> anyhow::Result<Option<Checkpoint>>;

    /// All stored checkpoints, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read.
    fn list(&self) -> anyhow::Result<Vec<Checkpoint>>;
}
