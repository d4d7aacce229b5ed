//! File-backed checkpoint storage.
//!
//! The [`CheckpointManager`] stores each checkpoint as its own JSON file,
//! written atomically (temp file + rename) under an exclusive `fs2` lock, and
//! prunes the oldest files beyond the configured retention.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether::checkpoint::{Checkpoint, CheckpointManager, CheckpointReason, CheckpointStore};
//!
//! let manager = CheckpointManager::new(".tether/checkpoints")?;
//! manager.save(&Checkpoint::capture(&shared, CheckpointReason::Interval))?;
//!
//! if let Some(latest) = manager.load()? {
//!     println!("{}", latest.summary());
//! }
//! ```

use super::{Checkpoint, CheckpointStore};
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Lock file guarding writes and pruning.
const LOCK_FILE: &str = ".checkpoints.lock";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

// ============================================================================
// Checkpoint Manager Configuration
// ============================================================================

/// Configuration for checkpoint manager behavior.
#[derive(Debug, Clone)]
pub struct CheckpointManagerConfig {
    /// Maximum number of checkpoints to retain.
    pub max_checkpoints: usize,

    /// Whether to auto-prune after each save.
    pub auto_prune: bool,
}

impl Default for CheckpointManagerConfig {
    fn default() -> Self {
        Self {
            max_checkpoints: 20,
            auto_prune: true,
        }
    }
}

impl CheckpointManagerConfig {
    /// Create a new configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of checkpoints.
    #[must_use]
    pub fn with_max_checkpoints(mut self, max: usize) -> Self {
        self.max_checkpoints = max;
        self
    }

    /// Enable/disable auto-pruning.
    #[must_use]
    pub fn with_auto_prune(mut self, enabled: bool) -> Self {
        self.auto_prune = enabled;
        self
    }
}

// ============================================================================
// Checkpoint Manager
// ============================================================================

/// Manages checkpoint storage and retrieval on disk.
#[derive(Debug)]
pub struct CheckpointManager {
    /// Directory where checkpoints are stored.
    storage_dir: PathBuf,

    /// Configuration for manager behavior.
    config: CheckpointManagerConfig,
}

impl CheckpointManager {
    /// Create a new checkpoint manager with storage at the given path.
    ///
    /// Creates the storage directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage directory cannot be created.
    pub fn new(storage_dir: impl AsRef<Path>) -> Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();

        if !storage_dir.exists() {
            fs::create_dir_all(&storage_dir).with_context(|| {
                format!(
                    "Failed to create checkpoint directory: {}",
                    storage_dir.display()
                )
            })?;
            debug!("Created checkpoint directory: {}", storage_dir.display());
        }

        Ok(Self {
            storage_dir,
            config: CheckpointManagerConfig::default(),
        })
    }

    /// Create a checkpoint manager with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage directory cannot be created.
    pub fn with_config(
        storage_dir: impl AsRef<Path>,
        config: CheckpointManagerConfig,
    ) -> Result<Self> {
        let mut manager = Self::new(storage_dir)?;
        manager.config = config;
        Ok(manager)
    }

    /// Get the storage directory path.
    #[must_use]
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Get the current configuration.
    #[must_use]
    pub fn config(&self) -> &CheckpointManagerConfig {
        &self.config
    }

    /// Find a checkpoint by full ID or unique ID prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or the prefix is
    /// ambiguous.
    pub fn get(&self, id_or_prefix: &str) -> Result<Option<Checkpoint>> {
        let matches: Vec<Checkpoint> = self
            .read_all()?
            .into_iter()
            .filter(|cp| cp.id.as_str().starts_with(id_or_prefix))
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.into_iter().next()),
            n => anyhow::bail!("Checkpoint prefix '{id_or_prefix}' is ambiguous ({n} matches)"),
        }
    }

    /// Prune checkpoints to keep only the most recent `keep`.
    ///
    /// # Errors
    ///
    /// Returns an error if checkpoints cannot be deleted.
    pub fn prune(&self, keep: usize) -> Result<usize> {
        let _lock = self.lock_exclusive()?;
        self.prune_locked(keep)
    }

    fn prune_locked(&self, keep: usize) -> Result<usize> {
        let all = self.read_all()?;
        if all.len() <= keep {
            return Ok(0);
        }

        let mut removed = 0;
        for checkpoint in all.iter().skip(keep) {
            let path = self.checkpoint_path(checkpoint);
            if path.exists() {
                fs::remove_file(&path).with_context(|| {
                    format!("Failed to delete checkpoint: {}", path.display())
                })?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Pruned {} checkpoints, {} remaining", removed, all.len() - removed);
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------------

    /// File name sorts chronologically; the ID suffix keeps it unique.
    fn checkpoint_path(&self, checkpoint: &Checkpoint) -> PathBuf {
        self.storage_dir.join(format!(
            "checkpoint-{}-{}.json",
            checkpoint.created_at.format("%Y%m%dT%H%M%S%3f"),
            checkpoint.id
        ))
    }

    fn lock_exclusive(&self) -> Result<File> {
        let lock_file = File::create(self.storage_dir.join(LOCK_FILE))
            .context("Failed to open checkpoint lock file")?;
        FileExt::lock_exclusive(&lock_file).context("Failed to acquire checkpoint lock")?;
        Ok(lock_file)
    }

    fn write_atomic(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let path = self.checkpoint_path(checkpoint);
        let tmp_path = path.with_extension(format!("json{TMP_SUFFIX}"));
        let json =
            serde_json::to_string_pretty(checkpoint).context("Failed to serialize checkpoint")?;

        let mut tmp_file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to write checkpoint: {}", path.display()))?;
        Ok(path)
    }

    /// Read every checkpoint on disk, newest first. Corrupted files are
    /// skipped with a warning.
    fn read_all(&self) -> Result<Vec<Checkpoint>> {
        let entries = fs::read_dir(&self.storage_dir).with_context(|| {
            format!(
                "Failed to read checkpoint directory: {}",
                self.storage_dir.display()
            )
        })?;

        let mut checkpoints = Vec::new();
        for entry in entries {
            let entry = entry.context("Failed to read directory entry")?;
            let path = entry.path();

            if path.extension().is_some_and(|ext| ext == "json") {
                match Self::read_file(&path) {
                    Ok(checkpoint) => checkpoints.push(checkpoint),
                    Err(e) => warn!("Skipping unreadable checkpoint {}: {:#}", path.display(), e),
                }
            }
        }

        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(checkpoints)
    }

    fn read_file(path: &Path) -> Result<Checkpoint> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint file: {}", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint file: {}", path.display()))?;
        if !checkpoint.verify_context() {
            warn!(
                "Checkpoint {} context hash mismatch; file may have been edited",
                checkpoint.id
            );
        }
        Ok(checkpoint)
    }
}

impl CheckpointStore for CheckpointManager {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        let path = self.write_atomic(checkpoint)?;
        debug!("Saved checkpoint to: {}", path.display());

        if self.config.auto_prune {
            self.prune_locked(self.config.max_checkpoints)?;
        }

        info!("Created checkpoint: {}", checkpoint.summary());
        Ok(())
    }

    fn load(&self) -> Result<Option<Checkpoint>> {
        Ok(self.read_all()?.into_iter().next())
    }

    fn list(&self) -> Result<Vec<Checkpoint>> {
        self.read_all()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointReason;
    use crate::r#loop::state::LoopState;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn temp_manager() -> (TempDir, CheckpointManager) {
        let dir = TempDir::new().expect("create temp dir");
        let manager =
            CheckpointManager::new(dir.path().join("checkpoints")).expect("create manager");
        (dir, manager)
    }

    fn checkpoint_at(iteration: u32, age_secs: i64) -> Checkpoint {
        let mut cp = Checkpoint::new(
            CheckpointReason::Interval,
            iteration,
            LoopState::Running,
            format!("context {iteration}"),
            vec![],
        );
        cp.created_at = Utc::now() - Duration::seconds(age_secs);
        cp
    }

    #[test]
    fn test_checkpoint_manager_new_creates_directory() {
        let dir = TempDir::new().expect("create temp dir");
        let storage = dir.path().join("checkpoints");

        assert!(!storage.exists());
        let _manager = CheckpointManager::new(&storage).expect("create manager");
        assert!(storage.exists());
    }

    #[test]
    fn test_checkpoint_manager_load_empty() {
        let (_dir, manager) = temp_manager();
        assert!(manager.load().expect("load").is_none());
        assert!(manager.list().expect("list").is_empty());
    }

    #[test]
    fn test_checkpoint_manager_save_and_load_latest() {
        let (_dir, manager) = temp_manager();
        manager.save(&checkpoint_at(1, 30)).expect("save");
        manager.save(&checkpoint_at(2, 20)).expect("save");
        let newest = checkpoint_at(3, 10);
        manager.save(&newest).expect("save");

        let loaded = manager.load().expect("load").expect("some checkpoint");
        assert_eq!(loaded, newest);

        let iterations: Vec<u32> = manager
            .list()
            .expect("list")
            .iter()
            .map(|cp| cp.iteration)
            .collect();
        assert_eq!(iterations, vec![3, 2, 1]);
    }

    #[test]
    fn test_checkpoint_manager_no_tmp_files_left() {
        let (_dir, manager) = temp_manager();
        manager.save(&checkpoint_at(1, 0)).expect("save");

        let leftovers = fs::read_dir(manager.storage_dir())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(TMP_SUFFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_checkpoint_manager_auto_prune() {
        let dir = TempDir::new().expect("create temp dir");
        let manager = CheckpointManager::with_config(
            dir.path(),
            CheckpointManagerConfig::new().with_max_checkpoints(2),
        )
        .expect("create manager");

        for i in 0..5 {
            manager.save(&checkpoint_at(i, 100 - i64::from(i))).expect("save");
        }

        let iterations: Vec<u32> = manager
            .list()
            .expect("list")
            .iter()
            .map(|cp| cp.iteration)
            .collect();
        assert_eq!(iterations, vec![4, 3]);
    }

    #[test]
    fn test_checkpoint_manager_manual_prune() {
        let dir = TempDir::new().expect("create temp dir");
        let manager = CheckpointManager::with_config(
            dir.path(),
            CheckpointManagerConfig::new().with_auto_prune(false),
        )
        .expect("create manager");

        for i in 0..4 {
            manager.save(&checkpoint_at(i, 50 - i64::from(i))).expect("save");
        }
        assert_eq!(manager.prune(1).expect("prune"), 3);
        assert_eq!(manager.list().expect("list").len(), 1);
        assert_eq!(manager.prune(5).expect("prune"), 0);
    }

    #[test]
    fn test_checkpoint_manager_skips_corrupted_files() {
        let (_dir, manager) = temp_manager();
        manager.save(&checkpoint_at(1, 0)).expect("save");
        fs::write(manager.storage_dir().join("checkpoint-broken.json"), "{not json")
            .expect("write corrupt file");

        let list = manager.list().expect("list");
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_checkpoint_manager_get_by_prefix() {
        let (_dir, manager) = temp_manager();
        let cp = checkpoint_at(7, 0);
        manager.save(&cp).expect("save");

        let found = manager.get(cp.id.short()).expect("get").expect("found");
        assert_eq!(found.iteration, 7);
        assert!(manager.get("zzzz-not-there").expect("get").is_none());
    }
}
