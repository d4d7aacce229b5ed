//! Session configuration for Tether.
//!
//! Settings are read from `<project>/.tether/settings.json`. Every field has a
//! default, so a missing file (or a partial one) is fine. CLI flags override
//! individual values afterwards, and [`SessionConfig::validate`] runs last.

use crate::error::{Result, TetherError};
use crate::r#loop::driver::DriverConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory (relative to the project) holding settings, checkpoints and logs.
pub const TETHER_DIR: &str = ".tether";

// ============================================================================
// Executor
// ============================================================================

/// How the process executor launches one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    /// Program to run.
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments passed before the context is written on stdin.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Stdout marker signalling that the work is complete.
    #[serde(default = "default_completion_marker")]
    pub completion_marker: String,
}

fn default_command() -> String {
    "claude".to_string()
}

fn default_args() -> Vec<String> {
    vec![
        "--print".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ]
}

fn default_completion_marker() -> String {
    "<promise>COMPLETE</promise>".to_string()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            completion_marker: default_completion_marker(),
        }
    }
}

impl ExecutorConfig {
    /// Set the program and its arguments.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = command.into();
        self.args = args;
        self
    }

    /// Set the completion marker.
    #[must_use]
    pub fn with_completion_marker(mut self, marker: impl Into<String>) -> Self {
        self.completion_marker = marker.into();
        self
    }
}

// ============================================================================
// Session
// ============================================================================

/// Configuration for one supervised session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Iterations between periodic checkpoints (0 disables periodic checkpoints).
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,

    /// Iteration limit; reaching it completes the loop (0 = unlimited).
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Queue depth above which every enqueue logs a warning.
    #[serde(default = "default_queue_warn_threshold")]
    pub queue_warn_threshold: usize,

    /// How often the console drains the output log, in milliseconds.
    #[serde(default = "default_output_poll_ms")]
    pub output_poll_ms: u64,

    /// Window in which a second interrupt forces exit, in milliseconds.
    #[serde(default = "default_interrupt_window_ms")]
    pub interrupt_window_ms: u64,

    /// How long rollback waits for the driver to pause, in seconds.
    #[serde(default = "default_pause_timeout_secs")]
    pub pause_timeout_secs: u64,

    /// Branches rollback always refuses to touch.
    #[serde(default = "default_protected_branches")]
    pub protected_branches: Vec<String>,

    /// Checkpoint files to retain.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,

    /// Base working context, relative to the project directory.
    #[serde(default = "default_prompt_file")]
    pub prompt_file: PathBuf,

    #[serde(default)]
    pub executor: ExecutorConfig,
}

fn default_checkpoint_interval() -> u32 {
    5
}

fn default_max_iterations() -> u32 {
    50
}

fn default_queue_warn_threshold() -> usize {
    crate::r#loop::queue::DEFAULT_QUEUE_WARN_THRESHOLD
}

fn default_output_poll_ms() -> u64 {
    500
}

fn default_interrupt_window_ms() -> u64 {
    2000
}

fn default_pause_timeout_secs() -> u64 {
    900
}

fn default_protected_branches() -> Vec<String> {
    vec!["main".to_string(), "master".to_string()]
}

fn default_max_checkpoints() -> usize {
    20
}

fn default_prompt_file() -> PathBuf {
    PathBuf::from("PROMPT.md")
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            max_iterations: default_max_iterations(),
            queue_warn_threshold: default_queue_warn_threshold(),
            output_poll_ms: default_output_poll_ms(),
            interrupt_window_ms: default_interrupt_window_ms(),
            pause_timeout_secs: default_pause_timeout_secs(),
            protected_branches: default_protected_branches(),
            max_checkpoints: default_max_checkpoints(),
            prompt_file: default_prompt_file(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a project directory.
    ///
    /// A missing settings file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file exists but cannot be read or parsed.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let settings_path = Self::settings_path(project_dir);
        if !settings_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&settings_path).map_err(|e| {
            TetherError::config_with_path(format!("cannot read settings: {e}"), settings_path.clone())
        })?;
        serde_json::from_str(&content).map_err(|e| {
            TetherError::config_with_path(format!("cannot parse settings: {e}"), settings_path)
        })
    }

    /// Reject values the session cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.output_poll_ms == 0 {
            return Err(TetherError::invalid_config("outputPollMs", "must be greater than 0"));
        }
        if self.interrupt_window_ms == 0 {
            return Err(TetherError::invalid_config(
                "interruptWindowMs",
                "must be greater than 0",
            ));
        }
        if self.max_checkpoints == 0 {
            return Err(TetherError::invalid_config(
                "maxCheckpoints",
                "must keep at least one checkpoint",
            ));
        }
        if self.executor.command.trim().is_empty() {
            return Err(TetherError::invalid_config("executor.command", "must not be empty"));
        }
        Ok(())
    }

    /// Set the periodic checkpoint interval.
    #[must_use]
    pub fn with_checkpoint_interval(mut self, interval: u32) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Set the iteration limit.
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Set the prompt file.
    #[must_use]
    pub fn with_prompt_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.prompt_file = path.into();
        self
    }

    /// Set the rollback pause timeout.
    #[must_use]
    pub fn with_pause_timeout_secs(mut self, secs: u64) -> Self {
        self.pause_timeout_secs = secs;
        self
    }

    /// Set the executor configuration.
    #[must_use]
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Driver settings derived from this configuration.
    #[must_use]
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig::new()
            .with_checkpoint_interval(self.checkpoint_interval)
            .with_max_iterations(self.max_iterations)
    }

    pub fn output_poll(&self) -> Duration {
        Duration::from_millis(self.output_poll_ms)
    }

    pub fn interrupt_window(&self) -> Duration {
        Duration::from_millis(self.interrupt_window_ms)
    }

    pub fn pause_timeout(&self) -> Duration {
        Duration::from_secs(self.pause_timeout_secs)
    }

    /// Resolve the prompt file against the project directory.
    #[must_use]
    pub fn prompt_path(&self, project_dir: &Path) -> PathBuf {
        if self.prompt_file.is_absolute() {
            self.prompt_file.clone()
        } else {
            project_dir.join(&self.prompt_file)
        }
    }

    /// Get the settings.json path for a project
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        project_dir.join(TETHER_DIR).join("settings.json")
    }

    /// Get the checkpoint directory for a project
    pub fn checkpoints_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(TETHER_DIR).join("checkpoints")
    }

    /// Get the detached-mode log path for a project
    pub fn session_log_path(project_dir: &Path) -> PathBuf {
        project_dir.join(TETHER_DIR).join("session.log")
    }
}
