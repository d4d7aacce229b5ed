//! Real implementations of the collaborator traits.
//!
//! These shell out to `git` and to the configured agent command. They
//! implement the same traits as the mocks, enabling dependency injection.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tracing::debug;

use crate::config::ExecutorConfig;
use crate::testing::{GitOperations, IterationExecutor, IterationOutcome};

/// Longest summary kept from executor output, in characters.
pub const MAX_SUMMARY_CHARS: usize = 200;

const ORIGIN_HEAD_PREFIX: &str = "refs/remotes/origin/";

/// Real git operations implementation.
///
/// Executes actual git commands against the project directory.
#[derive(Debug, Clone)]
pub struct RealGitOperations {
    project_dir: PathBuf,
}

impl RealGitOperations {
    /// Create a new git operations instance for the given directory.
    #[must_use]
    pub fn new(project_dir: PathBuf) -> Self {
        Self { project_dir }
    }

    fn git(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.project_dir)
            .output()
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    fn rev_list_count(&self, range: &str) -> Result<u32> {
        let output = self.git(&["rev-list", "--count", range])?;
        if !output.status.success() {
            bail!(
                "git rev-list {} failed: {}",
                range,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .with_context(|| format!("Unexpected rev-list output for {range}"))
    }
}

impl GitOperations for RealGitOperations {
    fn current_branch(&self) -> Result<String> {
        let output = self.git(&["branch", "--show-current"])?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            bail!("Not in a git repository")
        }
    }

    fn default_branch(&self) -> Option<String> {
        let output = self
            .git(&["symbolic-ref", "refs/remotes/origin/HEAD"])
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let reference = String::from_utf8_lossy(&output.stdout).trim().to_string();
        reference
            .strip_prefix(ORIGIN_HEAD_PREFIX)
            .map(str::to_string)
            .filter(|name| !name.is_empty())
    }

    fn head_hash(&self) -> Result<String> {
        let output = self.git(&["rev-parse", "HEAD"])?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            bail!("Failed to resolve HEAD")
        }
    }

    fn commits_since(&self, base: &str) -> Result<u32> {
        match self.rev_list_count(&format!("{base}..HEAD")) {
            Ok(count) => Ok(count),
            // The default branch may only exist as a remote-tracking ref.
            Err(local) => self
                .rev_list_count(&format!("origin/{base}..HEAD"))
                .map_err(|_| local),
        }
    }

    fn reset_commits(&self, count: u32) -> Result<()> {
        let target = format!("HEAD~{count}");
        let output = self.git(&["reset", "--hard", &target])?;
        if !output.status.success() {
            bail!(
                "git reset --hard {} failed: {}",
                target,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!(count, "Reset branch");
        Ok(())
    }
}

/// Runs one iteration by launching the configured agent command.
///
/// The working context goes to the child's stdin; stdout decides the outcome.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    project_dir: PathBuf,
    config: ExecutorConfig,
}

impl ProcessExecutor {
    /// Create an executor running in the given directory.
    #[must_use]
    pub fn new(project_dir: PathBuf, config: ExecutorConfig) -> Self {
        Self {
            project_dir,
            config,
        }
    }

    /// Whether the configured command can be found.
    #[must_use]
    pub fn is_available(&self) -> bool {
        which::which(&self.config.command).is_ok()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }
}

impl IterationExecutor for ProcessExecutor {
    fn execute_iteration(&self, context: &str) -> Result<IterationOutcome> {
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.config.command))?;

        // Feed stdin from a separate thread so a chatty child cannot block on
        // a full stdout pipe while we are still writing.
        let stdin = child.stdin.take();
        let input = context.to_string();
        let writer = std::thread::spawn(move || -> std::io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(input.as_bytes())?;
            }
            Ok(())
        });

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {}", self.config.command))?;

        match writer.join() {
            Ok(Ok(())) => {}
            // The child may exit without reading everything.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(e).context("Failed to write context to executor"),
            Err(_) => bail!("Context writer thread panicked"),
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            status = ?output.status.code(),
            stdout_bytes = output.stdout.len(),
            "Executor finished"
        );

        Ok(interpret_output(
            output.status.success(),
            output.status.code(),
            &stdout,
            &stderr,
            &self.config.completion_marker,
        ))
    }
}

/// Map a finished executor process to an iteration outcome.
#[must_use]
pub fn interpret_output(
    success: bool,
    code: Option<i32>,
    stdout: &str,
    stderr: &str,
    completion_marker: &str,
) -> IterationOutcome {
    if !success {
        let status = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        return IterationOutcome::errored(
            format!("executor exited with status {status}"),
            stderr.trim(),
        );
    }

    let completed = !completion_marker.is_empty() && stdout.contains(completion_marker);
    let visible = if completion_marker.is_empty() {
        stdout.to_string()
    } else {
        stdout.replace(completion_marker, "")
    };
    let summary = summarize(&visible);

    if completed {
        IterationOutcome::completed(summary)
    } else {
        IterationOutcome::proceed(summary)
    }
}

fn summarize(stdout: &str) -> String {
    let line = stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .unwrap_or("no output");
    if line.chars().count() > MAX_SUMMARY_CHARS {
        let mut truncated: String = line.chars().take(MAX_SUMMARY_CHARS - 3).collect();
        truncated.push_str("...");
        truncated
    } else {
        line.to_string()
    }
}
