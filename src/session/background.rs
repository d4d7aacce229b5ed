//! Background handoff.
//!
//! `/background` stops the in-process loop at its next safe point with a
//! cancellation checkpoint, then launches `tether run --resume --headless` as
//! a new process with no terminal attached. The child picks up from that
//! checkpoint and writes its output to `.tether/session.log`, and the
//! foreground process exits, giving the shell back.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::info;

use crate::config::SessionConfig;
use crate::error::Result;

/// Command-line arguments that continue a session headless in `project_dir`.
///
/// Iteration limits are cumulative across a resume, so the current limits
/// are passed through unchanged.
#[must_use]
pub fn resume_args(project_dir: &Path, config: &SessionConfig) -> Vec<OsString> {
    vec![
        "--project".into(),
        project_dir.as_os_str().to_os_string(),
        "run".into(),
        "--resume".into(),
        "--headless".into(),
        "--max-iterations".into(),
        config.max_iterations.to_string().into(),
        "--checkpoint-interval".into(),
        config.checkpoint_interval.to_string().into(),
    ]
}

/// Build the detached command for `exe`.
#[must_use]
pub fn background_command(exe: &Path, project_dir: &Path, config: &SessionConfig) -> Command {
    let mut command = Command::new(exe);
    command
        .args(resume_args(project_dir, config))
        .current_dir(project_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New process group, so Ctrl+C in the terminal no longer reaches it.
        command.process_group(0);
    }

    command
}

/// Launch the background process and return its PID.
///
/// # Errors
///
/// Returns an IO error if the current executable cannot be located or the
/// process cannot be spawned.
pub fn spawn_background(project_dir: &Path, config: &SessionConfig) -> Result<u32> {
    let exe = std::env::current_exe()?;
    let child = background_command(&exe, project_dir, config).spawn()?;
    let pid = child.id();
    info!(pid, "Session continues in background process");
    Ok(pid)
}
