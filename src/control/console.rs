//! Interactive console and detached supervisor.
//!
//! Both run on the control thread inside the tokio runtime while the driver
//! runs on its own OS thread. The console multiplexes three sources with
//! `tokio::select!`:
//!
//! - a poll interval that drains and renders the output log,
//! - Ctrl+C, fed through an [`InterruptTracker`],
//! - stdin lines, parsed into [`Command`]s.
//!
//! Commands are dispatched on the blocking pool because `/cancel` and
//! `/rollback` may wait on the driver.

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::interrupt::{InterruptAction, InterruptTracker, MenuChoice, MENU_PROMPT};
use super::{Command, CommandOutcome, ControlSurface};
use crate::error::{Result, TetherError};
use crate::r#loop::shared::{OutputEntry, OutputKind, SharedLoopState};
use crate::r#loop::state::LoopState;

/// Why the console or supervisor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The loop reached a terminal state.
    Finished(LoopState),
    /// Stdin closed; keep supervising without a console.
    Detached,
    /// `/background`: hand the session to a background process.
    Background,
    /// Double interrupt: exit now, skipping the checkpoint.
    ForcedExit,
}

enum Dispatched {
    Done(Result<CommandOutcome>),
    ForcedExit,
}

/// Run the interactive console until the loop finishes or the operator leaves.
///
/// # Errors
///
/// Returns an IO error if stdin cannot be read.
pub async fn run_console(
    surface: Arc<ControlSurface>,
    poll: Duration,
    interrupt_window: Duration,
) -> Result<ConsoleExit> {
    let shared = Arc::clone(surface.shared());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(poll);
    let mut interrupts = InterruptTracker::new(interrupt_window);
    let mut menu_open = false;

    println!(
        "{} Session started ({}). Type /help for commands.",
        "Tether:".cyan().bold(),
        shared.status().summary()
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                render_entries(&shared.drain_output());
                let state = shared.state();
                if state.is_terminal() {
                    render_entries(&shared.drain_output());
                    return Ok(ConsoleExit::Finished(state));
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                match interrupts.on_interrupt(Instant::now()) {
                    InterruptAction::ForceExit => return Ok(ConsoleExit::ForcedExit),
                    InterruptAction::OpenMenu => {
                        menu_open = true;
                        println!("\n{} {}", "Interrupt:".yellow().bold(), MENU_PROMPT);
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Console input closed; detaching");
                    return Ok(ConsoleExit::Detached);
                };
                let line = line.trim();

                let command = if menu_open {
                    menu_open = false;
                    match line.parse::<MenuChoice>() {
                        Ok(choice) => {
                            interrupts.reset();
                            match choice.command() {
                                Some(command) => command,
                                None => {
                                    println!("{} Continuing", "Info:".blue());
                                    continue;
                                }
                            }
                        }
                        Err(e) => {
                            render_error(&e);
                            continue;
                        }
                    }
                } else if line.is_empty() {
                    continue;
                } else {
                    match Command::parse(line) {
                        Ok(command) => command,
                        Err(e) => {
                            render_error(&e);
                            continue;
                        }
                    }
                };

                match dispatch(&surface, command, &mut interrupts).await {
                    Dispatched::ForcedExit => return Ok(ConsoleExit::ForcedExit),
                    Dispatched::Done(Ok(CommandOutcome::Detach)) => {
                        println!("{} {}", "Info:".blue(), CommandOutcome::Detach);
                        return Ok(ConsoleExit::Background);
                    }
                    Dispatched::Done(Ok(outcome)) => render_outcome(&outcome),
                    Dispatched::Done(Err(e)) => render_error(&e),
                }
            }
        }
    }
}

/// Dispatch on the blocking pool, still honoring a forced interrupt while
/// the command waits on the driver.
async fn dispatch(
    surface: &Arc<ControlSurface>,
    command: Command,
    interrupts: &mut InterruptTracker,
) -> Dispatched {
    let surface = Arc::clone(surface);
    let name = command.name();
    let mut task = tokio::task::spawn_blocking(move || surface.dispatch(command));

    loop {
        tokio::select! {
            joined = &mut task => {
                return Dispatched::Done(joined.unwrap_or_else(|e| {
                    Err(TetherError::Other(anyhow::anyhow!("/{name} failed: {e}")))
                }));
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    continue;
                }
                match interrupts.on_interrupt(Instant::now()) {
                    InterruptAction::ForceExit => return Dispatched::ForcedExit,
                    InterruptAction::OpenMenu => println!(
                        "\n{} waiting for /{name} to finish; Ctrl+C again to force exit",
                        "Interrupt:".yellow().bold()
                    ),
                }
            }
        }
    }
}

/// Supervise a session with no console attached.
///
/// Drains the output log into `log_path` every `poll`. The first Ctrl+C
/// requests a checkpointed cancel; a second one inside the window forces exit.
///
/// # Errors
///
/// Returns an IO error if the log file cannot be written.
pub async fn run_detached(
    shared: Arc<SharedLoopState>,
    log_path: &Path,
    poll: Duration,
    interrupt_window: Duration,
) -> Result<ConsoleExit> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    info!(path = %log_path.display(), "Running detached");

    let mut ticker = tokio::time::interval(poll);
    let mut interrupts = InterruptTracker::new(interrupt_window);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                write_entries(&mut log, &shared.drain_output())?;
                let state = shared.state();
                if state.is_terminal() {
                    write_entries(&mut log, &shared.drain_output())?;
                    return Ok(ConsoleExit::Finished(state));
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                match interrupts.on_interrupt(Instant::now()) {
                    InterruptAction::ForceExit => {
                        write_entries(&mut log, &shared.drain_output())?;
                        return Ok(ConsoleExit::ForcedExit);
                    }
                    InterruptAction::OpenMenu => {
                        if shared.state().is_terminal() {
                            continue;
                        }
                        shared.request_cancel();
                        debug!("Interrupt in detached mode; cancel requested");
                        eprintln!(
                            "{} cancelling after the current iteration (Ctrl+C again to force exit)",
                            "Interrupt:".yellow().bold()
                        );
                    }
                }
            }
        }
    }
}

fn write_entries(log: &mut impl std::io::Write, entries: &[OutputEntry]) -> Result<()> {
    for entry in entries {
        writeln!(
            log,
            "{} [{}] {}",
            entry.timestamp.to_rfc3339(),
            entry.kind,
            entry.text
        )?;
    }
    log.flush()?;
    Ok(())
}

fn render_entries(entries: &[OutputEntry]) {
    for entry in entries {
        let stamp = entry.timestamp.format("%H:%M:%S").to_string().dimmed();
        let text = match entry.kind {
            OutputKind::Info => entry.text.normal(),
            OutputKind::Success => entry.text.green(),
            OutputKind::Warning => entry.text.yellow(),
            OutputKind::Error => entry.text.red().bold(),
        };
        println!("{stamp} {text}");
    }
    let _ = std::io::stdout().flush();
}

fn render_outcome(outcome: &CommandOutcome) {
    match outcome {
        CommandOutcome::Help => println!("{outcome}"),
        CommandOutcome::Status(_) => println!("{} {}", "Status:".cyan().bold(), outcome),
        CommandOutcome::CancelRequested { checkpoint: false } => {
            println!("{} {}", "Warning:".yellow().bold(), outcome)
        }
        _ => println!("{} {}", "OK".green().bold(), outcome),
    }
}

fn render_error(error: &TetherError) {
    if error.is_recoverable() {
        eprintln!("{} {} (the loop is unaffected)", "Refused:".yellow().bold(), error);
    } else {
        eprintln!("{} {}", "Error:".red().bold(), error);
    }
    if matches!(error, TetherError::Usage { .. }) {
        eprintln!("{}", "Type /help for the command list.".dimmed());
    }
}
