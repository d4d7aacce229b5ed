//! Tether - supervised autonomous work loops
//!
//! Runs an agent iteration loop on a background thread while the operator
//! steers it from the terminal: pause, inject instructions, roll back, cancel.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use tether::checkpoint::{Checkpoint, CheckpointManager, CheckpointManagerConfig, CheckpointStore};
use tether::config::SessionConfig;
use tether::error::{IntoTetherError, Result, TetherError};
use tether::r#loop::LoopState;
use tether::session::Session;

#[derive(Parser)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Supervise an autonomous agent work loop with pause, inject, rollback and checkpointed cancel", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervised work loop
    Run {
        /// Prompt file holding the base working context (default: PROMPT.md)
        #[arg(long, value_name = "FILE")]
        prompt: Option<PathBuf>,

        /// Maximum iterations (0 for unlimited)
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Checkpoint every N iterations (0 disables periodic checkpoints)
        #[arg(short, long)]
        checkpoint_interval: Option<u32>,

        /// Resume from the latest checkpoint
        #[arg(long)]
        resume: bool,

        /// Run without the interactive console; output goes to .tether/session.log
        #[arg(long)]
        headless: bool,
    },

    /// Inspect stored checkpoints
    #[command(alias = "checkpoint")]
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List checkpoints, newest first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a checkpoint (the latest if no ID is given)
    Show {
        /// Checkpoint ID or unique prefix
        id: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "tether=debug,info"
    } else {
        "tether=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Resolve project path
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());

    if !project_path.is_dir() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(2);
    }

    let code = match execute(cli.command, &project_path).await {
        Ok(code) => code,
        Err(e) => {
            let label = if e.is_fatal() { "Fatal:" } else { "Error:" };
            eprintln!("{} {}", label.red().bold(), e);
            e.exit_code()
        }
    };

    // Exit explicitly: the console's stdin reader may still be parked on the
    // blocking pool.
    std::process::exit(code);
}

async fn execute(command: Commands, project_path: &Path) -> Result<i32> {
    match command {
        Commands::Run {
            prompt,
            max_iterations,
            checkpoint_interval,
            resume,
            headless,
        } => {
            let mut config = SessionConfig::load(project_path)?;
            if let Some(prompt) = prompt {
                config = config.with_prompt_file(prompt);
            }
            if let Some(max) = max_iterations {
                config = config.with_max_iterations(max);
            }
            if let Some(interval) = checkpoint_interval {
                config = config.with_checkpoint_interval(interval);
            }

            let session = Session::open(project_path, config, resume)?;
            if let Some(id) = session.resumed_from() {
                println!(
                    "{} Resuming from checkpoint {} at iteration {}",
                    "Info:".blue(),
                    id.short(),
                    session.shared().iteration()
                );
            }

            let summary = session.run(headless).await?;
            let line = summary.describe();
            match (summary.forced, summary.final_state) {
                _ if summary.background_pid.is_some() => {
                    println!("{} {}", "Detached:".cyan().bold(), line)
                }
                (true, _) => println!("{} {}", "Warning:".yellow().bold(), line),
                (false, LoopState::Completed) => println!("{} {}", "OK".green().bold(), line),
                (false, LoopState::Cancelled) if summary.error.is_none() => {
                    println!("{} {}", "Cancelled:".yellow(), line)
                }
                _ => println!("{} {}", "Error:".red().bold(), line),
            }
            Ok(summary.exit_code())
        }

        Commands::Checkpoints { action } => {
            let config = SessionConfig::load(project_path)?;
            let manager = CheckpointManager::with_config(
                SessionConfig::checkpoints_dir(project_path),
                CheckpointManagerConfig::new()
                    .with_max_checkpoints(config.max_checkpoints)
                    .with_auto_prune(false),
            )?;

            match action {
                CheckpointAction::List { json } => {
                    let checkpoints = manager.list().into_tether_checkpoint()?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&checkpoints)?);
                    } else {
                        print_checkpoint_list(&checkpoints);
                    }
                }

                CheckpointAction::Show { id, json } => {
                    let checkpoint = match id {
                        Some(ref id) => manager.get(id).into_tether_checkpoint()?,
                        None => manager.load().into_tether_checkpoint()?,
                    }
                    .ok_or_else(|| {
                        TetherError::usage(match id {
                            Some(id) => format!("Checkpoint not found: {id}"),
                            None => "No checkpoints found".to_string(),
                        })
                    })?;

                    if json {
                        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
                    } else {
                        print_checkpoint(&checkpoint);
                    }
                }
            }
            Ok(0)
        }
    }
}

fn print_checkpoint_list(checkpoints: &[Checkpoint]) {
    println!(
        "\n{} Checkpoints ({} total)",
        "Checkpoints:".cyan().bold(),
        checkpoints.len()
    );
    println!("{}", "─".repeat(60));

    if checkpoints.is_empty() {
        println!("   No checkpoints found");
        return;
    }
    for cp in checkpoints {
        println!(
            "   {} [{}] {}",
            cp.id.short(),
            cp.created_at.format("%Y-%m-%d %H:%M"),
            cp.summary()
        );
    }
}

fn print_checkpoint(checkpoint: &Checkpoint) {
    println!("\n{} Checkpoint Details", "Checkpoint:".cyan().bold());
    println!("{}", "─".repeat(60));
    println!("   ID: {}", checkpoint.id);
    println!(
        "   Created: {}",
        checkpoint.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("   Reason: {}", checkpoint.reason);
    println!("   Iteration: {}", checkpoint.iteration);
    println!("   State: {}", checkpoint.state);
    let integrity = if checkpoint.verify_context() {
        "ok".green()
    } else {
        "MISMATCH".red().bold()
    };
    println!("   Context hash: {} ({})", checkpoint.context_hash, integrity);

    if !checkpoint.metadata.is_empty() {
        println!();
        for (key, value) in &checkpoint.metadata {
            println!("   {key}: {value}");
        }
    }

    if !checkpoint.pending.is_empty() {
        println!();
        println!("   Pending instructions ({}):", checkpoint.pending.len());
        for instruction in &checkpoint.pending {
            println!(
                "     - [{} {}] {}",
                instruction.priority, instruction.kind, instruction.content
            );
        }
    }

    println!();
    println!("   Context ({} bytes):", checkpoint.context.len());
    for line in checkpoint.context.lines() {
        println!("     {line}");
    }
}
