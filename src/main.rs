// ABOUTME: Entry point for the shipwright CLI application.
// ABOUTME: Parses arguments, sets up logging, and maps run outcomes to exit codes.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use commands::DeployRequest;
use shipwright::config::{self, Config};
use shipwright::deploy::RunStatus;
use shipwright::error::Result;
use shipwright::output::{Output, OutputMode};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit code for a run waiting on an external condition.
const EXIT_BLOCKED: u8 = 2;
/// Exit code for an operator abort, as for SIGINT.
const EXIT_ABORTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mode = if cli.json {
        OutputMode::Json
    } else if cli.quiet {
        OutputMode::Quiet
    } else {
        OutputMode::Normal
    };

    match run(cli, mode).await {
        Ok(status) => exit_code(status),
        Err(e) => {
            Output::new(mode).error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::Blocked => ExitCode::from(EXIT_BLOCKED),
        RunStatus::Cancelled => ExitCode::from(EXIT_ABORTED),
        RunStatus::Failed | RunStatus::Running => ExitCode::FAILURE,
    }
}

fn project_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => Ok(std::env::current_dir()?),
    }
}

async fn run(cli: Cli, mode: OutputMode) -> Result<RunStatus> {
    let dir = project_dir(cli.dir)?;
    let output = Output::new(mode);

    match cli.command {
        Commands::Init { project, force } => {
            let path = config::init_config(&dir, project.as_deref(), force)?;
            output.success(&format!("Created {}", path.display()));
            Ok(RunStatus::Succeeded)
        }
        Commands::Deploy {
            overrides,
            resume,
            run_id,
            force_stage,
            force_unlock,
            workers,
        } => {
            let mut config = Config::discover(&dir)?;
            config.apply_overrides(&overrides.into());
            let request = DeployRequest {
                resume,
                run_id,
                force_stages: force_stage,
                force_unlock,
                workers,
            };
            commands::deploy(config, request, output).await
        }
        Commands::Status { run_id } => {
            let config = Config::discover(&dir)?;
            commands::status(&config, run_id.as_deref(), &output)?;
            Ok(RunStatus::Succeeded)
        }
        Commands::Purge { run_id } => {
            let config = Config::discover(&dir)?;
            commands::purge(&config, &run_id, &output)?;
            Ok(RunStatus::Succeeded)
        }
        Commands::Destroy { overrides, yes } => {
            let mut config = Config::discover(&dir)?;
            config.apply_overrides(&overrides.into());
            commands::destroy(config, yes, output).await?;
            Ok(RunStatus::Succeeded)
        }
    }
}
