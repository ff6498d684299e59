//! backup-lifecycle - Main entry point
//!
//! Backup, verify and restore for the ComfyUI/OpenWebUI stack.

use anyhow::Context as _;
use backup_lifecycle::commands::{self, BackupArgs, Context, ListArgs, Outcome, PruneArgs, RestoreArgs, VerifyArgs};
use backup_lifecycle::{config::Config, shutdown::ShutdownCoordinator, utils};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new archive from the backup manifest
    Backup(BackupArgs),
    /// Restore an archive into the install root
    Restore(RestoreArgs),
    /// Check an archive's checksum and structure without extracting
    VerifyBackup(VerifyArgs),
    /// List archives in the output directory
    List(ListArgs),
    /// Delete all but the newest archives
    Prune(PruneArgs),
    /// Print the effective configuration
    ShowConfig,
}

fn startup(cli: &Cli) -> anyhow::Result<Config> {
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level).context("failed to initialize logging")?;
    Ok(config)
}

fn run(ctx: &Context, command: &Command) -> Result<Outcome, commands::Failure> {
    if !matches!(command, Command::ShowConfig) {
        ctx.validate()?;
    }
    match command {
        Command::Backup(args) => commands::backup(ctx, args),
        Command::Restore(args) => commands::restore(ctx, args),
        Command::VerifyBackup(args) => commands::verify_backup(ctx, args),
        Command::List(args) => commands::list(ctx, args),
        Command::Prune(args) => commands::prune(ctx, args),
        Command::ShowConfig => commands::show_config(ctx),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match startup(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            let code = e
                .downcast_ref::<backup_lifecycle::LifecycleError>()
                .map(|e| e.exit_code())
                .unwrap_or(1);
            return ExitCode::from(code);
        }
    };

    tracing::debug!("backup-lifecycle v{}", env!("CARGO_PKG_VERSION"));

    // Signals cancel the token; the pipeline stops at the next stage boundary
    // and unwinds its guards before the blocking task returns.
    let coordinator = Arc::new(ShutdownCoordinator::new());
    let ctx = Context::new(config, coordinator.token());
    let signals = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.watch().await })
    };

    let command = cli.command;
    let result = tokio::task::spawn_blocking(move || run(&ctx, &command)).await;
    signals.abort();

    match result {
        Ok(Ok(outcome)) => {
            print!("{}", outcome.report);
            ExitCode::from(outcome.code)
        }
        Ok(Err(failure)) => {
            eprintln!("error: {}", failure);
            if let Some(snapshot) = &failure.snapshot {
                eprintln!("safety snapshot: {}", snapshot.display());
            }
            if let Some(hint) = &failure.hint {
                eprintln!("hint: {}", hint);
            }
            ExitCode::from(failure.exit_code())
        }
        Err(e) => {
            eprintln!("error: command task failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
