//! Command handlers behind the CLI.
//!
//! Each handler merges command-line flags over the loaded [`Config`], runs one
//! operation and returns an [`Outcome`] holding the report for stdout. Logging
//! goes to stderr through `tracing`.

use crate::archive::{Catalog, CompressionFormat};
use crate::config::Config;
use crate::confirm::{AssumeYes, Confirm, TerminalPrompt};
use crate::executor::{self, BackupExecutor, BackupJob};
use crate::restore::{RestoreFailure, RestoreOptions, RestoreOrchestrator, RestoreSettings};
use crate::services::CommandServiceManager;
use crate::tools::{EncryptionKey, GpgCli, SystemTools};
use crate::utils::errors::LifecycleError;
use crate::utils::format::{format_bytes, format_elapsed};
use crate::verify::{Verification, Verifier};
use std::fmt::Write as _;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, clap::Args)]
pub struct BackupArgs {
    /// Directory to write the archive to
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Archive name prefix
    #[arg(short, long, value_name = "PREFIX")]
    pub name: Option<String>,

    /// Compression format
    #[arg(short, long, value_enum)]
    pub compress: Option<CompressionFormat>,

    /// Encrypt the archive with gpg
    #[arg(long)]
    pub encrypt: bool,

    /// Encrypt for this recipient (implies --encrypt)
    #[arg(long, value_name = "ID")]
    pub recipient: Option<String>,

    /// Encrypt symmetrically with the passphrase in FILE (implies --encrypt)
    #[arg(long, value_name = "FILE")]
    pub passphrase_file: Option<PathBuf>,

    /// Stop the configured services while the archive is written
    #[arg(long)]
    pub stop_services: bool,

    /// Keep only the newest N archives afterwards
    #[arg(long, value_name = "N")]
    pub keep: Option<usize>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct RestoreArgs {
    /// Archive to restore
    pub archive: PathBuf,

    /// Skip checksum and structure verification
    #[arg(long)]
    pub skip_verify: bool,

    /// Do not stop services before installing
    #[arg(long)]
    pub no_stop: bool,

    /// Leave services stopped after a successful restore
    #[arg(long)]
    pub no_start: bool,

    /// Answer yes to confirmation prompts
    #[arg(short, long)]
    pub yes: bool,

    /// Install into DIR instead of the configured install root
    #[arg(long, value_name = "DIR")]
    pub target: Option<PathBuf>,

    /// Decrypt with the passphrase in FILE
    #[arg(long, value_name = "FILE")]
    pub passphrase_file: Option<PathBuf>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct VerifyArgs {
    /// Archive to verify
    pub archive: PathBuf,
}

#[derive(Debug, Clone, clap::Args)]
pub struct ListArgs {
    /// Directory to list
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct PruneArgs {
    /// Number of archives to keep
    #[arg(long, value_name = "N")]
    pub keep: usize,

    /// Directory to prune
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,
}

/// Report for stdout and the process exit code.
#[derive(Debug)]
pub struct Outcome {
    pub report: String,
    pub code: u8,
}

impl Outcome {
    fn success(report: String) -> Self {
        Self { report, code: 0 }
    }
}

/// A failed command: the stage it failed in, plus rollback guidance.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {source}")]
pub struct Failure {
    pub stage: String,
    pub source: LifecycleError,
    pub snapshot: Option<PathBuf>,
    pub hint: Option<String>,
}

impl Failure {
    pub fn at(stage: &str) -> impl FnOnce(LifecycleError) -> Failure + '_ {
        move |source| Failure {
            stage: stage.to_string(),
            hint: source.hint().map(str::to_string),
            source,
            snapshot: None,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.source.exit_code()
    }
}

impl From<RestoreFailure> for Failure {
    fn from(failure: RestoreFailure) -> Self {
        Failure {
            stage: failure.state.to_string(),
            hint: Some(failure.hint()),
            snapshot: failure.snapshot,
            source: failure.source,
        }
    }
}

/// Shared state for one invocation.
pub struct Context {
    pub config: Config,
    pub cancel: CancellationToken,
}

impl Context {
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    fn tools(&self) -> SystemTools {
        let mut gpg = GpgCli::new(&self.config.encryption.gpg_binary);
        if let Some(homedir) = &self.config.encryption.gpg_homedir {
            gpg = gpg.with_homedir(homedir);
        }
        SystemTools::new(gpg)
    }

    fn services(&self) -> CommandServiceManager {
        CommandServiceManager::new(
            self.config.services.stop_command.clone(),
            self.config.services.start_command.clone(),
        )
    }

    /// Fail on configuration errors; log warnings.
    pub fn validate(&self) -> Result<(), Failure> {
        let warnings = self
            .config
            .validate()
            .into_result()
            .map_err(Failure::at("configuration"))?;
        for issue in warnings {
            warn!("Configuration: {}", issue);
        }
        Ok(())
    }

    fn encryption_key(&self, args: &BackupArgs) -> Result<Option<EncryptionKey>, LifecycleError> {
        if let Some(recipient) = &args.recipient {
            return Ok(Some(EncryptionKey::Recipient(recipient.clone())));
        }
        if let Some(file) = &args.passphrase_file {
            return Ok(Some(EncryptionKey::PassphraseFile(file.clone())));
        }
        if !args.encrypt {
            return Ok(None);
        }
        let encryption = &self.config.encryption;
        match (&encryption.recipient, &encryption.passphrase_file) {
            (Some(recipient), _) => Ok(Some(EncryptionKey::Recipient(recipient.clone()))),
            (None, Some(file)) => Ok(Some(EncryptionKey::PassphraseFile(file.clone()))),
            (None, None) => Err(LifecycleError::Config(
                "--encrypt needs --recipient, --passphrase-file or an [encryption] section"
                    .to_string(),
            )),
        }
    }
}

pub fn backup(ctx: &Context, args: &BackupArgs) -> Result<Outcome, Failure> {
    let config = &ctx.config;
    let job = BackupJob {
        install_root: config.backup.install_root.clone(),
        manifest: config.manifest(),
        output_dir: args.output.clone().unwrap_or_else(|| config.backup.output_dir.clone()),
        prefix: args.name.clone().unwrap_or_else(|| config.backup.prefix.clone()),
        compression: args.compress.unwrap_or(config.backup.compression),
        encryption: ctx.encryption_key(args).map_err(Failure::at("backup"))?,
        stop_services: args.stop_services,
        services: config.services.names.clone(),
        keep: args.keep.or(config.backup.keep),
    };

    let tools = ctx.tools();
    let services = ctx.services();
    let result = BackupExecutor::with_cancel(&tools, &services, ctx.cancel.clone())
        .execute(&job)
        .map_err(Failure::at("backup"))?;

    let mut report = String::new();
    let _ = writeln!(report, "Archive:  {}", result.archive.path.display());
    let _ = writeln!(report, "Size:     {}", format_bytes(result.archive.size));
    let _ = writeln!(report, "SHA-256:  {}", result.archive.checksum.digest);
    let _ = writeln!(
        report,
        "Contents: {} files, {}",
        result.record.total_files,
        format_bytes(result.record.total_bytes)
    );
    for skipped in &result.skipped {
        let _ = writeln!(report, "Skipped:  {} ({})", skipped.path.display(), skipped.reason);
    }
    for pruned in &result.pruned {
        let _ = writeln!(report, "Pruned:   {}", pruned.display());
    }
    let _ = writeln!(report, "Elapsed:  {}", format_elapsed(result.duration_ms));
    Ok(Outcome::success(report))
}

pub fn restore(ctx: &Context, args: &RestoreArgs) -> Result<Outcome, Failure> {
    let config = &ctx.config;
    let key = match (&args.passphrase_file, &config.encryption.passphrase_file) {
        (Some(file), _) | (None, Some(file)) => EncryptionKey::PassphraseFile(file.clone()),
        (None, None) => EncryptionKey::Keyring,
    };
    let settings = RestoreSettings {
        install_root: args
            .target
            .clone()
            .unwrap_or_else(|| config.backup.install_root.clone()),
        services: config.services.names.clone(),
        snapshot_dir: config.snapshot_dir(),
        work_root: config.restore.work_dir.clone(),
        key,
    };
    let install_root = settings.install_root.clone();
    let options = RestoreOptions {
        verify: !args.skip_verify,
        stop_services: !args.no_stop,
        start_services: !args.no_start,
    };

    let tools = ctx.tools();
    let services = ctx.services();
    let confirm: &dyn Confirm = if args.yes { &AssumeYes } else { &TerminalPrompt };
    let report = RestoreOrchestrator::new(&tools, &services, confirm, settings, ctx.cancel.clone())
        .run(&args.archive, &options)?;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Restored {} into {}",
        report.archive.display(),
        install_root.display()
    );
    let _ = writeln!(
        out,
        "Installed:    {} files, {} directories, {}",
        report.installed.files,
        report.installed.dirs,
        format_bytes(report.installed.bytes)
    );
    let verification = match &report.verification {
        Some(verdict) => verdict.to_string(),
        None => "skipped".to_string(),
    };
    let _ = writeln!(out, "Verification: {}", verification);
    if let Some(record) = &report.record {
        let _ = writeln!(out, "Created:      {} on {}", record.created_at, record.hostname);
    }
    match &report.snapshot {
        Some(snapshot) => {
            let _ = writeln!(out, "Snapshot:     {}", snapshot.display());
        }
        None => {
            let _ = writeln!(out, "Snapshot:     none (nothing was replaced)");
        }
    }
    if !options.stop_services || config.services.names.is_empty() {
        let _ = writeln!(out, "Services:     not stopped");
    } else if report.services_restarted {
        let _ = writeln!(out, "Services:     restarted");
    } else {
        let _ = writeln!(out, "Services:     left stopped ({})", config.services.names.join(", "));
    }
    Ok(Outcome::success(out))
}

pub fn verify_backup(ctx: &Context, args: &VerifyArgs) -> Result<Outcome, Failure> {
    let tools = ctx.tools();
    let report = Verifier::new(&tools)
        .verify(&args.archive)
        .map_err(Failure::at("verify"))?;

    let mut out = String::new();
    let _ = writeln!(out, "{}: {}", report.archive.display(), report.verdict);
    let _ = writeln!(
        out,
        "  format:   {}{}",
        report.format,
        if report.encrypted { " (encrypted)" } else { "" }
    );
    let _ = writeln!(out, "  checksum: {}", report.checksum.describe());
    if let Some(entries) = report.entries {
        let _ = writeln!(out, "  entries:  {}", entries);
    }
    let code = match &report.verdict {
        Verification::Corrupted(reason) => {
            let _ = writeln!(out, "  problem:  {}", reason);
            LifecycleError::Integrity(String::new()).exit_code()
        }
        _ => 0,
    };
    Ok(Outcome { report: out, code })
}

pub fn list(ctx: &Context, args: &ListArgs) -> Result<Outcome, Failure> {
    let dir = args
        .output
        .clone()
        .unwrap_or_else(|| ctx.config.backup.output_dir.clone());
    let catalog = Catalog::scan(&dir).map_err(|e| Failure::at("list")(e.into()))?;

    let mut out = String::new();
    if catalog.archives.is_empty() {
        let _ = writeln!(out, "No archives in {}", dir.display());
    } else {
        let _ = writeln!(out, "{:<48} {:>12}  {:<9}  {}", "ARCHIVE", "SIZE", "ENCRYPTED", "CHECKSUM");
    }
    for entry in &catalog.archives {
        let _ = writeln!(
            out,
            "{:<48} {:>12}  {:<9}  {}",
            entry.path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            format_bytes(entry.size),
            if entry.name.encrypted { "yes" } else { "no" },
            if entry.has_checksum { "sha256" } else { "missing" }
        );
    }
    for orphan in &catalog.orphaned_checksums {
        let _ = writeln!(out, "Orphaned checksum (no archive): {}", orphan.display());
    }
    Ok(Outcome::success(out))
}

pub fn prune(ctx: &Context, args: &PruneArgs) -> Result<Outcome, Failure> {
    let dir = args
        .output
        .clone()
        .unwrap_or_else(|| ctx.config.backup.output_dir.clone());
    let removed =
        executor::prune(&dir, &ctx.config.backup.prefix, args.keep).map_err(Failure::at("prune"))?;

    let mut out = String::new();
    if removed.is_empty() {
        let _ = writeln!(out, "Nothing to prune (keeping {})", args.keep);
    }
    for path in &removed {
        let _ = writeln!(out, "Removed {}", path.display());
    }
    Ok(Outcome::success(out))
}

/// Effective configuration, with validation issues appended as comments.
pub fn show_config(ctx: &Context) -> Result<Outcome, Failure> {
    let mut out = ctx.config.to_toml().map_err(Failure::at("show-config"))?;
    let validation = ctx.config.validate();
    for issue in &validation.errors {
        let _ = writeln!(out, "# error: {}", issue);
    }
    for issue in &validation.warnings {
        let _ = writeln!(out, "# warning: {}", issue);
    }
    Ok(Outcome::success(out))
}
