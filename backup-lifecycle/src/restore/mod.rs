//! Restore Orchestrator.
//!
//! A restore walks an explicit state machine:
//!
//! ```text
//! Validating → Verifying → [Decrypting] → [StoppingServices] → Extracting
//!            → Installing → [StartingServices] → Done
//! ```
//!
//! and ends in `Failed` from whichever state went wrong. Temporary artifacts
//! live in a [`RestoreSession`] and stopped services are held by a
//! [`ServiceGuard`]; both are released on every exit path before the result
//! is reported.

pub mod session;

use crate::archive::manifest::{BackupRecord, RECORD_FILE};
use crate::archive::{classify, CompressionFormat, TIMESTAMP_FORMAT};
use crate::confirm::Confirm;
use crate::crypto;
use crate::fs::tree::{copy_children, copy_tree, CopyStats};
use crate::services::{ServiceGuard, ServiceManager};
use crate::tools::{EncryptionKey, ToolRunner};
use crate::utils::errors::{LifecycleError, Result};
use crate::verify::{Verification, Verifier};
use session::RestoreSession;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestoreState {
    Validating,
    Verifying,
    Decrypting,
    StoppingServices,
    Extracting,
    Installing,
    StartingServices,
    Done,
    Failed,
}

impl RestoreState {
    /// Whether `next` may follow `self`.
    pub fn can_advance_to(self, next: RestoreState) -> bool {
        use RestoreState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Validating, Verifying) => true,
            (Verifying, Decrypting | StoppingServices | Extracting) => true,
            (Decrypting, StoppingServices | Extracting) => true,
            (StoppingServices, Extracting) => true,
            (Extracting, Installing) => true,
            (Installing, StartingServices | Done) => true,
            (StartingServices, Done) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RestoreState::Done | RestoreState::Failed)
    }
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RestoreState::Validating => "validating",
            RestoreState::Verifying => "verifying",
            RestoreState::Decrypting => "decrypting",
            RestoreState::StoppingServices => "stopping services",
            RestoreState::Extracting => "extracting",
            RestoreState::Installing => "installing",
            RestoreState::StartingServices => "starting services",
            RestoreState::Done => "done",
            RestoreState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Per-invocation switches (`--skip-verify`, `--no-stop`, `--no-start`).
#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    pub verify: bool,
    pub stop_services: bool,
    /// Restart stopped services after a successful install. Failed restores
    /// always restart what they stopped.
    pub start_services: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            verify: true,
            stop_services: true,
            start_services: true,
        }
    }
}

/// Where and how a restore installs.
#[derive(Debug, Clone)]
pub struct RestoreSettings {
    pub install_root: PathBuf,
    pub services: Vec<String>,
    pub snapshot_dir: PathBuf,
    /// Parent of the private working directory; system temp dir when `None`.
    pub work_root: Option<PathBuf>,
    pub key: EncryptionKey,
}

#[derive(Debug)]
pub struct RestoreReport {
    pub archive: PathBuf,
    /// `None` when verification was skipped.
    pub verification: Option<Verification>,
    pub snapshot: Option<PathBuf>,
    pub installed: CopyStats,
    pub record: Option<BackupRecord>,
    pub services_restarted: bool,
    pub trail: Vec<RestoreState>,
}

#[derive(Debug, thiserror::Error)]
#[error("restore failed while {state}: {source}")]
pub struct RestoreFailure {
    /// State that was active when the failure happened.
    pub state: RestoreState,
    pub source: LifecycleError,
    /// Safety snapshot taken before the failure, if any.
    pub snapshot: Option<PathBuf>,
    pub trail: Vec<RestoreState>,
}

impl RestoreFailure {
    pub fn hint(&self) -> String {
        if self.state == RestoreState::StartingServices {
            let mut hint = "every file was installed; only starting the services failed, start them manually".to_string();
            if let Some(snapshot) = &self.snapshot {
                hint.push_str(&format!(" (the previous state is in {})", snapshot.display()));
            }
            return hint;
        }
        if let Some(snapshot) = &self.snapshot {
            return format!(
                "live files may be partially replaced; the previous state is in {} (copy it back over the install root to roll back)",
                snapshot.display()
            );
        }
        match self.state {
            RestoreState::Validating | RestoreState::Verifying | RestoreState::Decrypting => {
                let base = "no live files were changed";
                match self.source.hint() {
                    Some(h) => format!("{}; {}", base, h),
                    None => base.to_string(),
                }
            }
            _ => self
                .source
                .hint()
                .unwrap_or("no live files were changed")
                .to_string(),
        }
    }
}

pub struct RestoreOrchestrator<'a> {
    tools: &'a dyn ToolRunner,
    services: &'a dyn ServiceManager,
    confirm: &'a dyn Confirm,
    settings: RestoreSettings,
    cancel: CancellationToken,
    state: RestoreState,
    trail: Vec<RestoreState>,
    snapshot: Option<PathBuf>,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(
        tools: &'a dyn ToolRunner,
        services: &'a dyn ServiceManager,
        confirm: &'a dyn Confirm,
        settings: RestoreSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tools,
            services,
            confirm,
            settings,
            cancel,
            state: RestoreState::Validating,
            trail: vec![RestoreState::Validating],
            snapshot: None,
        }
    }

    pub fn run(mut self, archive: &Path, options: &RestoreOptions) -> std::result::Result<RestoreReport, RestoreFailure> {
        info!("Restoring {} into {}", archive.display(), self.settings.install_root.display());

        // Session and service guard are dropped inside `execute`, so cleanup
        // has finished by the time a failure is reported.
        match self.execute(archive, options) {
            Ok(report) => Ok(report),
            Err(source) => {
                let state = self.state;
                self.state = RestoreState::Failed;
                self.trail.push(RestoreState::Failed);
                error!("Restore failed while {}: {}", state, source);
                if let Some(snapshot) = &self.snapshot {
                    error!("Safety snapshot of the previous state: {}", snapshot.display());
                }
                Err(RestoreFailure {
                    state,
                    source,
                    snapshot: self.snapshot.take(),
                    trail: self.trail,
                })
            }
        }
    }

    fn execute(&mut self, archive: &Path, options: &RestoreOptions) -> Result<RestoreReport> {
        self.check_cancelled()?;
        let (format, encrypted) = self.validate(archive)?;

        self.advance(RestoreState::Verifying)?;
        let verification = if options.verify {
            Some(self.verify(archive)?)
        } else {
            warn!("Verification skipped (--skip-verify); trusting {}", archive.display());
            None
        };

        let mut session = RestoreSession::open(archive, self.settings.work_root.as_deref())?;

        if encrypted {
            self.advance(RestoreState::Decrypting)?;
            session.plaintext = crypto::decrypt_to(self.tools, archive, session.work_dir(), &self.settings.key)?;
            session.decrypted = true;
        }

        let guard = if options.stop_services && !self.settings.services.is_empty() {
            self.advance(RestoreState::StoppingServices)?;
            let guard = ServiceGuard::acquire(self.services, &self.settings.services)?;
            session.services_stopped = guard.stopped();
            guard
        } else {
            if !options.stop_services {
                info!("Leaving services running (--no-stop)");
            }
            ServiceGuard::inactive(self.services)
        };

        self.advance(RestoreState::Extracting)?;
        let top_level = self.extract(&session, format)?;
        let record = BackupRecord::read_from(&top_level);
        if let Some(record) = &record {
            info!(
                "Archive created {} on {} ({} files, {} bytes)",
                record.created_at, record.hostname, record.total_files, record.total_bytes
            );
        }

        self.advance(RestoreState::Installing)?;
        self.snapshot = self.create_snapshot(&top_level)?;
        let installed = self.install(&top_level)?;

        let mut services_restarted = false;
        if guard.stopped() {
            if options.start_services {
                self.advance(RestoreState::StartingServices)?;
                guard.release()?;
                services_restarted = true;
            } else {
                guard.keep_stopped();
            }
        }

        self.advance(RestoreState::Done)?;
        info!(
            "Restore complete: {} files, {} directories installed into {}",
            installed.files,
            installed.dirs,
            self.settings.install_root.display()
        );

        Ok(RestoreReport {
            archive: archive.to_path_buf(),
            verification,
            snapshot: self.snapshot.clone(),
            installed,
            record,
            services_restarted,
            trail: self.trail.clone(),
        })
    }

    /// Move to `next`, refusing transitions the state machine does not allow.
    fn advance(&mut self, next: RestoreState) -> Result<()> {
        if !next.is_terminal() {
            self.check_cancelled()?;
        }
        if !self.state.can_advance_to(next) {
            return Err(LifecycleError::Config(format!(
                "invalid restore transition {} -> {}",
                self.state, next
            )));
        }
        info!("Restore stage: {}", next);
        self.state = next;
        self.trail.push(next);
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(LifecycleError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn validate(&self, archive: &Path) -> Result<(CompressionFormat, bool)> {
        let meta = fs::metadata(archive)
            .map_err(|_| LifecycleError::FileNotFound(archive.display().to_string()))?;
        if !meta.is_file() {
            return Err(LifecycleError::Config(format!(
                "{} is not a regular file",
                archive.display()
            )));
        }

        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if let Some(found) = classify(&file_name) {
            return Ok(found);
        }

        warn!("{} does not have a recognized backup extension", file_name);
        let prompt = format!(
            "{} is not named like a backup archive (.tar.gz/.tar.bz2/.tar.xz/.tar.zst[.gpg]). Restore it anyway?",
            file_name
        );
        if !self.confirm.confirm(&prompt) {
            return Err(LifecycleError::Aborted(format!(
                "restore of {} declined by operator",
                file_name
            )));
        }

        match CompressionFormat::detect(archive)? {
            Some(format) => {
                info!("Detected {} compression from file contents", format);
                Ok((format, false))
            }
            None => Err(LifecycleError::Structure(format!(
                "cannot determine the compression format of {}",
                archive.display()
            ))),
        }
    }

    fn verify(&self, archive: &Path) -> Result<Verification> {
        let report = Verifier::new(self.tools).verify(archive)?;
        match &report.verdict {
            Verification::Valid => info!("Checksum verified for {}", archive.display()),
            Verification::NoChecksum => warn!(
                "No checksum record for {}; continuing without integrity verification",
                archive.display()
            ),
            Verification::Corrupted(reason) => {
                return Err(LifecycleError::Integrity(format!(
                    "{} failed verification: {}",
                    archive.display(),
                    reason
                )))
            }
        }
        Ok(report.verdict)
    }

    fn extract(&self, session: &RestoreSession, format: CompressionFormat) -> Result<PathBuf> {
        let staging = session.staging_dir();
        fs::create_dir_all(&staging)?;
        self.tools.decompress(&session.plaintext, format, &staging)?;
        single_top_level(&staging)
    }

    /// Copy the live counterparts of everything about to be installed.
    fn create_snapshot(&mut self, top_level: &Path) -> Result<Option<PathBuf>> {
        let root = &self.settings.install_root;
        let live: Vec<OsString> = incoming_names(top_level)?
            .into_iter()
            .filter(|name| fs::symlink_metadata(root.join(name)).is_ok())
            .collect();

        if live.is_empty() {
            info!("Nothing live to snapshot under {}", root.display());
            return Ok(None);
        }

        let stamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        let mut dir = self.settings.snapshot_dir.join(format!("pre-restore-{}", stamp));
        let mut attempt = 1;
        while dir.exists() {
            dir = self
                .settings
                .snapshot_dir
                .join(format!("pre-restore-{}-{}", stamp, attempt));
            attempt += 1;
        }
        fs::create_dir_all(&dir)?;
        let dir = dir.canonicalize()?;

        for name in &live {
            let live_path = root.join(name).canonicalize()?;
            if dir.starts_with(&live_path) {
                let _ = fs::remove_dir(&dir);
                return Err(LifecycleError::Config(format!(
                    "snapshot directory {} is inside {}, which the restore overwrites",
                    dir.display(),
                    live_path.display()
                )));
            }
        }

        self.snapshot = Some(dir.clone());
        let mut stats = CopyStats::default();
        for name in &live {
            let copied = copy_tree(&root.join(name), &dir.join(name))?;
            stats.files += copied.files;
            stats.bytes += copied.bytes;
        }
        info!(
            "Safety snapshot: {} files ({} bytes) at {}",
            stats.files,
            stats.bytes,
            dir.display()
        );
        Ok(Some(dir))
    }

    fn install(&self, top_level: &Path) -> Result<CopyStats> {
        let root = &self.settings.install_root;
        fs::create_dir_all(root).map_err(|e| {
            LifecycleError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot create install root {}: {}", root.display(), e),
            ))
        })?;
        let stats = copy_children(top_level, root, |name| name != RECORD_FILE)?;
        Ok(stats)
    }
}

/// Names an install would write at the top of the install root.
fn incoming_names(top_level: &Path) -> Result<Vec<OsString>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(top_level)? {
        let name = entry?.file_name();
        if name != RECORD_FILE {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// The one directory an archive must unpack to.
fn single_top_level(staging: &Path) -> Result<PathBuf> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(staging)? {
        entries.push(entry?);
    }

    if entries.len() != 1 {
        let mut names: Vec<String> = entries
            .iter()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        return Err(LifecycleError::Structure(format!(
            "expected exactly one top-level directory, found {} entries{}",
            entries.len(),
            if names.is_empty() {
                String::new()
            } else {
                format!(": {}", names.join(", "))
            }
        )));
    }

    let entry = &entries[0];
    if !entry.file_type()?.is_dir() {
        return Err(LifecycleError::Structure(format!(
            "top-level entry {} is not a directory",
            entry.file_name().to_string_lossy()
        )));
    }
    Ok(entry.path())
}
