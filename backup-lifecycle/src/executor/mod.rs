//! Backup job executor - runs one backup end to end.
//!
//! Ties together the pipeline stages:
//! - Service window (optional stop/start around the capture)
//! - Archive Builder
//! - Integrity Signer
//! - Encryption Wrapper (optional)
//! - Retention (optional `--keep`)

use crate::archive::builder::{archive_name_for, ArchiveBuilder, Skipped};
use crate::archive::manifest::{BackupManifest, BackupRecord};
use crate::archive::{Archive, Catalog, CompressionFormat};
use crate::crypto;
use crate::integrity::{self, ChecksumRecord};
use crate::services::{ServiceGuard, ServiceManager};
use crate::tools::{EncryptionKey, ToolRunner};
use crate::utils::errors::{LifecycleError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Backup job configuration
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub install_root: PathBuf,
    pub manifest: BackupManifest,
    pub output_dir: PathBuf,
    pub prefix: String,
    pub compression: CompressionFormat,
    /// Encrypt the sealed archive for this key.
    pub encryption: Option<EncryptionKey>,
    pub stop_services: bool,
    pub services: Vec<String>,
    /// Keep only the newest N archives with this prefix.
    pub keep: Option<usize>,
}

/// Backup result statistics
#[derive(Debug)]
pub struct BackupResult {
    pub archive: Archive,
    pub record: BackupRecord,
    pub skipped: Vec<Skipped>,
    pub pruned: Vec<PathBuf>,
    pub duration_ms: u128,
}

pub struct BackupExecutor<'a> {
    tools: &'a dyn ToolRunner,
    services: &'a dyn ServiceManager,
    cancel_token: CancellationToken,
}

impl<'a> BackupExecutor<'a> {
    pub fn new(tools: &'a dyn ToolRunner, services: &'a dyn ServiceManager) -> Self {
        Self::with_cancel(tools, services, CancellationToken::new())
    }

    pub fn with_cancel(
        tools: &'a dyn ToolRunner,
        services: &'a dyn ServiceManager,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            tools,
            services,
            cancel_token,
        }
    }

    pub fn execute(&self, job: &BackupJob) -> Result<BackupResult> {
        let start = Instant::now();
        validate_prefix(&job.prefix)?;
        if job.manifest.is_empty() {
            return Err(LifecycleError::Config("backup manifest is empty".to_string()));
        }
        if job.keep == Some(0) {
            return Err(LifecycleError::Config("--keep must be at least 1".to_string()));
        }

        info!(
            "Starting backup of {} into {} ({}{})",
            job.install_root.display(),
            job.output_dir.display(),
            job.compression,
            if job.encryption.is_some() { ", encrypted" } else { "" }
        );

        let guard = if job.stop_services {
            ServiceGuard::acquire(self.services, &job.services)?
        } else {
            ServiceGuard::inactive(self.services)
        };

        let name = archive_name_for(&job.prefix, job.compression);
        let built = ArchiveBuilder::new(self.tools, self.cancel_token.clone()).build(
            &job.install_root,
            &job.manifest,
            &job.output_dir,
            &name,
        )?;

        // Data is captured; services come back before sealing and encryption.
        let restart = guard.release();

        let checksum = integrity::sign(self.tools, &built.path)?;
        let mut archive = Archive {
            path: built.path,
            name: built.name,
            size: built.size,
            checksum,
        };
        info!(
            "Archive sealed: {} ({} bytes, sha256 {})",
            archive.path.display(),
            archive.size,
            archive.checksum.digest
        );

        if let Err(e) = restart {
            error!("Archive {} was written but services did not restart", archive.path.display());
            return Err(e);
        }

        if let Some(key) = &job.encryption {
            self.check_cancelled()?;
            archive = crypto::encrypt_archive(self.tools, &archive, key)?;
            info!("Encrypted archive: {}", archive.path.display());
        }

        let pruned = match job.keep {
            Some(keep) => prune(&job.output_dir, &job.prefix, keep)?,
            None => Vec::new(),
        };

        let duration_ms = start.elapsed().as_millis();
        info!(
            "Backup complete: {} files, {} bytes captured in {} ms",
            built.record.total_files, built.record.total_bytes, duration_ms
        );

        Ok(BackupResult {
            archive,
            record: built.record,
            skipped: built.skipped,
            pruned,
            duration_ms,
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            Err(LifecycleError::Interrupted)
        } else {
            Ok(())
        }
    }
}

fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(LifecycleError::Config("archive prefix must not be empty".to_string()));
    }
    if prefix.contains(['/', '\\']) || prefix.starts_with('.') {
        return Err(LifecycleError::Config(format!(
            "archive prefix '{}' must be a plain file name",
            prefix
        )));
    }
    Ok(())
}

/// Delete all but the newest `keep` archives named with `prefix`, together
/// with their checksum sidecars. Returns the removed archive paths.
pub fn prune(output_dir: &Path, prefix: &str, keep: usize) -> Result<Vec<PathBuf>> {
    if keep == 0 {
        return Err(LifecycleError::Config("--keep must be at least 1".to_string()));
    }

    let catalog = Catalog::scan(output_dir)?;
    let mut removed = Vec::new();
    for old in catalog.with_prefix(prefix).skip(keep) {
        fs::remove_file(&old.path)?;
        let sidecar = ChecksumRecord::sidecar_path(&old.path);
        if let Err(e) = fs::remove_file(&sidecar) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", sidecar.display(), e);
            }
        }
        info!("[Retention] Removed old backup: {}", old.path.display());
        removed.push(old.path.clone());
    }
    Ok(removed)
}
