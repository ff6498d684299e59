//! Standalone archive verification.
//!
//! Reads only: the artifact and its sidecar are never modified.

use crate::archive::{classify, CompressionFormat};
use crate::integrity::{self, ChecksumStatus};
use crate::tools::ToolRunner;
use crate::utils::errors::{LifecycleError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Tri-state verification verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid,
    /// Structurally valid, but there is no checksum record to compare against.
    NoChecksum,
    Corrupted(String),
}

impl Verification {
    pub fn is_acceptable(&self) -> bool {
        !matches!(self, Verification::Corrupted(_))
    }
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verification::Valid => f.write_str("VALID"),
            Verification::NoChecksum => f.write_str("NO_CHECKSUM"),
            Verification::Corrupted(_) => f.write_str("CORRUPTED"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub archive: PathBuf,
    pub format: CompressionFormat,
    pub encrypted: bool,
    pub checksum: ChecksumStatus,
    /// Member count from the structural probe; `None` when it was not run.
    pub entries: Option<usize>,
    pub verdict: Verification,
}

/// How the archive's compression was identified.
pub fn identify(archive: &Path) -> Result<Option<(CompressionFormat, bool)>> {
    let file_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if let Some(found) = classify(&file_name) {
        return Ok(Some(found));
    }
    Ok(CompressionFormat::detect(archive)?.map(|format| (format, false)))
}

pub struct Verifier<'a> {
    tools: &'a dyn ToolRunner,
}

impl<'a> Verifier<'a> {
    pub fn new(tools: &'a dyn ToolRunner) -> Self {
        Self { tools }
    }

    /// Check the sidecar (if any) and, for plaintext archives, decode the whole
    /// stream without extracting. Errors only when the file is missing or
    /// its format cannot be determined.
    pub fn verify(&self, archive: &Path) -> Result<VerifyReport> {
        if !archive.is_file() {
            // Reports orphaned sidecars too.
            integrity::check(self.tools, archive)?;
        }

        let (format, encrypted) = identify(archive)?.ok_or_else(|| {
            LifecycleError::Structure(format!(
                "{} has no recognized extension or compression signature",
                archive.display()
            ))
        })?;

        let checksum = integrity::check(self.tools, archive)?;
        let mut report = VerifyReport {
            archive: archive.to_path_buf(),
            format,
            encrypted,
            checksum: checksum.clone(),
            entries: None,
            verdict: Verification::Valid,
        };

        if checksum.is_failure() {
            warn!("{}: {}", archive.display(), checksum.describe());
            report.verdict = Verification::Corrupted(checksum.describe());
            return Ok(report);
        }

        if encrypted {
            info!("{} is encrypted; structural probe skipped", archive.display());
        } else {
            match self.tools.list(archive, format) {
                Ok(entries) => report.entries = Some(entries.len()),
                Err(e) => {
                    warn!("{}: structural probe failed: {}", archive.display(), e);
                    report.verdict = Verification::Corrupted(e.to_string());
                    return Ok(report);
                }
            }
        }

        if checksum == ChecksumStatus::Missing {
            report.verdict = Verification::NoChecksum;
        }
        info!("{}: {}", archive.display(), report.verdict);
        Ok(report)
    }
}
