//! Checksum sidecars.
//!
//! Every sealed artifact `X` has a sibling `X.sha256` holding one line in the
//! format `sha256sum` produces and `sha256sum -c` accepts:
//! `<hex-digest>  <file name>`. The record must always describe the bytes
//! currently stored under that file name.

use crate::tools::ToolRunner;
use crate::utils::errors::{LifecycleError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CHECKSUM_EXTENSION: &str = "sha256";
pub const ALGORITHM: &str = "sha256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRecord {
    pub algorithm: &'static str,
    pub digest: String,
    /// File name (not path) the digest describes.
    pub subject: String,
}

impl ChecksumRecord {
    pub fn new(digest: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            algorithm: ALGORITHM,
            digest: digest.into(),
            subject: subject.into(),
        }
    }

    /// `<artifact>.sha256`
    pub fn sidecar_path(artifact: &Path) -> PathBuf {
        let mut name = artifact.file_name().unwrap_or_default().to_os_string();
        name.push(".");
        name.push(CHECKSUM_EXTENSION);
        artifact.with_file_name(name)
    }

    /// Artifact file name a sidecar file name refers to.
    pub fn subject_of_sidecar(sidecar_name: &str) -> Option<&str> {
        sidecar_name
            .strip_suffix(CHECKSUM_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .filter(|s| !s.is_empty())
    }

    pub fn parse(content: &str) -> Result<Self> {
        let line = content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| LifecycleError::Integrity("checksum file is empty".to_string()))?;

        let (digest, subject) = line.split_once(char::is_whitespace).ok_or_else(|| {
            LifecycleError::Integrity(format!("malformed checksum line: '{}'", line))
        })?;
        // A leading '*' marks binary mode in sha256sum output.
        let subject = subject.trim_start().trim_start_matches('*');

        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(LifecycleError::Integrity(format!(
                "malformed sha256 digest: '{}'",
                digest
            )));
        }
        if subject.is_empty() {
            return Err(LifecycleError::Integrity(format!(
                "checksum line names no file: '{}'",
                line
            )));
        }

        Ok(Self::new(digest.to_ascii_lowercase(), subject))
    }

    pub fn render(&self) -> String {
        format!("{}  {}\n", self.digest, self.subject)
    }

    /// Read the sidecar for `artifact`, `None` if there is none.
    pub fn read_for(artifact: &Path) -> Result<Option<Self>> {
        let sidecar = Self::sidecar_path(artifact);
        match fs::read_to_string(&sidecar) {
            Ok(content) => Self::parse(&content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically write the sidecar next to `artifact`.
    pub fn write_for(&self, artifact: &Path) -> Result<PathBuf> {
        let sidecar = Self::sidecar_path(artifact);
        let dir = sidecar.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::Builder::new()
            .prefix(".checksum")
            .tempfile_in(dir)?;
        tmp.write_all(self.render().as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&sidecar).map_err(|e| LifecycleError::Io(e.error))?;
        Ok(sidecar)
    }
}

/// Outcome of comparing an artifact against its sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumStatus {
    Match,
    Missing,
    Mismatch { expected: String, actual: String },
    /// The sidecar describes a different file name.
    WrongSubject { expected: String, found: String },
    Malformed(String),
}

impl ChecksumStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, ChecksumStatus::Match | ChecksumStatus::Missing)
    }

    pub fn describe(&self) -> String {
        match self {
            ChecksumStatus::Match => "checksum matches".to_string(),
            ChecksumStatus::Missing => "no checksum record".to_string(),
            ChecksumStatus::Mismatch { expected, actual } => {
                format!("checksum mismatch (expected {}, got {})", expected, actual)
            }
            ChecksumStatus::WrongSubject { expected, found } => format!(
                "checksum record describes '{}', not '{}'",
                found, expected
            ),
            ChecksumStatus::Malformed(reason) => format!("unreadable checksum record: {}", reason),
        }
    }
}

/// Compute the digest of `artifact` and write its sidecar.
pub fn sign(tools: &dyn ToolRunner, artifact: &Path) -> Result<ChecksumRecord> {
    let subject = artifact
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| LifecycleError::Config(format!("{} has no file name", artifact.display())))?;
    let digest = tools.checksum(artifact)?;
    let record = ChecksumRecord::new(digest, subject);
    let sidecar = record.write_for(artifact)?;
    info!("Wrote checksum {} ({})", sidecar.display(), record.digest);
    Ok(record)
}

/// Re-derive the digest of `artifact` and compare it with its sidecar.
pub fn check(tools: &dyn ToolRunner, artifact: &Path) -> Result<ChecksumStatus> {
    if !artifact.is_file() {
        let sidecar = ChecksumRecord::sidecar_path(artifact);
        let detail = if sidecar.exists() {
            format!("{} (checksum record {} has no archive)", artifact.display(), sidecar.display())
        } else {
            artifact.display().to_string()
        };
        return Err(LifecycleError::FileNotFound(detail));
    }

    let record = match ChecksumRecord::read_for(artifact) {
        Ok(Some(record)) => record,
        Ok(None) => return Ok(ChecksumStatus::Missing),
        Err(LifecycleError::Integrity(reason)) => return Ok(ChecksumStatus::Malformed(reason)),
        Err(e) => return Err(e),
    };

    let expected_subject = artifact
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let recorded_subject = Path::new(&record.subject)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if recorded_subject != expected_subject {
        return Ok(ChecksumStatus::WrongSubject {
            expected: expected_subject,
            found: record.subject,
        });
    }

    let actual = tools.checksum(artifact)?;
    if actual == record.digest {
        Ok(ChecksumStatus::Match)
    } else {
        Ok(ChecksumStatus::Mismatch {
            expected: record.digest,
            actual,
        })
    }
}
