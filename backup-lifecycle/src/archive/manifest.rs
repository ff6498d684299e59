//! Backup manifest and the metadata record embedded in each archive.
//!
//! The manifest is the fixed, ordered list of paths (relative to the
//! installation root) that a backup captures. The metadata record is written
//! as `.backup-manifest.json` inside the archive's top-level directory so a
//! restore can report what the archive claims to contain.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// File name of the metadata record inside the archive's top-level directory.
pub const RECORD_FILE: &str = ".backup-manifest.json";

/// Current metadata record version.
pub const RECORD_VERSION: u32 = 1;

/// One source path in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the installation root.
    pub path: PathBuf,

    /// Abort the backup when this path is missing.
    #[serde(default)]
    pub required: bool,
}

impl ManifestEntry {
    pub fn required(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            required: true,
        }
    }

    pub fn optional(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            required: false,
        }
    }

    /// Relative, and never escapes the installation root.
    pub fn is_contained(&self) -> bool {
        !self.path.as_os_str().is_empty()
            && self
                .path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
            && self.path.components().any(|c| matches!(c, Component::Normal(_)))
    }
}

/// Ordered set of source paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub entries: Vec<ManifestEntry>,
}

impl BackupManifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter()
    }

    /// Default layout of the ComfyUI/OpenWebUI deployment.
    pub fn ai_stack() -> Self {
        Self::new(vec![
            ManifestEntry::required("docker-compose.yml"),
            ManifestEntry::optional(".env"),
            ManifestEntry::optional("data/open-webui"),
            ManifestEntry::optional("data/comfyui/user"),
            ManifestEntry::optional("data/comfyui/custom_nodes"),
            ManifestEntry::optional("data/comfyui/output"),
            ManifestEntry::optional("nginx"),
            ManifestEntry::optional("certs"),
        ])
    }
}

/// Metadata record serialized as `.backup-manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub version: u32,
    pub created_at: String,
    pub hostname: String,
    pub tool_version: String,
    /// Manifest paths that were captured.
    pub included: Vec<PathBuf>,
    /// Optional manifest paths that were missing or unreadable.
    pub skipped: Vec<PathBuf>,
    pub total_files: usize,
    pub total_bytes: u64,
}

impl BackupRecord {
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Read the record out of an extracted top-level directory, if present.
    pub fn read_from(top_level: &Path) -> Option<Self> {
        let bytes = std::fs::read(top_level.join(RECORD_FILE)).ok()?;
        Self::from_json(&bytes).ok()
    }
}

pub(crate) fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}
