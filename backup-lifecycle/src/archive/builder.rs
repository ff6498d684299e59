//! Archive Builder: manifest → single compressed tar under the output directory.
//!
//! Layout of every archive:
//!
//! ```text
//! <prefix>-<timestamp>/
//!     .backup-manifest.json
//!     <manifest entries at their paths relative to the install root>
//! ```
//!
//! The archive is written to a hidden temporary file next to its final
//! location and renamed into place only after the compressor has finished.

use super::manifest::{local_hostname, BackupManifest, BackupRecord, RECORD_FILE, RECORD_VERSION};
use super::{ArchiveName, CompressionFormat};
use crate::fs::walker::{walk_tree, EntryKind, WalkOptions};
use crate::tools::{ArchiveMember, DroppedMember, MemberSource, ToolRunner};
use crate::utils::errors::{LifecycleError, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A non-fatal problem met while collecting sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug)]
pub struct BuildOutput {
    pub path: PathBuf,
    pub name: ArchiveName,
    pub size: u64,
    pub record: BackupRecord,
    pub skipped: Vec<Skipped>,
}

struct Collected {
    members: Vec<ArchiveMember>,
    record: BackupRecord,
    skipped: Vec<Skipped>,
    /// Archived path to size, for every non-directory member.
    file_sizes: HashMap<PathBuf, u64>,
}

pub struct ArchiveBuilder<'a> {
    tools: &'a dyn ToolRunner,
    cancel: CancellationToken,
}

impl<'a> ArchiveBuilder<'a> {
    pub fn new(tools: &'a dyn ToolRunner, cancel: CancellationToken) -> Self {
        Self { tools, cancel }
    }

    pub fn build(
        &self,
        install_root: &Path,
        manifest: &BackupManifest,
        output_dir: &Path,
        name: &ArchiveName,
    ) -> Result<BuildOutput> {
        let root = install_root.canonicalize().map_err(|e| {
            LifecycleError::Config(format!(
                "install root {} is not accessible: {}",
                install_root.display(),
                e
            ))
        })?;
        let output_dir = prepare_output_dir(output_dir)?;

        let Collected {
            members,
            mut record,
            mut skipped,
            file_sizes,
        } = self.collect(&root, manifest, &output_dir, name)?;
        self.check_cancelled()?;

        let final_path = output_dir.join(name.file_name());
        for taken in [final_path.clone(), output_dir.join(name.encrypted().file_name())] {
            if fs::symlink_metadata(&taken).is_ok() {
                return Err(already_exists(&taken));
            }
        }

        let partial = tempfile::Builder::new()
            .prefix(".build")
            .suffix(".partial")
            .tempfile_in(&output_dir)?
            .into_temp_path();

        info!(
            "Writing {} ({} files, {} bytes, {})",
            final_path.display(),
            record.total_files,
            record.total_bytes,
            name.format
        );
        let stem = PathBuf::from(name.stem());
        let mut trailer = |dropped: &[DroppedMember]| -> Result<Vec<ArchiveMember>> {
            for missing in dropped {
                let relative = missing.source.strip_prefix(&root).unwrap_or(&missing.source).to_path_buf();
                warn!("Optional {} disappeared before archiving: {}", relative.display(), missing.reason);
                if let Some(size) = file_sizes.get(&missing.archived_as) {
                    record.total_files -= 1;
                    record.total_bytes -= size;
                }
                record.skipped.push(relative.clone());
                skipped.push(Skipped {
                    path: relative,
                    reason: missing.reason.clone(),
                });
            }
            Ok(vec![ArchiveMember::bytes(stem.join(RECORD_FILE), record.to_json()?)])
        };
        self.tools.compress(&members, &mut trailer, &partial, name.format)?;
        self.check_cancelled()?;

        partial.persist_noclobber(&final_path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                already_exists(&final_path)
            } else {
                LifecycleError::Io(e.error)
            }
        })?;
        let size = fs::metadata(&final_path)?.len();

        Ok(BuildOutput {
            path: final_path,
            name: name.clone(),
            size,
            record,
            skipped,
        })
    }

    fn collect(
        &self,
        root: &Path,
        manifest: &BackupManifest,
        output_dir: &Path,
        name: &ArchiveName,
    ) -> Result<Collected> {
        let stem = PathBuf::from(name.stem());
        let options = WalkOptions {
            exclude_roots: vec![output_dir.to_path_buf()],
            ..WalkOptions::default()
        };

        let mut members = vec![ArchiveMember::path(stem.clone(), root)];
        let mut file_sizes = HashMap::new();
        let mut seen = HashSet::from([stem.clone()]);
        let mut included = Vec::new();
        let mut skipped = Vec::new();
        let mut total_files = 0;
        let mut total_bytes = 0;

        for entry in manifest.iter() {
            self.check_cancelled()?;
            if !entry.is_contained() {
                return Err(LifecycleError::Config(format!(
                    "manifest path {} must be relative to the install root",
                    entry.path.display()
                )));
            }

            let source = root.join(&entry.path);
            if fs::symlink_metadata(&source).is_err() {
                if entry.required {
                    return Err(LifecycleError::Config(format!(
                        "required manifest path {} is missing",
                        source.display()
                    )));
                }
                info!("Optional path {} not present, skipping", entry.path.display());
                skipped.push(Skipped {
                    path: entry.path.clone(),
                    reason: "not present".to_string(),
                });
                continue;
            }
            if source.starts_with(output_dir) {
                warn!("Manifest path {} is inside the output directory, skipping", entry.path.display());
                skipped.push(Skipped {
                    path: entry.path.clone(),
                    reason: "inside the output directory".to_string(),
                });
                continue;
            }

            let outcome = walk_tree(root, &source, &options);
            if !outcome.errors.is_empty() {
                if entry.required {
                    let (path, reason) = &outcome.errors[0];
                    return Err(LifecycleError::Config(format!(
                        "required manifest path {} is unreadable at {}: {}",
                        entry.path.display(),
                        path.display(),
                        reason
                    )));
                }
                for (path, reason) in &outcome.errors {
                    warn!("Skipping unreadable {}: {}", path.display(), reason);
                    skipped.push(Skipped {
                        path: path.strip_prefix(root).unwrap_or(path).to_path_buf(),
                        reason: reason.clone(),
                    });
                }
            }

            for info in outcome.entries {
                let archived_as = stem.join(&info.relative_path);
                // Overlapping manifest entries: the first one to reach a path owns it.
                if !seen.insert(archived_as.clone()) {
                    continue;
                }
                if info.kind != EntryKind::Dir {
                    total_files += 1;
                    total_bytes += info.size;
                    file_sizes.insert(archived_as.clone(), info.size);
                }
                members.push(ArchiveMember {
                    archived_as,
                    source: MemberSource::Path(info.path),
                    optional: !entry.required,
                });
            }
            included.push(entry.path.clone());
        }

        let record = BackupRecord {
            version: RECORD_VERSION,
            created_at: chrono::Local::now().to_rfc3339(),
            hostname: local_hostname(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            included,
            skipped: skipped.iter().map(|s| s.path.clone()).collect(),
            total_files,
            total_bytes,
        };

        Ok(Collected {
            members,
            record,
            skipped,
            file_sizes,
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(LifecycleError::Interrupted)
        } else {
            Ok(())
        }
    }
}

fn already_exists(path: &Path) -> LifecycleError {
    LifecycleError::Config(format!("{} already exists", path.display()))
}

fn prepare_output_dir(output_dir: &Path) -> Result<PathBuf> {
    if output_dir.exists() && !output_dir.is_dir() {
        return Err(LifecycleError::Config(format!(
            "output path {} is not a directory",
            output_dir.display()
        )));
    }
    fs::create_dir_all(output_dir).map_err(|e| {
        LifecycleError::Config(format!(
            "cannot create output directory {}: {}",
            output_dir.display(),
            e
        ))
    })?;
    Ok(output_dir.canonicalize()?)
}

/// Name for an archive created now.
pub fn archive_name_for(prefix: &str, format: CompressionFormat) -> ArchiveName {
    ArchiveName::new(prefix, chrono::Local::now(), format)
}
