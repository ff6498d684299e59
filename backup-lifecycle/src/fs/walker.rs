//! Directory traversal for archive collection.
//!
//! Walks one manifest entry and reports every directory, file and symlink
//! beneath it, pruning excluded subtrees (the backup output directory, for
//! instance) before descending into them.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking. Symlinks are reported, never followed.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Absolute subtrees never entered
    pub exclude_roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Information about a path discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path
    pub path: PathBuf,

    /// Path relative to the walk base
    pub relative_path: PathBuf,

    /// File size in bytes (0 for directories and symlinks)
    pub size: u64,

    pub kind: EntryKind,
}

/// Result of walking one tree; unreadable paths are reported, not fatal.
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub entries: Vec<FileInfo>,
    pub errors: Vec<(PathBuf, String)>,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, base: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(base).unwrap_or(&path).to_path_buf();

        let file_type = entry.file_type();
        let (kind, size) = if file_type.is_symlink() {
            (EntryKind::Symlink, 0)
        } else if file_type.is_dir() {
            (EntryKind::Dir, 0)
        } else {
            (EntryKind::File, metadata.len())
        };

        Ok(Self {
            path,
            relative_path,
            size,
            kind,
        })
    }
}

/// Walk `start` (a file or directory under `base`), yielding entries in
/// sorted order with paths relative to `base`.
pub fn walk_tree(base: &Path, start: &Path, options: &WalkOptions) -> WalkOutcome {
    let mut outcome = WalkOutcome::default();

    let iter = WalkDir::new(start)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !should_exclude(entry, options));

    for entry in iter {
        match entry {
            Ok(entry) => match FileInfo::from_entry(&entry, base) {
                Ok(info) => outcome.entries.push(info),
                Err(e) => outcome.errors.push((entry.path().to_path_buf(), e.to_string())),
            },
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| start.to_path_buf());
                outcome.errors.push((path, e.to_string()));
            }
        }
    }

    outcome
}

fn should_exclude(entry: &DirEntry, options: &WalkOptions) -> bool {
    options
        .exclude_roots
        .iter()
        .any(|root| entry.path().starts_with(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn file_count(outcome: &WalkOutcome) -> usize {
        outcome.entries.iter().filter(|e| e.kind != EntryKind::Dir).count()
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let base = temp_dir.path();

        fs::create_dir(base.join("subdir"))?;
        fs::write(base.join("file1.txt"), b"content1")?;
        fs::write(base.join("subdir/file2.txt"), b"content2")?;

        let outcome = walk_tree(base, base, &WalkOptions::default());
        assert!(outcome.errors.is_empty());
        assert_eq!(file_count(&outcome), 2);
        assert_eq!(outcome.entries.iter().map(|e| e.size).sum::<u64>(), 16);

        let relative: Vec<_> = outcome.entries.iter().map(|e| e.relative_path.clone()).collect();
        assert!(relative.contains(&PathBuf::from("subdir")));
        assert!(relative.contains(&PathBuf::from("subdir/file2.txt")));

        Ok(())
    }

    #[test]
    fn test_walk_single_file_relative_to_base() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let base = temp_dir.path();
        fs::write(base.join(".env"), b"KEY=1")?;

        let outcome = walk_tree(base, &base.join(".env"), &WalkOptions::default());
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].relative_path, PathBuf::from(".env"));
        assert_eq!(outcome.entries[0].kind, EntryKind::File);

        Ok(())
    }

    #[test]
    fn test_exclude_roots_prunes_subtree() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let base = temp_dir.path();
        fs::create_dir_all(base.join("backups"))?;
        fs::write(base.join("backups/old.tar.gz"), b"archive")?;
        fs::write(base.join("keep.txt"), b"keep")?;

        let options = WalkOptions {
            exclude_roots: vec![base.join("backups")],
            ..WalkOptions::default()
        };
        let outcome = walk_tree(base, base, &options);
        assert!(outcome
            .entries
            .iter()
            .all(|e| !e.path.starts_with(base.join("backups"))));
        assert_eq!(file_count(&outcome), 1);

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_are_not_followed() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let base = temp_dir.path();
        fs::write(base.join("target.txt"), b"data")?;
        std::os::unix::fs::symlink(base.join("target.txt"), base.join("link"))?;

        let outcome = walk_tree(base, base, &WalkOptions::default());
        let link = outcome
            .entries
            .iter()
            .find(|e| e.relative_path == PathBuf::from("link"))
            .unwrap();
        assert_eq!(link.kind, EntryKind::Symlink);

        Ok(())
    }

    #[test]
    fn test_missing_start_reports_error() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path();
        let outcome = walk_tree(base, &base.join("nope"), &WalkOptions::default());
        assert!(outcome.entries.is_empty());
        assert_eq!(outcome.errors.len(), 1);
    }
}
