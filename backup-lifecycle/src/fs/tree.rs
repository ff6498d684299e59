//! Recursive tree copy used for safety snapshots and restore installs.

use std::fs;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Counters for a finished copy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
    pub bytes: u64,
}

impl CopyStats {
    fn absorb(&mut self, other: CopyStats) {
        self.files += other.files;
        self.dirs += other.dirs;
        self.symlinks += other.symlinks;
        self.bytes += other.bytes;
    }
}

/// Copy `src` (file, symlink or directory) to `dst`, overwriting what is
/// already there. Existing destination paths not present in `src` are left alone.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<CopyStats> {
    let mut stats = CopyStats::default();
    let mut dir_modes = Vec::new();

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = if relative.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(relative)
        };
        let file_type = entry.file_type();

        if file_type.is_dir() {
            make_dir(&target)?;
            let permissions = entry.metadata().map_err(io::Error::from)?.permissions();
            make_writable(&target)?;
            dir_modes.push((target, permissions));
            stats.dirs += 1;
        } else if file_type.is_symlink() {
            clear_for_leaf(&target)?;
            copy_symlink(entry.path(), &target)?;
            stats.symlinks += 1;
        } else {
            clear_for_leaf(&target)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            stats.bytes += fs::copy(entry.path(), &target)?;
            stats.files += 1;
        }
    }

    // Read-only source directories must still accept their children, so
    // directory modes are applied last, deepest first.
    for (dir, permissions) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, permissions)?;
    }

    Ok(stats)
}

/// Copy every top-level child of `src_dir` into `dst_dir`, skipping names
/// rejected by `keep`.
pub fn copy_children<F>(src_dir: &Path, dst_dir: &Path, keep: F) -> io::Result<CopyStats>
where
    F: Fn(&std::ffi::OsStr) -> bool,
{
    make_dir(dst_dir)?;
    let mut stats = CopyStats::default();

    let mut children: Vec<_> = fs::read_dir(src_dir)?.collect::<io::Result<_>>()?;
    children.sort_by_key(|c| c.file_name());

    for child in children {
        let name = child.file_name();
        if !keep(&name) {
            continue;
        }
        stats.absorb(copy_tree(&child.path(), &dst_dir.join(&name))?);
    }

    Ok(stats)
}

fn make_dir(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => {
            fs::remove_file(path)?;
            fs::create_dir_all(path)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(path),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
pub(crate) fn make_writable(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(dir)?.permissions();
    let mode = permissions.mode();
    if mode & 0o700 != 0o700 {
        permissions.set_mode(mode | 0o700);
        fs::set_permissions(dir, permissions)?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn make_writable(dir: &Path) -> io::Result<()> {
    let mut permissions = fs::metadata(dir)?.permissions();
    if permissions.readonly() {
        permissions.set_readonly(false);
        fs::set_permissions(dir, permissions)?;
    }
    Ok(())
}

/// Remove whatever occupies `path` so a file or symlink can be written there.
/// Writing through an existing symlink would modify its target instead.
fn clear_for_leaf(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(meta) if meta.file_type().is_symlink() || meta.permissions().readonly() => fs::remove_file(path),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}
