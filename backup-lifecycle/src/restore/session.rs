//! Per-invocation restore state and its private working directory.

use crate::fs::tree::make_writable;
use crate::utils::errors::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

/// Transient state of one restore.
///
/// Owns a private working directory holding the decrypted plaintext and the
/// extraction staging tree; it is removed when the session is dropped,
/// whichever way the restore ends.
#[derive(Debug)]
pub struct RestoreSession {
    pub source: PathBuf,
    pub decrypted: bool,
    pub services_stopped: bool,
    /// Archive the extraction reads from: `source`, or the decrypted copy.
    pub plaintext: PathBuf,
    work: TempDir,
}

impl RestoreSession {
    pub fn open(source: &Path, work_root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(".restore-");
        let work = match work_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        debug!("Restore working directory: {}", work.path().display());

        Ok(Self {
            source: source.to_path_buf(),
            decrypted: false,
            services_stopped: false,
            plaintext: source.to_path_buf(),
            work,
        })
    }

    pub fn work_dir(&self) -> &Path {
        self.work.path()
    }

    /// Directory the archive is unpacked into.
    pub fn staging_dir(&self) -> PathBuf {
        self.work.path().join("staging")
    }
}

impl Drop for RestoreSession {
    fn drop(&mut self) {
        // Unpacked read-only directories would block removal of their contents.
        for entry in WalkDir::new(self.work.path()).follow_links(false).into_iter().flatten() {
            if entry.file_type().is_dir() {
                let _ = make_writable(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::entry_count;

    #[test]
    fn test_session_removes_work_dir_on_drop() -> Result<()> {
        let root = TempDir::new()?;
        let work_path;
        {
            let session = RestoreSession::open(Path::new("/b/x.tar.gz"), Some(root.path()))?;
            work_path = session.work_dir().to_path_buf();
            std::fs::create_dir_all(session.staging_dir())?;
            std::fs::write(session.staging_dir().join("f"), b"x")?;
            assert_eq!(entry_count(root.path()), 1);
            assert_eq!(session.plaintext, PathBuf::from("/b/x.tar.gz"));
        }
        assert!(!work_path.exists());
        assert_eq!(entry_count(root.path()), 0);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_read_only_staging_is_still_removed() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new()?;
        {
            let session = RestoreSession::open(Path::new("/b/x.tar.gz"), Some(root.path()))?;
            let locked = session.staging_dir().join("top/certs");
            std::fs::create_dir_all(&locked)?;
            std::fs::write(locked.join("server.pem"), b"cert")?;
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555))?;
        }
        assert_eq!(entry_count(root.path()), 0);
        Ok(())
    }
}
