//! Encryption wrapper around sealed archives.
//!
//! Encrypting produces a new `.gpg` artifact with its own checksum sidecar.
//! The plaintext archive and its sidecar are removed only once the ciphertext
//! is written and sealed; on any failure the plaintext stays on disk.

use crate::archive::{split_encrypted, Archive};
use crate::integrity::{self, ChecksumRecord};
use crate::tools::{EncryptionKey, ToolRunner};
use crate::utils::errors::{LifecycleError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Encrypt a sealed archive and return the sealed ciphertext artifact.
pub fn encrypt_archive(tools: &dyn ToolRunner, archive: &Archive, key: &EncryptionKey) -> Result<Archive> {
    if archive.encrypted() {
        return Err(LifecycleError::Config(format!(
            "{} is already encrypted",
            archive.path.display()
        )));
    }

    tools.check_encryption(key)?;

    let name = archive.name.encrypted();
    let output = archive.path.with_file_name(name.file_name());
    let dir = output.parent().unwrap_or_else(|| Path::new("."));

    // A failed or interrupted write must not leave a truncated `.gpg` under the final name.
    let partial = tempfile::Builder::new()
        .prefix(".encrypt")
        .suffix(".partial")
        .tempfile_in(dir)?
        .into_temp_path();

    info!("Encrypting {} for {}", archive.path.display(), key.describe());
    tools.encrypt(&archive.path, &partial, key)?;

    let size = fs::metadata(&partial)?.len();
    if size == 0 {
        return Err(LifecycleError::Encryption(
            "encryption produced an empty file".to_string(),
        ));
    }
    partial.persist_noclobber(&output).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            LifecycleError::Config(format!("{} already exists", output.display()))
        } else {
            LifecycleError::Io(e.error)
        }
    })?;

    let checksum = match integrity::sign(tools, &output) {
        Ok(record) => record,
        Err(e) => {
            // Leave the plaintext as the only sealed artifact.
            let _ = fs::remove_file(&output);
            return Err(e);
        }
    };

    remove_plaintext(&archive.path);

    Ok(Archive {
        path: output,
        name,
        size,
        checksum,
    })
}

fn remove_plaintext(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Failed to remove plaintext archive {}: {}", path.display(), e);
    }
    let sidecar = ChecksumRecord::sidecar_path(path);
    if let Err(e) = fs::remove_file(&sidecar) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove checksum {}: {}", sidecar.display(), e);
        }
    }
}

/// Decrypt `ciphertext` into `work_dir`, returning the plaintext path.
///
/// `work_dir` must be private to the caller; the plaintext is an
/// intermediate input to extraction and never lands in the install root.
pub fn decrypt_to(
    tools: &dyn ToolRunner,
    ciphertext: &Path,
    work_dir: &Path,
    key: &EncryptionKey,
) -> Result<PathBuf> {
    let file_name = ciphertext
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| LifecycleError::Config(format!("{} has no file name", ciphertext.display())))?;
    let (plain_name, _) = split_encrypted(&file_name);
    let output = work_dir.join(plain_name);

    info!("Decrypting {} with {}", ciphertext.display(), key.describe());
    if let Err(e) = tools.decrypt(ciphertext, &output, key) {
        let _ = fs::remove_file(&output);
        return Err(e);
    }
    if !output.is_file() {
        return Err(LifecycleError::Encryption(format!(
            "decryption of {} produced no output",
            ciphertext.display()
        )));
    }
    Ok(output)
}
