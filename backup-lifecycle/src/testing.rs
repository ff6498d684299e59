//! Test doubles for the tool and service seams.

use crate::archive::CompressionFormat;
use crate::services::ServiceManager;
use crate::tools::{ArchiveMember, EncryptionKey, SystemTools, ToolRunner, Trailer};
use crate::utils::errors::{LifecycleError, Result};
use std::cell::RefCell;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

const FAKE_MAGIC: &[u8] = b"FAKEGPG1\n";

/// Real archive handling, fake encryption.
///
/// Ciphertext is `FAKEGPG1\n<key label>\n` followed by the plaintext XORed
/// with 0x5a; decryption only succeeds with the same key label.
pub struct FakeTools {
    inner: SystemTools,
    keys: HashSet<String>,
    fail_encrypt: bool,
    fail_decrypt: bool,
    fail_decompress: bool,
    remove_before_compress: Option<PathBuf>,
}

impl FakeTools {
    pub fn with_keys(keys: &[&str]) -> Self {
        Self {
            inner: SystemTools::default(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            fail_encrypt: false,
            fail_decrypt: false,
            fail_decompress: false,
            remove_before_compress: None,
        }
    }

    pub fn failing_encrypt(mut self) -> Self {
        self.fail_encrypt = true;
        self
    }

    pub fn failing_decrypt(mut self) -> Self {
        self.fail_decrypt = true;
        self
    }

    pub fn failing_decompress(mut self) -> Self {
        self.fail_decompress = true;
        self
    }

    /// Delete `path` after collection, just before the archive is written.
    pub fn removing_before_compress(mut self, path: impl Into<PathBuf>) -> Self {
        self.remove_before_compress = Some(path.into());
        self
    }

    fn label(key: &EncryptionKey) -> Result<String> {
        match key {
            EncryptionKey::Recipient(id) => Ok(format!("recipient:{}", id)),
            EncryptionKey::PassphraseFile(path) => Ok(format!(
                "passphrase:{}",
                fs::read_to_string(path)?.trim()
            )),
            EncryptionKey::Keyring => Ok("keyring".to_string()),
        }
    }
}

fn xor(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b ^ 0x5a).collect()
}

impl ToolRunner for FakeTools {
    fn compress(
        &self,
        members: &[ArchiveMember],
        trailer: Trailer<'_>,
        dest: &Path,
        format: CompressionFormat,
    ) -> Result<()> {
        if let Some(path) = &self.remove_before_compress {
            fs::remove_file(path)?;
        }
        self.inner.compress(members, trailer, dest, format)
    }

    fn decompress(&self, archive: &Path, format: CompressionFormat, dest_dir: &Path) -> Result<()> {
        if self.fail_decompress {
            // Leave something behind so cleanup is observable.
            fs::write(dest_dir.join("partial"), b"half-extracted")?;
            return Err(LifecycleError::Integrity("injected extraction failure".to_string()));
        }
        self.inner.decompress(archive, format, dest_dir)
    }

    fn list(&self, archive: &Path, format: CompressionFormat) -> Result<Vec<PathBuf>> {
        self.inner.list(archive, format)
    }

    fn checksum(&self, path: &Path) -> Result<String> {
        self.inner.checksum(path)
    }

    fn check_encryption(&self, key: &EncryptionKey) -> Result<()> {
        match key {
            EncryptionKey::Recipient(id) if !self.keys.contains(id) => Err(
                LifecycleError::ToolUnavailable(format!("no public key for recipient '{}'", id)),
            ),
            EncryptionKey::PassphraseFile(path) if !path.is_file() => Err(LifecycleError::Config(
                format!("passphrase file {} does not exist", path.display()),
            )),
            EncryptionKey::Keyring => Err(LifecycleError::Config(
                "encryption requires a recipient or a passphrase file".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn encrypt(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<()> {
        if self.fail_encrypt {
            fs::write(output, b"trunc")?;
            return Err(LifecycleError::Encryption("injected encryption failure".to_string()));
        }
        let mut bytes = FAKE_MAGIC.to_vec();
        bytes.extend_from_slice(Self::label(key)?.as_bytes());
        bytes.push(b'\n');
        bytes.extend(xor(&fs::read(input)?));
        fs::write(output, bytes)?;
        Ok(())
    }

    fn decrypt(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<()> {
        if self.fail_decrypt {
            fs::write(output, b"garbage")?;
            return Err(LifecycleError::Encryption("injected decryption failure".to_string()));
        }
        let bytes = fs::read(input)?;
        let body = bytes
            .strip_prefix(FAKE_MAGIC)
            .ok_or_else(|| LifecycleError::Encryption("not a fake ciphertext".to_string()))?;
        let split = body
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| LifecycleError::Encryption("truncated fake ciphertext".to_string()))?;
        let label = String::from_utf8_lossy(&body[..split]).to_string();

        let authorized = match key {
            EncryptionKey::Keyring => label
                .strip_prefix("recipient:")
                .map(|id| self.keys.contains(id))
                .unwrap_or(false),
            other => Self::label(other)? == label,
        };
        if !authorized {
            return Err(LifecycleError::Encryption("decryption failed: no secret key".to_string()));
        }
        fs::write(output, xor(&body[split + 1..]))?;
        Ok(())
    }
}

/// Records stop/start calls.
#[derive(Default)]
pub struct RecordingServices {
    pub calls: RefCell<Vec<String>>,
    pub fail_stop: bool,
    pub fail_start: bool,
}

impl RecordingServices {
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl ServiceManager for RecordingServices {
    fn stop(&self, services: &[String]) -> Result<()> {
        self.calls.borrow_mut().push(format!("stop {}", services.join(" ")));
        if self.fail_stop {
            return Err(LifecycleError::Service("injected stop failure".to_string()));
        }
        Ok(())
    }

    fn start(&self, services: &[String]) -> Result<()> {
        self.calls.borrow_mut().push(format!("start {}", services.join(" ")));
        if self.fail_start {
            return Err(LifecycleError::Service("injected start failure".to_string()));
        }
        Ok(())
    }
}

/// Create files (and their parents) under `root`.
pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel, bytes) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, bytes).unwrap();
    }
}

/// Number of entries directly inside `dir`.
pub fn entry_count(dir: &Path) -> usize {
    fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
