//! GnuPG command-line integration.
//!
//! Encryption is delegated to the `gpg` binary so archives stay readable with
//! stock tooling (`gpg --decrypt backup.tar.gz.gpg | tar -xz`).

use crate::utils::errors::{LifecycleError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;

/// How an archive is encrypted or decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionKey {
    /// Public-key encryption for a recipient (email or key id).
    Recipient(String),
    /// Symmetric encryption with a passphrase read from a file.
    PassphraseFile(PathBuf),
    /// Decrypt with whatever secret key the default keyring holds.
    Keyring,
}

impl EncryptionKey {
    pub fn describe(&self) -> String {
        match self {
            EncryptionKey::Recipient(id) => format!("recipient '{}'", id),
            EncryptionKey::PassphraseFile(path) => format!("passphrase file {}", path.display()),
            EncryptionKey::Keyring => "default keyring".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GpgCli {
    binary: PathBuf,
    homedir: Option<PathBuf>,
}

impl GpgCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            homedir: None,
        }
    }

    pub fn with_homedir(mut self, homedir: impl Into<PathBuf>) -> Self {
        self.homedir = Some(homedir.into());
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg("--batch").arg("--yes").arg("--no-tty");
        if let Some(homedir) = &self.homedir {
            command.arg("--homedir").arg(homedir);
        }
        command
    }

    fn run(&self, mut command: Command, action: &str) -> Result<Output> {
        debug!("Running {:?}", command);
        match command.output() {
            Ok(output) => Ok(output),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(LifecycleError::ToolUnavailable(
                format!("{} not found on PATH (needed to {})", self.binary.display(), action),
            )),
            Err(e) => Err(LifecycleError::Encryption(format!(
                "failed to launch {}: {}",
                self.binary.display(),
                e
            ))),
        }
    }

    /// Confirm the binary runs and, for recipient keys, that the public key is present.
    pub fn ensure_ready(&self, key: &EncryptionKey) -> Result<()> {
        let mut version = self.command();
        version.arg("--version");
        let output = self.run(version, "encrypt the archive")?;
        if !output.status.success() {
            return Err(LifecycleError::ToolUnavailable(format!(
                "{} --version exited with {}",
                self.binary.display(),
                output.status
            )));
        }

        match key {
            EncryptionKey::Recipient(id) => {
                let mut list = self.command();
                list.arg("--list-keys").arg(id);
                let output = self.run(list, "look up the recipient key")?;
                if !output.status.success() {
                    return Err(LifecycleError::ToolUnavailable(format!(
                        "no public key for recipient '{}' in the keyring",
                        id
                    )));
                }
            }
            EncryptionKey::PassphraseFile(path) => {
                if !path.is_file() {
                    return Err(LifecycleError::Config(format!(
                        "passphrase file {} does not exist",
                        path.display()
                    )));
                }
            }
            EncryptionKey::Keyring => {
                return Err(LifecycleError::Config(
                    "encryption requires a recipient or a passphrase file".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn encrypt(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<()> {
        let mut command = self.command();
        match key {
            EncryptionKey::Recipient(id) => {
                command
                    .arg("--trust-model")
                    .arg("always")
                    .arg("--recipient")
                    .arg(id)
                    .arg("--output")
                    .arg(output)
                    .arg("--encrypt");
            }
            EncryptionKey::PassphraseFile(path) => {
                command
                    .arg("--pinentry-mode")
                    .arg("loopback")
                    .arg("--passphrase-file")
                    .arg(path)
                    .arg("--cipher-algo")
                    .arg("AES256")
                    .arg("--output")
                    .arg(output)
                    .arg("--symmetric");
            }
            EncryptionKey::Keyring => {
                return Err(LifecycleError::Config(
                    "encryption requires a recipient or a passphrase file".to_string(),
                ));
            }
        }
        command.arg(input);
        self.check(command, "encrypt the archive")
    }

    pub fn decrypt(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<()> {
        let mut command = self.command();
        if let EncryptionKey::PassphraseFile(path) = key {
            command
                .arg("--pinentry-mode")
                .arg("loopback")
                .arg("--passphrase-file")
                .arg(path);
        }
        command.arg("--output").arg(output).arg("--decrypt").arg(input);
        self.check(command, "decrypt the archive")
    }

    fn check(&self, command: Command, action: &str) -> Result<()> {
        let output = self.run(command, action)?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(LifecycleError::Encryption(format!(
            "gpg failed to {} ({}): {}",
            action,
            output.status,
            stderr.trim()
        )))
    }
}

impl Default for GpgCli {
    fn default() -> Self {
        Self::new("gpg")
    }
}
