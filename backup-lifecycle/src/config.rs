//! Configuration management for the backup lifecycle tool.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`BACKUP_LIFECYCLE__<SECTION>__<KEY>`). Command-line flags are applied on
//! top by the command layer.

use crate::archive::manifest::{BackupManifest, ManifestEntry};
use crate::archive::CompressionFormat;
use crate::utils::errors::{LifecycleError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Read when no `--config` is given and the file exists.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/backup-lifecycle/config.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "BACKUP_LIFECYCLE";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backup: BackupConfig,
    pub services: ServicesConfig,
    pub restore: RestoreConfig,
    pub encryption: EncryptionConfig,
    pub log: LogConfig,

    /// Paths captured by every backup, relative to `backup.install_root`.
    pub manifest: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Installation root the manifest paths are relative to
    pub install_root: PathBuf,

    /// Directory archives are written to
    pub output_dir: PathBuf,

    /// Archive name prefix
    pub prefix: String,

    pub compression: CompressionFormat,

    /// Keep only the newest N archives after each backup
    pub keep: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Services stopped around backup and restore windows
    pub names: Vec<String>,

    /// Command run to stop services; the names are appended
    pub stop_command: Vec<String>,

    /// Command run to start services; the names are appended
    pub start_command: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Parent of the private restore working directory (system temp dir if unset)
    pub work_dir: Option<PathBuf>,

    /// Where pre-restore safety snapshots go (output_dir if unset)
    pub snapshot_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Default recipient (email or key id) for `--encrypt`
    pub recipient: Option<String>,

    /// Passphrase file for symmetric encryption
    pub passphrase_file: Option<PathBuf>,

    pub gpg_binary: PathBuf,

    /// Alternate GnuPG home directory
    pub gpg_homedir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

// Default values
fn default_install_root() -> PathBuf {
    PathBuf::from("/opt/ai-stack")
}

fn default_compose_command(action: &str) -> Vec<String> {
    vec![
        "docker".to_string(),
        "compose".to_string(),
        "-f".to_string(),
        default_install_root()
            .join("docker-compose.yml")
            .to_string_lossy()
            .to_string(),
        action.to_string(),
    ]
}

fn default_manifest() -> Vec<ManifestEntry> {
    BackupManifest::ai_stack().entries
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backup: BackupConfig::default(),
            services: ServicesConfig::default(),
            restore: RestoreConfig::default(),
            encryption: EncryptionConfig::default(),
            log: LogConfig::default(),
            manifest: default_manifest(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            install_root: default_install_root(),
            output_dir: default_install_root().join("backups"),
            prefix: "ai-stack".to_string(),
            compression: CompressionFormat::Gzip,
            keep: None,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            names: vec!["open-webui".to_string(), "comfyui".to_string()],
            stop_command: default_compose_command("stop"),
            start_command: default_compose_command("start"),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            recipient: None,
            passphrase_file: None,
            gpg_binary: PathBuf::from("gpg"),
            gpg_homedir: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration: file (explicit, or the default path if present),
    /// then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`Config::load`], reading overrides from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                if !path.is_file() {
                    return Err(LifecycleError::Config(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                ::config::File::from(path).required(true)
            }
            None => ::config::File::from(Path::new(DEFAULT_CONFIG_PATH)).required(false),
        };

        let environment = ::config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("services.names")
            .with_list_parse_key("services.stop_command")
            .with_list_parse_key("services.start_command")
            .source(env);

        let settings = ::config::Config::builder()
            .add_source(file.format(::config::FileFormat::Toml))
            .add_source(environment)
            .build()
            .map_err(|e| LifecycleError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| LifecycleError::Config(e.to_string()))
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LifecycleError::Config(e.to_string()))
    }

    pub fn manifest(&self) -> BackupManifest {
        BackupManifest::new(self.manifest.clone())
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.restore
            .snapshot_dir
            .clone()
            .unwrap_or_else(|| self.backup.output_dir.clone())
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        let prefix = &self.backup.prefix;
        if prefix.is_empty() || prefix.contains(['/', '\\']) || prefix.starts_with('.') {
            result.error("backup.prefix", format!("'{}' is not a plain file name", prefix));
        }
        if self.backup.keep == Some(0) {
            result.error("backup.keep", "must be at least 1");
        }
        if !self.backup.install_root.is_absolute() {
            result.error("backup.install_root", "must be an absolute path");
        }
        if self.backup.output_dir.as_os_str().is_empty() {
            result.error("backup.output_dir", "must not be empty");
        }

        if self.manifest.is_empty() {
            result.error("manifest", "no paths to back up");
        }
        let mut seen = Vec::new();
        for entry in &self.manifest {
            if !entry.is_contained() {
                result.error(
                    "manifest",
                    format!("{} must be relative to the install root", entry.path.display()),
                );
            }
            if seen.contains(&&entry.path) {
                result.warning("manifest", format!("{} is listed twice", entry.path.display()));
            }
            seen.push(&entry.path);

            let source = self.backup.install_root.join(&entry.path);
            if self.backup.output_dir.starts_with(&source) {
                result.warning(
                    "backup.output_dir",
                    format!(
                        "inside manifest path {}; it is excluded from its own archives",
                        entry.path.display()
                    ),
                );
            }
        }

        if !self.services.names.is_empty() {
            if self.services.stop_command.is_empty() {
                result.error("services.stop_command", "required when services.names is set");
            }
            if self.services.start_command.is_empty() {
                result.error("services.start_command", "required when services.names is set");
            }
        }

        if self.encryption.recipient.is_some() && self.encryption.passphrase_file.is_some() {
            result.warning(
                "encryption",
                "both recipient and passphrase_file are set; the recipient is used",
            );
        }
        if self.encryption.gpg_binary.as_os_str().is_empty() {
            result.error("encryption.gpg_binary", "must not be empty");
        }

        if !LOG_LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            result.warning(
                "log.level",
                format!("unknown level '{}', falling back to info", self.log.level),
            );
        }

        result
    }
}

/// One problem found by [`Config::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub field: String,
    pub message: String,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(Issue {
            field: field.to_string(),
            message: message.into(),
        });
    }

    fn warning(&mut self, field: &str, message: impl Into<String>) {
        self.warnings.push(Issue {
            field: field.to_string(),
            message: message.into(),
        });
    }

    /// Warnings on success, every error joined into one `Config` error otherwise.
    pub fn into_result(self) -> Result<Vec<Issue>> {
        if self.errors.is_empty() {
            return Ok(self.warnings);
        }
        let joined = self
            .errors
            .iter()
            .map(|issue| issue.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(LifecycleError::Config(joined))
    }
}
