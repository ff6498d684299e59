//! Error taxonomy for the backup lifecycle.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Bad configuration, invalid output directory, missing required manifest path.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checksum mismatch or an archive that cannot be decoded.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// A required external tool or key is missing.
    #[error("Tool unavailable: {0}")]
    ToolUnavailable(String),

    /// Archive layout is not a single top-level directory.
    #[error("Archive structure error: {0}")]
    Structure(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    /// The operator declined a confirmation prompt.
    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Interrupted by signal")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LifecycleError {
    /// Process exit code for this error class.
    pub fn exit_code(&self) -> u8 {
        match self {
            LifecycleError::Config(_) => 2,
            LifecycleError::Integrity(_) => 3,
            LifecycleError::ToolUnavailable(_) => 4,
            LifecycleError::Structure(_) => 5,
            LifecycleError::Interrupted => 130,
            _ => 1,
        }
    }

    /// Short remediation hint shown next to the error.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            LifecycleError::Config(_) => Some("check the configuration file and command-line flags"),
            LifecycleError::Integrity(_) => {
                Some("re-run with --skip-verify only if you trust the source")
            }
            LifecycleError::ToolUnavailable(_) => {
                Some("install gnupg and import the recipient key, or run without --encrypt")
            }
            LifecycleError::Structure(_) => {
                Some("the archive was not produced by this tool; inspect it with `tar -tf`")
            }
            LifecycleError::Encryption(_) => {
                Some("check the recipient key or passphrase; the plaintext archive was kept")
            }
            LifecycleError::Service(_) => {
                Some("check the service stop/start commands in the [services] section")
            }
            LifecycleError::Interrupted => Some("re-run the command; temporary files were removed"),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_error_classes() {
        assert_eq!(LifecycleError::Config("x".into()).exit_code(), 2);
        assert_eq!(LifecycleError::Integrity("x".into()).exit_code(), 3);
        assert_eq!(LifecycleError::ToolUnavailable("x".into()).exit_code(), 4);
        assert_eq!(LifecycleError::Structure("x".into()).exit_code(), 5);
        assert_eq!(LifecycleError::Interrupted.exit_code(), 130);
        assert_eq!(LifecycleError::Service("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_integrity_hint_mentions_skip_verify() {
        let hint = LifecycleError::Integrity("mismatch".into()).hint().unwrap();
        assert!(hint.contains("--skip-verify"));
    }
}
