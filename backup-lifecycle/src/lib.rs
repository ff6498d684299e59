//! backup-lifecycle library
//!
//! Backup, verification and restore pipeline for the ComfyUI/OpenWebUI stack:
//! manifest-driven archives, SHA-256 sidecars, optional gpg encryption and a
//! restore state machine with pre-restore safety snapshots.

pub mod archive;
pub mod commands;
pub mod config;
pub mod confirm;
pub mod crypto;
pub mod executor;
pub mod fs;
pub mod integrity;
pub mod restore;
pub mod services;
pub mod shutdown;
pub mod tools;
pub mod utils;
pub mod verify;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{LifecycleError, Result};
