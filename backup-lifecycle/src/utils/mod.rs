//! Utility modules for the backup lifecycle.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{LifecycleError, Result};
