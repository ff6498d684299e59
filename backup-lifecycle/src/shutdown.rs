//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! The pipeline runs on a blocking thread and polls a [`CancellationToken`]
//! at every stage boundary. The first signal cancels the token, which makes
//! the running stage return `Interrupted` and unwind through the scoped
//! guards: temporary files are removed and stopped services are started
//! again. A second signal exits the process at once, for a tool that hangs.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status used when a repeated signal ends the process.
pub const FORCED_EXIT_CODE: i32 = 130;

/// What to do about a received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Let the pipeline stop at its next stage boundary.
    Drain,
    /// Exit immediately, skipping cleanup.
    Exit,
}

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token handed to the pipeline.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Listen for SIGINT and SIGTERM for as long as the task runs.
    pub async fn watch(&self) {
        #[cfg(unix)]
        let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                None
            }
        };

        let mut interrupts = true;
        loop {
            let int = async move {
                if interrupts {
                    signal::ctrl_c().await
                } else {
                    std::future::pending().await
                }
            };

            #[cfg(unix)]
            let term = async {
                match terminate.as_mut() {
                    Some(stream) => {
                        stream.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            #[cfg(not(unix))]
            let term = std::future::pending::<()>();

            let name = tokio::select! {
                received = int => match received {
                    Ok(()) => "SIGINT",
                    Err(e) => {
                        error!("Failed to install Ctrl+C handler: {}", e);
                        interrupts = false;
                        continue;
                    }
                },
                _ = term => "SIGTERM",
            };

            if self.on_signal(name) == SignalAction::Exit {
                std::process::exit(FORCED_EXIT_CODE);
            }
        }
    }

    /// Cancel the token on the first signal; ask for an exit on any later one.
    pub fn on_signal(&self, name: &str) -> SignalAction {
        if self.token.is_cancelled() {
            warn!("Received {} again, exiting without cleanup", name);
            SignalAction::Exit
        } else {
            info!(
                "Received {}, stopping at the next stage boundary (repeat to exit immediately)",
                name
            );
            self.token.cancel();
            SignalAction::Drain
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
