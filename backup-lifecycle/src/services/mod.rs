//! Service lifecycle control around backup and restore windows.
//!
//! [`ServiceGuard`] is the scoped acquisition: constructing it stops the
//! services, dropping it starts them again. A guard that never stopped
//! anything never starts anything.

use crate::utils::errors::{LifecycleError, Result};
use std::process::Command;
use tracing::{error, info, warn};

pub trait ServiceManager {
    fn stop(&self, services: &[String]) -> Result<()>;
    fn start(&self, services: &[String]) -> Result<()>;
}

/// Runs configured commands with the service names appended, e.g.
/// `docker compose -f /opt/ai-stack/docker-compose.yml stop open-webui comfyui`.
#[derive(Debug, Clone)]
pub struct CommandServiceManager {
    stop_command: Vec<String>,
    start_command: Vec<String>,
}

impl CommandServiceManager {
    pub fn new(stop_command: Vec<String>, start_command: Vec<String>) -> Self {
        Self {
            stop_command,
            start_command,
        }
    }

    fn run(&self, template: &[String], services: &[String], action: &str) -> Result<()> {
        let (program, args) = template.split_first().ok_or_else(|| {
            LifecycleError::Config(format!("no {} command configured in [services]", action))
        })?;

        let mut command = Command::new(program);
        command.args(args).args(services);
        info!("Running service {} command: {:?}", action, command);

        let output = command.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LifecycleError::ToolUnavailable(format!("{} not found on PATH", program))
            } else {
                LifecycleError::Service(format!("failed to launch {}: {}", program, e))
            }
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(LifecycleError::Service(format!(
                "{} command exited with {}: {}",
                action,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl ServiceManager for CommandServiceManager {
    fn stop(&self, services: &[String]) -> Result<()> {
        self.run(&self.stop_command, services, "stop")
    }

    fn start(&self, services: &[String]) -> Result<()> {
        self.run(&self.start_command, services, "start")
    }
}

/// Keeps services stopped for its lifetime.
pub struct ServiceGuard<'a> {
    manager: &'a dyn ServiceManager,
    services: Vec<String>,
    stopped: bool,
    restart: bool,
}

impl<'a> ServiceGuard<'a> {
    /// A guard that holds nothing; releasing it is a no-op.
    pub fn inactive(manager: &'a dyn ServiceManager) -> Self {
        Self {
            manager,
            services: Vec::new(),
            stopped: false,
            restart: false,
        }
    }

    /// Stop `services`. If stopping fails part-way, the services are started
    /// again before the error is returned.
    pub fn acquire(manager: &'a dyn ServiceManager, services: &[String]) -> Result<Self> {
        if services.is_empty() {
            return Ok(Self::inactive(manager));
        }

        // Marked stopped before the attempt so a partial stop is undone on drop.
        let guard = Self {
            manager,
            services: services.to_vec(),
            stopped: true,
            restart: true,
        };
        info!("Stopping services: {}", services.join(", "));
        manager.stop(services)?;
        Ok(guard)
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Leave the services stopped when the guard is released on success.
    pub fn keep_stopped(mut self) {
        if self.stopped {
            warn!(
                "Leaving services stopped: {} (start them manually)",
                self.services.join(", ")
            );
        }
        self.restart = false;
    }

    /// Start the services now and report the outcome.
    pub fn release(mut self) -> Result<()> {
        if !self.stopped || !self.restart {
            return Ok(());
        }
        self.restart = false;
        info!("Starting services: {}", self.services.join(", "));
        self.manager.start(&self.services)
    }
}

impl Drop for ServiceGuard<'_> {
    fn drop(&mut self) {
        if self.stopped && self.restart {
            info!("Restarting services after interrupted operation: {}", self.services.join(", "));
            if let Err(e) = self.manager.start(&self.services) {
                error!("Failed to restart services {}: {}", self.services.join(", "), e);
            }
        }
    }
}

/// Used when no services are configured.
pub struct NoServices;

impl ServiceManager for NoServices {
    fn stop(&self, _services: &[String]) -> Result<()> {
        Ok(())
    }

    fn start(&self, _services: &[String]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingServices;

    fn names() -> Vec<String> {
        vec!["open-webui".to_string(), "comfyui".to_string()]
    }

    #[test]
    fn test_inactive_guard_never_starts() {
        let manager = RecordingServices::default();
        {
            let guard = ServiceGuard::inactive(&manager);
            assert!(!guard.stopped());
        }
        ServiceGuard::inactive(&manager).release().unwrap();
        assert!(manager.calls().is_empty());
    }

    #[test]
    fn test_empty_service_list_is_inactive() {
        let manager = RecordingServices::default();
        let guard = ServiceGuard::acquire(&manager, &[]).unwrap();
        assert!(!guard.stopped());
        drop(guard);
        assert!(manager.calls().is_empty());
    }

    #[test]
    fn test_drop_restarts_stopped_services() {
        let manager = RecordingServices::default();
        {
            let _guard = ServiceGuard::acquire(&manager, &names()).unwrap();
        }
        assert_eq!(
            manager.calls(),
            vec!["stop open-webui comfyui", "start open-webui comfyui"]
        );
    }

    #[test]
    fn test_release_starts_exactly_once() {
        let manager = RecordingServices::default();
        let guard = ServiceGuard::acquire(&manager, &names()).unwrap();
        guard.release().unwrap();
        assert_eq!(manager.calls().len(), 2);
    }

    #[test]
    fn test_failed_stop_is_undone() {
        let manager = RecordingServices {
            fail_stop: true,
            ..RecordingServices::default()
        };
        let result = ServiceGuard::acquire(&manager, &names());
        assert!(result.is_err());
        assert_eq!(
            manager.calls(),
            vec!["stop open-webui comfyui", "start open-webui comfyui"]
        );
    }

    #[test]
    fn test_keep_stopped_skips_restart() {
        let manager = RecordingServices::default();
        let guard = ServiceGuard::acquire(&manager, &names()).unwrap();
        guard.keep_stopped();
        assert_eq!(manager.calls(), vec!["stop open-webui comfyui"]);
    }

    #[test]
    #[cfg(unix)]
    fn test_command_manager_appends_service_names() {
        let manager = CommandServiceManager::new(
            vec!["true".to_string()],
            vec!["false".to_string()],
        );
        assert!(manager.stop(&names()).is_ok());
        assert!(matches!(manager.start(&names()), Err(LifecycleError::Service(_))));
    }

    #[test]
    fn test_command_manager_requires_command() {
        let manager = CommandServiceManager::new(Vec::new(), Vec::new());
        assert!(matches!(manager.stop(&names()), Err(LifecycleError::Config(_))));
    }
}
