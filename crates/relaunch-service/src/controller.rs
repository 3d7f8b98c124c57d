use std::fmt;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use relaunch_core::{UpdateError, UpdaterConfig};
use tracing::{debug, info, warn};

use crate::runner::{run_with_timeout, CommandOutput};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ServiceStatus {
    Running,
    Stopped,
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }

    /// Maps `systemctl is-active` output.
    pub fn from_is_active(output: &str) -> Self {
        match output.lines().next().unwrap_or_default().trim() {
            "active" | "activating" | "reloading" | "deactivating" | "refreshing" => {
                Self::Running
            }
            "inactive" | "failed" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stop/start/status against a named OS service. Never holds a live handle.
pub trait ServiceController {
    /// Returns only once the service is observed stopped.
    fn stop(&self) -> Result<(), UpdateError>;
    fn start(&self) -> Result<(), UpdateError>;
    fn status(&self) -> ServiceStatus;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub name: String,
    pub use_sudo: bool,
    pub daemon_reload: bool,
    pub command_timeout: Duration,
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
}

impl ServiceSettings {
    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self {
            name: config.service_name.clone(),
            use_sudo: config.use_sudo,
            daemon_reload: config.daemon_reload,
            command_timeout: config.timeouts.command(),
            stop_timeout: config.timeouts.stop(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub type Runner = fn(&[String], Duration) -> io::Result<CommandOutput>;

pub struct SystemdController<R = Runner> {
    settings: ServiceSettings,
    runner: R,
}

impl SystemdController {
    pub fn new(settings: ServiceSettings) -> Self {
        Self::with_runner(settings, run_with_timeout)
    }
}

impl<R> SystemdController<R>
where
    R: Fn(&[String], Duration) -> io::Result<CommandOutput>,
{
    pub fn with_runner(settings: ServiceSettings, runner: R) -> Self {
        Self { settings, runner }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    fn systemctl_argv(&self, args: &[&str]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 3);
        if self.settings.use_sudo {
            argv.push("sudo".to_string());
            argv.push("-n".to_string());
        }
        argv.push("systemctl".to_string());
        argv.extend(args.iter().map(|arg| arg.to_string()));
        argv
    }

    fn run_action(&self, action: &str, args: &[&str]) -> Result<CommandOutput, UpdateError> {
        let argv = self.systemctl_argv(args);
        debug!(command = %argv.join(" "), "running service command");
        let output = (self.runner)(&argv, self.settings.command_timeout).map_err(|err| {
            UpdateError::service(action, None, format!("'{}': {err}", argv.join(" ")))
        })?;
        if !output.success() {
            return Err(UpdateError::service(
                action,
                output.code,
                output.stderr.trim().to_string(),
            ));
        }
        Ok(output)
    }

    fn wait_until_stopped(&self) -> Result<(), UpdateError> {
        let deadline = Instant::now() + self.settings.stop_timeout;
        loop {
            let status = self.status();
            if status == ServiceStatus::Stopped {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(UpdateError::service(
                    "stop",
                    None,
                    format!(
                        "{} still {status} after {}s",
                        self.settings.name,
                        self.settings.stop_timeout.as_secs()
                    ),
                ));
            }
            thread::sleep(self.settings.poll_interval);
        }
    }
}

impl<R> ServiceController for SystemdController<R>
where
    R: Fn(&[String], Duration) -> io::Result<CommandOutput>,
{
    fn stop(&self) -> Result<(), UpdateError> {
        info!(service = %self.settings.name, "stopping service");
        self.run_action("stop", &["stop", self.settings.name.as_str()])?;
        self.wait_until_stopped()
    }

    fn start(&self) -> Result<(), UpdateError> {
        if self.settings.daemon_reload {
            self.run_action("daemon-reload", &["daemon-reload"])?;
        }
        info!(service = %self.settings.name, "starting service");
        self.run_action("start", &["start", self.settings.name.as_str()])?;
        Ok(())
    }

    fn status(&self) -> ServiceStatus {
        let argv = self.systemctl_argv(&["is-active", self.settings.name.as_str()]);
        match (self.runner)(&argv, self.settings.command_timeout) {
            // is-active exits non-zero for inactive units; the text decides
            Ok(output) => ServiceStatus::from_is_active(&output.stdout),
            Err(err) => {
                warn!(service = %self.settings.name, error = %err, "service status probe failed");
                ServiceStatus::Unknown
            }
        }
    }
}
