use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("download error: {0}")]
    Download(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("integrity check failed: expected sha256 {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("service {action} failed (exit code {}): {stderr}", format_exit_code(.code))]
    ServiceControl {
        action: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("health check failed: {0}")]
    HealthCheck(HealthFailure),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(
        "another relaunch run is in progress (pid={})",
        .pid.map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
    )]
    LockHeld { pid: Option<u32> },
}

impl UpdateError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn service(action: &str, code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::ServiceControl {
            action: action.to_string(),
            code,
            stderr: stderr.into(),
        }
    }

    /// Short category token used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Parse(_) => "parse",
            Self::Download(_) => "download",
            Self::Io { .. } => "io",
            Self::Integrity { .. } => "integrity",
            Self::ServiceControl { .. } => "service_control",
            Self::HealthCheck(HealthFailure::Timeout { .. }) => "health_timeout",
            Self::HealthCheck(HealthFailure::Failed { .. }) => "health_failed",
            Self::Config(_) => "config",
            Self::LockHeld { .. } => "lock_held",
        }
    }
}

fn format_exit_code(code: &Option<i32>) -> String {
    code.map(|code| code.to_string())
        .unwrap_or_else(|| "none".to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthFailure {
    Timeout { window: Duration },
    Failed { reason: String },
}

impl fmt::Display for HealthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { window } => write!(
                f,
                "no ready marker within {}s health window",
                window.as_secs()
            ),
            Self::Failed { reason } => write!(f, "{reason}"),
        }
    }
}

/// Step of an update run that failed; drives the process exit code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailureStage {
    Fetch,
    Stop,
    Install,
    Start,
    Health,
    Record,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch-failed",
            Self::Stop => "stop-failed",
            Self::Install => "install-failed",
            Self::Start => "start-failed",
            Self::Health => "health-failed",
            Self::Record => "record-failed",
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            Self::Fetch => 2,
            Self::Stop => 3,
            Self::Install => 4,
            Self::Start => 5,
            Self::Health => 6,
            Self::Record => 7,
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
