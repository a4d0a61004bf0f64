use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Broad failure classes the shell maps to remediation messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureCategory {
    PortUnavailable,
    ExecutableMissing,
    ProcessSpawnError,
    ProcessExitedEarly,
    HealthCheckExhausted,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::PortUnavailable => "port-unavailable",
            FailureCategory::ExecutableMissing => "executable-missing",
            FailureCategory::ProcessSpawnError => "process-spawn-error",
            FailureCategory::ProcessExitedEarly => "process-exited-early",
            FailureCategory::HealthCheckExhausted => "health-check-exhausted",
            FailureCategory::Unknown => "unknown",
        }
    }
}

/// Result of a single health probe that did not come back healthy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HealthError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("health check timed out")]
    Timeout,
    #[error("health check returned status {0}")]
    BadStatus(u16),
}

/// Terminal failure of a startup attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartupFailure {
    #[error("backend executable not found ({tried} candidate paths checked)")]
    ExecutableMissing { tried: usize },

    #[error("port unavailable: {detail}")]
    PortUnavailable { detail: String },

    #[error("failed to spawn backend {path:?}: {message}")]
    ProcessSpawn { path: PathBuf, message: String },

    #[error("backend exited early ({})", describe_exit(.code))]
    ProcessExitedEarly { code: Option<i32> },

    #[error("backend not healthy after {attempts} attempts: {last_error}")]
    HealthCheckExhausted { attempts: u32, last_error: HealthError },

    #[error("{0}")]
    Unknown(String),
}

impl StartupFailure {
    pub fn category(&self) -> FailureCategory {
        match self {
            StartupFailure::ExecutableMissing { .. } => FailureCategory::ExecutableMissing,
            StartupFailure::PortUnavailable { .. } => FailureCategory::PortUnavailable,
            StartupFailure::ProcessSpawn { .. } => FailureCategory::ProcessSpawnError,
            StartupFailure::ProcessExitedEarly { .. } => FailureCategory::ProcessExitedEarly,
            StartupFailure::HealthCheckExhausted { .. } => FailureCategory::HealthCheckExhausted,
            StartupFailure::Unknown(_) => FailureCategory::Unknown,
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}
