use std::{path::PathBuf, time::Duration};

use crate::supervisor_state::SupervisorState;

/// Reasons a backend start (or a lifecycle request) can fail.
///
/// Every startup variant is terminal for the `start()` call that produced it;
/// the supervisor never retries on its own.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("backend executable not found at {}", path.display())]
    ExecutableNotFound { path: PathBuf },

    #[error("failed to spawn backend process {}: {message}", path.display())]
    SpawnFailed { path: PathBuf, message: String },

    #[error("backend output ended without a port announcement after {lines_seen} lines")]
    PortAnnouncementMissing { lines_seen: usize },

    #[error("backend health check did not pass after {attempts} attempts")]
    HealthCheckTimeout { attempts: u32 },

    #[error("backend exited before becoming ready ({})", describe_exit_code(*code))]
    PrematureExit { code: Option<i32> },

    #[error("backend did not announce a port within {}ms", timeout.as_millis())]
    StartupTimedOut { timeout: Duration },

    #[error("backend start was cancelled by a stop request")]
    StartCancelled,

    #[error("cannot {operation} backend while supervisor is {state}")]
    InvalidState {
        operation: &'static str,
        state: SupervisorState,
    },

    #[error("backend supervisor task is no longer running")]
    SupervisorClosed,
}

impl SupervisorError {
    /// Stable identifier for bridge payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecutableNotFound { .. } => "executable_not_found",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::PortAnnouncementMissing { .. } => "port_announcement_missing",
            Self::HealthCheckTimeout { .. } => "health_check_timeout",
            Self::PrematureExit { .. } => "premature_exit",
            Self::StartupTimedOut { .. } => "startup_timed_out",
            Self::StartCancelled => "start_cancelled",
            Self::InvalidState { .. } => "invalid_state",
            Self::SupervisorClosed => "supervisor_closed",
        }
    }
}

fn describe_exit_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn premature_exit_message_includes_code_or_signal() {
        let with_code = SupervisorError::PrematureExit { code: Some(1) };
        assert!(with_code.to_string().contains("exit code 1"));

        let by_signal = SupervisorError::PrematureExit { code: None };
        assert!(by_signal.to_string().contains("terminated by signal"));
    }

    #[test]
    fn invalid_state_message_names_operation_and_state() {
        let error = SupervisorError::InvalidState {
            operation: "start",
            state: SupervisorState::Ready,
        };
        assert_eq!(
            error.to_string(),
            "cannot start backend while supervisor is ready"
        );
        assert_eq!(error.kind(), "invalid_state");
    }
}
