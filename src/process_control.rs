use std::{io, time::Duration};

use tracing::warn;

use crate::logging::LogCategory;

const FORCE_STOP_WAIT_MIN_MS: u64 = 200;
#[cfg(target_os = "windows")]
const WINDOWS_GRACEFUL_STOP_NONZERO_WAIT_MS: u64 = 350;
#[cfg(target_os = "windows")]
const FORCE_STOP_WAIT_MAX_WINDOWS_MS: u64 = 2_200;
#[cfg(not(target_os = "windows"))]
const FORCE_STOP_WAIT_MAX_NON_WINDOWS_MS: u64 = 1_500;
#[cfg(not(target_os = "windows"))]
const UNIX_GRACEFUL_STOP_FAILED_WAIT_MS: u64 = 500;
#[cfg(target_os = "windows")]
const WINDOWS_CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[cfg(unix)]
pub const GRACEFUL_STOP_LABEL: &str = "SIGTERM";
#[cfg(target_os = "windows")]
pub const GRACEFUL_STOP_LABEL: &str = "taskkill graceful stop";

/// Asks the process to shut down on its own terms.
#[cfg(unix)]
pub async fn request_graceful_stop(pid: u32) -> io::Result<()> {
    use nix::{
        sys::signal::{self, Signal},
        unistd::Pid,
    };

    let raw_pid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    signal::kill(Pid::from_raw(raw_pid), Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(target_os = "windows")]
pub async fn request_graceful_stop(pid: u32) -> io::Result<()> {
    let pid_arg = pid.to_string();
    let mut command = tokio::process::Command::new("taskkill");
    command
        .args(["/pid", &pid_arg, "/t"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .stdin(std::process::Stdio::null())
        // Avoid flashing transient console windows when invoking taskkill.
        .creation_flags(WINDOWS_CREATE_NO_WINDOW);
    let status = command.status().await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill returned {status}")))
    }
}

pub fn graceful_wait_cap(timeout: Duration) -> Duration {
    #[cfg(target_os = "windows")]
    {
        timeout.min(Duration::from_millis(WINDOWS_GRACEFUL_STOP_NONZERO_WAIT_MS))
    }
    #[cfg(not(target_os = "windows"))]
    {
        timeout.min(Duration::from_millis(UNIX_GRACEFUL_STOP_FAILED_WAIT_MS))
    }
}

pub fn max_force_stop_wait() -> Duration {
    #[cfg(target_os = "windows")]
    {
        Duration::from_millis(FORCE_STOP_WAIT_MAX_WINDOWS_MS)
    }
    #[cfg(not(target_os = "windows"))]
    {
        Duration::from_millis(FORCE_STOP_WAIT_MAX_NON_WINDOWS_MS)
    }
}

pub fn compute_followup_wait(timeout: Duration, max_extra_wait: Duration) -> Duration {
    if timeout.is_zero() {
        Duration::ZERO
    } else {
        (timeout / 4)
            .max(Duration::from_millis(FORCE_STOP_WAIT_MIN_MS))
            .min(max_extra_wait)
    }
}

/// How long to wait after the graceful request; a failed request gets at most
/// `non_success_wait_cap`.
pub fn resolve_graceful_wait_timeout(
    pid: u32,
    timeout: Duration,
    non_success_wait_cap: Duration,
    graceful_status: &io::Result<()>,
    command_label: &str,
) -> Duration {
    match graceful_status {
        Ok(()) => timeout,
        Err(error) => {
            let shortened_wait = timeout.min(non_success_wait_cap);
            if shortened_wait < timeout {
                warn!(
                    category = LogCategory::Shutdown.as_label(),
                    pid,
                    %error,
                    requested_wait_ms = timeout.as_millis() as u64,
                    effective_wait_ms = shortened_wait.as_millis() as u64,
                    "{command_label} not successful; shorten graceful wait"
                );
            }
            shortened_wait
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_followup_wait_respects_min_and_cap() {
        assert_eq!(
            compute_followup_wait(Duration::from_millis(0), Duration::from_millis(900)),
            Duration::ZERO
        );
        assert_eq!(
            compute_followup_wait(Duration::from_millis(100), Duration::from_millis(900)),
            Duration::from_millis(200)
        );
        assert_eq!(
            compute_followup_wait(Duration::from_millis(9_000), Duration::from_millis(900)),
            Duration::from_millis(900)
        );
    }

    #[cfg(unix)]
    #[test]
    fn failed_sigterm_shortens_graceful_wait() {
        let timeout = Duration::from_millis(5_000);
        let graceful_status: io::Result<()> = Err(io::Error::from_raw_os_error(3));
        let wait = resolve_graceful_wait_timeout(
            42,
            timeout,
            graceful_wait_cap(timeout),
            &graceful_status,
            GRACEFUL_STOP_LABEL,
        );
        assert_eq!(wait, Duration::from_millis(500));
        assert_eq!(
            graceful_wait_cap(Duration::from_millis(100)),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn resolve_graceful_wait_timeout_keeps_full_wait_on_success() {
        let wait = resolve_graceful_wait_timeout(
            42,
            Duration::from_millis(2_000),
            Duration::from_millis(350),
            &Ok(()),
            GRACEFUL_STOP_LABEL,
        );
        assert_eq!(wait, Duration::from_millis(2_000));
    }

    #[test]
    fn resolve_graceful_wait_timeout_shortens_on_failure() {
        let graceful_status: io::Result<()> = Err(io::Error::other("simulated failure"));
        let wait = resolve_graceful_wait_timeout(
            42,
            Duration::from_millis(2_000),
            Duration::from_millis(350),
            &graceful_status,
            GRACEFUL_STOP_LABEL,
        );
        assert_eq!(wait, Duration::from_millis(350));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn request_graceful_stop_terminates_a_sleeping_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("pid");

        request_graceful_stop(pid).await.expect("send SIGTERM");
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("process exits after SIGTERM")
            .expect("wait status");
        assert!(!status.success());
    }
}
