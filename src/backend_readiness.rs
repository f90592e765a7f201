use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::{backend_http, error::SupervisorError, http_response, logging::LogCategory};

pub const DEFAULT_HEALTH_PATH: &str = "/api/v1/health";
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_HEALTH_MAX_ATTEMPTS: u32 = 30;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub path: String,
    pub interval: Duration,
    pub max_attempts: u32,
    pub probe_timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_HEALTH_PATH.to_string(),
            interval: Duration::from_millis(DEFAULT_HEALTH_INTERVAL_MS),
            max_attempts: DEFAULT_HEALTH_MAX_ATTEMPTS,
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
        }
    }
}

/// Bookkeeping for one round of health polling.
#[derive(Debug, Clone, Copy)]
pub struct StartupAttempt {
    pub attempts: u32,
    started_at: Instant,
}

impl StartupAttempt {
    fn begin() -> Self {
        Self {
            attempts: 0,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[derive(Debug, Clone)]
pub struct HealthPoller {
    config: HealthCheckConfig,
}

impl HealthPoller {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self { config }
    }

    /// Probes `base_url` until a 2xx arrives or the attempt budget runs out.
    ///
    /// Each probe is independent and bounded by `probe_timeout`; a timed out
    /// probe is just a failed attempt.
    pub async fn wait_until_healthy(
        &self,
        base_url: &str,
    ) -> Result<StartupAttempt, SupervisorError> {
        let mut attempt = StartupAttempt::begin();
        let mut last_http_status = None;
        let mut tcp_ready_logged = false;

        while attempt.attempts < self.config.max_attempts {
            attempt.attempts += 1;
            let status = backend_http::request_status_code(
                base_url,
                &self.config.path,
                self.config.probe_timeout,
            )
            .await;
            match status {
                Some(code) if http_response::is_success_status(code) => {
                    info!(
                        category = LogCategory::Startup.as_label(),
                        base_url,
                        attempts = attempt.attempts,
                        elapsed_ms = attempt.elapsed().as_millis() as u64,
                        "backend health check passed"
                    );
                    return Ok(attempt);
                }
                Some(code) => {
                    last_http_status = Some(code);
                    debug!(
                        category = LogCategory::Startup.as_label(),
                        attempt = attempt.attempts,
                        status = code,
                        "backend health check not ready"
                    );
                }
                None => {
                    if !tcp_ready_logged
                        && backend_http::ping_backend(base_url, self.config.probe_timeout).await
                    {
                        debug!(
                            category = LogCategory::Startup.as_label(),
                            "backend TCP port is reachable but health endpoint is not answering yet"
                        );
                        tcp_ready_logged = true;
                    }
                }
            }

            if attempt.attempts < self.config.max_attempts {
                time::sleep(self.config.interval).await;
            }
        }

        self.log_health_timeout(base_url, &attempt, last_http_status);
        Err(SupervisorError::HealthCheckTimeout {
            attempts: attempt.attempts,
        })
    }

    fn log_health_timeout(
        &self,
        base_url: &str,
        attempt: &StartupAttempt,
        last_http_status: Option<u16>,
    ) {
        let last_http_status_text = last_http_status
            .map(|status| status.to_string())
            .unwrap_or_else(|| "none".to_string());
        warn!(
            category = LogCategory::Startup.as_label(),
            "backend health check gave up after {} attempts in {}ms: base_url={}, path={}, probe_timeout_ms={}, last_http_status={}",
            attempt.attempts,
            attempt.elapsed().as_millis(),
            base_url,
            self.config.path,
            self.config.probe_timeout.as_millis(),
            last_http_status_text
        );
    }
}
