use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::warn;

use crate::{backend_path, backend_readiness::HealthCheckConfig, logging::LogCategory};

pub const BACKEND_PATH_ENV: &str = "DBTOOLKIT_BACKEND_PATH";
pub const BACKEND_ARGS_ENV: &str = "DBTOOLKIT_BACKEND_ARGS";
pub const BACKEND_CWD_ENV: &str = "DBTOOLKIT_BACKEND_CWD";
pub const DEV_BACKEND_PORT_ENV: &str = "DBTOOLKIT_DEV_BACKEND_PORT";
pub const STARTUP_TIMEOUT_ENV: &str = "DBTOOLKIT_BACKEND_STARTUP_TIMEOUT_MS";
pub const HEALTH_PATH_ENV: &str = "DBTOOLKIT_BACKEND_HEALTH_PATH";
pub const HEALTH_INTERVAL_ENV: &str = "DBTOOLKIT_BACKEND_HEALTH_INTERVAL_MS";
pub const HEALTH_MAX_ATTEMPTS_ENV: &str = "DBTOOLKIT_BACKEND_HEALTH_MAX_ATTEMPTS";
pub const PROBE_TIMEOUT_ENV: &str = "DBTOOLKIT_BACKEND_PROBE_TIMEOUT_MS";
pub const STOP_TIMEOUT_ENV: &str = "DBTOOLKIT_BACKEND_STOP_TIMEOUT_MS";

pub const DEFAULT_BACKEND_HOST: &str = "127.0.0.1";
pub const DEFAULT_DEV_BACKEND_PORT: u16 = 8000;
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_ANNOUNCEMENT_LINES: usize = 2_000;
pub const DEFAULT_GRACEFUL_STOP_TIMEOUT_MS: u64 = 5_000;

const STARTUP_TIMEOUT_MIN_MS: u64 = 100;
const STARTUP_TIMEOUT_MAX_MS: u64 = 10 * 60 * 1000;
const HEALTH_INTERVAL_MIN_MS: u64 = 10;
const HEALTH_INTERVAL_MAX_MS: u64 = 10_000;
const HEALTH_MAX_ATTEMPTS_MIN: u64 = 1;
const HEALTH_MAX_ATTEMPTS_MAX: u64 = 10_000;
const PROBE_TIMEOUT_MIN_MS: u64 = 50;
const PROBE_TIMEOUT_MAX_MS: u64 = 30_000;
const STOP_TIMEOUT_MIN_MS: u64 = 0;
const STOP_TIMEOUT_MAX_MS: u64 = 60_000;

/// Everything the supervisor needs to launch and watch one backend.
///
/// `executable: None` means development mode: the backend is managed
/// elsewhere and assumed to listen on `host:dev_port`.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub host: String,
    pub dev_port: u16,
    pub startup_timeout: Duration,
    pub max_announcement_lines: usize,
    pub graceful_stop_timeout: Duration,
    pub health: HealthCheckConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            working_dir: None,
            host: DEFAULT_BACKEND_HOST.to_string(),
            dev_port: DEFAULT_DEV_BACKEND_PORT,
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            max_announcement_lines: DEFAULT_MAX_ANNOUNCEMENT_LINES,
            graceful_stop_timeout: Duration::from_millis(DEFAULT_GRACEFUL_STOP_TIMEOUT_MS),
            health: HealthCheckConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn for_executable(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: Some(executable.into()),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `DBTOOLKIT_*` environment overrides.
    pub fn from_env(resources_dir: Option<&Path>) -> Self {
        let log = |message: String| warn!(category = LogCategory::Startup.as_label(), "{message}");
        let mut config = Self {
            executable: backend_path::resolve_backend_executable(
                BACKEND_PATH_ENV,
                resources_dir,
                log,
            ),
            ..Self::default()
        };

        if let Ok(raw) = env::var(BACKEND_ARGS_ENV) {
            config.args = parse_backend_args(&raw, BACKEND_ARGS_ENV, log);
        }
        config.working_dir = env::var_os(BACKEND_CWD_ENV)
            .map(PathBuf::from)
            .filter(|path| !path.as_os_str().is_empty());
        if let Ok(raw) = env::var(DEV_BACKEND_PORT_ENV) {
            config.dev_port = parse_port_env(&raw, DEV_BACKEND_PORT_ENV, DEFAULT_DEV_BACKEND_PORT, log);
        }

        config.startup_timeout = duration_from_env(
            STARTUP_TIMEOUT_ENV,
            config.startup_timeout,
            STARTUP_TIMEOUT_MIN_MS,
            STARTUP_TIMEOUT_MAX_MS,
            log,
        );
        config.graceful_stop_timeout = duration_from_env(
            STOP_TIMEOUT_ENV,
            config.graceful_stop_timeout,
            STOP_TIMEOUT_MIN_MS,
            STOP_TIMEOUT_MAX_MS,
            log,
        );

        config.health.path = resolve_health_path(HEALTH_PATH_ENV, &config.health.path, log);
        config.health.interval = duration_from_env(
            HEALTH_INTERVAL_ENV,
            config.health.interval,
            HEALTH_INTERVAL_MIN_MS,
            HEALTH_INTERVAL_MAX_MS,
            log,
        );
        config.health.probe_timeout = duration_from_env(
            PROBE_TIMEOUT_ENV,
            config.health.probe_timeout,
            PROBE_TIMEOUT_MIN_MS,
            PROBE_TIMEOUT_MAX_MS,
            log,
        );
        if let Ok(raw) = env::var(HEALTH_MAX_ATTEMPTS_ENV) {
            config.health.max_attempts = parse_clamped_env(
                &raw,
                HEALTH_MAX_ATTEMPTS_ENV,
                u64::from(config.health.max_attempts),
                HEALTH_MAX_ATTEMPTS_MIN,
                HEALTH_MAX_ATTEMPTS_MAX,
                log,
            ) as u32;
        }

        config
    }

    pub fn is_development_mode(&self) -> bool {
        self.executable.is_none()
    }
}

pub fn resolve_health_path<F>(env_name: &str, default_path: &str, mut log: F) -> String
where
    F: FnMut(String),
{
    match env::var_os(env_name) {
        Some(raw) => match raw.to_str() {
            Some(raw_utf8) => normalize_health_path(raw_utf8, env_name, default_path, &mut log),
            None => {
                log(format!(
                    "{env_name} contains non-UTF-8 value '{}', fallback to default '{default_path}'",
                    raw.to_string_lossy()
                ));
                default_path.to_string()
            }
        },
        None => default_path.to_string(),
    }
}

fn normalize_health_path<F>(raw: &str, env_name: &str, default_path: &str, log: &mut F) -> String
where
    F: FnMut(String),
{
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        log(format!(
            "{env_name} is empty/whitespace, fallback to default '{default_path}'"
        ));
        default_path.to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        let normalized = format!("/{trimmed}");
        log(format!(
            "{env_name} is missing leading '/': '{trimmed}', normalized to '{normalized}'"
        ));
        normalized
    }
}

/// Parses a positive integer and clamps it into `[min, max]`.
pub fn parse_clamped_env<F>(
    raw: &str,
    env_name: &str,
    fallback: u64,
    min: u64,
    max: u64,
    mut log: F,
) -> u64
where
    F: FnMut(String),
{
    match raw.trim().parse::<u128>() {
        Ok(parsed) if parsed > 0 || min == 0 => {
            if parsed < min as u128 {
                log(format!(
                    "{env_name}='{raw}' is below minimum {min}, clamped to {min}"
                ));
                min
            } else if parsed > max as u128 {
                log(format!(
                    "{env_name}='{raw}' is above maximum {max}, clamped to {max}"
                ));
                max
            } else {
                parsed as u64
            }
        }
        _ => {
            log(format!("invalid {env_name}='{raw}', fallback to {fallback}"));
            fallback
        }
    }
}

fn duration_from_env<F>(env_name: &str, current: Duration, min_ms: u64, max_ms: u64, log: F) -> Duration
where
    F: FnMut(String),
{
    match env::var(env_name) {
        Ok(raw) => {
            let fallback_ms = u64::try_from(current.as_millis()).unwrap_or(u64::MAX);
            Duration::from_millis(parse_clamped_env(
                &raw,
                env_name,
                fallback_ms,
                min_ms,
                max_ms,
                log,
            ))
        }
        Err(_) => current,
    }
}

fn parse_port_env<F>(raw: &str, env_name: &str, fallback: u16, mut log: F) -> u16
where
    F: FnMut(String),
{
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => port,
        _ => {
            log(format!("invalid {env_name}='{raw}', fallback to {fallback}"));
            fallback
        }
    }
}

pub fn parse_backend_args<F>(raw: &str, env_name: &str, mut log: F) -> Vec<String>
where
    F: FnMut(String),
{
    match shlex::split(raw) {
        Some(args) => args,
        None => {
            log(format!("invalid {env_name}='{raw}', backend starts without arguments"));
            Vec::new()
        }
    }
}
