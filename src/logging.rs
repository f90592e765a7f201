use std::{
    env,
    ffi::OsString,
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

pub const LOG_FILTER_ENV: &str = "DBTOOLKIT_LOG";
pub const DESKTOP_LOG_PATH_ENV: &str = "DBTOOLKIT_DESKTOP_LOG_PATH";
pub const DESKTOP_ROOT_ENV: &str = "DBTOOLKIT_ROOT";
pub const DESKTOP_LOG_FILE: &str = "desktop.log";
pub const DESKTOP_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;
pub const LOG_BACKUP_COUNT: usize = 5;
const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %z";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Startup,
    Runtime,
    Shutdown,
}

impl LogCategory {
    pub fn as_label(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Runtime => "runtime",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Installs the global subscriber: stderr always, plus `log_path` when given.
///
/// Keep the returned guard alive for as long as file output should be flushed.
pub fn init_logging(log_path: Option<&Path>) -> io::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_timer(ChronoLocal::new(LOG_TIMESTAMP_FORMAT.to_string()));

    let (file_layer, guard) = match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            rotate_log_if_needed(path, DESKTOP_LOG_MAX_BYTES, LOG_BACKUP_COUNT, "desktop");
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(ChronoLocal::new(LOG_TIMESTAMP_FORMAT.to_string()));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|error| io::Error::other(format!("failed to install log subscriber: {error}")))?;
    Ok(guard)
}

pub fn resolve_desktop_log_path(desktop_log_file: &str) -> PathBuf {
    if let Ok(custom) = env::var(DESKTOP_LOG_PATH_ENV) {
        let candidate = PathBuf::from(custom.trim());
        if !candidate.as_os_str().is_empty() {
            return candidate;
        }
    }

    if let Ok(root) = env::var(DESKTOP_ROOT_ENV) {
        let root = PathBuf::from(root.trim());
        if !root.as_os_str().is_empty() {
            return root.join("logs").join(desktop_log_file);
        }
    }

    env::temp_dir()
        .join("db-toolkit")
        .join("logs")
        .join(desktop_log_file)
}

/// Shifts `path` to `path.1`, `path.1` to `path.2` and so on once it reaches
/// `max_bytes`, dropping anything past `backup_count`.
pub fn rotate_log_if_needed(path: &Path, max_bytes: u64, backup_count: usize, log_scope: &str) {
    if max_bytes == 0 || backup_count == 0 {
        return;
    }

    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(error) => {
            if error.kind() != io::ErrorKind::NotFound {
                eprintln!(
                    "[log rotation:{log_scope}] failed to read metadata for {}: {}",
                    path.display(),
                    error
                );
            }
            return;
        }
    };
    if metadata.len() < max_bytes {
        return;
    }

    let oldest = rotated_log_path(path, backup_count);
    remove_if_present(&oldest, log_scope);

    for index in (1..backup_count).rev() {
        let source = rotated_log_path(path, index);
        if !source.exists() {
            continue;
        }
        let target = rotated_log_path(path, index + 1);
        remove_if_present(&target, log_scope);
        if let Err(error) = fs::rename(&source, &target) {
            eprintln!(
                "[log rotation:{log_scope}] failed to rename {} to {}: {}",
                source.display(),
                target.display(),
                error
            );
        }
    }

    let rotated = rotated_log_path(path, 1);
    remove_if_present(&rotated, log_scope);
    if let Err(error) = fs::rename(path, &rotated) {
        eprintln!(
            "[log rotation:{log_scope}] failed to rotate {} to {}: {}",
            path.display(),
            rotated.display(),
            error
        );
    }
}

fn remove_if_present(path: &Path, log_scope: &str) {
    if let Err(error) = fs::remove_file(path) {
        if error.kind() != io::ErrorKind::NotFound {
            eprintln!(
                "[log rotation:{log_scope}] failed to remove backup {}: {}",
                path.display(),
                error
            );
        }
    }
}

fn rotated_log_path(path: &Path, index: usize) -> PathBuf {
    let mut value = OsString::from(path.as_os_str());
    value.push(format!(".{index}"));
    PathBuf::from(value)
}
