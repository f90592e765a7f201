use std::{future::Future, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use db_toolkit_desktop::{
    logging::{self, LogCategory},
    BackendSupervisor, SupervisorConfig, SupervisorEvent,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "db-toolkit-supervisor",
    about = "Run the DB Toolkit backend until interrupted"
)]
struct Cli {
    /// Backend executable; overrides DBTOOLKIT_BACKEND_PATH and the packaged binary
    #[arg(long, value_name = "PATH")]
    backend: Option<PathBuf>,

    /// Directory holding the packaged `backend/` resources
    #[arg(long, value_name = "DIR")]
    resources_dir: Option<PathBuf>,

    /// Log file path (defaults to the desktop log location)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Print the ready snapshot as JSON instead of the bare base URL
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_path = cli
        .log_file
        .clone()
        .unwrap_or_else(|| logging::resolve_desktop_log_path(logging::DESKTOP_LOG_FILE));
    let _log_guard = logging::init_logging(Some(log_path.as_path()))
        .with_context(|| format!("failed to initialise logging at {}", log_path.display()))?;

    let mut config = SupervisorConfig::from_env(cli.resources_dir.as_deref());
    if let Some(backend) = cli.backend {
        config.executable = Some(backend);
    }
    if config.is_development_mode() {
        info!(
            category = LogCategory::Startup.as_label(),
            "no backend executable configured; expecting an external backend"
        );
    }

    let supervisor = BackendSupervisor::spawn(config);
    let mut events = supervisor.subscribe();
    let Some(base_url) = start_or_interrupt(&supervisor, interrupt_signal()).await? else {
        return Ok(());
    };

    if cli.json {
        let snapshot = serde_json::to_string(&supervisor.snapshot())
            .context("failed to serialize supervisor snapshot")?;
        println!("{snapshot}");
    } else {
        println!("{base_url}");
    }

    let crashed = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!(category = LogCategory::Shutdown.as_label(), "interrupt received");
            false
        }
        code = wait_for_unexpected_exit(&mut events) => {
            warn!(
                category = LogCategory::Runtime.as_label(),
                ?code,
                "backend exited unexpectedly"
            );
            true
        }
    };

    supervisor.stop().await.context("failed to stop backend")?;
    if crashed {
        anyhow::bail!("backend exited unexpectedly");
    }
    Ok(())
}

/// Starts the backend unless `interrupt` resolves first, in which case the
/// pending start is cancelled through `stop()` and `None` is returned.
async fn start_or_interrupt<F>(supervisor: &BackendSupervisor, interrupt: F) -> Result<Option<String>>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        started = supervisor.start() => {
            started.map(Some).context("backend failed to start")
        }
        signal = interrupt => {
            signal?;
            info!(
                category = LogCategory::Shutdown.as_label(),
                "interrupt received during startup"
            );
            supervisor.stop().await.context("failed to stop backend")?;
            Ok(None)
        }
    }
}

async fn interrupt_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}

async fn wait_for_unexpected_exit(
    events: &mut broadcast::Receiver<SupervisorEvent>,
) -> Option<i32> {
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::BackendExited {
                code,
                unexpected: true,
            }) => return code,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                return std::future::pending().await;
            }
        }
    }
}
