use std::{
    net::TcpListener as StdTcpListener,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task::JoinHandle,
};

use crate::{backend_config::SupervisorConfig, backend_http::backend_base_url};

/// Minimal HTTP server answering every request with a fixed status, after an
/// optional number of `503` replies.
pub struct HealthServer {
    port: u16,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl HealthServer {
    pub async fn start(status: u16) -> Self {
        Self::start_with_failures(status, 0).await
    }

    pub async fn start_with_failures(status: u16, failures: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind health server");
        let port = listener.local_addr().expect("health server addr").port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let hit = counter.fetch_add(1, Ordering::SeqCst);
                let reply_status = if hit < failures { 503 } else { status };
                tokio::spawn(async move {
                    let mut buffer = [0u8; 1024];
                    let _ = stream.read(&mut buffer).await;
                    let response = format!(
                        "HTTP/1.1 {reply_status} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        Self { port, hits, task }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        backend_base_url("127.0.0.1", self.port)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for HealthServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A loopback port that was free a moment ago.
pub fn unused_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind probe port");
    listener.local_addr().expect("probe addr").port()
}

/// Writes a `/bin/sh` script standing in for the backend executable.
pub fn write_backend_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-backend.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake backend");
    path
}

/// Config running `script` through `/bin/sh` with short test timings.
pub fn script_config(script: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig::for_executable("/bin/sh");
    config.args = vec![script.display().to_string()];
    config.startup_timeout = Duration::from_secs(5);
    config.graceful_stop_timeout = Duration::from_secs(2);
    config.health.interval = Duration::from_millis(50);
    config.health.probe_timeout = Duration::from_millis(300);
    config.health.max_attempts = 20;
    config
}
