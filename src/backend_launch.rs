use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::oneshot,
};
use tracing::{info, warn};

use crate::{error::SupervisorError, logging::LogCategory};

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(target_os = "windows")]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl LaunchPlan {
    pub fn debug_command(&self) -> Vec<String> {
        std::iter::once(self.executable.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Newline-delimited output of a child stream.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the stream,
/// so the pipe keeps draining whatever the backend writes.
#[derive(Debug)]
pub struct OutputLines<R> {
    reader: BufReader<R>,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buffer: Vec::new(),
        }
    }

    /// The next line without its `\n` / `\r\n` terminator, or `None` at EOF.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.buffer.clear();
        if self.reader.read_until(b'\n', &mut self.buffer).await? == 0 {
            return Ok(None);
        }
        if self.buffer.last() == Some(&b'\n') {
            self.buffer.pop();
            if self.buffer.last() == Some(&b'\r') {
                self.buffer.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buffer).into_owned()))
    }
}

/// A freshly spawned backend with its output split into line streams.
pub struct LaunchedBackend {
    pub pid: u32,
    pub stdout: OutputLines<ChildStdout>,
    pub stderr: OutputLines<ChildStderr>,
    pub child: Child,
}

pub fn launch_backend(plan: &LaunchPlan) -> Result<LaunchedBackend, SupervisorError> {
    ensure_executable_exists(&plan.executable)?;

    let mut command = Command::new(&plan.executable);
    command
        .args(&plan.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env("PYTHONUNBUFFERED", "1");
    if let Some(cwd) = &plan.cwd {
        command.current_dir(cwd);
    }
    #[cfg(target_os = "windows")]
    {
        command.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
    }

    let spawn_failed = |message: String| SupervisorError::SpawnFailed {
        path: plan.executable.clone(),
        message,
    };
    let mut child = command.spawn().map_err(|error| {
        spawn_failed(format!(
            "command {:?} could not be started: {error}",
            plan.debug_command()
        ))
    })?;
    let pid = child
        .id()
        .ok_or_else(|| spawn_failed("process exited before its pid was read".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_failed("stdout was not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| spawn_failed("stderr was not captured".to_string()))?;

    info!(
        category = LogCategory::Startup.as_label(),
        pid,
        cmd = ?plan.debug_command(),
        "spawned backend"
    );

    Ok(LaunchedBackend {
        pid,
        stdout: OutputLines::new(stdout),
        stderr: OutputLines::new(stderr),
        child,
    })
}

fn ensure_executable_exists(path: &Path) -> Result<(), SupervisorError> {
    if path.exists() {
        Ok(())
    } else {
        Err(SupervisorError::ExecutableNotFound {
            path: path.to_path_buf(),
        })
    }
}

/// Moves `child` into a task that reports its exit code through `on_exit`.
///
/// Sending on the returned channel force-kills the process; the exit is still
/// reported afterwards.
pub fn spawn_exit_watcher<F>(mut child: Child, on_exit: F) -> oneshot::Sender<()>
where
    F: FnOnce(Option<i32>) + Send + 'static,
{
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let pid = child.id();
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = kill_rx => {
                if let Err(error) = child.start_kill() {
                    warn!(
                        category = LogCategory::Shutdown.as_label(),
                        ?pid,
                        %error,
                        "failed to force-kill backend"
                    );
                }
                child.wait().await
            }
        };
        let code = match status {
            Ok(status) => {
                info!(
                    category = LogCategory::Runtime.as_label(),
                    ?pid,
                    %status,
                    "backend process exited"
                );
                status.code()
            }
            Err(error) => {
                warn!(
                    category = LogCategory::Runtime.as_label(),
                    ?pid,
                    %error,
                    "failed to wait for backend process"
                );
                None
            }
        };
        on_exit(code);
    });
    kill_tx
}
