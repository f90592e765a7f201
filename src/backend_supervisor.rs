//! Lifecycle controller for the bundled backend.
//!
//! All transitions run on one task. Commands from [`BackendSupervisor`] handles,
//! output lines, exit notifications, health results and startup timers are
//! serialised through that task's `select!` loop, so no two transitions ever
//! race. Work belonging to an earlier start attempt is tagged with that
//! attempt's epoch and dropped once the epoch moves on.

use std::{future, time::Duration};

use tokio::{
    io::AsyncRead,
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    backend_config::SupervisorConfig,
    backend_http::backend_base_url,
    backend_launch::{self, LaunchPlan, LaunchedBackend, OutputLines},
    backend_readiness::{HealthPoller, StartupAttempt},
    error::SupervisorError,
    logging::LogCategory,
    port_discovery::{PortDiscovery, PortScan},
    process_control,
    supervisor_events::{SupervisorEvent, SupervisorSnapshot},
    supervisor_state::{SupervisorState, SupervisorStateMachine},
};

const COMMAND_CHANNEL_CAPACITY: usize = 16;
const EVENT_CHANNEL_CAPACITY: usize = 64;
const STDOUT_CLOSED_EXIT_GRACE: Duration = Duration::from_secs(2);

type StartReply = oneshot::Sender<Result<String, SupervisorError>>;

enum Command {
    Start { reply: StartReply },
    Stop { reply: oneshot::Sender<()> },
}

#[derive(Debug)]
enum AttemptEvent {
    StdoutLine {
        epoch: u64,
        line: String,
    },
    StdoutClosed {
        epoch: u64,
    },
    Exited {
        epoch: u64,
        code: Option<i32>,
    },
    HealthChecked {
        epoch: u64,
        result: Result<StartupAttempt, SupervisorError>,
    },
}

impl AttemptEvent {
    fn epoch(&self) -> u64 {
        match self {
            Self::StdoutLine { epoch, .. }
            | Self::StdoutClosed { epoch }
            | Self::Exited { epoch, .. }
            | Self::HealthChecked { epoch, .. } => *epoch,
        }
    }
}

/// The live backend of the current lifecycle. Owned by the controller task.
#[derive(Debug)]
struct BackendHandle {
    epoch: u64,
    pid: Option<u32>,
    port: Option<u16>,
    base_url: Option<String>,
    discovery: PortDiscovery,
    force_kill: Option<oneshot::Sender<()>>,
    health_task: Option<JoinHandle<()>>,
    exited: bool,
}

impl BackendHandle {
    fn spawned(epoch: u64, pid: u32, force_kill: oneshot::Sender<()>, max_lines: usize) -> Self {
        Self {
            epoch,
            pid: Some(pid),
            port: None,
            base_url: None,
            discovery: PortDiscovery::new(max_lines),
            force_kill: Some(force_kill),
            health_task: None,
            exited: false,
        }
    }

    /// A backend managed outside this process (development mode).
    fn external(epoch: u64, port: u16, base_url: String) -> Self {
        Self {
            epoch,
            pid: None,
            port: Some(port),
            base_url: Some(base_url),
            discovery: PortDiscovery::new(1),
            force_kill: None,
            health_task: None,
            exited: false,
        }
    }
}

/// Cloneable handle to a backend lifecycle controller.
///
/// Must be created inside a Tokio runtime. The controller task ends, stopping
/// any backend it still owns, once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct BackendSupervisor {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SupervisorSnapshot>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start { .. } => f.write_str("Start"),
            Self::Stop { .. } => f.write_str("Stop"),
        }
    }
}

impl BackendSupervisor {
    pub fn spawn(config: SupervisorConfig) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot) = watch::channel(SupervisorSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (controller, attempt_rx) =
            LifecycleController::new(config, snapshot_tx, events.clone());
        tokio::spawn(controller.run(command_rx, attempt_rx));
        Self {
            commands,
            snapshot,
            events,
        }
    }

    /// Launches the backend and resolves with its base URL once healthy.
    pub async fn start(&self) -> Result<String, SupervisorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Start { reply })
            .await
            .map_err(|_| SupervisorError::SupervisorClosed)?;
        response
            .await
            .map_err(|_| SupervisorError::SupervisorClosed)?
    }

    /// Terminates the backend and returns to `Idle`. Idempotent.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Stop { reply })
            .await
            .map_err(|_| SupervisorError::SupervisorClosed)?;
        response.await.map_err(|_| SupervisorError::SupervisorClosed)
    }

    /// The backend base URL, available only in `Ready`.
    pub fn base_url(&self) -> Option<String> {
        self.snapshot.borrow().ready_base_url().map(str::to_string)
    }

    pub fn state(&self) -> SupervisorState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }
}

struct LifecycleController {
    config: SupervisorConfig,
    machine: SupervisorStateMachine,
    handle: Option<BackendHandle>,
    pending_start: Option<StartReply>,
    startup_deadline: Option<Instant>,
    exit_grace_deadline: Option<Instant>,
    attempt_tx: mpsc::UnboundedSender<AttemptEvent>,
    snapshot: watch::Sender<SupervisorSnapshot>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl LifecycleController {
    fn new(
        config: SupervisorConfig,
        snapshot: watch::Sender<SupervisorSnapshot>,
        events: broadcast::Sender<SupervisorEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<AttemptEvent>) {
        let (attempt_tx, attempt_rx) = mpsc::unbounded_channel();
        let controller = Self {
            config,
            machine: SupervisorStateMachine::default(),
            handle: None,
            pending_start: None,
            startup_deadline: None,
            exit_grace_deadline: None,
            attempt_tx,
            snapshot,
            events,
        };
        (controller, attempt_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut attempts: mpsc::UnboundedReceiver<AttemptEvent>,
    ) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start { reply }) => self.handle_start(reply),
                    Some(Command::Stop { reply }) => {
                        self.handle_stop(&mut attempts).await;
                        let _ = reply.send(());
                    }
                    None => break,
                },
                Some(event) = attempts.recv() => self.handle_attempt_event(event, &mut attempts).await,
                _ = sleep_until_optional(deadline) => self.handle_deadline(&mut attempts).await,
            }
        }

        debug!(
            category = LogCategory::Shutdown.as_label(),
            "all supervisor handles dropped, stopping backend"
        );
        self.handle_stop(&mut attempts).await;
    }

    fn handle_start(&mut self, reply: StartReply) {
        let previous = self.machine.state();
        let Some(epoch) = self.machine.try_begin_start() else {
            let _ = reply.send(Err(SupervisorError::InvalidState {
                operation: "start",
                state: previous,
            }));
            return;
        };
        if previous == SupervisorState::Failed {
            self.publish_state_change(SupervisorState::Idle);
        }

        let Some(executable) = self.config.executable.clone() else {
            let port = self.config.dev_port;
            let base_url = backend_base_url(&self.config.host, port);
            info!(
                category = LogCategory::Startup.as_label(),
                base_url, "development mode: using externally managed backend"
            );
            self.handle = Some(BackendHandle::external(epoch, port, base_url.clone()));
            self.publish();
            self.machine.mark_ready(epoch);
            self.publish();
            let _ = reply.send(Ok(base_url));
            return;
        };

        let plan = LaunchPlan {
            executable,
            args: self.config.args.clone(),
            cwd: self.config.working_dir.clone(),
        };
        let launched = match backend_launch::launch_backend(&plan) {
            Ok(launched) => launched,
            Err(error) => {
                warn!(
                    category = LogCategory::Startup.as_label(),
                    %error,
                    "backend launch failed"
                );
                self.machine.mark_failed(epoch);
                self.publish();
                let _ = reply.send(Err(error));
                return;
            }
        };

        let LaunchedBackend {
            pid,
            stdout,
            stderr,
            child,
        } = launched;
        spawn_stdout_forwarder(epoch, pid, stdout, self.attempt_tx.clone());
        spawn_stderr_logger(pid, stderr);
        let exit_tx = self.attempt_tx.clone();
        let force_kill = backend_launch::spawn_exit_watcher(child, move |code| {
            let _ = exit_tx.send(AttemptEvent::Exited { epoch, code });
        });

        self.handle = Some(BackendHandle::spawned(
            epoch,
            pid,
            force_kill,
            self.config.max_announcement_lines,
        ));
        self.pending_start = Some(reply);
        self.startup_deadline = Some(Instant::now() + self.config.startup_timeout);
        self.exit_grace_deadline = None;
        self.publish();
    }

    async fn handle_stop(&mut self, attempts: &mut mpsc::UnboundedReceiver<AttemptEvent>) {
        match self.machine.state() {
            SupervisorState::Idle | SupervisorState::Stopping => {
                debug!(
                    category = LogCategory::Shutdown.as_label(),
                    "stop requested with no backend running"
                );
                return;
            }
            SupervisorState::Failed => {
                self.machine.reset_failed();
                self.publish();
                return;
            }
            SupervisorState::Starting | SupervisorState::Ready => {}
        }

        self.machine.try_begin_stop();
        self.clear_deadlines();
        self.publish();
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(SupervisorError::StartCancelled));
        }

        if let Some(handle) = self.handle.as_mut() {
            info!(
                category = LogCategory::Shutdown.as_label(),
                pid = ?handle.pid,
                "stopping backend"
            );
            let code = terminate_backend(handle, self.config.graceful_stop_timeout, attempts).await;
            if let Some(code) = code {
                self.emit(SupervisorEvent::BackendExited {
                    code,
                    unexpected: false,
                });
            }
        }
        self.handle = None;
        self.machine.finish_stop();
        self.publish();
    }

    async fn handle_attempt_event(
        &mut self,
        event: AttemptEvent,
        attempts: &mut mpsc::UnboundedReceiver<AttemptEvent>,
    ) {
        if !self.is_current_attempt(event.epoch()) {
            if let AttemptEvent::StdoutLine { .. } = event {
                return;
            }
            debug!(
                category = LogCategory::Runtime.as_label(),
                ?event,
                current_epoch = self.machine.epoch(),
                "discarding event from a previous backend attempt"
            );
            return;
        }

        match event {
            AttemptEvent::StdoutLine { line, .. } => {
                if let Some(error) = self.observe_stdout_line(&line) {
                    self.fail_start(error, attempts).await;
                }
            }
            AttemptEvent::StdoutClosed { .. } => {
                let port_known = self.handle.as_ref().is_some_and(|handle| handle.port.is_some());
                if !port_known && self.machine.state() == SupervisorState::Starting {
                    debug!(
                        category = LogCategory::Startup.as_label(),
                        "backend stdout closed before a port announcement"
                    );
                    self.exit_grace_deadline = Some(Instant::now() + STDOUT_CLOSED_EXIT_GRACE);
                }
            }
            AttemptEvent::Exited { code, .. } => {
                if let Some(handle) = self.handle.as_mut() {
                    handle.exited = true;
                }
                self.handle_backend_exit(code, attempts).await;
            }
            AttemptEvent::HealthChecked { epoch, result } => match result {
                Ok(attempt) => self.finish_start(epoch, attempt),
                Err(error) => self.fail_start(error, attempts).await,
            },
        }
    }

    /// Feeds one stdout line to port discovery; returns an error when the
    /// announcement budget is exhausted.
    fn observe_stdout_line(&mut self, line: &str) -> Option<SupervisorError> {
        let handle = self.handle.as_mut()?;
        match handle.discovery.observe(line) {
            PortScan::Discovered(port) => {
                let base_url = backend_base_url(&self.config.host, port);
                info!(
                    category = LogCategory::Startup.as_label(),
                    port, base_url, "backend announced port"
                );
                handle.port = Some(port);
                handle.base_url = Some(base_url.clone());

                let poller = HealthPoller::new(self.config.health.clone());
                let tx = self.attempt_tx.clone();
                let epoch = handle.epoch;
                handle.health_task = Some(tokio::spawn(async move {
                    let result = poller.wait_until_healthy(&base_url).await;
                    let _ = tx.send(AttemptEvent::HealthChecked { epoch, result });
                }));

                self.clear_deadlines();
                self.publish();
                self.emit(SupervisorEvent::PortDiscovered { port });
                None
            }
            PortScan::Ignored {
                announced: Some(announced),
            } if handle.port != Some(announced) => {
                warn!(
                    category = LogCategory::Runtime.as_label(),
                    recorded_port = ?handle.port,
                    announced,
                    "backend announced a second port; keeping the first"
                );
                None
            }
            PortScan::Ignored { .. } | PortScan::Pending => None,
            PortScan::Exhausted { lines_seen } => {
                Some(SupervisorError::PortAnnouncementMissing { lines_seen })
            }
        }
    }

    async fn handle_backend_exit(
        &mut self,
        code: Option<i32>,
        attempts: &mut mpsc::UnboundedReceiver<AttemptEvent>,
    ) {
        match self.machine.state() {
            SupervisorState::Starting => {
                self.emit(SupervisorEvent::BackendExited {
                    code,
                    unexpected: false,
                });
                self.fail_start(SupervisorError::PrematureExit { code }, attempts)
                    .await;
            }
            SupervisorState::Ready => {
                warn!(
                    category = LogCategory::Runtime.as_label(),
                    ?code,
                    "backend exited unexpectedly after becoming ready"
                );
                self.emit(SupervisorEvent::BackendExited {
                    code,
                    unexpected: true,
                });
                let epoch = self.machine.epoch();
                self.machine.mark_failed(epoch);
                self.handle = None;
                self.publish();
            }
            _ => {}
        }
    }

    async fn handle_deadline(&mut self, attempts: &mut mpsc::UnboundedReceiver<AttemptEvent>) {
        let now = Instant::now();
        if self.exit_grace_deadline.is_some_and(|deadline| deadline <= now) {
            let lines_seen = self
                .handle
                .as_ref()
                .map_or(0, |handle| handle.discovery.lines_seen());
            self.fail_start(
                SupervisorError::PortAnnouncementMissing { lines_seen },
                attempts,
            )
            .await;
        } else if self.startup_deadline.is_some_and(|deadline| deadline <= now) {
            self.fail_start(
                SupervisorError::StartupTimedOut {
                    timeout: self.config.startup_timeout,
                },
                attempts,
            )
            .await;
        }
    }

    fn finish_start(&mut self, epoch: u64, attempt: StartupAttempt) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        handle.health_task = None;
        let Some(base_url) = handle.base_url.clone() else {
            return;
        };
        if !self.machine.mark_ready(epoch) {
            return;
        }
        info!(
            category = LogCategory::Startup.as_label(),
            base_url,
            pid = ?handle.pid,
            attempts = attempt.attempts,
            "backend is ready"
        );
        self.publish();
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Ok(base_url));
        }
    }

    /// Moves to `Failed`, terminates the process and settles the pending start.
    async fn fail_start(
        &mut self,
        error: SupervisorError,
        attempts: &mut mpsc::UnboundedReceiver<AttemptEvent>,
    ) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        if !self.machine.mark_failed(handle.epoch) {
            self.handle = Some(handle);
            return;
        }
        warn!(
            category = LogCategory::Startup.as_label(),
            %error,
            pid = ?handle.pid,
            "backend start failed"
        );
        self.clear_deadlines();
        self.publish();

        if let Some(code) =
            terminate_backend(&mut handle, self.config.graceful_stop_timeout, attempts).await
        {
            self.emit(SupervisorEvent::BackendExited {
                code,
                unexpected: false,
            });
        }
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(error));
        }
    }

    fn is_current_attempt(&self, epoch: u64) -> bool {
        self.machine.is_current(epoch)
            && self
                .handle
                .as_ref()
                .is_some_and(|handle| handle.epoch == epoch)
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.startup_deadline, self.exit_grace_deadline) {
            (Some(startup), Some(grace)) => Some(startup.min(grace)),
            (startup, grace) => startup.or(grace),
        }
    }

    fn clear_deadlines(&mut self) {
        self.startup_deadline = None;
        self.exit_grace_deadline = None;
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_state_change(&self, state: SupervisorState) {
        self.emit(SupervisorEvent::StateChanged { state });
    }

    fn publish(&self) {
        debug_assert_eq!(
            self.handle.is_some(),
            self.machine.state().holds_handle(),
            "backend handle out of step with state {}",
            self.machine.state()
        );
        let next = SupervisorSnapshot {
            state: self.machine.state(),
            base_url: self
                .handle
                .as_ref()
                .and_then(|handle| handle.base_url.clone()),
            pid: self.handle.as_ref().and_then(|handle| handle.pid),
            port: self.handle.as_ref().and_then(|handle| handle.port),
        };
        let previous = self.snapshot.send_replace(next);
        if previous.state != self.machine.state() {
            debug!(
                category = LogCategory::Runtime.as_label(),
                from = %previous.state,
                to = %self.machine.state(),
                "supervisor state changed"
            );
            self.publish_state_change(self.machine.state());
        }
    }
}

/// Stops the handle's process, gracefully first. Returns the exit code when
/// an exit was observed during this call.
async fn terminate_backend(
    handle: &mut BackendHandle,
    graceful_timeout: Duration,
    attempts: &mut mpsc::UnboundedReceiver<AttemptEvent>,
) -> Option<Option<i32>> {
    if let Some(task) = handle.health_task.take() {
        task.abort();
    }
    let pid = handle.pid?;
    if handle.exited {
        return None;
    }

    let graceful_status = process_control::request_graceful_stop(pid).await;
    let graceful_wait = process_control::resolve_graceful_wait_timeout(
        pid,
        graceful_timeout,
        process_control::graceful_wait_cap(graceful_timeout),
        &graceful_status,
        process_control::GRACEFUL_STOP_LABEL,
    );
    if let Some(code) = wait_for_exit(handle.epoch, graceful_wait, attempts).await {
        handle.exited = true;
        return Some(code);
    }

    if let Some(force_kill) = handle.force_kill.take() {
        let _ = force_kill.send(());
    }
    let followup_wait = process_control::compute_followup_wait(
        graceful_timeout,
        process_control::max_force_stop_wait(),
    )
    .max(Duration::from_millis(200));
    warn!(
        category = LogCategory::Shutdown.as_label(),
        pid,
        graceful_wait_ms = graceful_wait.as_millis() as u64,
        followup_wait_ms = followup_wait.as_millis() as u64,
        "backend graceful stop timed out, force-kill issued"
    );
    let code = wait_for_exit(handle.epoch, followup_wait, attempts).await;
    if code.is_some() {
        handle.exited = true;
    } else {
        warn!(
            category = LogCategory::Shutdown.as_label(),
            pid, "backend exit was not observed after force-kill"
        );
    }
    code
}

async fn wait_for_exit(
    epoch: u64,
    timeout: Duration,
    attempts: &mut mpsc::UnboundedReceiver<AttemptEvent>,
) -> Option<Option<i32>> {
    let deadline = Instant::now() + timeout;
    loop {
        match time::timeout_at(deadline, attempts.recv()).await {
            Ok(Some(AttemptEvent::Exited {
                epoch: exited_epoch,
                code,
            })) if exited_epoch == epoch => return Some(code),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

async fn sleep_until_optional(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

fn spawn_stdout_forwarder<R>(
    epoch: u64,
    pid: u32,
    mut lines: OutputLines<R>,
    tx: mpsc::UnboundedSender<AttemptEvent>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!(target: "backend", pid, "{line}");
                    if tx.send(AttemptEvent::StdoutLine { epoch, line }).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(
                        category = LogCategory::Runtime.as_label(),
                        pid,
                        %error,
                        "failed to read backend stdout"
                    );
                    break;
                }
            }
        }
        let _ = tx.send(AttemptEvent::StdoutClosed { epoch });
    });
}

fn spawn_stderr_logger<R>(pid: u32, mut lines: OutputLines<R>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => warn!(target: "backend", pid, "{line}"),
                Ok(None) => break,
                Err(error) => {
                    warn!(
                        category = LogCategory::Runtime.as_label(),
                        pid,
                        %error,
                        "failed to read backend stderr"
                    );
                    break;
                }
            }
        }
    });
}
