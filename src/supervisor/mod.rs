//! Child-process supervisor for one external MCP tool server.
//!
//! `start()` launches a run loop that owns the child for its whole life:
//! spawn, stream output, wait for exit, decide (via `Lifecycle`) whether to
//! respawn, and tear down on `stop()`. The loop releases its slot only after
//! the OS-level process is gone, so `start()` during teardown still reports
//! "already running".

pub mod lifecycle;
pub mod output;
mod watchdog;

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventSink, Topic};
use lifecycle::{ExitDecision, Lifecycle, ProcessState};
use output::{OutputLine, OutputRingBuffer};

/// Substrings that mark a child as up and serving.
pub const STARTUP_MARKERS: [&str; 3] = ["Server started", "listening", "Uvicorn running on"];

const OUTPUT_CAPACITY: usize = 200;
const STATUS_OUTPUT_LINES: usize = 50;
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_RUN: AtomicU64 = AtomicU64::new(1);

/// Value snapshot returned by `ProcessSupervisor::status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub server_id: Uuid,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub port: u16,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub recent_output: Vec<OutputLine>,
}

struct RunHandle {
    id: u64,
    stop: CancellationToken,
    finished: CancellationToken,
}

struct Inner {
    server_id: Uuid,
    config: SupervisorConfig,
    events: EventSink,
    http: reqwest::Client,
    lifecycle: Mutex<Lifecycle>,
    run: Mutex<Option<RunHandle>>,
    pid: Mutex<Option<u32>>,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
    output: OutputRingBuffer,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, events: EventSink) -> Self {
        let max_restarts = config.max_restarts;
        Self {
            inner: Arc::new(Inner {
                server_id: Uuid::new_v4(),
                config,
                events,
                http: reqwest::Client::new(),
                lifecycle: Mutex::new(Lifecycle::new(max_restarts)),
                run: Mutex::new(None),
                pid: Mutex::new(None),
                last_health_check: Mutex::new(None),
                output: OutputRingBuffer::new(OUTPUT_CAPACITY),
            }),
        }
    }

    pub fn server_id(&self) -> Uuid {
        self.inner.server_id
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ProcessState {
        self.inner.lifecycle().state()
    }

    /// Launch the process. Fails if a run loop (or its teardown) is active.
    pub fn start(&self) -> BridgeResult<()> {
        self.inner.config.validate()?;

        let mut run = self.inner.run.lock().unwrap_or_else(|p| p.into_inner());
        if run.is_some() {
            return Err(BridgeError::AlreadyRunning { server_id: self.inner.server_id });
        }

        self.inner.lifecycle().begin();
        self.inner.output.clear();

        let handle = RunHandle {
            id: NEXT_RUN.fetch_add(1, Ordering::Relaxed),
            stop: CancellationToken::new(),
            finished: CancellationToken::new(),
        };
        tracing::info!(
            "supervisor: starting {} ({} {})",
            self.inner.server_id,
            self.inner.config.command,
            self.inner.config.build_args().join(" ")
        );
        tokio::spawn(run_loop(
            Arc::clone(&self.inner),
            handle.id,
            handle.stop.clone(),
            handle.finished.clone(),
        ));
        *run = Some(handle);
        Ok(())
    }

    /// Request termination. The state flips to stopped immediately; the OS
    /// process is terminated in the background (SIGTERM, then kill).
    pub fn stop(&self) -> BridgeResult<()> {
        let run = self.inner.run.lock().unwrap_or_else(|p| p.into_inner());
        match run.as_ref() {
            Some(handle) if !handle.stop.is_cancelled() => {
                self.inner.lifecycle().stop_requested();
                handle.stop.cancel();
                tracing::info!("supervisor: stop requested for {}", self.inner.server_id);
                Ok(())
            }
            _ => Err(BridgeError::NotRunning { server_id: self.inner.server_id }),
        }
    }

    /// Stop (if running), wait for the OS-level teardown, then start again.
    pub async fn restart(&self) -> BridgeResult<()> {
        self.shutdown().await;
        self.start()
    }

    /// Stop if running and wait until the process is gone.
    pub async fn shutdown(&self) {
        match self.stop() {
            Ok(()) | Err(BridgeError::NotRunning { .. }) => {}
            Err(e) => tracing::warn!("supervisor: stop failed: {}", e),
        }
        self.wait_idle().await;
    }

    /// Resolves once no run loop is active (immediately if none is).
    pub async fn wait_idle(&self) {
        let finished = {
            let run = self.inner.run.lock().unwrap_or_else(|p| p.into_inner());
            run.as_ref().map(|h| h.finished.clone())
        };
        if let Some(finished) = finished {
            finished.cancelled().await;
        }
    }

    pub fn status(&self) -> SupervisorStatus {
        let (state, restart_count, max_restarts) = {
            let lc = self.inner.lifecycle();
            (lc.state(), lc.restart_count(), lc.max_restarts())
        };
        SupervisorStatus {
            server_id: self.inner.server_id,
            state,
            pid: *self.inner.pid.lock().unwrap_or_else(|p| p.into_inner()),
            port: self.inner.config.port,
            restart_count,
            max_restarts,
            last_health_check_at: *self.inner.last_health_check.lock().unwrap_or_else(|p| p.into_inner()),
            recent_output: self.inner.output.recent(STATUS_OUTPUT_LINES),
        }
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn spawn_child(&self) -> BridgeResult<Child> {
        let config = &self.config;
        let port = config.port.to_string();

        let mut cmd = Command::new(&config.command);
        cmd.args(config.build_args())
            .envs(&config.env)
            .env("MCP_PORT", &port)
            .env("PORT", &port)
            .env("MCP_SERVER_NAME", &config.server_name)
            .env("MCP_SERVER_ID", self.server_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        cmd.spawn().map_err(|e| BridgeError::Spawn {
            command: config.command.clone(),
            reason: e.to_string(),
        })
    }

    fn on_line(self: &Arc<Self>, topic: Topic, line: &str, child_token: &CancellationToken) {
        self.output.push(topic.as_str(), line);
        self.events.emit(topic, json!({ "serverId": self.server_id, "line": line }));

        if !STARTUP_MARKERS.iter().any(|m| line.contains(m)) {
            return;
        }
        if !self.lifecycle().startup_marker() {
            return;
        }

        let pid = *self.pid.lock().unwrap_or_else(|p| p.into_inner());
        tracing::info!("supervisor: {} is running (pid {:?})", self.server_id, pid);
        self.events.emit(
            Topic::Started,
            json!({ "serverId": self.server_id, "pid": pid, "port": self.config.port }),
        );
        if self.config.health_check {
            watchdog::spawn(Arc::clone(self), child_token.clone());
        }
    }

    /// SIGTERM, then a forced kill once the grace window has passed.
    async fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        send_terminate(child);
        let grace = self.config.stop_grace();
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(
                    "supervisor: {} ignored SIGTERM for {}ms, killing",
                    self.server_id,
                    grace.as_millis()
                );
                child.kill().await?;
                child.wait().await
            }
        }
    }
}

// ── Run loop ────────────────────────────────────────────────────────────────

async fn run_loop(inner: Arc<Inner>, run_id: u64, stop: CancellationToken, finished: CancellationToken) {
    loop {
        let mut child = match inner.spawn_child() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("supervisor: {}", e);
                inner.lifecycle().spawn_failed();
                inner.events.emit(
                    Topic::Error,
                    json!({ "serverId": inner.server_id, "message": e.to_string() }),
                );
                break;
            }
        };
        *inner.pid.lock().unwrap_or_else(|p| p.into_inner()) = child.id();
        tracing::info!("supervisor: {} spawned (pid {:?})", inner.server_id, child.id());

        let child_token = stop.child_token();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(
                Arc::clone(&inner),
                stdout,
                Topic::Stdout,
                child_token.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(
                Arc::clone(&inner),
                stderr,
                Topic::Stderr,
                child_token.clone(),
            )));
        }

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = stop.cancelled() => None,
        };
        let status = match exited {
            Some(status) => status,
            None => inner.terminate(&mut child).await,
        };
        child_token.cancel();

        // Deliver every output line before the exit event.
        for reader in readers {
            let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await;
        }
        *inner.pid.lock().unwrap_or_else(|p| p.into_inner()) = None;

        let (code, signal) = match &status {
            Ok(status) => exit_parts(status),
            Err(e) => {
                tracing::error!("supervisor: waiting on {} failed: {}", inner.server_id, e);
                (None, None)
            }
        };

        let (decision, restart_count) = {
            let mut lc = inner.lifecycle();
            let decision = lc.exited(code);
            (decision, lc.restart_count())
        };
        inner.events.emit(
            Topic::Exit,
            json!({
                "serverId": inner.server_id,
                "code": code,
                "signal": signal,
                "restartCount": restart_count,
            }),
        );

        match decision {
            ExitDecision::Restart { attempt } => {
                let delay = inner.config.restart_delay();
                tracing::warn!(
                    "supervisor: {} exited (code {:?}, signal {:?}), restart {}/{} in {}ms",
                    inner.server_id,
                    code,
                    signal,
                    attempt,
                    inner.config.max_restarts,
                    delay.as_millis()
                );
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                inner.lifecycle().respawn();
            }
            ExitDecision::Settle(ProcessState::Error) => {
                tracing::error!(
                    "supervisor: {} exited (code {:?}, signal {:?}) with no restarts left",
                    inner.server_id,
                    code,
                    signal
                );
                break;
            }
            ExitDecision::Settle(state) => {
                tracing::info!("supervisor: {} {}", inner.server_id, state.as_str());
                break;
            }
        }
    }

    {
        let mut run = inner.run.lock().unwrap_or_else(|p| p.into_inner());
        if run.as_ref().is_some_and(|h| h.id == run_id) {
            *run = None;
        }
    }
    finished.cancel();
}

async fn read_lines<R>(inner: Arc<Inner>, source: R, topic: Topic, child_token: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                inner.on_line(topic, line, &child_token);
            }
            Err(e) => {
                tracing::debug!("supervisor: {} read error: {}", topic, e);
                break;
            }
        }
    }
}

fn exit_parts(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!("supervisor: SIGTERM to {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("supervisor: kill failed: {}", e);
    }
}
