use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::output::{PortConflictDetector, RecentOutput};
use crate::config::BackendConfig;
use crate::error::StartupFailure;

/// How long an exit report waits for the output readers to drain
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const RECENT_OUTPUT_LINES: usize = 200;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Lifecycle of the supervised backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Signals raised by the supervisor while the backend runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// An output line matched a port-conflict phrase; sent at most once per run
    PortConflict { stream: OutputStream, line: String },
    /// The process is gone. `requested` is true when `stop()` caused it.
    Exited { code: Option<i32>, requested: bool },
}

/// What to run and where
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub port: u16,
}

impl LaunchSpec {
    /// Runs `program` from its own directory with the given arguments
    pub fn new(program: PathBuf, args: Vec<String>, port: u16) -> Self {
        let working_dir = program
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            program,
            args,
            working_dir,
            port,
        }
    }

    /// Headless backend bound to `port`: `<headless-flag> <port-flag> <port> [extra...]`
    pub fn for_backend(program: PathBuf, port: u16, backend: &BackendConfig) -> Self {
        let mut args = Vec::new();
        if !backend.headless_flag.is_empty() {
            args.push(backend.headless_flag.clone());
        }
        args.push(backend.port_flag.clone());
        args.push(port.to_string());
        args.extend(backend.extra_args.iter().cloned());
        Self::new(program, args, port)
    }
}

/// Snapshot of the running child
#[derive(Debug, Clone, Serialize)]
pub struct SupervisedProcess {
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub port: u16,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone)]
struct OutputContext {
    events: mpsc::UnboundedSender<SupervisorEvent>,
    detector: Arc<PortConflictDetector>,
    recent: Arc<RecentOutput>,
    conflict_reported: Arc<AtomicBool>,
}

/// Owns the single backend child process.
/// Created once per application run and shared with the shutdown hooks.
pub struct BackendSupervisor {
    current: Arc<Mutex<Option<SupervisedProcess>>>,
    state: Arc<watch::Sender<ProcessState>>,
    detector: Arc<PortConflictDetector>,
    recent: Arc<RecentOutput>,
}

impl BackendSupervisor {
    pub fn new(detector: PortConflictDetector) -> Self {
        let (state, _) = watch::channel(ProcessState::Idle);
        Self {
            current: Arc::new(Mutex::new(None)),
            state: Arc::new(state),
            detector: Arc::new(detector),
            recent: Arc::new(RecentOutput::new(RECENT_OUTPUT_LINES)),
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn current(&self) -> Option<SupervisedProcess> {
        self.current.lock().clone()
    }

    /// Most recent backend output lines, oldest first
    pub fn recent_output(&self) -> Vec<String> {
        self.recent.snapshot()
    }

    /// Spawn the backend. Must be called inside a tokio runtime.
    /// The returned channel carries port-conflict and exit events for this run.
    pub fn start(
        &self,
        spec: &LaunchSpec,
    ) -> Result<mpsc::UnboundedReceiver<SupervisorEvent>, StartupFailure> {
        let mut current = self.current.lock();
        let state = self.state();
        if !matches!(state, ProcessState::Idle | ProcessState::Failed) {
            return Err(StartupFailure::Unknown(format!(
                "backend process is already active ({:?})",
                state
            )));
        }

        self.state.send_replace(ProcessState::Starting);
        self.recent.clear();

        info!(
            "Starting backend: {:?} {} (cwd {:?})",
            spec.program,
            spec.args.join(" "),
            spec.working_dir
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Hide console on Windows
        #[cfg(windows)]
        {
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn backend {:?}: {}", spec.program, e);
                self.state.send_replace(ProcessState::Idle);
                return Err(StartupFailure::ProcessSpawn {
                    path: spec.program.clone(),
                    message: e.to_string(),
                });
            }
        };

        let pid = child.id();
        info!("Backend started with PID {:?}", pid);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = OutputContext {
            events: events_tx.clone(),
            detector: self.detector.clone(),
            recent: self.recent.clone(),
            conflict_reported: Arc::new(AtomicBool::new(false)),
        };

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_output_reader(stdout, OutputStream::Stdout, ctx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_output_reader(stderr, OutputStream::Stderr, ctx));
        }

        *current = Some(SupervisedProcess {
            executable: spec.program.clone(),
            working_dir: spec.working_dir.clone(),
            port: spec.port,
            pid,
            started_at: Utc::now(),
        });

        tokio::spawn(monitor_child(
            child,
            readers,
            events_tx,
            self.current.clone(),
            self.state.clone(),
            self.recent.clone(),
        ));

        Ok(events_rx)
    }

    /// Starting -> Running once the backend answered its health check
    pub fn mark_running(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ProcessState::Starting {
                *state = ProcessState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Send the termination signal. Safe to call any number of times.
    pub fn stop(&self) {
        let mut current = self.current.lock();
        match self.state() {
            ProcessState::Idle | ProcessState::Stopping => {
                debug!("Backend stop requested, nothing to do");
            }
            ProcessState::Failed => {
                *current = None;
                self.state.send_replace(ProcessState::Idle);
            }
            ProcessState::Starting | ProcessState::Running => match current.as_ref() {
                // Reaped already; the exit report is on its way and stays unrequested
                None => debug!("Backend already exited, nothing to stop"),
                Some(process) => {
                    info!("Stopping backend process...");
                    self.state.send_replace(ProcessState::Stopping);
                    match process.pid {
                        Some(pid) => terminate_pid(pid),
                        None => warn!("Backend has no PID, waiting for it to exit on its own"),
                    }
                }
            },
        }
    }

    /// Wait until the backend is no longer running or stopping
    pub async fn wait_until_settled(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| matches!(state, ProcessState::Idle | ProcessState::Failed))
            .await;
    }
}

impl Drop for BackendSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_output_reader<R>(reader: R, stream: OutputStream, ctx: OutputContext) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Backends on Chinese Windows may print GBK; never stop reading over it
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(&['\r', '\n'][..])
                        .to_string();
                    if line.is_empty() {
                        continue;
                    }

                    match stream {
                        OutputStream::Stdout => info!("[backend {}] {}", stream, line),
                        OutputStream::Stderr => warn!("[backend {}] {}", stream, line),
                    }

                    if ctx.detector.matches(&line)
                        && !ctx.conflict_reported.swap(true, Ordering::SeqCst)
                    {
                        error!("Port conflict detected in backend {}", stream);
                        let _ = ctx.events.send(SupervisorEvent::PortConflict {
                            stream,
                            line: line.clone(),
                        });
                    }

                    ctx.recent.push(line);
                }
                Err(e) => {
                    warn!("Failed to read backend {}: {}", stream, e);
                    break;
                }
            }
        }
    })
}

async fn monitor_child(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    current: Arc<Mutex<Option<SupervisedProcess>>>,
    state: Arc<watch::Sender<ProcessState>>,
    recent: Arc<RecentOutput>,
) {
    let status = child.wait().await;

    // The PID is no longer ours once reaped; decide `requested` before draining
    let requested = {
        let mut current = current.lock();
        *current = None;
        *state.borrow() == ProcessState::Stopping
    };

    // Let the readers finish so a conflict line printed right before exit wins
    let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
        for reader in readers {
            let _ = reader.await;
        }
    })
    .await;
    if drained.is_err() {
        debug!("Backend output still open after exit, not waiting for it");
    }

    let code = match &status {
        Ok(status) => status.code(),
        Err(e) => {
            error!("Failed to wait for backend process: {}", e);
            None
        }
    };

    {
        let _current = current.lock();
        let next = if requested || code == Some(0) {
            ProcessState::Idle
        } else {
            ProcessState::Failed
        };
        state.send_replace(next);
    }

    if requested {
        info!("Backend stopped (status {:?})", code);
    } else if code == Some(0) {
        info!("Backend exited normally");
    } else {
        error!("Backend exited unexpectedly with code {:?}", code);
        let tail = recent.snapshot();
        let skip = tail.len().saturating_sub(20);
        for line in &tail[skip..] {
            error!("  | {}", line);
        }
    }

    let _ = events.send(SupervisorEvent::Exited { code, requested });
}

#[cfg(unix)]
fn terminate_pid(pid: u32) {
    // SAFETY: plain kill(2). Callers hold the `current` lock and only pass a PID
    // the monitor has not cleared, i.e. one it has not finished reaping
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        info!("Sent SIGTERM to backend PID {}", pid);
    } else {
        warn!(
            "Failed to send SIGTERM to PID {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(windows)]
fn terminate_pid(pid: u32) {
    use std::os::windows::process::CommandExt;

    let result = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .creation_flags(CREATE_NO_WINDOW)
        .output();
    match result {
        Ok(output) if output.status.success() => info!("Terminated backend PID {}", pid),
        Ok(output) => warn!(
            "taskkill failed for PID {}: {}",
            pid,
            String::from_utf8_lossy(&output.stderr)
        ),
        Err(e) => error!("Failed to run taskkill for PID {}: {}", pid, e),
    }
}

#[cfg(not(any(unix, windows)))]
fn terminate_pid(pid: u32) {
    warn!(
        "Stopping PID {} is not supported on {}, waiting for it to exit",
        pid,
        std::env::consts::OS
    );
}
