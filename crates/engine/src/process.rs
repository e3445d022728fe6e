//! OS process supervision
//!
//! A [`Process`] wraps exactly one spawned (or externally attached) OS
//! process. Output lines and the final exit are delivered as
//! [`ProcessEvent`]s in order: every stdout/stderr line is sent before the
//! `Exited` event.

use crossrun_common::{Error, ProcessStatus, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How the process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "signal {}", sig),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Output or termination of a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    Exited(ExitInfo),
}

/// Event stream returned by [`Process::create`]
pub struct ProcessEvents {
    rx: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl ProcessEvents {
    /// Next event; `None` once the exit has been delivered
    pub async fn next(&mut self) -> Option<ProcessEvent> {
        self.rx.recv().await
    }

    /// Drain output until the process exits
    pub async fn wait(mut self) -> Option<ExitInfo> {
        while let Some(event) = self.rx.recv().await {
            if let ProcessEvent::Exited(info) = event {
                return Some(info);
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handle {
    None,
    Spawned,
    /// Known only by pid, e.g. found in the OS process table
    Attached,
}

struct ProcessState {
    pid: Option<u32>,
    handle: Handle,
    stop_sent: bool,
}

/// Supervisor for one OS process
pub struct Process {
    state: Mutex<ProcessState>,
    exited: Arc<AtomicBool>,
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

impl Process {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState {
                pid: None,
                handle: Handle::None,
                stop_sent: false,
            }),
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Track a process this supervisor did not spawn
    pub fn attach(pid: u32) -> Self {
        let process = Self::new();
        {
            let mut state = process.state.lock();
            state.pid = Some(pid);
            state.handle = Handle::Attached;
        }
        process
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    /// Spawn `command` with `args`. Fails immediately on spawn errors; the
    /// exit is reported through the returned event stream.
    pub fn create(&self, command: &Path, args: &[String]) -> Result<ProcessEvents> {
        let mut state = self.state.lock();
        if state.handle != Handle::None {
            return Err(Error::ProcessLifecycle(format!(
                "process already created (pid {})",
                state.pid.unwrap_or_default()
            )));
        }

        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::ProcessLifecycle(format!("failed to spawn {}: {}", command.display(), e))
            })?;

        let pid = child.id().ok_or_else(|| {
            Error::ProcessLifecycle(format!("{} exited before reporting a pid", command.display()))
        })?;
        debug!("Spawned {} with PID {}", command.display(), pid);

        state.pid = Some(pid);
        state.handle = Handle::Spawned;
        drop(state);

        let (tx, rx) = mpsc::unbounded_channel();

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, tx.clone(), ProcessEvent::Stdout)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, tx.clone(), ProcessEvent::Stderr)));

        let exited = self.exited.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            exited.store(true, Ordering::SeqCst);

            // A grandchild may inherit the pipes and keep them open.
            for mut reader in [stdout, stderr].into_iter().flatten() {
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader).await.is_err() {
                    reader.abort();
                }
            }

            let info = match status {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    warn!("Failed to wait for PID {}: {}", pid, e);
                    ExitInfo { code: None, signal: None }
                }
            };
            debug!("PID {} exited with {}", pid, info);
            let _ = tx.send(ProcessEvent::Exited(info));
        });

        Ok(ProcessEvents { rx })
    }

    /// Liveness via a zero signal
    pub fn status(&self) -> Result<ProcessStatus> {
        let pid = self
            .pid()
            .ok_or_else(|| Error::ProcessLifecycle("no pid".to_string()))?;

        if self.exited.load(Ordering::SeqCst) {
            return Ok(ProcessStatus::Stopped);
        }

        Ok(if is_process_running(pid) {
            ProcessStatus::Running
        } else {
            ProcessStatus::Stopped
        })
    }

    /// Send SIGTERM. Returns as soon as the signal is delivered; poll
    /// [`Process::status`] to observe the exit.
    pub fn stop(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL to a process that ignored [`Process::stop`]
    pub fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        let mut state = self.state.lock();
        let pid = match (state.handle, state.pid) {
            (Handle::None, _) | (_, None) => {
                return Err(Error::ProcessLifecycle("no pid".to_string()))
            }
            (Handle::Attached, Some(pid)) => {
                return Err(Error::ProcessLifecycle(format!(
                    "process {} was attached without a live handle",
                    pid
                )))
            }
            (Handle::Spawned, Some(pid)) => pid,
        };

        let running = !self.exited.load(Ordering::SeqCst) && is_process_running(pid);
        let already_stopped = !running || (state.stop_sent && signal == Signal::SIGTERM);
        if already_stopped {
            return Err(Error::ProcessLifecycle(format!("process {} already stopped", pid)));
        }

        trace!("Sending {} to PID {}", signal, pid);
        kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| Error::ProcessLifecycle(format!("{} to {} failed: {}", signal, pid, e)))?;
        state.stop_sent = true;
        Ok(())
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

async fn forward_lines<R>(
    reader: R,
    tx: mpsc::UnboundedSender<ProcessEvent>,
    wrap: fn(String) -> ProcessEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(wrap(line)).is_err() {
            break;
        }
    }
}
