//! Lifecycle wrapper around a spawned child process.
//!
//! [`ProcessHandler`] owns the pump tasks around one child: stdout and
//! stderr readers feeding the console, a stdin writer fed by a queue, and a
//! waiter that records the exit status and flips the running flag. The
//! child itself lives inside the waiter task, so the handler can be shared
//! freely and every other operation works through the pid or a channel.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};

use crate::command_line::{CommandLine, ExecError};
use crate::console::{
    parse_console_level, Console, ConsoleLevel, ConsoleLine, ConsoleSource,
    DEFAULT_CONSOLE_CAPACITY,
};
use crate::monitor;

const STDIN_QUEUE_CAPACITY: usize = 256;
const DESTROY_WAIT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
    #[error("stdin of process {pid} is closed")]
    StdinClosed { pid: u32 },
}

/// Knobs for [`ProcessHandler::spawn_with_options`].
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Existing console to append to; a fresh one is created when absent.
    /// Passing a shared console lets output from successive runs land in
    /// one history.
    pub console: Option<Console>,
    /// Ring capacity for the fresh console when `console` is `None`.
    pub console_capacity: usize,
    /// Regex with a named `level` group for classifying output lines.
    pub level_pattern: Option<String>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            console: None,
            console_capacity: DEFAULT_CONSOLE_CAPACITY,
            level_pattern: None,
        }
    }
}

#[derive(Debug)]
pub struct ProcessHandler {
    pid: u32,
    console: Console,
    stdin_tx: mpsc::Sender<String>,
    running_rx: watch::Receiver<bool>,
    exit_status: Arc<StdMutex<Option<ExitStatus>>>,
    destroyed: AtomicBool,
}

impl ProcessHandler {
    pub async fn spawn(command_line: &CommandLine) -> Result<Self, ExecError> {
        Self::spawn_with_options(command_line, HandlerOptions::default()).await
    }

    pub async fn spawn_with_options(
        command_line: &CommandLine,
        options: HandlerOptions,
    ) -> Result<Self, ExecError> {
        let mut child = command_line.create_process_inner(true).await?;
        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                return Err(ExecError::ProcessNotCreated {
                    command: command_line.command_line_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "process exited before a pid could be read",
                    ),
                })
            }
        };

        let level_pattern = options.level_pattern.as_deref().and_then(|p| {
            match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("Invalid level pattern '{}', ignoring it: {}", p, e);
                    None
                }
            }
        });
        let console = options
            .console
            .unwrap_or_else(|| Console::new(options.console_capacity));
        let redirect = command_line.redirect_error_stream();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(STDIN_QUEUE_CAPACITY);
        let (running_tx, running_rx) = watch::channel(true);
        let exit_status = Arc::new(StdMutex::new(None));

        tracing::info!("Process started with PID {}", pid);
        console
            .push(
                ConsoleSource::System,
                format!("Process started with PID {}", pid),
                ConsoleLevel::Info,
            )
            .await;

        if let Some(stdout) = stdout {
            let console = console.clone();
            let pattern = level_pattern.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let level = parse_console_level(&line, pattern.as_ref());
                    console.push(ConsoleSource::Stdout, line, level).await;
                }
            });
        }

        if let Some(stderr) = stderr {
            let console = console.clone();
            let pattern = level_pattern.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let level = parse_console_level(&line, pattern.as_ref());
                    if redirect {
                        console.push(ConsoleSource::Stdout, line, level).await;
                    } else {
                        // stderr without an explicit level is at least a warning
                        let level = if level == ConsoleLevel::Info {
                            ConsoleLevel::Warn
                        } else {
                            level
                        };
                        console.push(ConsoleSource::Stderr, line, level).await;
                    }
                }
            });
        }

        if let Some(mut stdin) = stdin {
            let mut rx = stdin_rx;
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    let mut payload = line.into_bytes();
                    payload.push(b'\n');
                    if stdin.write_all(&payload).await.is_err() {
                        break;
                    }
                    if stdin.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        {
            let console = console.clone();
            let exit_status = exit_status.clone();
            tokio::spawn(async move {
                let message = match child.wait().await {
                    Ok(status) => {
                        *exit_status.lock().unwrap_or_else(|p| p.into_inner()) = Some(status);
                        format!("Process exited with {}", status)
                    }
                    Err(e) => format!("Process wait failed: {}", e),
                };
                tracing::info!("{} (pid {})", message, pid);
                console
                    .push(ConsoleSource::System, message, ConsoleLevel::Info)
                    .await;
                let _ = running_tx.send(false);
            });
        }

        Ok(Self {
            pid,
            console,
            stdin_tx,
            running_rx,
            exit_status,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Subscribe to real-time console events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleLine> {
        self.console.subscribe()
    }

    pub async fn console_since(&self, after_id: u64) -> Vec<ConsoleLine> {
        self.console.get_since(after_id).await
    }

    pub async fn recent_console(&self, count: usize) -> Vec<ConsoleLine> {
        self.console.get_recent(count).await
    }

    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// Exit status, once the waiter has observed it.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self
            .exit_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue one line for the child's stdin. A newline is appended.
    pub async fn send_line(&self, line: impl Into<String>) -> Result<(), ProcessError> {
        self.stdin_tx
            .send(line.into())
            .await
            .map_err(|_| ProcessError::StdinClosed { pid: self.pid })
    }

    /// Record a lifecycle message on this process's console.
    pub async fn push_system_line(&self, message: impl Into<String>) {
        self.console
            .push(ConsoleSource::System, message, ConsoleLevel::Info)
            .await;
    }

    /// Resolve once the process has exited. Returns immediately when it
    /// already has.
    pub async fn wait_for_exit(&self) {
        let mut rx = self.running_rx.clone();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Like [`Self::wait_for_exit`] but bounded. True when the process
    /// exited within `timeout`.
    pub async fn wait_for_exit_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_exit())
            .await
            .is_ok()
    }

    /// Ask the process to exit: SIGTERM on Unix, `TerminateProcess` on
    /// Windows. Errs only when the signal could not be delivered.
    pub fn terminate(&self) -> Result<(), ProcessError> {
        signal_pid(self.pid, false)
    }

    /// Kill without ceremony: SIGKILL on Unix.
    pub fn kill(&self) -> Result<(), ProcessError> {
        signal_pid(self.pid, true)
    }

    /// Force the process down and wait a bounded time for confirmation.
    /// Concurrent and repeated calls collapse to a single kill; the extra
    /// callers just wait for the exit.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            self.wait_for_exit_timeout(DESTROY_WAIT).await;
            return;
        }
        if self.is_running() {
            if let Err(e) = self.kill() {
                tracing::warn!("{}", e);
            }
        }
        if !self.wait_for_exit_timeout(DESTROY_WAIT).await
            && monitor::pid_alive_async(self.pid).await
        {
            tracing::error!("Process {} still present after force kill", self.pid);
        }
    }

    /// Polite shutdown: terminate, wait up to `grace`, then escalate to
    /// [`Self::destroy`] if the process is still around.
    pub async fn stop_with_grace(&self, grace: Duration) {
        if !self.is_running() {
            return;
        }
        match self.terminate() {
            Ok(()) => {
                if self.wait_for_exit_timeout(grace).await {
                    tracing::debug!("Process {} exited within the grace period", self.pid);
                    return;
                }
            }
            Err(e) => tracing::warn!("{}", e),
        }
        // the running flag can lag the actual death, so check the pid
        // before reaching for the kill
        if !monitor::pid_alive_async(self.pid).await {
            tracing::debug!("Process {} is already gone, skipping force kill", self.pid);
            self.wait_for_exit_timeout(DESTROY_WAIT).await;
            return;
        }
        tracing::warn!(
            "Process {} survived the termination request, force killing",
            self.pid
        );
        self.destroy().await;
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, force: bool) -> Result<(), ProcessError> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    signal::kill(Pid::from_raw(pid as i32), signal).map_err(|e| ProcessError::SignalFailed {
        pid,
        reason: e.to_string(),
    })
}

#[cfg(windows)]
fn signal_pid(pid: u32, force: bool) -> Result<(), ProcessError> {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(ProcessError::SignalFailed {
                pid,
                reason: "OpenProcess failed".to_string(),
            });
        }
        let exit_code = if force { 1 } else { 0 };
        let result = TerminateProcess(handle, exit_code);
        CloseHandle(handle);
        if result == 0 {
            return Err(ProcessError::SignalFailed {
                pid,
                reason: "TerminateProcess failed".to_string(),
            });
        }
    }
    Ok(())
}
