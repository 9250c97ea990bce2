//! Launching TCP services on ephemeral ports.
//!
//! [`NetService`] wraps one external server process: it picks a free
//! loopback port, starts the process through a [`ProcessHandler`], probes
//! the port until the server answers, and hands out a shared
//! [`ServiceHandle`]. Startup is single-flight: whoever calls
//! [`NetService::acquire`] first drives it, concurrent callers wait for the
//! same outcome, and a failed startup tears the process down before the
//! error is reported. A background watchdog returns the service to idle
//! when the process dies, so the next acquire starts a fresh run.

pub mod port;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command_line::CommandLine;
use crate::console::{Console, ConsoleLevel, ConsoleSource, DEFAULT_CONSOLE_CAPACITY};
use crate::handler::{HandlerOptions, ProcessHandler};

pub use port::{find_available_port, probe_port};

#[derive(Error, Debug, Clone)]
pub enum NetServiceError {
    #[error("failed to launch '{service}': {message}")]
    Launch { service: String, message: String },
    #[error("no free port available: {0}")]
    NoFreePort(String),
    #[error("service '{service}' on port {port} did not answer after {attempts} attempts: {last}")]
    ConnectFailed {
        service: String,
        port: u16,
        attempts: u32,
        last: String,
    },
    #[error("service '{service}' exited during startup: {status}")]
    DiedDuringStartup { service: String, status: String },
    #[error("probe of port {port} failed: {reason}")]
    Probe { port: u16, reason: String },
    #[error("startup of '{0}' was cancelled")]
    Cancelled(String),
    #[error("invalid service configuration: {0}")]
    InvalidConfig(String),
}

/// What a concrete service contributes to the generic startup machinery.
#[async_trait]
pub trait ServiceBackend: Send + Sync + 'static {
    /// Stable name, used in console lines, log records and errors.
    fn name(&self) -> &str;

    /// Command line that starts the server listening on `port`.
    fn command_line(&self, port: u16) -> Result<CommandLine, NetServiceError>;

    /// One readiness attempt. The default opens a TCP connection to the
    /// port; services with a handshake can override this. Each attempt is
    /// additionally bounded by [`NetServiceConfig::probe_timeout`].
    async fn probe(&self, port: u16) -> Result<(), NetServiceError> {
        probe_port(port, Duration::from_secs(1))
            .await
            .map_err(|e| NetServiceError::Probe {
                port,
                reason: e.to_string(),
            })
    }

    /// Drop client-side state before the process goes away. Called on
    /// startup rejection and on [`NetService::stop`], before the process is
    /// taken down.
    async fn close_connections(&self) {}
}

#[derive(Debug, Clone)]
pub struct NetServiceConfig {
    /// Probe attempts before startup is rejected.
    pub connect_attempts: u32,
    /// Pause between probe attempts. The first attempt runs immediately.
    pub connect_delay: Duration,
    /// Upper bound on a single probe attempt.
    pub probe_timeout: Duration,
    /// How long [`NetService::stop`] waits after a polite terminate before
    /// force killing.
    pub stop_grace: Duration,
    /// Passed through to the process handler for output classification.
    pub level_pattern: Option<String>,
}

impl Default for NetServiceConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 20,
            connect_delay: Duration::from_millis(250),
            probe_timeout: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
            level_pattern: None,
        }
    }
}

/// Shared view of one successfully started run.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    run_id: Uuid,
    port: u16,
    handler: Arc<ProcessHandler>,
}

impl ServiceHandle {
    /// Identifies one process run; a restart gets a fresh id.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> u32 {
        self.handler.pid()
    }

    pub fn is_running(&self) -> bool {
        self.handler.is_running()
    }

    pub fn process(&self) -> &ProcessHandler {
        &self.handler
    }

    pub fn console(&self) -> &Console {
        self.handler.console()
    }
}

type StartOutcome = Result<ServiceHandle, NetServiceError>;

enum LoaderState {
    Idle,
    Starting {
        outcome_rx: watch::Receiver<Option<StartOutcome>>,
        cancel: CancellationToken,
    },
    Running(ServiceHandle),
}

/// One external TCP service with managed startup and teardown.
pub struct NetService<B> {
    backend: Arc<B>,
    config: NetServiceConfig,
    console: Console,
    state: Arc<Mutex<LoaderState>>,
}

impl<B: ServiceBackend> NetService<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, NetServiceConfig::default())
    }

    pub fn with_config(backend: B, config: NetServiceConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            config,
            console: Console::new(DEFAULT_CONSOLE_CAPACITY),
            state: Arc::new(Mutex::new(LoaderState::Idle)),
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &NetServiceConfig {
        &self.config
    }

    /// Service-level console. Output of every run lands here, including the
    /// lifecycle lines around restarts.
    pub fn console(&self) -> &Console {
        &self.console
    }

    /// The handle of the currently running service, if any. Never triggers
    /// a start.
    pub async fn current(&self) -> Option<ServiceHandle> {
        match &*self.state.lock().await {
            LoaderState::Running(handle) if handle.is_running() => Some(handle.clone()),
            _ => None,
        }
    }

    /// Get the running service, starting it first when necessary.
    ///
    /// Exactly one startup runs at a time; every concurrent caller gets the
    /// same handle or the same error. On failure the process has already
    /// been torn down by the time this returns.
    pub async fn acquire(&self) -> Result<ServiceHandle, NetServiceError> {
        let outcome_rx = {
            let mut state = self.state.lock().await;
            match &*state {
                LoaderState::Running(handle) if handle.is_running() => {
                    return Ok(handle.clone());
                }
                LoaderState::Starting { outcome_rx, .. } if !startup_abandoned(outcome_rx) => {
                    outcome_rx.clone()
                }
                _ => {
                    // Idle, Running with a dead process the watchdog has
                    // not collected yet, or an abandoned startup
                    let (outcome_tx, outcome_rx) = watch::channel(None);
                    let cancel = CancellationToken::new();
                    *state = LoaderState::Starting {
                        outcome_rx: outcome_rx.clone(),
                        cancel: cancel.clone(),
                    };
                    tokio::spawn(run_startup(
                        self.backend.clone(),
                        self.config.clone(),
                        self.console.clone(),
                        self.state.clone(),
                        outcome_tx,
                        cancel,
                    ));
                    outcome_rx
                }
            }
        };
        await_outcome(outcome_rx, self.backend.name()).await
    }

    /// Stop whatever is happening and return to idle.
    ///
    /// A running service gets `close_connections`, a polite terminate and a
    /// bounded wait before force kill. A startup in flight is cancelled and
    /// its rejection teardown awaited. Idle is a no-op, and repeated calls
    /// are safe.
    pub async fn reset(&self) {
        loop {
            let mut rx = {
                let mut state = self.state.lock().await;
                match &*state {
                    LoaderState::Idle => return,
                    LoaderState::Running(handle) => {
                        let handle = handle.clone();
                        *state = LoaderState::Idle;
                        // teardown happens under the state lock so a
                        // concurrent acquire cannot start a second process
                        // while this one is still dying
                        self.backend.close_connections().await;
                        handle.process().stop_with_grace(self.config.stop_grace).await;
                        return;
                    }
                    LoaderState::Starting { outcome_rx, cancel } => {
                        if startup_abandoned(outcome_rx) {
                            *state = LoaderState::Idle;
                            return;
                        }
                        cancel.cancel();
                        outcome_rx.clone()
                    }
                }
            };

            // wait for the startup task to settle, then re-inspect: it may
            // have won the race and installed a running state
            loop {
                if rx.borrow().is_some() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Synonym for [`Self::reset`], for call sites that read better as a
    /// shutdown.
    pub async fn stop(&self) {
        self.reset().await;
    }
}

/// A startup task that went away without publishing leaves `Starting`
/// behind with a dead channel and no value. Both [`NetService::acquire`]
/// and [`NetService::reset`] treat such an entry as idle.
fn startup_abandoned(rx: &watch::Receiver<Option<StartOutcome>>) -> bool {
    rx.borrow().is_none() && rx.has_changed().is_err()
}

async fn await_outcome(
    mut rx: watch::Receiver<Option<StartOutcome>>,
    service: &str,
) -> StartOutcome {
    loop {
        {
            let value = rx.borrow();
            if let Some(outcome) = value.as_ref() {
                return outcome.clone();
            }
        }
        if rx.changed().await.is_err() {
            return Err(NetServiceError::Cancelled(service.to_string()));
        }
    }
}

async fn run_startup<B: ServiceBackend>(
    backend: Arc<B>,
    config: NetServiceConfig,
    console: Console,
    state: Arc<Mutex<LoaderState>>,
    outcome_tx: watch::Sender<Option<StartOutcome>>,
    cancel: CancellationToken,
) {
    let outcome = start_service(&*backend, &config, &console, &cancel).await;

    {
        let mut st = state.lock().await;
        match &outcome {
            Ok(handle) => {
                *st = LoaderState::Running(handle.clone());
                spawn_watchdog(
                    state.clone(),
                    console.clone(),
                    backend.name().to_string(),
                    handle.clone(),
                );
            }
            Err(_) => *st = LoaderState::Idle,
        }
    }
    let _ = outcome_tx.send(Some(outcome));
}

async fn start_service<B: ServiceBackend>(
    backend: &B,
    config: &NetServiceConfig,
    console: &Console,
    cancel: &CancellationToken,
) -> StartOutcome {
    let name = backend.name().to_string();
    let run_id = Uuid::new_v4();

    let port = find_available_port().map_err(|e| NetServiceError::NoFreePort(e.to_string()))?;
    let command_line = backend.command_line(port)?;
    if cancel.is_cancelled() {
        return Err(NetServiceError::Cancelled(name));
    }

    let options = HandlerOptions {
        console: Some(console.clone()),
        level_pattern: config.level_pattern.clone(),
        ..Default::default()
    };
    let handler = match ProcessHandler::spawn_with_options(&command_line, options).await {
        Ok(handler) => Arc::new(handler),
        Err(e) => {
            tracing::error!("Failed to launch service '{}': {}", name, e);
            return Err(NetServiceError::Launch {
                service: name,
                message: e.to_string(),
            });
        }
    };

    console
        .push(
            ConsoleSource::System,
            format!("{} starting on port {} (run {})", name, port, run_id),
            ConsoleLevel::Info,
        )
        .await;
    tracing::info!("Service '{}' starting on port {} (pid {}, run {})", name, port, handler.pid(), run_id);

    match connect_with_retry(backend, config, &handler, port, cancel).await {
        Ok(()) => Ok(ServiceHandle {
            run_id,
            port,
            handler,
        }),
        Err(err) => {
            tracing::error!("Service '{}' failed to start: {}", name, err);
            backend.close_connections().await;
            handler.destroy().await;
            Err(err)
        }
    }
}

async fn connect_with_retry<B: ServiceBackend>(
    backend: &B,
    config: &NetServiceConfig,
    handler: &Arc<ProcessHandler>,
    port: u16,
    cancel: &CancellationToken,
) -> Result<(), NetServiceError> {
    let name = backend.name();
    let mut last = String::from("no probe attempted");

    for attempt in 0..config.connect_attempts {
        if attempt > 0 {
            tokio::select! {
                _ = tokio::time::sleep(config.connect_delay) => {}
                _ = cancel.cancelled() => {}
                _ = handler.wait_for_exit() => {}
            }
        }
        if !handler.is_running() {
            let status = handler
                .exit_status()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown status".to_string());
            return Err(NetServiceError::DiedDuringStartup {
                service: name.to_string(),
                status,
            });
        }
        if cancel.is_cancelled() {
            return Err(NetServiceError::Cancelled(name.to_string()));
        }

        match tokio::time::timeout(config.probe_timeout, backend.probe(port)).await {
            Ok(Ok(())) => {
                tracing::info!(
                    "Service '{}' is answering on port {} (attempt {})",
                    name,
                    port,
                    attempt + 1
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                last = e.to_string();
                tracing::debug!("Probe {} of '{}' failed: {}", attempt + 1, name, last);
            }
            Err(_) => {
                last = format!("probe timed out after {:?}", config.probe_timeout);
                tracing::debug!("Probe {} of '{}' timed out", attempt + 1, name);
            }
        }
    }

    Err(NetServiceError::ConnectFailed {
        service: name.to_string(),
        port,
        attempts: config.connect_attempts,
        last,
    })
}

fn spawn_watchdog(
    state: Arc<Mutex<LoaderState>>,
    console: Console,
    name: String,
    handle: ServiceHandle,
) {
    tokio::spawn(async move {
        handle.process().wait_for_exit().await;

        // a deliberate stop or a replacing restart moves the loader on
        // before the process dies; only an unexpected death still finds
        // this very run installed
        let mut st = state.lock().await;
        let still_installed = matches!(
            &*st,
            LoaderState::Running(current) if current.run_id() == handle.run_id()
        );
        if !still_installed {
            return;
        }

        let status = handle
            .process()
            .exit_status()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown status".to_string());
        tracing::warn!("Service '{}' terminated: {}", name, status);
        console
            .push(
                ConsoleSource::System,
                format!("{} terminated: {}", name, status),
                ConsoleLevel::Info,
            )
            .await;
        *st = LoaderState::Idle;
    });
}
