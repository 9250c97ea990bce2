//! End-to-end tests for managed TCP services.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ikura::command_line::CommandLine;
use ikura::console::{ConsoleLine, ConsoleSource};
use ikura::monitor;
use ikura::net::{NetService, NetServiceConfig, NetServiceError, ServiceBackend};

fn sh(script: &str) -> CommandLine {
    CommandLine::new("/bin/sh")
        .with_parameter("-c")
        .with_parameter(script)
}

fn quick_config() -> NetServiceConfig {
    NetServiceConfig {
        connect_attempts: 3,
        connect_delay: Duration::from_millis(50),
        probe_timeout: Duration::from_millis(200),
        stop_grace: Duration::from_millis(500),
        level_pattern: None,
    }
}

fn pid_from_console(lines: &[ConsoleLine]) -> Option<u32> {
    lines.iter().find_map(|l| {
        l.content
            .strip_prefix("Process started with PID ")
            .and_then(|rest| rest.parse().ok())
    })
}

fn count_exit_lines(lines: &[ConsoleLine]) -> usize {
    lines
        .iter()
        .filter(|l| l.source == ConsoleSource::System && l.content.starts_with("Process exited"))
        .count()
}

/// Long-running process that never listens; the probe is stubbed out, so
/// startup succeeds immediately.
struct SleeperBackend;

#[async_trait]
impl ServiceBackend for SleeperBackend {
    fn name(&self) -> &str {
        "sleeper"
    }

    fn command_line(&self, _port: u16) -> Result<CommandLine, NetServiceError> {
        Ok(sh("sleep 30"))
    }

    async fn probe(&self, _port: u16) -> Result<(), NetServiceError> {
        Ok(())
    }
}

/// Long-running process that never listens, probed with the default TCP
/// connect. Every attempt must fail.
struct DeafBackend;

#[async_trait]
impl ServiceBackend for DeafBackend {
    fn name(&self) -> &str {
        "deaf"
    }

    fn command_line(&self, _port: u16) -> Result<CommandLine, NetServiceError> {
        Ok(sh("sleep 30"))
    }
}

/// Exits immediately with a nonzero status.
struct EarlyExitBackend;

#[async_trait]
impl ServiceBackend for EarlyExitBackend {
    fn name(&self) -> &str {
        "early-exit"
    }

    fn command_line(&self, _port: u16) -> Result<CommandLine, NetServiceError> {
        Ok(sh("exit 7"))
    }
}

/// Publishes the port it was assigned, so the test can stand up an
/// in-process listener there and let the default TCP probe succeed.
struct PortReportingBackend {
    seen_port: Arc<Mutex<Option<u16>>>,
}

#[async_trait]
impl ServiceBackend for PortReportingBackend {
    fn name(&self) -> &str {
        "port-reporter"
    }

    fn command_line(&self, port: u16) -> Result<CommandLine, NetServiceError> {
        *self.seen_port.lock().unwrap() = Some(port);
        Ok(sh("sleep 30"))
    }
}

#[tokio::test]
async fn acquire_starts_and_stop_tears_down() {
    let service = NetService::new(SleeperBackend);
    let handle = service.acquire().await.unwrap();
    assert!(handle.is_running());
    assert!(handle.port() > 0);
    let pid = handle.pid();
    assert!(monitor::pid_alive_async(pid).await);

    let lines = service.console().get_recent(50).await;
    assert!(lines
        .iter()
        .any(|l| l.source == ConsoleSource::System
            && l.content.starts_with("sleeper starting on port")));

    service.stop().await;
    assert!(!handle.is_running());
    assert!(!monitor::pid_alive_async(pid).await);
    assert!(service.current().await.is_none());

    // stopping again is a no-op
    service.stop().await;
}

#[tokio::test]
async fn deliberate_stop_records_no_termination_event() {
    let service = NetService::with_config(SleeperBackend, quick_config());
    let handle = service.acquire().await.unwrap();

    service.stop().await;
    assert!(!handle.is_running());
    // give the exit watcher time to observe the death before inspecting
    tokio::time::sleep(Duration::from_millis(200)).await;

    let lines = service.console().get_recent(100).await;
    let contents: Vec<&str> = lines.iter().map(|l| l.content.as_str()).collect();
    assert!(
        !contents.iter().any(|c| c.contains("terminated")),
        "a stopped service must not look crashed, console was: {:?}",
        contents
    );
    // the process exit itself is still on record
    assert_eq!(count_exit_lines(&lines), 1);
}

#[tokio::test]
async fn concurrent_acquires_share_one_run() {
    let service = Arc::new(NetService::new(SleeperBackend));
    let (a, b, c) = tokio::join!(service.acquire(), service.acquire(), service.acquire());
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    assert_eq!(a.run_id(), b.run_id());
    assert_eq!(b.run_id(), c.run_id());
    assert_eq!(a.pid(), c.pid());

    // a later acquire on a running service joins the same run
    let again = service.acquire().await.unwrap();
    assert_eq!(again.run_id(), a.run_id());

    service.stop().await;
}

#[tokio::test]
async fn unresponsive_service_is_rejected_and_torn_down() {
    let service = NetService::with_config(DeafBackend, quick_config());
    let err = service.acquire().await.unwrap_err();
    match err {
        NetServiceError::ConnectFailed { attempts, port, .. } => {
            assert_eq!(attempts, 3);
            assert!(port > 0);
        }
        other => panic!("expected ConnectFailed, got {}", other),
    }

    // rejection must have killed the process it spawned
    let lines = service.console().get_recent(50).await;
    let pid = pid_from_console(&lines).expect("spawn line missing");
    assert!(!monitor::pid_alive_async(pid).await);
    assert_eq!(count_exit_lines(&lines), 1);
    assert!(service.current().await.is_none());
}

#[tokio::test]
async fn death_during_startup_is_reported() {
    let service = NetService::with_config(EarlyExitBackend, quick_config());
    let err = service.acquire().await.unwrap_err();
    match err {
        NetServiceError::DiedDuringStartup { service: name, status } => {
            assert_eq!(name, "early-exit");
            assert!(status.contains('7'), "status was: {}", status);
        }
        other => panic!("expected DiedDuringStartup, got {}", other),
    }
    assert!(service.current().await.is_none());
}

#[tokio::test]
async fn watchdog_returns_service_to_idle_after_death() {
    let service = NetService::new(SleeperBackend);
    let first = service.acquire().await.unwrap();
    let first_pid = first.pid();

    first.process().kill().unwrap();
    for _ in 0..100 {
        if service.current().await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(service.current().await.is_none());

    let lines = service.console().get_recent(100).await;
    assert!(lines
        .iter()
        .any(|l| l.source == ConsoleSource::System
            && l.content.starts_with("sleeper terminated:")));

    // the next acquire starts a fresh run on a fresh process
    let second = service.acquire().await.unwrap();
    assert_ne!(second.run_id(), first.run_id());
    assert_ne!(second.pid(), first_pid);
    assert!(second.is_running());

    service.stop().await;
}

#[tokio::test]
async fn reset_during_startup_cancels_and_cleans_up() {
    let config = NetServiceConfig {
        connect_attempts: 100,
        connect_delay: Duration::from_millis(100),
        ..quick_config()
    };
    let service = Arc::new(NetService::with_config(DeafBackend, config));

    let starter = {
        let service = service.clone();
        tokio::spawn(async move { service.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    service.reset().await;

    let outcome = starter.await.unwrap();
    assert!(
        matches!(outcome, Err(NetServiceError::Cancelled(_))),
        "expected Cancelled, got {:?}",
        outcome.as_ref().map(|h| h.run_id())
    );
    assert!(service.current().await.is_none());

    let lines = service.console().get_recent(50).await;
    let pid = pid_from_console(&lines).expect("spawn line missing");
    assert!(!monitor::pid_alive_async(pid).await);
}

#[tokio::test]
async fn default_tcp_probe_passes_once_the_port_answers() {
    let seen_port = Arc::new(Mutex::new(None));
    let backend = PortReportingBackend {
        seen_port: seen_port.clone(),
    };
    let config = NetServiceConfig {
        connect_attempts: 40,
        connect_delay: Duration::from_millis(100),
        ..NetServiceConfig::default()
    };
    let service = Arc::new(NetService::with_config(backend, config));

    // stand in for the server: listen on whatever port was assigned
    let listener_port = seen_port.clone();
    tokio::spawn(async move {
        let port = loop {
            if let Some(port) = *listener_port.lock().unwrap() {
                break port;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("bind assigned port");
        loop {
            let _ = listener.accept().await;
        }
    });

    let handle = service.acquire().await.unwrap();
    assert_eq!(Some(handle.port()), *seen_port.lock().unwrap());
    service.stop().await;
}
