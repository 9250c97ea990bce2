use std::path::Path;
use std::sync::Arc;

use ikura::config::RunnerConfig;
use ikura::console::ConsoleLevel;
use ikura::net::NetService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("IKURA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    tracing::info!("ikura runner starting");

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("IKURA_CONFIG").ok())
        .unwrap_or_else(|| "config/services.toml".to_string());
    let config = RunnerConfig::load(Path::new(&config_path))?;

    let mut services = Vec::new();
    for definition in config.services {
        let name = definition.name.clone();
        let tuning = definition.net_service_config();
        let backend = match definition.into_backend() {
            Ok(backend) => backend,
            Err(e) => {
                tracing::error!("Skipping service '{}': {}", name, e);
                continue;
            }
        };

        let service = Arc::new(NetService::with_config(backend, tuning));
        forward_console(&service);

        match service.acquire().await {
            Ok(handle) => tracing::info!(
                "Service '{}' is up on port {} (pid {})",
                name,
                handle.port(),
                handle.pid()
            ),
            Err(e) => tracing::error!("Service '{}' failed to start: {}", name, e),
        }
        services.push(service);
    }
    if services.is_empty() {
        tracing::warn!("No services are configured (config: {})", config_path);
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, stopping services...");
    for service in &services {
        service.stop().await;
        tracing::info!("Service '{}' stopped", service.name());
    }
    tracing::info!("All services stopped, exiting");
    Ok(())
}

/// Mirror a service's console onto the process log, so `IKURA_LOG` filters
/// apply to child output under the `ikura::console` target.
fn forward_console(service: &Arc<NetService<ikura::config::ConfigBackend>>) {
    let mut rx = service.console().subscribe();
    let name = service.name().to_string();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(line) => match line.level {
                    ConsoleLevel::Error => {
                        tracing::error!(target: "ikura::console", "[{}] {}", name, line.content)
                    }
                    ConsoleLevel::Warn => {
                        tracing::warn!(target: "ikura::console", "[{}] {}", name, line.content)
                    }
                    ConsoleLevel::Debug => {
                        tracing::debug!(target: "ikura::console", "[{}] {}", name, line.content)
                    }
                    ConsoleLevel::Info => {
                        tracing::info!(target: "ikura::console", "[{}] {}", name, line.content)
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Console forwarder for '{}' skipped {} lines", name, missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
