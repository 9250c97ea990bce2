//! TOML-backed service definitions for the runner binary.
//!
//! The library API is programmatic; this module is the thin declarative
//! layer on top of it. Each `[[service]]` block in the config file becomes
//! a [`ConfigBackend`], and the chosen port reaches the child either
//! through an argument template or an environment variable.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use crate::command_line::CommandLine;
use crate::env::ParentEnvironment;
use crate::net::{NetServiceConfig, NetServiceError, ServiceBackend};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerConfig {
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceDefinition>,
}

impl RunnerConfig {
    /// Load from `path`. A missing file means an empty config, not an
    /// error; a file that exists but cannot be read or parsed is one.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No service config at {}, starting with none", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: RunnerConfig = toml::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        tracing::info!(
            "Loaded {} service definition(s) from {}",
            config.services.len(),
            path.display()
        );
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub exe: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Argument template carrying the chosen port, e.g. `--port={port}`.
    pub port_arg: Option<String>,
    /// Environment variable to carry the chosen port instead.
    pub port_env: Option<String>,
    pub work_dir: Option<String>,
    #[serde(default)]
    pub parent_env: ParentEnvironment,
    /// Record the child's stderr as part of the stdout stream.
    #[serde(default)]
    pub redirect_stderr: bool,
    pub connect_attempts: Option<u32>,
    pub connect_delay_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    pub level_pattern: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServiceDefinition {
    pub fn validate(&self) -> Result<(), NetServiceError> {
        if self.name.trim().is_empty() {
            return Err(NetServiceError::InvalidConfig(
                "service with an empty name".to_string(),
            ));
        }
        if let Some(arg) = &self.port_arg {
            if !arg.contains("{port}") {
                return Err(NetServiceError::InvalidConfig(format!(
                    "service '{}': port_arg '{}' is missing the {{port}} placeholder",
                    self.name, arg
                )));
            }
        }
        if self.port_arg.is_none() && self.port_env.is_none() {
            return Err(NetServiceError::InvalidConfig(format!(
                "service '{}' declares neither port_arg nor port_env, so it cannot learn its port",
                self.name
            )));
        }
        Ok(())
    }

    /// Startup tuning for this service, config defaults where unset.
    pub fn net_service_config(&self) -> NetServiceConfig {
        let mut config = NetServiceConfig::default();
        if let Some(n) = self.connect_attempts {
            config.connect_attempts = n;
        }
        if let Some(ms) = self.connect_delay_ms {
            config.connect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.probe_timeout_ms {
            config.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.stop_grace_ms {
            config.stop_grace = Duration::from_millis(ms);
        }
        config.level_pattern = self.level_pattern.clone();
        config
    }

    /// Validate and turn into a backend for [`crate::net::NetService`].
    pub fn into_backend(self) -> Result<ConfigBackend, NetServiceError> {
        self.validate()?;
        Ok(ConfigBackend { definition: self })
    }
}

/// [`ServiceBackend`] driven entirely by one config file entry.
#[derive(Debug)]
pub struct ConfigBackend {
    definition: ServiceDefinition,
}

impl ConfigBackend {
    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }
}

#[async_trait]
impl ServiceBackend for ConfigBackend {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn command_line(&self, port: u16) -> Result<CommandLine, NetServiceError> {
        let def = &self.definition;
        let mut command_line = CommandLine::new(def.exe.as_str())
            .with_parameters(def.args.iter().cloned())
            .with_parent_environment(def.parent_env)
            .with_redirect_error_stream(def.redirect_stderr);
        if let Some(dir) = &def.work_dir {
            command_line = command_line.with_work_directory(dir);
        }
        for (name, value) in &def.env {
            command_line = command_line.with_environment_var(name, value);
        }
        if let Some(arg) = &def.port_arg {
            command_line =
                command_line.with_parameter(arg.replace("{port}", &port.to_string()));
        }
        if let Some(var) = &def.port_env {
            command_line = command_line.with_environment_var(var, &port.to_string());
        }
        Ok(command_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[service]]
        name = "indexer"
        exe = "/opt/indexer/bin/indexerd"
        args = ["--quiet"]
        port_arg = "--listen=127.0.0.1:{port}"
        parent_env = "system"
        connect_attempts = 5
        connect_delay_ms = 100

        [service.env]
        INDEXER_HOME = "/var/lib/indexer"

        [[service]]
        name = "renderer"
        exe = "renderer"
        port_env = "RENDER_PORT"
        redirect_stderr = true
    "#;

    fn parse(text: &str) -> RunnerConfig {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_parse_sample() {
        let config = parse(SAMPLE);
        assert_eq!(config.services.len(), 2);

        let indexer = &config.services[0];
        assert_eq!(indexer.name, "indexer");
        assert_eq!(indexer.args, vec!["--quiet"]);
        assert_eq!(indexer.parent_env, ParentEnvironment::System);
        assert_eq!(indexer.env.get("INDEXER_HOME").map(String::as_str), Some("/var/lib/indexer"));
        assert!(!indexer.redirect_stderr);

        let renderer = &config.services[1];
        assert_eq!(renderer.parent_env, ParentEnvironment::Shell);
        assert!(renderer.redirect_stderr);
        assert_eq!(renderer.port_env.as_deref(), Some("RENDER_PORT"));
    }

    #[test]
    fn test_net_service_config_overrides() {
        let config = parse(SAMPLE);
        let tuned = config.services[0].net_service_config();
        assert_eq!(tuned.connect_attempts, 5);
        assert_eq!(tuned.connect_delay, Duration::from_millis(100));
        assert_eq!(tuned.probe_timeout, Duration::from_secs(1));

        let defaults = config.services[1].net_service_config();
        assert_eq!(defaults.connect_attempts, 20);
    }

    #[test]
    fn test_port_arg_requires_placeholder() {
        let bad = r#"
            [[service]]
            name = "broken"
            exe = "b"
            port_arg = "--listen"
        "#;
        let config = parse(bad);
        let err = config.services[0].validate().unwrap_err();
        assert!(matches!(err, NetServiceError::InvalidConfig(_)));
        assert!(err.to_string().contains("{port}"));
    }

    #[test]
    fn test_port_delivery_must_be_declared() {
        let bad = r#"
            [[service]]
            name = "mute"
            exe = "m"
        "#;
        let config = parse(bad);
        assert!(config.services[0].validate().is_err());
    }

    #[test]
    fn test_backend_substitutes_port() {
        let config = parse(SAMPLE);
        let backend = config.services[0].clone().into_backend().unwrap();
        let cl = backend.command_line(3344).unwrap();
        assert!(cl
            .parameters()
            .list()
            .contains(&"--listen=127.0.0.1:3344".to_string()));
        assert_eq!(cl.environment().get("INDEXER_HOME"), Some("/var/lib/indexer"));

        let renderer = config.services[1].clone().into_backend().unwrap();
        let cl = renderer.command_line(4455).unwrap();
        assert_eq!(cl.environment().get("RENDER_PORT"), Some("4455"));
        assert!(cl.redirect_error_stream());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_load_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not [valid toml").unwrap();
        assert!(RunnerConfig::load(&path).is_err());
    }
}
