//! Child-process environment handling.
//!
//! Three parent-environment modes are supported: none, the plain system
//! environment, and the environment of a login shell. The login-shell
//! capture exists for processes launched from desktop sessions, where the
//! inherited environment misses everything `.profile` and friends would
//! normally contribute (PATH entries above all).

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::command_line::ExecError;
use crate::utils::apply_spawn_flags;

/// How much of this process's environment a child starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParentEnvironment {
    /// Child starts from an empty environment.
    None,
    /// Child inherits this process's environment as-is.
    System,
    /// Child inherits the environment a login shell would have. Falls back
    /// to [`ParentEnvironment::System`] when the shell cannot be consulted.
    Shell,
}

impl Default for ParentEnvironment {
    fn default() -> Self {
        ParentEnvironment::Shell
    }
}

impl ParentEnvironment {
    /// Resolve this mode to a concrete variable map.
    pub async fn capture(&self) -> HashMap<String, String> {
        match self {
            ParentEnvironment::None => HashMap::new(),
            ParentEnvironment::System => system_environment(),
            ParentEnvironment::Shell => shell_environment().await,
        }
    }
}

/// User-supplied environment overrides for a child process.
///
/// On Windows, variable names compare case-insensitively while the casing of
/// the last write is what the child actually sees. On other platforms names
/// are exact. Empty names are rejected, with a warning, instead of being
/// handed to the OS where process creation would fail.
#[derive(Debug, Clone)]
pub struct EnvironmentMap {
    vars: HashMap<String, String>,
    case_insensitive: bool,
}

impl EnvironmentMap {
    /// Map with the key semantics of the current platform.
    pub fn new() -> Self {
        Self::with_case_insensitive_keys(cfg!(windows))
    }

    pub fn with_case_insensitive_keys(case_insensitive: bool) -> Self {
        Self {
            vars: HashMap::new(),
            case_insensitive,
        }
    }

    /// Insert or replace a variable. Returns false when the entry was
    /// rejected for having an empty name.
    pub fn set(&mut self, name: &str, value: &str) -> bool {
        if name.is_empty() {
            tracing::warn!("Ignoring environment variable with empty name (value '{}')", value);
            return false;
        }
        if self.case_insensitive {
            let stale: Vec<String> = self
                .vars
                .keys()
                .filter(|k| k.eq_ignore_ascii_case(name))
                .cloned()
                .collect();
            for key in stale {
                self.vars.remove(&key);
            }
        }
        self.vars.insert(name.to_string(), value.to_string());
        true
    }

    pub fn merge<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in entries {
            self.set(&name, &value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        if let Some(value) = self.vars.get(name) {
            return Some(value);
        }
        if self.case_insensitive {
            self.vars
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn into_map(self) -> HashMap<String, String> {
        self.vars
    }
}

impl Default for EnvironmentMap {
    fn default() -> Self {
        Self::new()
    }
}

/// This process's own environment.
pub fn system_environment() -> HashMap<String, String> {
    std::env::vars().collect()
}

const SHELL_ENV_TIMEOUT: Duration = Duration::from_secs(10);

static SHELL_ENV: OnceCell<HashMap<String, String>> = OnceCell::const_new();

/// The environment of a login shell, captured once per process and cached.
///
/// On Windows, or when the shell cannot be run, this degrades to
/// [`system_environment`] with a warning rather than failing the launch.
pub async fn shell_environment() -> HashMap<String, String> {
    if cfg!(windows) {
        return system_environment();
    }
    SHELL_ENV
        .get_or_init(|| async {
            match capture_shell_environment().await {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!("Could not read login shell environment, using system environment: {}", e);
                    system_environment()
                }
            }
        })
        .await
        .clone()
}

/// Run `$SHELL -l -c env` and parse the result. Unlike
/// [`shell_environment`] this neither caches nor falls back, so callers see
/// the real failure.
pub async fn capture_shell_environment() -> Result<HashMap<String, String>, ExecError> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let mut cmd = tokio::process::Command::new(&shell);
    cmd.arg("-l")
        .arg("-c")
        .arg("env")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    apply_spawn_flags(&mut cmd);

    let output = match tokio::time::timeout(SHELL_ENV_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(ExecError::ShellEnvUnavailable(format!(
                "failed to run '{}': {}",
                shell, e
            )))
        }
        Err(_) => {
            return Err(ExecError::ShellEnvUnavailable(format!(
                "'{}' produced no environment within {:?}",
                shell, SHELL_ENV_TIMEOUT
            )))
        }
    };
    if !output.status.success() {
        return Err(ExecError::ShellEnvUnavailable(format!(
            "'{}' exited with {}",
            shell, output.status
        )));
    }
    Ok(parse_env_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `env` output. Lines without `=` are treated as continuations of the
/// previous variable's value, which is how multi-line values come out.
fn parse_env_output(text: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }

    let mut current: Option<String> = None;
    for line in lines {
        if let Some(idx) = line.find('=') {
            let (name, rest) = line.split_at(idx);
            if name.is_empty() {
                current = None;
                continue;
            }
            vars.insert(name.to_string(), rest[1..].to_string());
            current = Some(name.to_string());
        } else if let Some(name) = &current {
            if let Some(value) = vars.get_mut(name) {
                value.push('\n');
                value.push_str(line);
            }
        }
    }
    vars
}
