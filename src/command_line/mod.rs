//! OS-independent construction of external process invocations.
//!
//! [`CommandLine`] collects an executable path, parameters, a working
//! directory and environment settings, keeping every value unescaped until
//! the moment it is rendered or spawned. Validation happens in
//! [`CommandLine::create_process`], in a fixed order, so callers get the
//! same diagnostics on every platform.

pub mod escape;
pub mod params;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Child;

use crate::env::{EnvironmentMap, ParentEnvironment};
use crate::utils::apply_spawn_flags;

pub use escape::{inescapable_quote, Platform};
pub use params::ParametersList;

/// Errors raised while preparing or starting a process.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("executable is not specified")]
    ExeNotSpecified,
    #[error("working directory '{}' does not exist", .0.display())]
    WorkDirMissing(PathBuf),
    #[error("working directory '{}' is not a directory", .0.display())]
    WorkDirNotDirectory(PathBuf),
    /// The OS refused to start the process. Carries the failed command line
    /// and the underlying I/O error.
    #[error("failed to start '{command}': {source}")]
    ProcessNotCreated {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("login shell environment unavailable: {0}")]
    ShellEnvUnavailable(String),
}

/// Builder for a single process invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandLine {
    exe_path: Option<String>,
    parameters: ParametersList,
    environment: EnvironmentMap,
    parent_environment: ParentEnvironment,
    work_directory: Option<PathBuf>,
    redirect_error_stream: bool,
}

impl CommandLine {
    pub fn new(exe_path: impl Into<String>) -> Self {
        Self::default().with_exe_path(exe_path)
    }

    /// Build from a full command where the first element is the executable
    /// and the rest are parameters. An empty iterator leaves the executable
    /// unset, which [`Self::create_process`] later rejects.
    pub fn from_command<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut result = Self::default();
        let mut parts = command.into_iter();
        if let Some(exe) = parts.next() {
            result.exe_path = Some(exe.into().trim().to_string());
        }
        result.parameters.add_all(parts);
        result
    }

    /// Set the executable path. Surrounding whitespace is trimmed.
    pub fn with_exe_path(mut self, exe_path: impl Into<String>) -> Self {
        self.exe_path = Some(exe_path.into().trim().to_string());
        self
    }

    pub fn with_work_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_directory = Some(dir.into());
        self
    }

    pub fn with_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.parameters.add(parameter);
        self
    }

    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters.add_all(parameters);
        self
    }

    pub fn with_environment_var(mut self, name: &str, value: &str) -> Self {
        self.environment.set(name, value);
        self
    }

    pub fn with_environment<I>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.environment.merge(entries);
        self
    }

    pub fn with_parent_environment(mut self, parent: ParentEnvironment) -> Self {
        self.parent_environment = parent;
        self
    }

    /// When set, the process handler records stderr output as if it had
    /// arrived on stdout, so consumers see a single merged stream.
    pub fn with_redirect_error_stream(mut self, redirect: bool) -> Self {
        self.redirect_error_stream = redirect;
        self
    }

    pub fn exe_path(&self) -> Option<&str> {
        self.exe_path.as_deref()
    }

    pub fn work_directory(&self) -> Option<&Path> {
        self.work_directory.as_deref()
    }

    pub fn parameters(&self) -> &ParametersList {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut ParametersList {
        &mut self.parameters
    }

    pub fn environment(&self) -> &EnvironmentMap {
        &self.environment
    }

    pub fn environment_mut(&mut self) -> &mut EnvironmentMap {
        &mut self.environment
    }

    pub fn parent_environment(&self) -> ParentEnvironment {
        self.parent_environment
    }

    pub fn redirect_error_stream(&self) -> bool {
        self.redirect_error_stream
    }

    /// Single-line display form, quoted per [`ParametersList::join_args`].
    /// Meant for logs and UIs, not for handing to a shell.
    pub fn command_line_string(&self) -> String {
        self.render_command_line(self.exe_path.as_deref())
    }

    /// Same as [`Self::command_line_string`] with the executable substituted,
    /// for showing a command under an alias or wrapper name.
    pub fn command_line_string_with_exe(&self, exe_name: &str) -> String {
        self.render_command_line(Some(exe_name))
    }

    fn render_command_line(&self, exe: Option<&str>) -> String {
        let mut all = Vec::with_capacity(self.parameters.len() + 1);
        all.push(exe.unwrap_or("<none>").to_string());
        all.extend(self.parameters.list().iter().cloned());
        ParametersList::join_args(&all)
    }

    /// Newline-separated command line with platform escaping applied to each
    /// token, the form a terminal on `platform` would accept.
    pub fn prepared_command_line(&self, platform: Platform) -> String {
        let exe = self.exe_path.clone().unwrap_or_default();
        escape::to_command_line(&exe, self.parameters.list(), platform).join("\n")
    }

    /// The exact variable map the child will receive: the captured parent
    /// environment (per the configured mode) with user variables layered on
    /// top under platform key semantics.
    pub async fn effective_environment(&self) -> HashMap<String, String> {
        let mut merged = EnvironmentMap::new();
        merged.merge(self.parent_environment.capture().await);
        for (name, value) in self.environment.iter() {
            merged.set(name, value);
        }
        merged.into_map()
    }

    /// Validate and start the process with all stdio piped.
    ///
    /// Checks run in a fixed order: working directory first, then the
    /// executable. A spawn refused by the OS comes back as
    /// [`ExecError::ProcessNotCreated`] with the I/O cause attached.
    pub async fn create_process(&self) -> Result<Child, ExecError> {
        self.create_process_inner(false).await
    }

    pub(crate) async fn create_process_inner(
        &self,
        kill_on_drop: bool,
    ) -> Result<Child, ExecError> {
        tracing::debug!("Executing [{}]", self.command_line_string());
        if let Err(e) = self.validate() {
            tracing::info!("{}", e);
            return Err(e);
        }
        let exe = self.exe_path.clone().unwrap_or_default();
        match self.spawn(&exe, kill_on_drop).await {
            Ok(child) => Ok(child),
            Err(e) => {
                let err = ExecError::ProcessNotCreated {
                    command: self.command_line_string(),
                    source: e,
                };
                tracing::warn!("{}", err);
                Err(err)
            }
        }
    }

    fn validate(&self) -> Result<(), ExecError> {
        if let Some(dir) = &self.work_directory {
            if !dir.exists() {
                return Err(ExecError::WorkDirMissing(dir.clone()));
            }
            if !dir.is_dir() {
                return Err(ExecError::WorkDirNotDirectory(dir.clone()));
            }
        }
        match &self.exe_path {
            Some(exe) if !exe.trim().is_empty() => Ok(()),
            _ => Err(ExecError::ExeNotSpecified),
        }
    }

    async fn spawn(&self, exe: &str, kill_on_drop: bool) -> std::io::Result<Child> {
        let mut cmd = tokio::process::Command::new(exe);
        cmd.args(self.parameters.list());
        cmd.env_clear();
        cmd.envs(self.effective_environment().await);
        if let Some(dir) = &self.work_directory {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(kill_on_drop);
        apply_spawn_flags(&mut cmd);
        cmd.spawn()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line_string())
    }
}
