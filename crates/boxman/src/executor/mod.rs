//! Command execution indirection.
//!
//! Every external command (virsh, qemu-img, ssh-keygen, ssh-copy-id, ...)
//! goes through an [`Executor`]. Control-plane commands run wherever the
//! libvirt daemon lives, on the local host or relayed into a container;
//! SSH tooling always runs on the host.

mod container;
mod local;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub use container::{compose_project_name, container_name, ContainerExecutor};
pub use local::LocalExecutor;

/// Executor failures. A command that ran and exited non-zero is *not* an
/// error at this level; it is reported through [`CommandOutput::exit_code`].
#[derive(Error, Debug)]
pub enum ExecError {
    /// The program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The execution environment is not usable.
    #[error("runtime not ready: {0}")]
    Runtime(String),
}

/// A command to run: program, arguments and extra environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program and arguments as a single string, for logs and error
    /// messages. Environment values are left out since they may hold secrets.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands somewhere.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Executor: Send + Sync {
    /// Short name for logs (`local`, `docker`).
    fn name(&self) -> &'static str;

    /// Make sure the execution environment is usable, starting it if needed.
    async fn ensure_ready(&self) -> Result<(), ExecError>;

    /// Run a command to completion and capture its output.
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError>;

    /// Remove the execution environment and the state kept in it.
    async fn teardown(&self) -> Result<(), ExecError> {
        Ok(())
    }
}

/// Which executor to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Run commands directly on this host.
    #[default]
    Local,
    /// Relay commands into the project's libvirt container.
    #[serde(alias = "docker-compose")]
    #[value(alias = "docker-compose")]
    Docker,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Docker => f.write_str("docker"),
        }
    }
}

/// Runtime selection plus container settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub kind: RuntimeKind,
    /// Container name override; derived from the project otherwise.
    pub container: Option<String>,
    /// Compose file used to start the container when it is not running.
    pub compose_file: Option<PathBuf>,
    /// How long to wait for the container to report running.
    pub ready_timeout_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Local,
            container: None,
            compose_file: None,
            ready_timeout_secs: 60,
        }
    }
}

/// Build the executor selected by `settings` for `project`. `mounts` are
/// host directories the container runtime must see at the same path.
#[must_use]
pub fn create_executor(settings: &RuntimeSettings, project: &str, mounts: &[PathBuf]) -> Arc<dyn Executor> {
    match settings.kind {
        RuntimeKind::Local => Arc::new(LocalExecutor::new()),
        RuntimeKind::Docker => Arc::new(ContainerExecutor::from_settings(settings, project, mounts)),
    }
}
