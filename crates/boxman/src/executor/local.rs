use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{CommandOutput, CommandSpec, ExecError, Executor};

/// Runs commands directly on the local host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn ensure_ready(&self) -> Result<(), ExecError> {
        Ok(())
    }

    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        debug!(command = %command, "Running command");

        let output = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        // Killed by a signal: no exit code.
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(command = %command, exit_code, "Command finished");

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        })
    }
}
