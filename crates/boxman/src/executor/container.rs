use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info, warn};

use super::{CommandOutput, CommandSpec, ExecError, Executor, LocalExecutor, RuntimeSettings};
use crate::retry::{retry, Attempt, RetryError, RetryPolicy};

const CONTAINER_PREFIX: &str = "boxman-libvirt-";
const COMPOSE_PREFIX: &str = "boxman-";
const DEFAULT_ENGINE: &str = "docker";
const READY_POLL_INTERVAL_SECS: u64 = 2;

/// State left inside the container by libvirt and by us.
const RUNTIME_STATE: &str = "rm -rf /var/run/libvirt/* /var/lib/libvirt/images/* /etc/boxman/ssh/*";

/// Lowercase, keep `[a-z0-9-]`, collapse everything else into `-`.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Name of the libvirt container hosting `project`.
#[must_use]
pub fn container_name(project: &str) -> String {
    format!("{CONTAINER_PREFIX}{}", sanitize(project))
}

/// Compose project name for `project`.
#[must_use]
pub fn compose_project_name(project: &str) -> String {
    format!("{COMPOSE_PREFIX}{}", sanitize(project))
}

/// Compose override that bind-mounts each of `dirs` at the same path into
/// the first service of `compose`.
///
/// # Errors
///
/// Returns [`ExecError::Runtime`] if `compose` is not YAML or declares no
/// services.
pub fn mounts_override(compose: &str, dirs: &[PathBuf]) -> Result<String, ExecError> {
    let document: Value = serde_yaml::from_str(compose)
        .map_err(|e| ExecError::Runtime(format!("cannot parse compose file: {e}")))?;
    let service = document
        .get("services")
        .and_then(Value::as_mapping)
        .and_then(|services| services.keys().next())
        .cloned()
        .ok_or_else(|| ExecError::Runtime("compose file declares no services".into()))?;

    let volumes: Vec<Value> = dirs
        .iter()
        .map(|dir| {
            let dir = dir.display();
            Value::String(format!("{dir}:{dir}"))
        })
        .collect();
    let mut body = Mapping::new();
    body.insert("volumes".into(), Value::Sequence(volumes));
    let mut services = Mapping::new();
    services.insert(service, Value::Mapping(body));
    let mut root = Mapping::new();
    root.insert("services".into(), Value::Mapping(services));

    serde_yaml::to_string(&Value::Mapping(root))
        .map_err(|e| ExecError::Runtime(format!("cannot render compose override: {e}")))
}

/// Relays commands into a running container with `docker exec`.
///
/// The command is quoted and handed to `bash -c` inside the container, so
/// what runs there is exactly what would have run on the host. Host
/// directories listed as mounts must be visible at the same path inside the
/// container: definitions and disk images are written there.
#[derive(Debug, Clone)]
pub struct ContainerExecutor {
    engine: String,
    container: String,
    compose_file: Option<PathBuf>,
    compose_project: String,
    mounts: Vec<PathBuf>,
    ready_timeout: Duration,
    host: LocalExecutor,
}

impl ContainerExecutor {
    #[must_use]
    pub fn new(container: impl Into<String>, compose_project: impl Into<String>) -> Self {
        Self {
            engine: DEFAULT_ENGINE.to_string(),
            container: container.into(),
            compose_file: None,
            compose_project: compose_project.into(),
            mounts: Vec::new(),
            ready_timeout: Duration::from_secs(60),
            host: LocalExecutor::new(),
        }
    }

    #[must_use]
    pub fn from_settings(settings: &RuntimeSettings, project: &str, mounts: &[PathBuf]) -> Self {
        let container = settings
            .container
            .clone()
            .unwrap_or_else(|| container_name(project));
        let mut executor = Self::new(container, compose_project_name(project));
        executor.compose_file.clone_from(&settings.compose_file);
        executor.mounts = mounts.to_vec();
        executor.ready_timeout = Duration::from_secs(settings.ready_timeout_secs);
        executor
    }

    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    /// The host-side command that runs `command` inside the container.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Runtime`] if an argument cannot be quoted (it
    /// contains a NUL byte).
    pub fn wrap(&self, command: &CommandSpec) -> Result<CommandSpec, ExecError> {
        let words = std::iter::once(command.program.as_str())
            .chain(command.args.iter().map(String::as_str));
        let script = shlex::try_join(words)
            .map_err(|e| ExecError::Runtime(format!("cannot quote `{command}`: {e}")))?;

        let mut wrapped = CommandSpec::new(&self.engine).args(["exec", "--user", "root"]);
        for (key, value) in &command.env {
            wrapped = wrapped.arg("-e").arg(format!("{key}={value}"));
        }
        Ok(wrapped.arg(&self.container).args(["bash", "-c"]).arg(script))
    }

    /// Where the mount override for `compose_file` is written.
    fn override_path(&self, compose_file: &Path) -> PathBuf {
        compose_file.with_file_name(format!(".{}-mounts.yml", self.compose_project))
    }

    fn compose<I, S>(&self, compose_file: &Path, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = CommandSpec::new(&self.engine)
            .args(["compose", "-p"])
            .arg(&self.compose_project)
            .arg("-f")
            .arg(compose_file.display().to_string());
        if !self.mounts.is_empty() {
            command = command
                .arg("-f")
                .arg(self.override_path(compose_file).display().to_string());
        }
        command.args(args)
    }

    async fn run_host(&self, command: &CommandSpec) -> Result<(), ExecError> {
        let output = self.host.run(command).await?;
        if !output.success() {
            return Err(ExecError::Runtime(format!(
                "`{command}` exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn is_running(&self) -> Result<bool, ExecError> {
        let inspect = CommandSpec::new(&self.engine)
            .args(["inspect", "-f", "{{.State.Running}}"])
            .arg(&self.container);
        let output = self.host.run(&inspect).await?;
        Ok(output.success() && output.stdout.trim() == "true")
    }

    /// The first mount the running container cannot see.
    async fn hidden_mount(&self) -> Result<Option<&Path>, ExecError> {
        for dir in &self.mounts {
            let test = CommandSpec::new("test")
                .arg("-d")
                .arg(dir.display().to_string());
            if !self.run(&test).await?.success() {
                return Ok(Some(dir));
            }
        }
        Ok(None)
    }

    async fn compose_up(&self, compose_file: &Path) -> Result<(), ExecError> {
        if !self.mounts.is_empty() {
            let compose = tokio::fs::read_to_string(compose_file).await.map_err(|e| {
                ExecError::Runtime(format!("cannot read {}: {e}", compose_file.display()))
            })?;
            let path = self.override_path(compose_file);
            tokio::fs::write(&path, mounts_override(&compose, &self.mounts)?)
                .await
                .map_err(|e| ExecError::Runtime(format!("cannot write {}: {e}", path.display())))?;
        }
        info!(
            container = %self.container,
            compose_file = %compose_file.display(),
            mounts = self.mounts.len(),
            "Starting libvirt container"
        );
        self.run_host(&self.compose(compose_file, ["up", "-d", "--build"]))
            .await
    }

    fn ready_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            Duration::from_secs(READY_POLL_INTERVAL_SECS),
            self.ready_timeout,
        )
    }

    async fn wait_running(&self) -> Result<(), ExecError> {
        let this = self;
        let result = retry(&self.ready_policy(), "container readiness", move |_| async move {
            match this.is_running().await {
                Ok(true) => Attempt::Done(()),
                Ok(false) => Attempt::Retry(ExecError::Runtime(format!(
                    "container {} not running yet",
                    this.container
                ))),
                Err(e) => Attempt::Fatal(e),
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!(container = %self.container, "Container is running");
                Ok(())
            }
            Err(RetryError::Fatal(e)) => Err(e),
            Err(RetryError::Exhausted { elapsed, .. }) => Err(ExecError::Runtime(format!(
                "container {} did not start within {elapsed:?}",
                self.container
            ))),
        }
    }

    /// Poll `virsh version` inside the container until libvirtd answers.
    async fn wait_for_libvirtd(&self) -> Result<(), ExecError> {
        let this = self;
        let version = CommandSpec::new("virsh").arg("version");
        let version = &version;
        let result = retry(&self.ready_policy(), "libvirtd readiness", move |_| async move {
            match this.run(version).await {
                Ok(output) if output.success() => Attempt::Done(()),
                Ok(output) => Attempt::Retry(ExecError::Runtime(output.stderr.trim().to_string())),
                Err(e) => Attempt::Fatal(e),
            }
        })
        .await;

        match result {
            Ok(()) => {
                debug!(container = %self.container, "libvirtd is answering");
                Ok(())
            }
            Err(RetryError::Fatal(e)) => Err(e),
            Err(RetryError::Exhausted { elapsed, last, .. }) => Err(ExecError::Runtime(format!(
                "libvirtd in {} did not answer within {elapsed:?}: {last}",
                self.container
            ))),
        }
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ensure_ready(&self) -> Result<(), ExecError> {
        for dir in &self.mounts {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ExecError::Runtime(format!("cannot create {}: {e}", dir.display())))?;
        }

        let running = self.is_running().await?;
        if running {
            match self.hidden_mount().await? {
                None => {
                    debug!(container = %self.container, "Container already running");
                    return self.wait_for_libvirtd().await;
                }
                Some(dir) if self.compose_file.is_none() => {
                    return Err(ExecError::Runtime(format!(
                        "container {} cannot see {}; mount it at the same path or configure a compose file",
                        self.container,
                        dir.display()
                    )));
                }
                Some(dir) => {
                    warn!(
                        container = %self.container,
                        dir = %dir.display(),
                        "Container cannot see a workdir, recreating it"
                    );
                }
            }
        }

        let Some(compose_file) = &self.compose_file else {
            return Err(ExecError::Runtime(format!(
                "container {} is not running and no compose file is configured",
                self.container
            )));
        };
        if running {
            self.run_host(&self.compose(compose_file, ["down"])).await?;
        }
        self.compose_up(compose_file).await?;
        self.wait_running().await?;
        self.wait_for_libvirtd().await
    }

    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let wrapped = self.wrap(command)?;
        self.host.run(&wrapped).await
    }

    async fn teardown(&self) -> Result<(), ExecError> {
        if self.is_running().await? {
            info!(container = %self.container, "Clearing libvirt state in container");
            let cleanup = CommandSpec::new("bash").args(["-c", RUNTIME_STATE]);
            let output = self.run(&cleanup).await?;
            if !output.success() {
                warn!(container = %self.container, stderr = %output.stderr.trim(), "Cleanup inside container failed");
            }
        }

        match &self.compose_file {
            Some(compose_file) => {
                self.run_host(&self.compose(compose_file, ["down", "--volumes", "--remove-orphans"]))
                    .await?;
                if !self.mounts.is_empty() {
                    let path = self.override_path(compose_file);
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        debug!(path = %path.display(), error = %e, "No compose override to remove");
                    }
                }
            }
            None => {
                let remove = CommandSpec::new(&self.engine)
                    .args(["rm", "-f"])
                    .arg(&self.container);
                self.run_host(&remove).await?;
            }
        }
        info!(container = %self.container, "Runtime removed");
        Ok(())
    }
}
