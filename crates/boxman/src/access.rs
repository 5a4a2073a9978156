//! SSH access to provisioned guests.
//!
//! One ed25519 keypair per cluster, installed into each guest with the
//! cluster's admin password, plus a generated `ssh_config` mapping every
//! hostname to its leased address.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::executor::{CommandSpec, ExecError, Executor};
use crate::graph::ClusterNode;
use crate::retry::{retry, Attempt, RetryError, RetryPolicy};

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("ssh-keygen failed for {path}: {message}")]
    Keygen { path: PathBuf, message: String },

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single copy or verification attempt failed.
    #[error("{host}: {message}")]
    Attempt { host: String, message: String },

    /// Every attempt allowed by the policy failed.
    #[error("could not install key on {host} after {attempts} attempts: {last}")]
    Exhausted {
        host: String,
        attempts: u32,
        last: String,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// A guest reachable over SSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub hostname: String,
    pub address: String,
}

/// Installs a public key into a guest using password authentication.
#[async_trait]
pub trait KeyCopier: Send + Sync {
    async fn copy_key(
        &self,
        user: &str,
        host: &HostEntry,
        public_key: &Path,
        password: &str,
    ) -> Result<(), AccessError>;

    /// Log in with the installed key through `ssh_config`.
    async fn verify(&self, ssh_config: &Path, host: &HostEntry) -> Result<(), AccessError>;
}

/// `sshpass` + `ssh-copy-id`, verified with a batch-mode `ssh`.
pub struct SshCopyId {
    executor: Arc<dyn Executor>,
}

impl SshCopyId {
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    async fn run(&self, host: &HostEntry, command: CommandSpec) -> Result<(), AccessError> {
        let output = self.executor.run(&command).await?;
        if output.success() {
            return Ok(());
        }
        Err(AccessError::Attempt {
            host: host.hostname.clone(),
            message: format!(
                "{} exited with {}: {}",
                command.program,
                output.exit_code,
                output.stderr.trim()
            ),
        })
    }
}

#[async_trait]
impl KeyCopier for SshCopyId {
    async fn copy_key(
        &self,
        user: &str,
        host: &HostEntry,
        public_key: &Path,
        password: &str,
    ) -> Result<(), AccessError> {
        // Password goes through the environment, never the argument list.
        let command = CommandSpec::new("sshpass")
            .args(["-e", "ssh-copy-id", "-i"])
            .arg(public_key.display().to_string())
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
            ])
            .arg(format!("{user}@{}", host.address))
            .env("SSHPASS", password);
        self.run(host, command).await
    }

    async fn verify(&self, ssh_config: &Path, host: &HostEntry) -> Result<(), AccessError> {
        let command = CommandSpec::new("ssh")
            .arg("-F")
            .arg(ssh_config.display().to_string())
            .args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=10"])
            .arg(host.hostname.clone())
            .arg("hostname");
        self.run(host, command).await
    }
}

/// Render the SSH client configuration for a cluster. The output depends
/// only on its inputs, so re-running provisioning rewrites the same file.
#[must_use]
pub fn render_ssh_config(cluster: &ClusterNode, hosts: &[HostEntry]) -> String {
    let mut out = format!("# Managed by boxman for {}\n", cluster.qualified_name());
    out.push_str("Host *\n");
    out.push_str("    StrictHostKeyChecking no\n");
    out.push_str("    UserKnownHostsFile /dev/null\n");
    out.push_str("    LogLevel ERROR\n");
    for host in hosts {
        out.push_str(&format!(
            "\nHost {}\n    Hostname {}\n    User {}\n    IdentityFile {}\n",
            host.hostname,
            host.address,
            cluster.admin_user,
            cluster.key_path.display()
        ));
    }
    out
}

pub struct AccessProvisioner {
    executor: Arc<dyn Executor>,
    copier: Arc<dyn KeyCopier>,
    policy: RetryPolicy,
}

impl AccessProvisioner {
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>, copier: Arc<dyn KeyCopier>, policy: RetryPolicy) -> Self {
        Self {
            executor,
            copier,
            policy,
        }
    }

    /// Generate the cluster keypair unless the private key already exists.
    /// Returns `true` if a key was generated.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Keygen`] if `ssh-keygen` fails.
    pub async fn ensure_keypair(&self, cluster: &ClusterNode) -> Result<bool, AccessError> {
        let key = &cluster.key_path;
        if tokio::fs::try_exists(key).await.unwrap_or(false) {
            debug!(key = %key.display(), "Keypair already present");
            return Ok(false);
        }

        let command = CommandSpec::new("ssh-keygen")
            .args(["-t", "ed25519", "-a", "100", "-f"])
            .arg(key.display().to_string())
            .args(["-q", "-N", "", "-C"])
            .arg(format!("boxman@{}", cluster.qualified_name()));
        let output = self.executor.run(&command).await?;
        if !output.success() {
            return Err(AccessError::Keygen {
                path: key.clone(),
                message: output.stderr.trim().to_string(),
            });
        }
        info!(key = %key.display(), cluster = %cluster.qualified_name(), "Keypair generated");
        Ok(true)
    }

    /// Write the cluster's `ssh_config`.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Io`] if the file cannot be written.
    pub async fn write_ssh_config(
        &self,
        cluster: &ClusterNode,
        hosts: &[HostEntry],
    ) -> Result<PathBuf, AccessError> {
        let path = cluster.ssh_config_path.clone();
        let content = render_ssh_config(cluster, hosts);
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| AccessError::Io {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), hosts = hosts.len(), "SSH config written");
        Ok(path)
    }

    /// Copy the cluster public key into `host` and verify key login,
    /// retrying while the guest's SSH service comes up. Returns the number
    /// of attempts used.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Exhausted`] when every attempt failed.
    pub async fn install_key(
        &self,
        cluster: &ClusterNode,
        host: &HostEntry,
        password: &str,
    ) -> Result<u32, AccessError> {
        let copier = &self.copier;
        let public_key = cluster.public_key_path();
        let public_key = public_key.as_path();
        let user = cluster.admin_user.as_str();
        let ssh_config = cluster.ssh_config_path.as_path();

        let result = retry(&self.policy, "ssh key install", move |attempt| async move {
            let installed = match copier.copy_key(user, host, public_key, password).await {
                Ok(()) => copier.verify(ssh_config, host).await,
                Err(e) => Err(e),
            };
            match installed {
                Ok(()) => Attempt::Done(attempt),
                Err(e) => Attempt::Retry(e.to_string()),
            }
        })
        .await;

        match result {
            Ok(attempts) => {
                info!(host = %host.hostname, address = %host.address, attempts, "SSH key installed");
                Ok(attempts)
            }
            Err(e) => {
                let (attempts, last) = match e {
                    RetryError::Fatal(last) => (1, last),
                    RetryError::Exhausted { attempts, last, .. } => (attempts, last),
                };
                warn!(host = %host.hostname, attempts, error = %last, "SSH key installation gave up");
                Err(AccessError::Exhausted {
                    host: host.hostname.clone(),
                    attempts,
                    last,
                })
            }
        }
    }
}
