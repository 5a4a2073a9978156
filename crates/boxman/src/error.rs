//! Top-level error taxonomy.

use thiserror::Error;

use crate::access::AccessError;
use crate::config::ConfigError;
use crate::control::ControlError;
use crate::credentials::CredentialError;
use crate::executor::ExecError;
use crate::network::NetworkError;
use crate::power::{PowerError, PreconditionError};
use crate::provisioner::ProvisionError;
use crate::registry::RegistryError;
use crate::templates::TemplateError;
use crate::waiter::WaitError;

/// Errors that end an orchestration run (or a single resource's part of
/// it, when collected into a [`crate::report::RunReport`]).
#[derive(Error, Debug)]
pub enum BoxmanError {
    /// Invalid or inconsistent configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A VM with the requested name already exists.
    #[error("{kind} {name} already exists (use --force to replace it)")]
    Collision { kind: &'static str, name: String },

    /// An existing resource does not match its declaration and is left
    /// as it is.
    #[error("{resource} conflicts with its declaration: {message}")]
    Conflict { resource: String, message: String },

    /// The control plane rejected an operation or could not be reached.
    #[error("{resource}: {source}")]
    Control {
        resource: String,
        #[source]
        source: ControlError,
    },

    /// A prerequisite of the resource failed or is missing.
    #[error("{resource}: {message}")]
    Blocked { resource: String, message: String },

    /// Waiting for a resource ran out of time.
    #[error("{resource}: {message}")]
    Timing { resource: String, message: String },

    /// An admin credential could not be resolved.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// The requested power transition is not valid from the current state.
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// The project registry could not be read, locked or updated.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Key generation or SSH config output failed.
    #[error(transparent)]
    Access(AccessError),

    /// The execution environment is not usable.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl BoxmanError {
    pub(crate) fn control(resource: impl Into<String>, source: ControlError) -> Self {
        Self::Control {
            resource: resource.into(),
            source,
        }
    }

    pub(crate) fn blocked(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Blocked {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Timing errors leave a resource incomplete rather than failed.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Timing { .. })
    }
}

impl From<NetworkError> for BoxmanError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Control { name, source } => Self::control(format!("network {name}"), source),
            NetworkError::Conflict { name, differences } => Self::Conflict {
                resource: format!("network {name}"),
                message: differences,
            },
        }
    }
}

impl From<ProvisionError> for BoxmanError {
    fn from(e: ProvisionError) -> Self {
        match e {
            ProvisionError::Collision { vm } => Self::Collision {
                kind: "VM",
                name: vm,
            },
            ProvisionError::Control { vm, source } => Self::control(format!("VM {vm}"), source),
            ProvisionError::Disk {
                vm,
                disk,
                created,
                source,
            } => {
                let resource = if created.is_empty() {
                    format!("VM {vm} disk {disk}")
                } else {
                    format!("VM {vm} disk {disk} (kept {})", created.join(", "))
                };
                Self::control(resource, source)
            }
            ProvisionError::NetworkNotActive {
                vm,
                adapter,
                network,
            } => Self::blocked(
                format!("VM {vm} adapter {adapter}"),
                format!("network {network} is not active"),
            ),
        }
    }
}

impl From<WaitError> for BoxmanError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Timeout { ref vm, .. } => Self::Timing {
                resource: format!("VM {vm}"),
                message: e.to_string(),
            },
            WaitError::NotRunning { ref vm, .. } => Self::blocked(format!("VM {vm}"), e.to_string()),
            WaitError::Control { vm, source } => Self::control(format!("VM {vm}"), source),
        }
    }
}

impl From<PowerError> for BoxmanError {
    fn from(e: PowerError) -> Self {
        match e {
            PowerError::Precondition(e) => Self::Precondition(e),
            PowerError::Control { vm, source } => Self::control(format!("VM {vm}"), source),
        }
    }
}

impl From<AccessError> for BoxmanError {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::Attempt { ref host, .. } | AccessError::Exhausted { ref host, .. } => {
                Self::Timing {
                    resource: format!("host {host}"),
                    message: e.to_string(),
                }
            }
            AccessError::Exec(e) => Self::Exec(e),
            other => Self::Access(other),
        }
    }
}

impl From<TemplateError> for BoxmanError {
    fn from(e: TemplateError) -> Self {
        match e {
            TemplateError::Control { template, source } => Self::control(format!("template {template}"), source),
            TemplateError::MissingImage { ref template, .. } | TemplateError::UnsetVariable { ref template, .. } => {
                Self::blocked(format!("template {template}"), e.to_string())
            }
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = BoxmanError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::DomainState;
    use std::time::Duration;

    #[test]
    fn test_only_timing_errors_degrade() {
        let timeout = BoxmanError::from(WaitError::Timeout {
            vm: "p_c_vm1".into(),
            attempts: 120,
            elapsed: Duration::from_secs(595),
        });
        assert!(timeout.is_degraded());

        let not_running = BoxmanError::from(WaitError::NotRunning {
            vm: "p_c_vm1".into(),
            state: DomainState::ShutOff,
        });
        assert!(!not_running.is_degraded());

        let ssh = BoxmanError::from(AccessError::Exhausted {
            host: "web".into(),
            attempts: 5,
            last: "Connection refused".into(),
        });
        assert!(ssh.is_degraded());
    }

    #[test]
    fn test_disk_failure_names_kept_disks() {
        let err = BoxmanError::from(ProvisionError::Disk {
            vm: "p_c_vm1".into(),
            disk: "d2".into(),
            created: vec!["d1".into()],
            source: ControlError::Invalid("bad size".into()),
        });
        assert_eq!(
            err.to_string(),
            "VM p_c_vm1 disk d2 (kept d1): invalid parameters: bad size"
        );
    }
}
