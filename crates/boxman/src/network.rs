//! Network lifecycle.
//!
//! `ensure` is create-or-start and never redefines an existing network: a
//! definition that differs from the declaration is reported as a conflict
//! and left alone. `teardown` treats an absent network as already removed.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::control::{ControlError, ControlPlane, NetworkDefinition, NetworkInfo};
use crate::graph::NetworkNode;
use crate::retry::{retry, Attempt, RetryError, RetryPolicy};

/// What `ensure` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Defined (and started, if enabled).
    Defined,
    /// Already defined; started and/or marked autostart.
    Updated,
    /// Already defined and in the declared state.
    Unchanged,
}

/// What `teardown` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    Removed,
    Absent,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("network {name}: {source}")]
    Control {
        name: String,
        #[source]
        source: ControlError,
    },

    #[error("network {name} is already defined with different parameters: {differences}")]
    Conflict { name: String, differences: String },
}

/// Declared-vs-defined differences, empty when compatible. Attributes the
/// control plane does not report are not compared.
#[must_use]
pub fn differences(declared: &NetworkDefinition, defined: &NetworkInfo) -> Vec<String> {
    let mut diffs = Vec::new();
    let mut compare = |field: &str, want: Option<&str>, have: Option<&str>| {
        if let (Some(want), Some(have)) = (want, have) {
            if want != have {
                diffs.push(format!("{field} declared {want}, defined {have}"));
            }
        }
    };
    compare("mode", Some(declared.mode.as_str()), defined.mode.as_deref());
    compare("bridge", declared.bridge.name.as_deref(), defined.bridge.as_deref());
    compare("address", Some(declared.address.as_str()), defined.address.as_deref());
    compare("netmask", Some(declared.netmask.as_str()), defined.netmask.as_deref());
    diffs
}

pub struct NetworkManager {
    control: Arc<dyn ControlPlane>,
    start_policy: RetryPolicy,
}

impl NetworkManager {
    #[must_use]
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self {
            control,
            // One retry after a short pause.
            start_policy: RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(1), 2),
        }
    }

    #[must_use]
    pub fn with_start_policy(mut self, policy: RetryPolicy) -> Self {
        self.start_policy = policy;
        self
    }

    /// Create the network if undefined, otherwise bring it to the declared
    /// state without touching its definition.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Conflict`] for an incompatible existing
    /// definition and [`NetworkError::Control`] when the control plane
    /// rejects a step.
    pub async fn ensure(&self, network: &NetworkNode) -> Result<EnsureOutcome, NetworkError> {
        let name = network.control_name();
        let control_err = |source| NetworkError::Control {
            name: name.to_string(),
            source,
        };

        let Some(existing) = self.control.network_info(name).await.map_err(control_err)? else {
            info!(network = %name, mode = %network.definition.mode, "Defining network");
            self.control
                .define_network(&network.definition)
                .await
                .map_err(control_err)?;
            if network.autostart {
                self.control
                    .set_network_autostart(name)
                    .await
                    .map_err(control_err)?;
            }
            if network.enable {
                self.start(name).await?;
            }
            return Ok(EnsureOutcome::Defined);
        };

        let diffs = differences(&network.definition, &existing);
        if !diffs.is_empty() {
            let differences = diffs.join("; ");
            warn!(network = %name, %differences, "Network definition conflicts with configuration");
            return Err(NetworkError::Conflict {
                name: name.to_string(),
                differences,
            });
        }

        let mut outcome = EnsureOutcome::Unchanged;
        if network.autostart && !existing.autostart {
            self.control
                .set_network_autostart(name)
                .await
                .map_err(control_err)?;
            outcome = EnsureOutcome::Updated;
        }
        if network.enable && !existing.active {
            self.start(name).await?;
            outcome = EnsureOutcome::Updated;
        }
        if outcome == EnsureOutcome::Unchanged {
            info!(network = %name, "Network already in place");
        }
        Ok(outcome)
    }

    /// Stop and undefine `name`.
    ///
    /// # Errors
    ///
    /// Returns the first control-plane failure other than "not found".
    pub async fn teardown(&self, name: &str) -> Result<TeardownOutcome, NetworkError> {
        let control_err = |source| NetworkError::Control {
            name: name.to_string(),
            source,
        };

        let Some(existing) = self.control.network_info(name).await.map_err(control_err)? else {
            info!(network = %name, "Network already absent");
            return Ok(TeardownOutcome::Absent);
        };

        if existing.active {
            match self.control.stop_network(name).await {
                Err(e) if !e.is_not_found() => return Err(control_err(e)),
                _ => {}
            }
        }
        match self.control.undefine_network(name).await {
            Ok(()) => {
                info!(network = %name, "Network removed");
                Ok(TeardownOutcome::Removed)
            }
            Err(e) if e.is_not_found() => Ok(TeardownOutcome::Absent),
            Err(e) => Err(control_err(e)),
        }
    }

    async fn start(&self, name: &str) -> Result<(), NetworkError> {
        let control = &self.control;
        let result = retry(&self.start_policy, "network start", move |_| async move {
            match control.start_network(name).await {
                Ok(()) => Attempt::Done(()),
                Err(e) if e.is_already_exists() => Attempt::Done(()),
                Err(e @ ControlError::Invalid(_)) => Attempt::Fatal(e),
                Err(e) => Attempt::Retry(e),
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!(network = %name, "Network started");
                Ok(())
            }
            Err(RetryError::Fatal(source) | RetryError::Exhausted { last: source, .. }) => {
                Err(NetworkError::Control {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }
}
