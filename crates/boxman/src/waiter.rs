//! DHCP address acquisition.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::control::{ControlError, ControlPlane, DomainState, Lease};
use crate::retry::{poll_until, Exhausted, RetryPolicy};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// The VM stopped (or never started); waiting longer cannot help.
    #[error("VM {vm} is {state}, not running")]
    NotRunning { vm: String, state: DomainState },

    #[error("VM {vm} acquired no address after {attempts} polls ({elapsed:?})")]
    Timeout {
        vm: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("VM {vm}: {source}")]
    Control {
        vm: String,
        #[source]
        source: ControlError,
    },
}

/// Why a poll should be repeated.
enum Pending {
    NoAddress,
    Unavailable(ControlError),
}

impl std::fmt::Display for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAddress => f.write_str("no address yet"),
            Self::Unavailable(e) => write!(f, "{e}"),
        }
    }
}

/// Polls a VM for DHCP leases on a fixed interval under a deadline.
pub struct IpWaiter {
    control: Arc<dyn ControlPlane>,
    policy: RetryPolicy,
}

impl IpWaiter {
    #[must_use]
    pub fn new(control: Arc<dyn ControlPlane>, policy: RetryPolicy) -> Self {
        Self { control, policy }
    }

    /// Block until `vm` reports at least one leased address.
    ///
    /// # Errors
    ///
    /// [`WaitError::NotRunning`] as soon as the VM is seen not running,
    /// [`WaitError::Timeout`] when the policy is exhausted.
    pub async fn wait(&self, vm: &str) -> Result<Vec<Lease>, WaitError> {
        info!(vm = %vm, budget = ?self.policy.deadline, "Waiting for DHCP lease");
        let control = &self.control;

        // Ok(Err(_)) stops the wait, Err(_) polls again.
        let result = poll_until(&self.policy, "address wait", move |_| async move {
            match control.domain_state(vm).await {
                Ok(DomainState::Running) => {}
                Ok(state) => {
                    return Ok(Err(WaitError::NotRunning {
                        vm: vm.to_string(),
                        state,
                    }))
                }
                Err(e @ ControlError::Unavailable(_)) => return Err(Pending::Unavailable(e)),
                Err(source) => {
                    return Ok(Err(WaitError::Control {
                        vm: vm.to_string(),
                        source,
                    }))
                }
            }
            match control.domain_leases(vm).await {
                Ok(leases) if !leases.is_empty() => Ok(Ok(leases)),
                Ok(_) => Err(Pending::NoAddress),
                Err(e @ ControlError::Unavailable(_)) => Err(Pending::Unavailable(e)),
                Err(source) => Ok(Err(WaitError::Control {
                    vm: vm.to_string(),
                    source,
                })),
            }
        })
        .await;

        match result {
            Ok(Ok(leases)) => {
                let addresses: Vec<&str> = leases.iter().map(|l| l.address.as_str()).collect();
                info!(vm = %vm, addresses = ?addresses, "Address acquired");
                Ok(leases)
            }
            Ok(Err(e)) => Err(e),
            Err(Exhausted {
                attempts, elapsed, ..
            }) => {
                warn!(vm = %vm, attempts, ?elapsed, "No address acquired");
                Err(WaitError::Timeout {
                    vm: vm.to_string(),
                    attempts,
                    elapsed,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeControlPlane, LeasePlan};
    use tokio::time::Instant;

    fn waiter(control: &Arc<FakeControlPlane>) -> IpWaiter {
        IpWaiter::new(
            control.clone(),
            RetryPolicy::fixed(Duration::from_secs(5), Duration::from_secs(600)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_after_a_few_polls() {
        let control = Arc::new(FakeControlPlane::new());
        control.add_domain("vm1", DomainState::Running);
        control.set_leases("vm1", LeasePlan::AfterPolls(3));

        let leases = waiter(&control).wait("vm1").await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(control.calls_to("domain_leases").len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_leasing_guest_times_out_at_budget() {
        let control = Arc::new(FakeControlPlane::new());
        control.add_domain("vm1", DomainState::Running);
        control.set_leases("vm1", LeasePlan::Never);
        let started = Instant::now();

        let err = waiter(&control).wait("vm1").await.unwrap_err();
        match err {
            WaitError::Timeout { attempts, .. } => assert_eq!(attempts, 120),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(control.calls_to("domain_leases").len(), 120);
        assert!(started.elapsed() <= Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_vm_fails_immediately() {
        let control = Arc::new(FakeControlPlane::new());
        control.add_domain("vm1", DomainState::ShutOff);

        let err = waiter(&control).wait("vm1").await.unwrap_err();
        assert_eq!(
            err,
            WaitError::NotRunning {
                vm: "vm1".into(),
                state: DomainState::ShutOff
            }
        );
        assert!(control.calls_to("domain_leases").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_unavailability_is_retried() {
        let control = Arc::new(FakeControlPlane::new());
        control.add_domain("vm1", DomainState::Running);
        control.fail_times(
            "domain_leases",
            "vm1",
            ControlError::Unavailable("failed to connect to the hypervisor".into()),
            2,
        );

        let leases = waiter(&control).wait("vm1").await.unwrap();
        assert_eq!(leases[0].address, "10.0.0.11");
        assert_eq!(control.calls_to("domain_leases").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_query_failure_stops_the_wait() {
        let control = Arc::new(FakeControlPlane::new());
        control.add_domain("vm1", DomainState::Running);
        control.fail_times(
            "domain_leases",
            "vm1",
            ControlError::Invalid("unknown source".into()),
            5,
        );

        let err = waiter(&control).wait("vm1").await.unwrap_err();
        assert!(matches!(err, WaitError::Control { ref vm, .. } if vm == "vm1"));
        assert_eq!(control.calls_to("domain_leases").len(), 1);
    }
}
