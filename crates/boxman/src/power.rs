//! VM power-state transitions.
//!
//! [`plan`] decides, from the observed state alone, whether an action is a
//! no-op, needs a control-plane call, or is invalid. Invalid transitions
//! never reach the control plane.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::control::{ControlError, ControlPlane, DomainState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Pause,
    Resume,
    Save,
    Restore,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Save => "save",
            Self::Restore => "restore",
        })
    }
}

/// An action that is not valid from the VM's current state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot {action} VM {vm}: it is {state}")]
pub struct PreconditionError {
    pub vm: String,
    pub action: PowerAction,
    pub state: DomainState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Already in the target state.
    Noop,
    Invoke(PowerAction),
}

/// Decide what `action` means for a VM in `state`.
///
/// # Errors
///
/// Returns a [`PreconditionError`] (with an empty `vm`) when the action is
/// invalid from `state`.
pub fn plan(action: PowerAction, state: DomainState) -> Result<Transition, PreconditionError> {
    use DomainState as S;
    use PowerAction as A;

    let transition = match (action, state) {
        (A::Start, S::Running)
        | (A::Pause, S::Paused)
        | (A::Resume, S::Running)
        | (A::Save, S::Saved)
        | (A::Restore, S::Running) => Transition::Noop,

        (A::Start, S::ShutOff | S::Crashed)
        | (A::Pause, S::Running)
        | (A::Resume, S::Paused)
        | (A::Save, S::Running | S::Paused)
        | (A::Restore, S::Saved) => Transition::Invoke(action),

        // Starting a domain with a managed save image resumes from it.
        (A::Start, S::Saved) => Transition::Invoke(A::Restore),

        _ => {
            return Err(PreconditionError {
                vm: String::new(),
                action,
                state,
            })
        }
    };
    Ok(transition)
}

/// What `up` does to an existing VM in `state`. `None` for an absent VM,
/// which needs full provisioning instead.
#[must_use]
pub fn plan_up(state: DomainState) -> Option<Transition> {
    match state {
        DomainState::Absent => None,
        DomainState::Running => Some(Transition::Noop),
        DomainState::Paused => Some(Transition::Invoke(PowerAction::Resume)),
        DomainState::Saved => Some(Transition::Invoke(PowerAction::Restore)),
        DomainState::ShutOff | DomainState::Crashed | DomainState::Unknown => {
            Some(Transition::Invoke(PowerAction::Start))
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PowerError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("VM {vm}: {source}")]
    Control {
        vm: String,
        #[source]
        source: ControlError,
    },
}

pub struct PowerController {
    control: Arc<dyn ControlPlane>,
}

impl PowerController {
    #[must_use]
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self { control }
    }

    /// Apply `action` to `vm`. Returns the transition taken.
    ///
    /// # Errors
    ///
    /// Returns [`PowerError::Precondition`] without calling the control
    /// plane when the action is invalid from the observed state.
    pub async fn apply(&self, vm: &str, action: PowerAction) -> Result<Transition, PowerError> {
        let state = self.state(vm).await?;
        let transition = plan(action, state).map_err(|e| PreconditionError {
            vm: vm.to_string(),
            ..e
        })?;
        self.execute(vm, transition).await?;
        Ok(transition)
    }

    /// Bring an existing VM in `state` to running.
    ///
    /// # Errors
    ///
    /// Returns a precondition error for an absent VM.
    pub async fn bring_up(&self, vm: &str, state: DomainState) -> Result<Transition, PowerError> {
        let Some(transition) = plan_up(state) else {
            return Err(PreconditionError {
                vm: vm.to_string(),
                action: PowerAction::Start,
                state,
            }
            .into());
        };
        self.execute(vm, transition).await?;
        Ok(transition)
    }

    /// Observed state of `vm`.
    ///
    /// # Errors
    ///
    /// Propagates control-plane failures.
    pub async fn state(&self, vm: &str) -> Result<DomainState, PowerError> {
        self.control
            .domain_state(vm)
            .await
            .map_err(|source| PowerError::Control {
                vm: vm.to_string(),
                source,
            })
    }

    async fn execute(&self, vm: &str, transition: Transition) -> Result<(), PowerError> {
        let Transition::Invoke(action) = transition else {
            info!(vm = %vm, "VM already in requested state");
            return Ok(());
        };

        let result = match action {
            PowerAction::Start => self.control.start_domain(vm).await,
            PowerAction::Pause => self.control.suspend_domain(vm).await,
            PowerAction::Resume => self.control.resume_domain(vm).await,
            PowerAction::Save => self.control.save_domain(vm).await,
            PowerAction::Restore => self.control.restore_domain(vm).await,
        };
        match result {
            Ok(()) => {
                info!(vm = %vm, %action, "Power state changed");
                Ok(())
            }
            // Raced with something else starting it.
            Err(e) if e.is_already_exists() && action == PowerAction::Start => Ok(()),
            Err(source) => Err(PowerError::Control {
                vm: vm.to_string(),
                source,
            }),
        }
    }
}
