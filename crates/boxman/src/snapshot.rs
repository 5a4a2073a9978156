//! Named point-in-time VM snapshots.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::control::{ControlError, ControlPlane, SnapshotInfo};

/// Name used when `snapshot create` is not given one.
#[must_use]
pub fn default_snapshot_name() -> String {
    Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string()
}

pub struct SnapshotManager {
    control: Arc<dyn ControlPlane>,
}

impl SnapshotManager {
    #[must_use]
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self { control }
    }

    /// # Errors
    ///
    /// Returns [`ControlError::AlreadyExists`] if `vm` already has a
    /// snapshot called `name`.
    pub async fn create(
        &self,
        vm: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<(), ControlError> {
        self.control.create_snapshot(vm, name, description).await?;
        info!(vm = %vm, snapshot = %name, "Snapshot created");
        Ok(())
    }

    /// # Errors
    ///
    /// Propagates control-plane failures.
    pub async fn list(&self, vm: &str) -> Result<Vec<SnapshotInfo>, ControlError> {
        self.control.list_snapshots(vm).await
    }

    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for an unknown snapshot.
    pub async fn restore(&self, vm: &str, name: &str) -> Result<(), ControlError> {
        self.control.revert_snapshot(vm, name).await?;
        info!(vm = %vm, snapshot = %name, "Snapshot restored");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for an unknown snapshot.
    pub async fn delete(&self, vm: &str, name: &str) -> Result<(), ControlError> {
        self.control.delete_snapshot(vm, name).await?;
        info!(vm = %vm, snapshot = %name, "Snapshot deleted");
        Ok(())
    }
}
