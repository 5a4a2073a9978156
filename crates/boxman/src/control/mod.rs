//! Virtualization control plane.
//!
//! [`ControlPlane`] is the narrow interface every libvirt-facing operation
//! goes through. Each call either succeeds or fails with a structured
//! [`ControlError`], so idempotence and retry policy can be written against
//! error kinds instead of command output.

pub mod virsh;
pub mod xml;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::{CommandOutput, CommandSpec, ExecError};

/// Control-plane failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// The named resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource already exists (or is already in the requested state).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The request was rejected as malformed.
    #[error("invalid parameters: {0}")]
    Invalid(String),

    /// The control plane could not be reached.
    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    /// A local file needed for the request could not be written or removed.
    #[error("I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Any other non-zero exit.
    #[error("`{command}` failed with exit code {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },
}

impl ControlError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub(crate) fn io(path: &Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

impl From<ExecError> for ControlError {
    fn from(err: ExecError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Turn a failed command into a [`ControlError`] by inspecting its stderr.
///
/// This is the only place command output is matched as text.
#[must_use]
pub fn classify(command: &CommandSpec, output: &CommandOutput) -> ControlError {
    let stderr = output.stderr.trim();
    let message = if stderr.is_empty() {
        output.stdout.trim().to_string()
    } else {
        stderr.to_string()
    };
    let lower = message.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if any(&[
        "failed to connect",
        "cannot connect",
        "unable to connect",
        "connection refused",
        "no connection driver",
        "could not resolve hostname",
        "no route to host",
        "connection timed out",
    ]) {
        ControlError::Unavailable(message)
    } else if any(&[
        "not found",
        "no domain with matching",
        "no network with matching",
        "failed to get domain",
        "failed to get network",
        "no such file",
        "does not exist",
    ]) {
        ControlError::NotFound(message)
    } else if any(&["already exists", "already in use", "already active", "is already"]) {
        ControlError::AlreadyExists(message)
    } else if any(&[
        "xml error",
        "invalid argument",
        "unsupported configuration",
        "cannot parse",
        "invalid value",
        "malformed",
    ]) {
        ControlError::Invalid(message)
    } else {
        ControlError::Failed {
            command: command.display(),
            code: output.exit_code,
            stderr: message,
        }
    }
}

/// Observed power state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    Absent,
    Running,
    Paused,
    /// Shut off with a managed save image.
    Saved,
    /// Shut off without saved state.
    ShutOff,
    Crashed,
    /// Transitional or unrecognised (e.g. `in shutdown`).
    Unknown,
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Saved => "saved",
            Self::ShutOff => "shut off",
            Self::Crashed => "crashed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Forwarding mode of a virtual network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Outbound access through NAT.
    #[default]
    Nat,
    /// Routed, no NAT.
    Route,
}

impl NetworkMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nat => "nat",
            Self::Route => "route",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bridge device parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeSpec {
    /// Device name; libvirt picks `virbrN` when unset.
    pub name: Option<String>,
    pub stp: bool,
    pub delay: u32,
}

/// Everything needed to define a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDefinition {
    pub name: String,
    pub mode: NetworkMode,
    pub bridge: BridgeSpec,
    pub mac: Option<String>,
    pub address: String,
    pub netmask: String,
    pub dhcp: Option<(String, String)>,
    /// Where the rendered definition is written.
    pub workdir: PathBuf,
}

/// What the control plane reports about an existing network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub active: bool,
    pub autostart: bool,
    pub mode: Option<String>,
    pub bridge: Option<String>,
    pub address: Option<String>,
    pub netmask: Option<String>,
}

/// vCPU layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuTopology {
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
}

impl Default for CpuTopology {
    fn default() -> Self {
        Self {
            sockets: 1,
            cores: 1,
            threads: 1,
        }
    }
}

impl CpuTopology {
    #[must_use]
    pub fn vcpus(&self) -> u32 {
        self.sockets * self.cores * self.threads
    }
}

/// Clone `source` into a new VM `name`, placing its OS disk at `disk_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub source: String,
    pub name: String,
    pub disk_path: PathBuf,
}

/// Where an imported VM's single adapter is plugged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportNetwork {
    Network(String),
    Bridge(String),
}

/// Define and boot a VM around an existing disk image (`virt-install
/// --import`), with a cloud-init seed attached as a CD-ROM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub name: String,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub os_variant: String,
    pub disk_path: PathBuf,
    pub disk_format: String,
    pub seed_path: PathBuf,
    pub network: ImportNetwork,
    /// Passed to `virt-install` verbatim.
    pub extra_args: Vec<String>,
}

/// A disk image attached at a fixed target slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskAttachment {
    pub path: PathBuf,
    pub driver: String,
    pub format: String,
    pub target: String,
}

/// A network adapter attached to a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAttachment {
    pub network: String,
    pub mac: Option<String>,
    pub model: Option<String>,
    pub link_up: bool,
}

/// An interface found in a VM definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Source network; `None` for bridge or direct interfaces.
    pub network: Option<String>,
    pub mac: Option<String>,
}

/// Resources and devices in a VM's persistent definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainLayout {
    pub vcpus: Option<u32>,
    pub memory_mib: Option<u64>,
    /// Target slots of attached disks, OS disk included.
    pub disk_targets: Vec<String>,
    pub interfaces: Vec<InterfaceInfo>,
}

/// A DHCP lease observed on a VM interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub interface: String,
    pub mac: String,
    /// Address without prefix length.
    pub address: String,
}

/// A named point-in-time capture of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub description: Option<String>,
    /// VM state captured by the snapshot.
    pub state: Option<String>,
}

/// Operations on libvirt networks, VMs, disks and snapshots.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Verify the control plane is reachable.
    async fn check(&self) -> Result<(), ControlError>;

    /// Current definition and state of a network, `None` when undefined.
    async fn network_info(&self, name: &str) -> Result<Option<NetworkInfo>, ControlError>;
    async fn define_network(&self, definition: &NetworkDefinition) -> Result<(), ControlError>;
    async fn set_network_autostart(&self, name: &str) -> Result<(), ControlError>;
    async fn start_network(&self, name: &str) -> Result<(), ControlError>;
    async fn stop_network(&self, name: &str) -> Result<(), ControlError>;
    async fn undefine_network(&self, name: &str) -> Result<(), ControlError>;

    /// Current power state; [`DomainState::Absent`] when undefined.
    async fn domain_state(&self, name: &str) -> Result<DomainState, ControlError>;
    async fn clone_domain(&self, request: &CloneRequest) -> Result<(), ControlError>;
    async fn import_domain(&self, request: &ImportRequest) -> Result<(), ControlError>;
    async fn domain_layout(&self, name: &str) -> Result<DomainLayout, ControlError>;
    /// Rewrite the persistent definition with a new CPU layout and memory
    /// size. `workdir` receives the intermediate definition file.
    async fn set_cpu_memory(
        &self,
        name: &str,
        cpus: Option<CpuTopology>,
        memory_mib: Option<u64>,
        workdir: &Path,
    ) -> Result<(), ControlError>;
    async fn create_disk_image(
        &self,
        path: &Path,
        format: &str,
        size_mib: u64,
    ) -> Result<(), ControlError>;
    async fn remove_disk_image(&self, path: &Path) -> Result<(), ControlError>;
    async fn disk_image_exists(&self, path: &Path) -> Result<bool, ControlError>;
    /// Copy an image, keeping it sparse.
    async fn copy_disk_image(&self, source: &Path, destination: &Path) -> Result<(), ControlError>;
    async fn download_disk_image(&self, url: &str, destination: &Path) -> Result<(), ControlError>;
    /// Grow an image; `size` is in `qemu-img resize` syntax.
    async fn resize_disk_image(&self, path: &Path, size: &str) -> Result<(), ControlError>;
    /// Pack `user-data`, `meta-data` and (if present) `network-config`
    /// from `nocloud_dir` into a `cidata` seed image at `path`.
    async fn build_seed_image(&self, nocloud_dir: &Path, path: &Path) -> Result<(), ControlError>;
    async fn attach_disk(&self, domain: &str, disk: &DiskAttachment) -> Result<(), ControlError>;
    async fn attach_interface(
        &self,
        domain: &str,
        interface: &InterfaceAttachment,
    ) -> Result<(), ControlError>;

    async fn start_domain(&self, name: &str) -> Result<(), ControlError>;
    async fn suspend_domain(&self, name: &str) -> Result<(), ControlError>;
    async fn resume_domain(&self, name: &str) -> Result<(), ControlError>;
    /// Persist memory and device state to disk and stop the VM.
    async fn save_domain(&self, name: &str) -> Result<(), ControlError>;
    /// Start a VM from its saved state.
    async fn restore_domain(&self, name: &str) -> Result<(), ControlError>;
    /// Ask the guest to power off.
    async fn shutdown_domain(&self, name: &str) -> Result<(), ControlError>;
    /// Power off immediately.
    async fn destroy_domain(&self, name: &str) -> Result<(), ControlError>;
    /// Remove the VM definition and its storage.
    async fn undefine_domain(&self, name: &str) -> Result<(), ControlError>;

    async fn domain_leases(&self, name: &str) -> Result<Vec<Lease>, ControlError>;

    async fn create_snapshot(
        &self,
        domain: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<(), ControlError>;
    async fn list_snapshots(&self, domain: &str) -> Result<Vec<SnapshotInfo>, ControlError>;
    async fn revert_snapshot(&self, domain: &str, name: &str) -> Result<(), ControlError>;
    async fn delete_snapshot(&self, domain: &str, name: &str) -> Result<(), ControlError>;
}
