//! Project and application configuration.
//!
//! The project document (`conf.yml`) is rendered through handlebars first
//! (see [`render`]) and then parsed into the typed tree below. Map-valued
//! sections keep their declaration order, which is the order resources are
//! provisioned in.

mod app;
pub mod render;

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;

pub use app::{
    default_app_config_path, default_config_dir, load_app_config, AppConfig, ProvidersConfig,
    TimingSettings,
};

use crate::control::virsh::VirshSettings;
use crate::control::{CpuTopology, NetworkMode};
use crate::credentials::Credential;
use crate::executor::RuntimeKind;
use crate::names::NameError;

/// Configuration errors. All of these are detected before any external
/// command runs.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to render {path}: {message}")]
    Render { path: PathBuf, message: String },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{context}: {source}")]
    Name {
        context: String,
        #[source]
        source: NameError,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("{kind} name '{name}' {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: &'static str,
    },

    #[error("{first} and {second} both map to {resource}")]
    NameCollision {
        resource: String,
        first: String,
        second: String,
    },

    #[error("VM {vm}: disk target {target} is declared more than once")]
    DuplicateDiskTarget { vm: String, target: String },

    #[error("VM {vm}: disk target {target} is reserved for the OS disk")]
    OsDiskTarget { vm: String, target: String },

    #[error("VM {vm}: '{target}' is not a valid disk target (expected e.g. vdb, sdc)")]
    InvalidDiskTarget { vm: String, target: String },

    #[error("VM {vm}: adapter {adapter} references undeclared network {network}")]
    UnknownNetwork {
        vm: String,
        adapter: String,
        network: String,
    },

    #[error("VM {vm}: adapter {adapter} references network {network}, which is disabled")]
    DisabledNetwork {
        vm: String,
        adapter: String,
        network: String,
    },

    #[error("VM {0} declares no network adapters")]
    NoAdapters(String),

    #[error("cluster {cluster}: file path {path} must be relative and stay inside the workdir")]
    UnsafeFilePath { cluster: String, path: String },

    #[error("unknown machine '{name}' (known: {known})")]
    UnknownMachine { name: String, known: String },

    #[error("unknown template '{name}' (known: {known})")]
    UnknownTemplate { name: String, known: String },
}

/// Top-level project document.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub project: String,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub runtime: Option<RuntimeKind>,
    pub clusters: IndexMap<String, ClusterConfig>,
    #[serde(default)]
    pub tasks: IndexMap<String, TaskConfig>,
    /// Template VMs built from cloud images, for clusters to clone from.
    #[serde(default)]
    pub templates: IndexMap<String, TemplateConfig>,
}

/// Per-project provider overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub libvirt: Option<VirshSettings>,
}

/// One cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Template VM every VM of the cluster is cloned from.
    pub base_image: String,
    /// Where keys, SSH config, disk images and files are written.
    pub workdir: String,
    #[serde(default = "default_admin_user")]
    pub admin_user: String,
    #[serde(default)]
    pub admin_pass: Option<Credential>,
    #[serde(default = "default_admin_key_name")]
    pub admin_key_name: String,
    #[serde(default = "default_ssh_config")]
    pub ssh_config: String,
    #[serde(default)]
    pub networks: IndexMap<String, NetworkConfig>,
    #[serde(default)]
    pub vms: IndexMap<String, VmConfig>,
    #[serde(default)]
    pub files: IndexMap<String, String>,
}

fn default_admin_user() -> String {
    "admin".to_string()
}

fn default_admin_key_name() -> String {
    "id_ed25519_boxman".to_string()
}

fn default_ssh_config() -> String {
    "ssh_config".to_string()
}

fn default_true() -> bool {
    true
}

/// A virtual network.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub mode: NetworkMode,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub mac: Option<String>,
    pub ip: IpConfig,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_true")]
    pub autostart: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true", deserialize_with = "deserialize_toggle")]
    pub stp: bool,
    #[serde(default)]
    pub delay: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: None,
            stp: true,
            delay: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpConfig {
    /// Gateway address of the network.
    pub address: String,
    #[serde(default = "default_netmask")]
    pub netmask: String,
    #[serde(default)]
    pub dhcp: Option<DhcpConfig>,
}

fn default_netmask() -> String {
    "255.255.255.0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DhcpConfig {
    pub range: DhcpRangeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DhcpRangeConfig {
    pub start: String,
    pub end: String,
}

/// One VM.
#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    /// Guest hostname and SSH alias; defaults to the VM key.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Clone source overriding the cluster's `base_image`.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub cpus: Option<CpuTopology>,
    /// Memory in MiB.
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
    #[serde(default)]
    pub network_adapters: Vec<AdapterConfig>,
}

/// An additional, empty disk.
#[derive(Debug, Clone, Deserialize)]
pub struct DiskConfig {
    pub name: String,
    #[serde(default)]
    pub driver: DriverConfig,
    pub target: String,
    /// Size in MiB.
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_driver_name")]
    pub name: String,
    #[serde(rename = "type", default = "default_disk_format")]
    pub format: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: default_driver_name(),
            format: default_disk_format(),
        }
    }
}

fn default_driver_name() -> String {
    "qemu".to_string()
}

fn default_disk_format() -> String {
    "qcow2".to_string()
}

/// Link state of an adapter at attach time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    #[default]
    Up,
    Down,
}

/// A network adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub network_source: String,
    /// Use `network_source` verbatim (host networks not managed here).
    #[serde(default)]
    pub is_global: bool,
    #[serde(default)]
    pub link_state: LinkState,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// A named shell command.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub workdir: Option<String>,
}

/// A template VM created from a cloud image and a cloud-init NoCloud seed.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    /// libvirt domain name; defaults to the template key.
    #[serde(default)]
    pub name: Option<String>,
    /// Local path, `file://` path or `http(s)://` URL of the cloud image.
    pub image: String,
    /// cloud-init user-data. `${env:VAR}` is replaced from the environment.
    pub cloudinit: String,
    #[serde(default)]
    pub meta_data: Option<String>,
    #[serde(default)]
    pub network_config: Option<String>,
    /// Memory in MiB.
    #[serde(default = "default_template_memory")]
    pub memory: u64,
    #[serde(default = "default_template_vcpus")]
    pub vcpus: u32,
    #[serde(default = "default_os_variant")]
    pub os_variant: String,
    /// Grow the copied image to this size (`qemu-img resize` syntax, e.g. `20G`).
    #[serde(default)]
    pub disk_size: Option<String>,
    /// libvirt network the template boots on.
    #[serde(default = "default_template_network")]
    pub network: String,
    /// Host bridge to use instead of `network`.
    #[serde(default)]
    pub bridge: Option<String>,
    /// Where the image copy and seed ISO are kept; one subdirectory per template.
    #[serde(default = "default_template_workdir")]
    pub workdir: String,
    /// How long cloud-init gets before the template is shut down.
    #[serde(default = "default_cloudinit_timeout")]
    pub cloudinit_timeout: u64,
    #[serde(default = "default_cloudinit_poll_interval")]
    pub cloudinit_poll_interval: u64,
    #[serde(default)]
    pub virt_install_extra_args: Vec<String>,
}

fn default_template_memory() -> u64 {
    2048
}

fn default_template_vcpus() -> u32 {
    2
}

fn default_os_variant() -> String {
    "generic".to_string()
}

fn default_template_network() -> String {
    "default".to_string()
}

fn default_template_workdir() -> String {
    "~/.boxman/templates".to_string()
}

fn default_cloudinit_timeout() -> u64 {
    300
}

fn default_cloudinit_poll_interval() -> u64 {
    10
}

/// Accept `true`/`false` as well as `on`/`off`/`yes`/`no`.
fn deserialize_toggle<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Toggle {
        Bool(bool),
        Text(String),
    }

    match Toggle::deserialize(deserializer)? {
        Toggle::Bool(value) => Ok(value),
        Toggle::Text(text) => match text.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" => Ok(true),
            "off" | "no" | "false" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected on/off, got '{other}'"
            ))),
        },
    }
}

/// Replace a leading `~` with the home directory.
#[must_use]
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    dirs::home_dir().map_or_else(|| path.to_path_buf(), |home| home.join(rest))
}

/// Parse an already-rendered project document.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] if the YAML does not match the schema.
pub fn parse_project(path: &Path, rendered: &str) -> Result<ProjectConfig, ConfigError> {
    let config: ProjectConfig =
        serde_yaml::from_str(rendered).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if config.project.trim().is_empty() {
        return Err(ConfigError::Invalid("project name is empty".into()));
    }
    if config.clusters.is_empty() && config.templates.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "project {} declares no clusters or templates",
            config.project
        )));
    }
    Ok(config)
}

/// Read, render and parse a project document.
///
/// # Errors
///
/// Returns an error if the file cannot be read, fails to render, or does
/// not parse.
pub fn load_project(path: &Path) -> Result<ProjectConfig, ConfigError> {
    let template = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let project_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let project_dir = std::fs::canonicalize(&project_dir).unwrap_or(project_dir);

    let rendered = render::render(&template, &project_dir).map_err(|message| {
        ConfigError::Render {
            path: path.to_path_buf(),
            message,
        }
    })?;
    debug!(path = %path.display(), "Rendered project configuration");
    parse_project(path, &rendered)
}
