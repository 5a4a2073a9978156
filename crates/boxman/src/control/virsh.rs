//! [`ControlPlane`] backed by the libvirt command-line tools.
//!
//! Every call is a `virsh`, `virt-clone`, `virt-install` or `qemu-img`
//! invocation (plus a few file utilities for images and seeds) routed
//! through an [`Executor`], so the same code drives a local libvirt daemon
//! or one running inside a container.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::xml;
use super::{
    classify, CloneRequest, ControlError, ControlPlane, CpuTopology, DiskAttachment, DomainLayout,
    DomainState, ImportNetwork, ImportRequest, InterfaceAttachment, Lease, NetworkDefinition,
    NetworkInfo, SnapshotInfo,
};
use crate::executor::{CommandOutput, CommandSpec, Executor};

/// Connection and tool settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VirshSettings {
    /// libvirt connection URI.
    pub uri: String,
    /// Prefix libvirt commands with `sudo`.
    pub use_sudo: bool,
    pub virsh_path: String,
    pub virt_clone_path: String,
    pub virt_install_path: String,
    pub qemu_img_path: String,
}

impl Default for VirshSettings {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            use_sudo: false,
            virsh_path: "virsh".to_string(),
            virt_clone_path: "virt-clone".to_string(),
            virt_install_path: "virt-install".to_string(),
            qemu_img_path: "qemu-img".to_string(),
        }
    }
}

/// libvirt through `virsh`.
pub struct VirshControlPlane {
    executor: Arc<dyn Executor>,
    settings: VirshSettings,
}

impl VirshControlPlane {
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>, settings: VirshSettings) -> Self {
        Self { executor, settings }
    }

    fn tool(&self, program: &str) -> CommandSpec {
        if self.settings.use_sudo {
            CommandSpec::new("sudo").arg(program)
        } else {
            CommandSpec::new(program)
        }
    }

    fn virsh<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool(&self.settings.virsh_path)
            .args(["-c", self.settings.uri.as_str()])
            .args(args)
    }

    async fn call(&self, command: CommandSpec) -> Result<CommandOutput, ControlError> {
        let output = self.executor.run(&command).await?;
        if output.success() {
            Ok(output)
        } else {
            let err = classify(&command, &output);
            debug!(command = %command, error = %err, "Control-plane call failed");
            Err(err)
        }
    }

    async fn run_virsh<I, S>(&self, args: I) -> Result<String, ControlError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self.call(self.virsh(args)).await?.stdout)
    }

    async fn write_file(path: &Path, content: &str) -> Result<(), ControlError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ControlError::io(parent, &e))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ControlError::io(path, &e))
    }

    async fn has_managed_save(&self, name: &str) -> Result<bool, ControlError> {
        let info = self.run_virsh(["dominfo", name]).await?;
        Ok(info.lines().any(|line| {
            line.split_once(':').is_some_and(|(key, value)| {
                key.trim().eq_ignore_ascii_case("managed save") && value.trim() == "yes"
            })
        }))
    }

    fn xml_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".xml");
        PathBuf::from(name)
    }
}

/// ISO authoring tools that can write a NoCloud seed, tried in order after
/// `cloud-localds`.
const ISO_TOOLS: [&str; 3] = ["genisoimage", "mkisofs", "xorrisofs"];

/// Candidate commands for a seed image, preferred first.
fn seed_commands(nocloud_dir: &Path, path: &Path, with_network_config: bool) -> Vec<CommandSpec> {
    let file = |name: &str| nocloud_dir.join(name).display().to_string();
    let mut localds = CommandSpec::new("cloud-localds");
    if with_network_config {
        localds = localds.arg(format!("--network-config={}", file("network-config")));
    }
    let localds = localds
        .arg(path.display().to_string())
        .arg(file("user-data"))
        .arg(file("meta-data"));

    let mut commands = vec![localds];
    for tool in ISO_TOOLS {
        let mut command = CommandSpec::new(tool)
            .arg("-output")
            .arg(path.display().to_string())
            .args(["-volid", "cidata", "-joliet", "-rock"])
            .arg(file("user-data"))
            .arg(file("meta-data"));
        if with_network_config {
            command = command.arg(file("network-config"));
        }
        commands.push(command);
    }
    commands
}

/// A random MAC in the KVM/QEMU OUI (`52:54:00`).
fn random_mac() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

/// Parse the lines of `virsh net-info`.
fn parse_net_info(output: &str) -> NetworkInfo {
    let mut info = NetworkInfo::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let yes = value.trim().eq_ignore_ascii_case("yes");
        match key.trim() {
            "Active" => info.active = yes,
            "Autostart" => info.autostart = yes,
            _ => {}
        }
    }
    info
}

/// Parse `virsh domstate` output (without the managed-save refinement).
fn parse_domstate(output: &str) -> DomainState {
    match output.trim() {
        "running" => DomainState::Running,
        "paused" => DomainState::Paused,
        "shut off" => DomainState::ShutOff,
        "crashed" => DomainState::Crashed,
        _ => DomainState::Unknown,
    }
}

/// Parse `virsh domifaddr` output.
///
/// ```text
///  Name       MAC address          Protocol     Address
/// -------------------------------------------------------------------------------
///  vnet0      52:54:00:8a:1e:0c    ipv4         192.168.122.45/24
/// ```
fn parse_domifaddr(output: &str) -> Vec<Lease> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            match columns.as_slice() {
                [interface, mac, _protocol, address, ..] => Some(Lease {
                    interface: (*interface).to_string(),
                    mac: (*mac).to_string(),
                    address: address.split('/').next().unwrap_or(address).to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}

#[async_trait]
impl ControlPlane for VirshControlPlane {
    async fn check(&self) -> Result<(), ControlError> {
        self.run_virsh(["uri"]).await.map(|_| ())
    }

    async fn network_info(&self, name: &str) -> Result<Option<NetworkInfo>, ControlError> {
        let output = match self.run_virsh(["net-info", name]).await {
            Ok(output) => output,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut info = parse_net_info(&output);
        let definition = self.run_virsh(["net-dumpxml", name]).await?;
        xml::read_network(&definition, &mut info)?;
        Ok(Some(info))
    }

    async fn define_network(&self, definition: &NetworkDefinition) -> Result<(), ControlError> {
        let path = definition
            .workdir
            .join(format!("{}_net_define.xml", definition.name));
        Self::write_file(&path, &xml::network_xml(definition)).await?;
        info!(network = %definition.name, path = %path.display(), "Defining network");
        self.run_virsh(["net-define".to_string(), path.display().to_string()])
            .await
            .map(|_| ())
    }

    async fn set_network_autostart(&self, name: &str) -> Result<(), ControlError> {
        self.run_virsh(["net-autostart", name]).await.map(|_| ())
    }

    async fn start_network(&self, name: &str) -> Result<(), ControlError> {
        self.run_virsh(["net-start", name]).await.map(|_| ())
    }

    async fn stop_network(&self, name: &str) -> Result<(), ControlError> {
        self.run_virsh(["net-destroy", name]).await.map(|_| ())
    }

    async fn undefine_network(&self, name: &str) -> Result<(), ControlError> {
        self.run_virsh(["net-undefine", name]).await.map(|_| ())
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState, ControlError> {
        let output = match self.run_virsh(["domstate", name]).await {
            Ok(output) => output,
            Err(e) if e.is_not_found() => return Ok(DomainState::Absent),
            Err(e) => return Err(e),
        };
        match parse_domstate(&output) {
            DomainState::ShutOff if self.has_managed_save(name).await? => Ok(DomainState::Saved),
            state => Ok(state),
        }
    }

    async fn clone_domain(&self, request: &CloneRequest) -> Result<(), ControlError> {
        let command = self
            .tool(&self.settings.virt_clone_path)
            .args(["--connect", self.settings.uri.as_str()])
            .args(["--original", request.source.as_str()])
            .args(["--name", request.name.as_str()])
            .arg("--file")
            .arg(request.disk_path.display().to_string());
        info!(vm = %request.name, source = %request.source, "Cloning VM");
        self.call(command).await.map(|_| ())
    }

    async fn import_domain(&self, request: &ImportRequest) -> Result<(), ControlError> {
        let network = match &request.network {
            ImportNetwork::Network(name) => format!("network={name},model=virtio"),
            ImportNetwork::Bridge(name) => format!("bridge={name},model=virtio"),
        };
        let command = self
            .tool(&self.settings.virt_install_path)
            .arg(format!("--connect={}", self.settings.uri))
            .arg(format!("--name={}", request.name))
            .arg(format!("--memory={}", request.memory_mib))
            .arg(format!("--vcpus={}", request.vcpus))
            .arg(format!("--os-variant={}", request.os_variant))
            .arg("--import")
            .arg(format!(
                "--disk=path={},format={},bus=virtio",
                request.disk_path.display(),
                request.disk_format
            ))
            .arg(format!("--disk=path={},device=cdrom", request.seed_path.display()))
            .arg(format!("--network={network}"))
            .args([
                "--graphics=vnc",
                "--video=virtio",
                "--channel=unix,target_type=virtio,name=org.qemu.guest_agent.0",
                "--noautoconsole",
            ])
            .args(request.extra_args.iter().cloned());
        info!(vm = %request.name, image = %request.disk_path.display(), "Importing VM");
        self.call(command).await.map(|_| ())
    }

    async fn domain_layout(&self, name: &str) -> Result<DomainLayout, ControlError> {
        let definition = self.run_virsh(["dumpxml", "--inactive", name]).await?;
        xml::read_layout(&definition)
    }

    async fn set_cpu_memory(
        &self,
        name: &str,
        cpus: Option<CpuTopology>,
        memory_mib: Option<u64>,
        workdir: &Path,
    ) -> Result<(), ControlError> {
        if cpus.is_none() && memory_mib.is_none() {
            return Ok(());
        }
        let current = self.run_virsh(["dumpxml", "--inactive", name]).await?;
        let updated = xml::apply_resources(&current, cpus, memory_mib)?;
        let path = workdir.join(format!("{name}_domain.xml"));
        Self::write_file(&path, &updated).await?;
        self.run_virsh(["define".to_string(), path.display().to_string()])
            .await
            .map(|_| ())
    }

    async fn create_disk_image(
        &self,
        path: &Path,
        format: &str,
        size_mib: u64,
    ) -> Result<(), ControlError> {
        // Images live in the user's workdir; no sudo.
        let command = CommandSpec::new(&self.settings.qemu_img_path)
            .args(["create", "-f", format])
            .arg(path.display().to_string())
            .arg(format!("{size_mib}M"));
        self.call(command).await.map(|_| ())
    }

    async fn remove_disk_image(&self, path: &Path) -> Result<(), ControlError> {
        let command = CommandSpec::new("rm")
            .arg("-f")
            .arg(path.display().to_string());
        self.call(command).await.map(|_| ())
    }

    async fn disk_image_exists(&self, path: &Path) -> Result<bool, ControlError> {
        let command = CommandSpec::new("test")
            .arg("-e")
            .arg(path.display().to_string());
        let output = self.executor.run(&command).await?;
        match output.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(classify(&command, &output)),
        }
    }

    async fn copy_disk_image(&self, source: &Path, destination: &Path) -> Result<(), ControlError> {
        let command = CommandSpec::new("cp")
            .arg("--sparse=always")
            .arg(source.display().to_string())
            .arg(destination.display().to_string());
        self.call(command).await.map(|_| ())
    }

    async fn download_disk_image(&self, url: &str, destination: &Path) -> Result<(), ControlError> {
        let command = CommandSpec::new("curl")
            .args(["--location", "--fail", "--silent", "--show-error", "--output"])
            .arg(destination.display().to_string())
            .arg(url);
        info!(url = %url, "Downloading image");
        self.call(command).await.map(|_| ())
    }

    async fn resize_disk_image(&self, path: &Path, size: &str) -> Result<(), ControlError> {
        let command = CommandSpec::new(&self.settings.qemu_img_path)
            .arg("resize")
            .arg(path.display().to_string())
            .arg(size);
        self.call(command).await.map(|_| ())
    }

    async fn build_seed_image(&self, nocloud_dir: &Path, path: &Path) -> Result<(), ControlError> {
        let with_network_config = tokio::fs::try_exists(nocloud_dir.join("network-config"))
            .await
            .map_err(|e| ControlError::io(nocloud_dir, &e))?;

        let mut tried = Vec::new();
        for command in seed_commands(nocloud_dir, path, with_network_config) {
            match self.executor.run(&command).await {
                Ok(output) if output.success() => {
                    info!(tool = %command.program, seed = %path.display(), "Seed image written");
                    return Ok(());
                }
                Ok(output) => debug!(
                    tool = %command.program,
                    error = %classify(&command, &output),
                    "Seed tool failed"
                ),
                Err(e) => debug!(tool = %command.program, error = %e, "Seed tool unavailable"),
            }
            tried.push(command.program);
        }
        Err(ControlError::Failed {
            command: format!("seed image {}", path.display()),
            code: 1,
            stderr: format!(
                "none of {} succeeded; install cloud-image-utils, genisoimage or xorriso",
                tried.join(", ")
            ),
        })
    }

    async fn attach_disk(&self, domain: &str, disk: &DiskAttachment) -> Result<(), ControlError> {
        let path = Self::xml_path(&disk.path);
        Self::write_file(&path, &xml::disk_xml(disk)).await?;
        self.run_virsh([
            "attach-device".to_string(),
            domain.to_string(),
            path.display().to_string(),
            "--persistent".to_string(),
        ])
        .await
        .map(|_| ())
    }

    async fn attach_interface(
        &self,
        domain: &str,
        interface: &InterfaceAttachment,
    ) -> Result<(), ControlError> {
        // `domif-setlink` addresses the interface by MAC, so a link that
        // starts down needs one up front.
        let mac = match (&interface.mac, interface.link_up) {
            (Some(mac), _) => Some(mac.clone()),
            (None, false) => Some(random_mac()),
            (None, true) => None,
        };
        let mut args = vec![
            "attach-interface".to_string(),
            domain.to_string(),
            "--type".to_string(),
            "network".to_string(),
            "--source".to_string(),
            interface.network.clone(),
        ];
        if let Some(mac) = &mac {
            args.extend(["--mac".to_string(), mac.clone()]);
        }
        if let Some(model) = &interface.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        args.push("--persistent".to_string());
        self.run_virsh(args).await?;

        if let (false, Some(mac)) = (interface.link_up, &mac) {
            self.run_virsh(["domif-setlink", domain, mac.as_str(), "down", "--config"])
                .await?;
        }
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<(), ControlError> {
        self.run_virsh(["start", name]).await.map(|_| ())
    }

    async fn suspend_domain(&self, name: &str) -> Result<(), ControlError> {
        self.run_virsh(["suspend", name]).await.map(|_| ())
    }

    async fn resume_domain(&self, name: &str) -> Result<(), ControlError> {
        self.run_virsh(["resume", name]).await.map(|_| ())
    }

    async fn save_domain(&self, name: &str) -> Result<(), ControlError> {
        self.run_virsh(["managedsave", name]).await.map(|_| ())
    }

    async fn restore_domain(&self, name: &str) -> Result<(), ControlError> {
        // `start` resumes from the managed save image when one exists.
        self.run_virsh(["start", name]).await.map(|_| ())
    }

    async fn shutdown_domain(&self, name: &str) -> Result<(), ControlError> {
        self.run_virsh(["shutdown", name]).await.map(|_| ())
    }

    async fn destroy_domain(&self, name: &str) -> Result<(), ControlError> {
        self.run_virsh(["destroy", name]).await.map(|_| ())
    }

    async fn undefine_domain(&self, name: &str) -> Result<(), ControlError> {
        self.run_virsh([
            "undefine",
            name,
            "--remove-all-storage",
            "--managed-save",
            "--snapshots-metadata",
        ])
        .await
        .map(|_| ())
    }

    async fn domain_leases(&self, name: &str) -> Result<Vec<Lease>, ControlError> {
        let output = self
            .run_virsh(["domifaddr", name, "--source", "lease"])
            .await?;
        Ok(parse_domifaddr(&output))
    }

    async fn create_snapshot(
        &self,
        domain: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<(), ControlError> {
        let mut args = vec!["snapshot-create-as", domain, name];
        if let Some(description) = description {
            args.extend(["--description", description]);
        }
        self.run_virsh(args).await.map(|_| ())
    }

    async fn list_snapshots(&self, domain: &str) -> Result<Vec<SnapshotInfo>, ControlError> {
        let names = self
            .run_virsh(["snapshot-list", domain, "--name"])
            .await?;
        let mut snapshots = Vec::new();
        for name in names.lines().map(str::trim).filter(|n| !n.is_empty()) {
            let document = self.run_virsh(["snapshot-dumpxml", domain, name]).await?;
            snapshots.push(SnapshotInfo {
                name: name.to_string(),
                description: xml::text(&document, "description")?,
                state: xml::text(&document, "state")?,
            });
        }
        Ok(snapshots)
    }

    async fn revert_snapshot(&self, domain: &str, name: &str) -> Result<(), ControlError> {
        self.run_virsh(["snapshot-revert", domain, name])
            .await
            .map(|_| ())
    }

    async fn delete_snapshot(&self, domain: &str, name: &str) -> Result<(), ControlError> {
        self.run_virsh(["snapshot-delete", domain, name])
            .await
            .map(|_| ())
    }
}
