//! The validated resource graph.
//!
//! [`ResourceGraph::build`] turns a parsed [`ProjectConfig`] into resolved
//! nodes (control-plane names, file paths, attachment parameters) and
//! rejects every configuration error up front. Nothing here talks to the
//! control plane, and the graph is read-only once built.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::config::{
    expand_home, ClusterConfig, ConfigError, LinkState, ProjectConfig, TemplateConfig, VmConfig,
};
use crate::control::{
    BridgeSpec, CpuTopology, DiskAttachment, ImportNetwork, InterfaceAttachment, NetworkDefinition,
};
use crate::credentials::Credential;
use crate::names::{self, ResolvedName};

/// Target slot of the cloned OS disk.
pub const OS_DISK_TARGET: &str = "vda";

const DISK_BUS_PREFIXES: [&str; 4] = ["xvd", "vd", "sd", "hd"];

/// DHCP on every `en*` and `eth*` interface.
const DEFAULT_NETWORK_CONFIG: &str = "version: 2
ethernets:
  all-en:
    match:
      name: \"en*\"
    dhcp4: true
  all-eth:
    match:
      name: \"eth*\"
    dhcp4: true
";

/// The whole project, in declaration order.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    pub project: String,
    pub clusters: Vec<ClusterNode>,
    pub templates: Vec<TemplateNode>,
}

#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub name: String,
    pub project: String,
    pub base_image: String,
    pub workdir: PathBuf,
    pub admin_user: String,
    pub admin_pass: Option<Credential>,
    /// Private key; the public key sits next to it with a `.pub` suffix.
    pub key_path: PathBuf,
    pub ssh_config_path: PathBuf,
    pub networks: Vec<NetworkNode>,
    pub vms: Vec<VmNode>,
    pub files: Vec<FileNode>,
}

impl ClusterNode {
    /// `project::cluster`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}{}{}", self.project, names::SCOPE_SEPARATOR, self.name)
    }

    /// Control-plane names of the managed networks this cluster's VMs
    /// attach to. Global references are not included.
    #[must_use]
    pub fn required_networks(&self) -> BTreeSet<String> {
        self.vms
            .iter()
            .flat_map(|vm| vm.adapters.iter())
            .filter(|adapter| !adapter.network.is_global())
            .map(|adapter| adapter.attachment.network.clone())
            .collect()
    }

    /// Public half of the cluster keypair.
    #[must_use]
    pub fn public_key_path(&self) -> PathBuf {
        let mut name = self.key_path.as_os_str().to_os_string();
        name.push(".pub");
        PathBuf::from(name)
    }
}

#[derive(Debug, Clone)]
pub struct NetworkNode {
    /// Name as declared in the cluster.
    pub name: String,
    pub resolved: ResolvedName,
    pub enable: bool,
    pub autostart: bool,
    pub definition: NetworkDefinition,
}

impl NetworkNode {
    #[must_use]
    pub fn control_name(&self) -> &str {
        &self.definition.name
    }
}

#[derive(Debug, Clone)]
pub struct VmNode {
    /// Name as declared in the cluster.
    pub name: String,
    pub control_name: String,
    pub hostname: String,
    /// VM the OS disk is cloned from.
    pub source: String,
    pub os_disk: PathBuf,
    pub cpus: Option<CpuTopology>,
    pub memory_mib: Option<u64>,
    pub disks: Vec<DiskNode>,
    pub adapters: Vec<AdapterNode>,
}

#[derive(Debug, Clone)]
pub struct DiskNode {
    pub name: String,
    pub size_mib: u64,
    pub attachment: DiskAttachment,
}

#[derive(Debug, Clone)]
pub struct AdapterNode {
    pub name: String,
    pub network: ResolvedName,
    pub attachment: InterfaceAttachment,
}

#[derive(Debug, Clone)]
pub struct FileNode {
    pub relative: PathBuf,
    pub path: PathBuf,
    pub content: String,
}

/// Where a template's cloud image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Local(PathBuf),
    Url(String),
}

/// A template VM to import from a cloud image.
#[derive(Debug, Clone)]
pub struct TemplateNode {
    /// Key in the `templates` section.
    pub key: String,
    /// libvirt domain name.
    pub name: String,
    pub image: ImageSource,
    /// Directory holding the image copy, the seed and the NoCloud files.
    pub workdir: PathBuf,
    /// The copy the template boots from.
    pub disk_path: PathBuf,
    pub disk_format: String,
    pub disk_size: Option<String>,
    pub seed_path: PathBuf,
    /// Raw user-data, before `${env:..}` substitution.
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub os_variant: String,
    pub network: ImportNetwork,
    /// How long cloud-init may run before the template is shut down.
    pub cloudinit_timeout: Duration,
    pub poll_interval: Duration,
    pub extra_args: Vec<String>,
}

/// A subset of VMs addressed by name, or all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Machines {
    All,
    Named(Vec<String>),
}

impl FromStr for Machines {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let names: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Err(ConfigError::Invalid("empty machine list".into()));
        }
        if names.iter().any(|n| n == "all") {
            return Ok(Self::All);
        }
        Ok(Self::Named(names))
    }
}

fn valid_disk_target(target: &str) -> bool {
    DISK_BUS_PREFIXES.iter().any(|prefix| {
        target
            .strip_prefix(prefix)
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_lowercase()))
    })
}

fn safe_relative(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

impl ResourceGraph {
    /// Resolve and validate `config`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found: bad names or name scoping,
    /// two resources mapping to the same control-plane name or image file,
    /// duplicate or reserved disk targets, adapters without a (declared,
    /// enabled) network, VMs without adapters, or unsafe file paths.
    pub fn build(config: &ProjectConfig) -> Result<Self, ConfigError> {
        check_name("project", &config.project, false)?;
        for name in config.clusters.keys() {
            check_name("cluster", name, false)?;
        }

        let clusters = config
            .clusters
            .iter()
            .map(|(name, cluster)| build_cluster(config, name, cluster))
            .collect::<Result<Vec<_>, _>>()?;
        let templates = config
            .templates
            .iter()
            .map(|(key, template)| build_template(key, template))
            .collect::<Result<Vec<_>, _>>()?;
        let graph = Self {
            project: config.project.clone(),
            clusters,
            templates,
        };
        graph.check_collisions()?;
        Ok(graph)
    }

    /// Every control-plane name and image file must belong to one resource.
    fn check_collisions(&self) -> Result<(), ConfigError> {
        let mut owners: HashMap<String, String> = HashMap::new();
        let mut claim = |resource: String, owner: String| match owners.entry(resource) {
            Entry::Occupied(entry) => Err(ConfigError::NameCollision {
                resource: entry.key().clone(),
                first: entry.get().clone(),
                second: owner,
            }),
            Entry::Vacant(entry) => {
                entry.insert(owner);
                Ok(())
            }
        };

        for cluster in &self.clusters {
            for network in &cluster.networks {
                claim(
                    format!("network {}", network.control_name()),
                    format!("network {}", network.resolved),
                )?;
            }
            for vm in &cluster.vms {
                let owner = format!("VM {}::{}", cluster.name, vm.name);
                claim(format!("domain {}", vm.control_name), owner.clone())?;
                claim(vm.os_disk.display().to_string(), owner.clone())?;
                for disk in &vm.disks {
                    claim(
                        disk.attachment.path.display().to_string(),
                        format!("{owner} disk {}", disk.name),
                    )?;
                }
            }
        }
        for template in &self.templates {
            let owner = format!("template {}", template.key);
            claim(format!("domain {}", template.name), owner.clone())?;
            claim(template.disk_path.display().to_string(), owner)?;
        }
        Ok(())
    }

    /// Every VM with its cluster, in declaration order.
    pub fn vms(&self) -> impl Iterator<Item = (&ClusterNode, &VmNode)> {
        self.clusters
            .iter()
            .flat_map(|cluster| cluster.vms.iter().map(move |vm| (cluster, vm)))
    }

    /// The VMs addressed by `machines`. A name matches a VM by its declared
    /// name, `cluster::name`, or control-plane name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownMachine`] if a name matches nothing.
    pub fn select(&self, machines: &Machines) -> Result<Vec<(&ClusterNode, &VmNode)>, ConfigError> {
        let Machines::Named(wanted) = machines else {
            return Ok(self.vms().collect());
        };

        let matches = |cluster: &ClusterNode, vm: &VmNode, name: &str| {
            vm.name == name
                || vm.control_name == name
                || format!("{}{}{}", cluster.name, names::SCOPE_SEPARATOR, vm.name) == name
        };

        for name in wanted {
            if !self.vms().any(|(cluster, vm)| matches(cluster, vm, name)) {
                let known = self
                    .vms()
                    .map(|(_, vm)| vm.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(ConfigError::UnknownMachine {
                    name: name.clone(),
                    known,
                });
            }
        }

        Ok(self
            .vms()
            .filter(|(cluster, vm)| wanted.iter().any(|name| matches(cluster, vm, name)))
            .collect())
    }

    /// The templates addressed by `selection`, by key or domain name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownTemplate`] if a name matches nothing.
    pub fn select_templates(&self, selection: &Machines) -> Result<Vec<&TemplateNode>, ConfigError> {
        let Machines::Named(wanted) = selection else {
            return Ok(self.templates.iter().collect());
        };
        let matches = |template: &TemplateNode, name: &str| template.key == name || template.name == name;

        if let Some(unknown) = wanted
            .iter()
            .find(|name| !self.templates.iter().any(|t| matches(t, name)))
        {
            let known = self
                .templates
                .iter()
                .map(|t| t.key.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ConfigError::UnknownTemplate {
                name: unknown.clone(),
                known,
            });
        }

        Ok(self
            .templates
            .iter()
            .filter(|t| wanted.iter().any(|name| matches(t, name)))
            .collect())
    }
}

fn build_cluster(
    config: &ProjectConfig,
    name: &str,
    cluster: &ClusterConfig,
) -> Result<ClusterNode, ConfigError> {
    let project = config.project.as_str();
    let workdir = expand_home(Path::new(&cluster.workdir));

    let networks = cluster
        .networks
        .iter()
        .map(|(net_name, net)| {
            check_name("network", net_name, true)?;
            let resolved = ResolvedName::Scoped {
                project: project.to_string(),
                cluster: name.to_string(),
                name: net_name.clone(),
            };
            let definition = NetworkDefinition {
                name: resolved.control_name(),
                mode: net.mode,
                bridge: BridgeSpec {
                    name: net.bridge.name.clone(),
                    stp: net.bridge.stp,
                    delay: net.bridge.delay,
                },
                mac: net.mac.clone(),
                address: net.ip.address.clone(),
                netmask: net.ip.netmask.clone(),
                dhcp: net
                    .ip
                    .dhcp
                    .as_ref()
                    .map(|d| (d.range.start.clone(), d.range.end.clone())),
                workdir: workdir.clone(),
            };
            Ok(NetworkNode {
                name: net_name.clone(),
                resolved,
                enable: net.enable,
                autostart: net.autostart,
                definition,
            })
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    let vms = cluster
        .vms
        .iter()
        .map(|(vm_name, vm)| {
            check_name("VM", vm_name, true)?;
            build_vm(config, name, cluster, &workdir, vm_name, vm)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let files = cluster
        .files
        .iter()
        .map(|(relative, content)| {
            let relative = PathBuf::from(relative);
            if !safe_relative(&relative) {
                return Err(ConfigError::UnsafeFilePath {
                    cluster: name.to_string(),
                    path: relative.display().to_string(),
                });
            }
            Ok(FileNode {
                path: workdir.join(&relative),
                relative,
                content: content.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ClusterNode {
        name: name.to_string(),
        project: project.to_string(),
        base_image: cluster.base_image.clone(),
        key_path: workdir.join(&cluster.admin_key_name),
        ssh_config_path: workdir.join(&cluster.ssh_config),
        workdir,
        admin_user: cluster.admin_user.clone(),
        admin_pass: cluster.admin_pass.clone(),
        networks,
        vms,
        files,
    })
}

fn build_vm(
    config: &ProjectConfig,
    cluster_name: &str,
    cluster: &ClusterConfig,
    workdir: &Path,
    name: &str,
    vm: &VmConfig,
) -> Result<VmNode, ConfigError> {
    let project = config.project.as_str();
    let control_name = names::control_name(project, cluster_name, name);
    let label = format!("{cluster_name}::{name}");

    let mut targets = HashSet::new();
    let mut disks = Vec::with_capacity(vm.disks.len());
    for disk in &vm.disks {
        check_name("disk", &disk.name, true)?;
        if !valid_disk_target(&disk.target) {
            return Err(ConfigError::InvalidDiskTarget {
                vm: label,
                target: disk.target.clone(),
            });
        }
        if disk.target == OS_DISK_TARGET {
            return Err(ConfigError::OsDiskTarget {
                vm: label,
                target: disk.target.clone(),
            });
        }
        if !targets.insert(disk.target.as_str()) {
            return Err(ConfigError::DuplicateDiskTarget {
                vm: label,
                target: disk.target.clone(),
            });
        }
        if disk.size == 0 {
            return Err(ConfigError::Invalid(format!(
                "VM {label}: disk {} has zero size",
                disk.name
            )));
        }
        disks.push(DiskNode {
            name: disk.name.clone(),
            size_mib: disk.size,
            attachment: DiskAttachment {
                path: workdir.join(format!(
                    "{control_name}_{}.{}",
                    disk.name, disk.driver.format
                )),
                driver: disk.driver.name.clone(),
                format: disk.driver.format.clone(),
                target: disk.target.clone(),
            },
        });
    }

    if vm.network_adapters.is_empty() {
        return Err(ConfigError::NoAdapters(label));
    }

    let mut adapters = Vec::with_capacity(vm.network_adapters.len());
    for (index, adapter) in vm.network_adapters.iter().enumerate() {
        let adapter_name = adapter
            .name
            .clone()
            .unwrap_or_else(|| format!("eth{index}"));
        let network = names::resolve(
            &adapter.network_source,
            project,
            cluster_name,
            adapter.is_global,
        )
        .map_err(|source| ConfigError::Name {
            context: format!("VM {label}: adapter {adapter_name}"),
            source,
        })?;

        check_network_declared(config, &network, &label, &adapter_name)?;

        adapters.push(AdapterNode {
            attachment: InterfaceAttachment {
                network: network.control_name(),
                mac: adapter.mac.clone(),
                model: adapter.model.clone(),
                link_up: adapter.link_state == LinkState::Up,
            },
            name: adapter_name,
            network,
        });
    }

    Ok(VmNode {
        name: name.to_string(),
        hostname: vm.hostname.clone().unwrap_or_else(|| name.to_string()),
        source: vm
            .template
            .clone()
            .unwrap_or_else(|| cluster.base_image.clone()),
        os_disk: workdir.join(format!("{control_name}.qcow2")),
        control_name,
        cpus: vm.cpus,
        memory_mib: vm.memory,
        disks,
        adapters,
    })
}

fn build_template(key: &str, template: &TemplateConfig) -> Result<TemplateNode, ConfigError> {
    check_name("template", key, true)?;
    let name = template.name.clone().unwrap_or_else(|| key.to_string());
    check_name("template domain", &name, true)?;
    let invalid = |message: &str| ConfigError::Invalid(format!("template {key}: {message}"));

    if template.cloudinit.trim().is_empty() {
        return Err(invalid("cloudinit user-data is empty"));
    }
    if template.memory == 0 || template.vcpus == 0 {
        return Err(invalid("memory and vcpus must be positive"));
    }
    if template.cloudinit_poll_interval == 0 {
        return Err(invalid("cloudinit_poll_interval must be positive"));
    }

    let location = template
        .image
        .strip_prefix("file://")
        .unwrap_or(&template.image);
    let (image, file_name) = if location.starts_with("http://") || location.starts_with("https://") {
        let file_name = location.rsplit('/').next().unwrap_or_default().to_string();
        (ImageSource::Url(location.to_string()), file_name)
    } else {
        let path = expand_home(Path::new(location));
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        (ImageSource::Local(path), file_name)
    };
    if file_name.is_empty() {
        return Err(invalid("image must name a file"));
    }

    // Cloud images shipped as `.img` are qcow2.
    let extension = Path::new(&file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase());
    let (extension, disk_format) = match extension.as_deref() {
        Some("raw") => ("raw", "raw"),
        _ => ("qcow2", "qcow2"),
    };

    let workdir = expand_home(Path::new(&template.workdir)).join(&name);
    let network = match &template.bridge {
        Some(bridge) => ImportNetwork::Bridge(bridge.clone()),
        None => ImportNetwork::Network(template.network.clone()),
    };

    Ok(TemplateNode {
        key: key.to_string(),
        disk_path: workdir.join(format!("{name}.{extension}")),
        disk_format: disk_format.to_string(),
        disk_size: template.disk_size.clone(),
        seed_path: workdir.join("seed.iso"),
        workdir,
        image,
        user_data: template.cloudinit.clone(),
        meta_data: template
            .meta_data
            .clone()
            .unwrap_or_else(|| format!("instance-id: {name}-001\nlocal-hostname: {name}\n")),
        network_config: template
            .network_config
            .clone()
            .unwrap_or_else(|| DEFAULT_NETWORK_CONFIG.to_string()),
        memory_mib: template.memory,
        vcpus: template.vcpus,
        os_variant: template.os_variant.clone(),
        network,
        cloudinit_timeout: Duration::from_secs(template.cloudinit_timeout),
        poll_interval: Duration::from_secs(template.cloudinit_poll_interval),
        extra_args: template.virt_install_extra_args.clone(),
        name,
    })
}

/// Names must be non-empty and free of `::`. Project and cluster names
/// also may not contain `_`, which joins the parts of control-plane names.
fn check_name(kind: &'static str, name: &str, allow_underscore: bool) -> Result<(), ConfigError> {
    let reason = if name.is_empty() {
        "is empty"
    } else if name.contains(names::SCOPE_SEPARATOR) {
        "contains '::'"
    } else if !allow_underscore && name.contains('_') {
        "contains '_'"
    } else {
        return Ok(());
    };
    Err(ConfigError::InvalidName {
        kind,
        name: name.to_string(),
        reason,
    })
}

/// Networks of this project must be declared and enabled. References into
/// other projects are checked against the control plane at attach time.
fn check_network_declared(
    config: &ProjectConfig,
    network: &ResolvedName,
    vm: &str,
    adapter: &str,
) -> Result<(), ConfigError> {
    let ResolvedName::Scoped {
        project,
        cluster,
        name,
    } = network
    else {
        return Ok(());
    };
    if *project != config.project {
        return Ok(());
    }

    let declared = config
        .clusters
        .get(cluster)
        .and_then(|c| c.networks.get(name));
    match declared {
        None => Err(ConfigError::UnknownNetwork {
            vm: vm.to_string(),
            adapter: adapter.to_string(),
            network: network.to_string(),
        }),
        Some(net) if !net.enable => Err(ConfigError::DisabledNetwork {
            vm: vm.to_string(),
            adapter: adapter.to_string(),
            network: network.to_string(),
        }),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_project;

    const TWO_CLUSTERS: &str = r"
project: lab
clusters:
  c1:
    base_image: base
    workdir: /srv/lab/c1
    networks:
      net1: { ip: { address: 10.1.0.1 } }
    vms:
      vm1:
        hostname: web
        disks:
          - { name: data, target: vdb, size: 1024 }
          - { name: logs, target: vdc, size: 512, driver: { type: raw } }
        network_adapters:
          - { network_source: net1 }
          - { network_source: c2::net2 }
          - { network_source: default, is_global: true }
  c2:
    base_image: base
    workdir: /srv/lab/c2
    networks:
      net2: { ip: { address: 10.2.0.1 } }
    vms:
      vm2:
        template: other-base
        network_adapters:
          - { name: uplink, network_source: net2, link_state: down }
    files:
      etc/hosts: 127.0.0.1 localhost
";

    fn build(doc: &str) -> Result<ResourceGraph, ConfigError> {
        ResourceGraph::build(&parse_project(Path::new("conf.yml"), doc)?)
    }

    #[test]
    fn test_build_resolves_names_and_paths() {
        let graph = build(TWO_CLUSTERS).unwrap();
        assert_eq!(graph.clusters.len(), 2);

        let c1 = &graph.clusters[0];
        assert_eq!(c1.networks[0].control_name(), "lab_c1_net1");
        assert_eq!(c1.key_path, PathBuf::from("/srv/lab/c1/id_ed25519_boxman"));
        assert_eq!(
            c1.public_key_path(),
            PathBuf::from("/srv/lab/c1/id_ed25519_boxman.pub")
        );

        let vm1 = &c1.vms[0];
        assert_eq!(vm1.control_name, "lab_c1_vm1");
        assert_eq!(vm1.hostname, "web");
        assert_eq!(vm1.source, "base");
        assert_eq!(
            vm1.disks[1].attachment.path,
            PathBuf::from("/srv/lab/c1/lab_c1_vm1_logs.raw")
        );
        let networks: Vec<&str> = vm1
            .adapters
            .iter()
            .map(|a| a.attachment.network.as_str())
            .collect();
        assert_eq!(networks, ["lab_c1_net1", "lab_c2_net2", "default"]);
        assert_eq!(vm1.adapters[0].name, "eth0");

        let vm2 = &graph.clusters[1].vms[0];
        assert_eq!(vm2.source, "other-base");
        assert!(!vm2.adapters[0].attachment.link_up);
        assert_eq!(
            graph.clusters[1].files[0].path,
            PathBuf::from("/srv/lab/c2/etc/hosts")
        );
    }

    #[test]
    fn test_required_networks_skip_global() {
        let graph = build(TWO_CLUSTERS).unwrap();
        let required: Vec<String> = graph.clusters[0].required_networks().into_iter().collect();
        assert_eq!(required, ["lab_c1_net1", "lab_c2_net2"]);
    }

    #[test]
    fn test_duplicate_disk_target_rejected() {
        let doc = TWO_CLUSTERS.replace("target: vdc", "target: vdb");
        assert!(matches!(
            build(&doc),
            Err(ConfigError::DuplicateDiskTarget { target, .. }) if target == "vdb"
        ));
    }

    #[test]
    fn test_os_disk_target_rejected() {
        let doc = TWO_CLUSTERS.replace("target: vdc", "target: vda");
        assert!(matches!(build(&doc), Err(ConfigError::OsDiskTarget { .. })));
    }

    #[test]
    fn test_malformed_disk_target_rejected() {
        let doc = TWO_CLUSTERS.replace("target: vdc", "target: disk2");
        assert!(matches!(build(&doc), Err(ConfigError::InvalidDiskTarget { .. })));
    }

    #[test]
    fn test_unknown_network_rejected() {
        let doc = TWO_CLUSTERS.replace("network_source: c2::net2", "network_source: c2::nope");
        match build(&doc) {
            Err(ConfigError::UnknownNetwork { network, .. }) => {
                assert_eq!(network, "lab::c2::nope");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_disabled_network_rejected() {
        let doc = TWO_CLUSTERS.replace(
            "net2: { ip: { address: 10.2.0.1 } }",
            "net2: { enable: false, ip: { address: 10.2.0.1 } }",
        );
        assert!(matches!(build(&doc), Err(ConfigError::DisabledNetwork { .. })));
    }

    #[test]
    fn test_cross_project_reference_is_not_checked_locally() {
        let doc = TWO_CLUSTERS.replace("network_source: c2::net2", "network_source: other::c9::shared");
        let graph = build(&doc).unwrap();
        assert_eq!(
            graph.clusters[0].vms[0].adapters[1].attachment.network,
            "other_c9_shared"
        );
    }

    #[test]
    fn test_bad_scope_rejected() {
        let doc = TWO_CLUSTERS.replace("network_source: c2::net2", "network_source: a::b::c::d");
        assert!(matches!(build(&doc), Err(ConfigError::Name { .. })));
    }

    #[test]
    fn test_vm_without_adapters_rejected() {
        let doc = TWO_CLUSTERS.replace(
            "        network_adapters:\n          - { name: uplink, network_source: net2, link_state: down }\n",
            "",
        );
        assert!(matches!(build(&doc), Err(ConfigError::NoAdapters(_))));
    }

    #[test]
    fn test_unsafe_file_paths_rejected() {
        for bad in ["../escape", "/etc/passwd"] {
            let doc = TWO_CLUSTERS.replace("etc/hosts:", &format!("{bad}:"));
            assert!(
                matches!(build(&doc), Err(ConfigError::UnsafeFilePath { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_machine_selection() {
        let graph = build(TWO_CLUSTERS).unwrap();

        assert_eq!(graph.select(&Machines::All).unwrap().len(), 2);
        assert_eq!("all".parse::<Machines>().unwrap(), Machines::All);

        let picked = graph.select(&"vm2".parse().unwrap()).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].1.control_name, "lab_c2_vm2");

        let by_scope = graph.select(&"c1::vm1, lab_c2_vm2".parse().unwrap()).unwrap();
        assert_eq!(by_scope.len(), 2);

        assert!(matches!(
            graph.select(&"vm9".parse().unwrap()),
            Err(ConfigError::UnknownMachine { .. })
        ));
    }

    #[test]
    fn test_underscore_in_cluster_name_rejected() {
        // `lab` + `c_2` + `net2` would share `lab_c_2_net2` with cluster `c`
        // and network `2_net2`.
        let doc = TWO_CLUSTERS
            .replace("  c2:\n", "  c_2:\n")
            .replace("c2::net2", "c_2::net2");
        assert!(matches!(
            build(&doc),
            Err(ConfigError::InvalidName { kind: "cluster", ref name, .. }) if name == "c_2"
        ));

        let doc = TWO_CLUSTERS.replace("project: lab", "project: my_lab");
        assert!(matches!(
            build(&doc),
            Err(ConfigError::InvalidName { kind: "project", .. })
        ));
    }

    #[test]
    fn test_scoped_network_key_rejected() {
        let doc = TWO_CLUSTERS.replace("      net1: {", "      c2::x: {");
        assert!(matches!(
            build(&doc),
            Err(ConfigError::InvalidName { kind: "network", ref name, .. }) if name == "c2::x"
        ));
    }

    #[test]
    fn test_underscores_allowed_in_vm_and_network_names() {
        let doc = TWO_CLUSTERS
            .replace("net2", "back_net")
            .replace("      vm2:", "      db_1:");
        let graph = build(&doc).unwrap();
        assert_eq!(graph.clusters[1].networks[0].control_name(), "lab_c2_back_net");
        assert_eq!(graph.clusters[1].vms[0].control_name, "lab_c2_db_1");
    }

    #[test]
    fn test_image_file_collision_rejected() {
        let doc = TWO_CLUSTERS.replace(
            "  c2:\n",
            "      vm1_data:\n        network_adapters:\n          - { network_source: net1 }\n  c2:\n",
        );
        match build(&doc) {
            Err(ConfigError::NameCollision {
                resource,
                first,
                second,
            }) => {
                assert_eq!(resource, "/srv/lab/c1/lab_c1_vm1_data.qcow2");
                assert_eq!(first, "VM c1::vm1 disk data");
                assert_eq!(second, "VM c1::vm1_data");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    const TEMPLATES: &str = r"
project: lab
clusters:
  c1:
    base_image: ubuntu-base
    workdir: /srv/lab/c1
    networks:
      net1: { ip: { address: 10.1.0.1 } }
    vms:
      vm1:
        network_adapters:
          - { network_source: net1 }
templates:
  ubuntu:
    name: ubuntu-base
    image: file:///var/images/noble-server-cloudimg-amd64.img
    workdir: /srv/templates
    cloudinit: |
      #cloud-config
      password: ${env:TEMPLATE_PASS}
    disk_size: 20G
  debian:
    image: https://cloud.debian.org/images/debian-12-generic-amd64.raw
    workdir: /srv/templates
    bridge: br0
    cloudinit: '#cloud-config'
";

    #[test]
    fn test_templates_resolve_image_and_paths() {
        let graph = build(TEMPLATES).unwrap();
        assert_eq!(graph.templates.len(), 2);

        let ubuntu = &graph.templates[0];
        assert_eq!(ubuntu.name, "ubuntu-base");
        assert_eq!(
            ubuntu.image,
            ImageSource::Local(PathBuf::from("/var/images/noble-server-cloudimg-amd64.img"))
        );
        assert_eq!(ubuntu.workdir, PathBuf::from("/srv/templates/ubuntu-base"));
        assert_eq!(
            ubuntu.disk_path,
            PathBuf::from("/srv/templates/ubuntu-base/ubuntu-base.qcow2")
        );
        assert_eq!(ubuntu.disk_format, "qcow2");
        assert_eq!(ubuntu.disk_size.as_deref(), Some("20G"));
        assert_eq!(ubuntu.network, ImportNetwork::Network("default".into()));
        assert_eq!(
            ubuntu.meta_data,
            "instance-id: ubuntu-base-001\nlocal-hostname: ubuntu-base\n"
        );
        assert!(ubuntu.network_config.contains("dhcp4: true"));
        assert_eq!(ubuntu.cloudinit_timeout, Duration::from_secs(300));

        let debian = &graph.templates[1];
        assert_eq!(debian.name, "debian");
        assert!(matches!(debian.image, ImageSource::Url(ref url) if url.ends_with("amd64.raw")));
        assert_eq!(debian.disk_format, "raw");
        assert_eq!(debian.disk_path, PathBuf::from("/srv/templates/debian/debian.raw"));
        assert_eq!(debian.network, ImportNetwork::Bridge("br0".into()));
    }

    #[test]
    fn test_template_selection() {
        let graph = build(TEMPLATES).unwrap();
        let selected = graph.select_templates(&"ubuntu-base".parse().unwrap()).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].key, "ubuntu");

        assert!(matches!(
            graph.select_templates(&"centos".parse().unwrap()),
            Err(ConfigError::UnknownTemplate { ref known, .. }) if known == "ubuntu, debian"
        ));
    }

    #[test]
    fn test_template_domain_colliding_with_vm_rejected() {
        let doc = TEMPLATES.replace("    name: ubuntu-base\n", "    name: lab_c1_vm1\n");
        assert!(matches!(
            build(&doc),
            Err(ConfigError::NameCollision { ref resource, .. }) if resource == "domain lab_c1_vm1"
        ));
    }
}
