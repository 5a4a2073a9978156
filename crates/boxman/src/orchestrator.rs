//! Cluster lifecycle orchestration.
//!
//! Composes the network manager, VM provisioner, address waiter, access
//! provisioner and power controller into the `provision`, `deprovision`
//! and `up` flows plus the power and snapshot commands. Resources are
//! handled one at a time in declaration order. Failures of individual
//! resources are collected into a [`RunReport`]; only failures that make
//! the whole run meaningless (bad credentials, unreachable control plane,
//! registry collision) are returned as errors.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::access::{AccessProvisioner, HostEntry, KeyCopier};
use crate::config::TimingSettings;
use crate::control::{ControlPlane, DomainState, SnapshotInfo};
use crate::error::{BoxmanError, Result};
use crate::executor::Executor;
use crate::graph::{ClusterNode, Machines, ResourceGraph, VmNode};
use crate::network::{EnsureOutcome, NetworkManager, TeardownOutcome};
use crate::power::{PowerAction, PowerController, Transition};
use crate::provisioner::{RemoveOutcome, VmProvisioner};
use crate::registry::{ProjectRegistry, Registration};
use crate::report::{Outcome, ResourceKind, RunReport};
use crate::retry::RetryPolicy;
use crate::snapshot::{default_snapshot_name, SnapshotManager};
use crate::templates::{TemplateBuilder, TemplateOutcome};
use crate::waiter::IpWaiter;

/// Retry bounds and flags for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub ip_wait: RetryPolicy,
    pub ssh_retry: RetryPolicy,
    pub shutdown: RetryPolicy,
    /// Re-clone existing VMs and take over a project registered elsewhere.
    pub force: bool,
    /// After a clean deprovision, also remove the container runtime.
    pub destroy_runtime: bool,
}

impl OrchestratorSettings {
    #[must_use]
    pub fn from_timing(timing: &TimingSettings) -> Self {
        Self {
            ip_wait: timing.ip_wait_policy(),
            ssh_retry: timing.ssh_policy(),
            shutdown: timing.shutdown_policy(),
            force: false,
            destroy_runtime: false,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_timing(&TimingSettings::default())
    }
}

/// Snapshots of one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSnapshots {
    pub vm: String,
    pub snapshots: Vec<SnapshotInfo>,
}

/// How to reach one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    pub vm: String,
    pub hostname: String,
    pub state: DomainState,
    pub addresses: Vec<String>,
    pub user: String,
    pub key_path: PathBuf,
    pub ssh_config: PathBuf,
}

pub struct Orchestrator {
    control: Arc<dyn ControlPlane>,
    executor: Arc<dyn Executor>,
    networks: NetworkManager,
    vms: VmProvisioner,
    waiter: IpWaiter,
    access: AccessProvisioner,
    power: PowerController,
    snapshots: SnapshotManager,
    templates: TemplateBuilder,
    registry: ProjectRegistry,
    settings: OrchestratorSettings,
}

/// A VM that got through creation or reconciliation and awaits an address.
struct Pending<'a> {
    vm: &'a VmNode,
    outcome: Outcome,
}

#[derive(Debug, Clone, Copy)]
enum SnapshotOp<'a> {
    Create { description: Option<&'a str> },
    Restore,
    Delete,
}

async fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await
}

fn record_error(report: &mut RunReport, kind: ResourceKind, name: &str, error: BoxmanError) {
    if error.is_degraded() {
        warn!(resource = %name, error = %error, "Resource degraded");
        report.degraded(kind, name, error);
    } else {
        warn!(resource = %name, error = %error, "Resource failed");
        report.failed(kind, name, error);
    }
}

impl Orchestrator {
    /// `executor` runs next to the libvirt daemon; `host` runs the SSH
    /// tooling, which needs the cluster workdirs and must keep passwords
    /// out of any relayed command line.
    #[must_use]
    pub fn new(
        control: Arc<dyn ControlPlane>,
        executor: Arc<dyn Executor>,
        host: Arc<dyn Executor>,
        copier: Arc<dyn KeyCopier>,
        registry: ProjectRegistry,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            networks: NetworkManager::new(control.clone()),
            vms: VmProvisioner::new(control.clone(), settings.shutdown.clone()),
            waiter: IpWaiter::new(control.clone(), settings.ip_wait.clone()),
            access: AccessProvisioner::new(host, copier, settings.ssh_retry.clone()),
            power: PowerController::new(control.clone()),
            snapshots: SnapshotManager::new(control.clone()),
            templates: TemplateBuilder::new(control.clone(), settings.shutdown.clone()),
            control,
            executor,
            registry,
            settings,
        }
    }

    /// Override the network start retry (one retry after a second by
    /// default).
    #[must_use]
    pub fn with_network_start_policy(mut self, policy: RetryPolicy) -> Self {
        self.networks = self.networks.with_start_policy(policy);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    async fn preflight(&self) -> Result<()> {
        self.executor.ensure_ready().await?;
        self.control
            .check()
            .await
            .map_err(|e| BoxmanError::control("control plane", e))
    }

    /// Converge the control plane toward `graph`.
    ///
    /// # Errors
    ///
    /// Returns an error, before any resource is touched, if an admin
    /// credential cannot be resolved, the control plane is unreachable or
    /// the project is registered from another config file. Everything else
    /// is recorded in the returned report.
    pub async fn provision(&self, graph: &ResourceGraph, config_path: &Path) -> Result<RunReport> {
        let mut passwords = Vec::with_capacity(graph.clusters.len());
        for cluster in &graph.clusters {
            let password = match &cluster.admin_pass {
                Some(credential) => Some(credential.resolve().await?),
                None => None,
            };
            passwords.push(password);
        }

        self.preflight().await?;

        let mut report = RunReport::new();
        let registration = self
            .registry
            .register(&graph.project, config_path, self.settings.force)?;
        let outcome = match registration {
            Registration::New => Outcome::Created,
            Registration::Existing => Outcome::Skipped,
            Registration::Replaced { .. } => Outcome::Updated,
        };
        report.ok(ResourceKind::Project, &graph.project, outcome);

        info!(project = %graph.project, clusters = graph.clusters.len(), "Provisioning");

        let mut usable = Vec::with_capacity(graph.clusters.len());
        for cluster in &graph.clusters {
            usable.push(self.write_files(cluster, &mut report).await);
        }

        let failed_networks = self.ensure_networks(graph, &mut report).await;

        for ((cluster, password), ready) in graph.clusters.iter().zip(&passwords).zip(usable) {
            if !ready {
                for vm in &cluster.vms {
                    record_error(
                        &mut report,
                        ResourceKind::Vm,
                        &vm.control_name,
                        BoxmanError::blocked(
                            format!("VM {}", vm.control_name),
                            format!("workdir {} is not usable", cluster.workdir.display()),
                        ),
                    );
                }
                continue;
            }

            let blocked: Vec<String> = cluster
                .required_networks()
                .into_iter()
                .filter(|n| failed_networks.contains(n))
                .collect();
            if !blocked.is_empty() {
                for vm in &cluster.vms {
                    record_error(
                        &mut report,
                        ResourceKind::Vm,
                        &vm.control_name,
                        BoxmanError::blocked(
                            format!("VM {}", vm.control_name),
                            format!("required network(s) failed: {}", blocked.join(", ")),
                        ),
                    );
                }
                continue;
            }

            let pending = self.provision_vms(cluster, &mut report).await;
            let hosts = self.wait_for_addresses(pending, &mut report).await;
            self.provision_access(cluster, password.as_deref(), &hosts, &mut report)
                .await;
        }

        info!(project = %graph.project, status = ?report.status(), "Provisioning finished");
        Ok(report)
    }

    /// Create the workdir and write the cluster's files. Returns `false` if
    /// the workdir cannot be created.
    async fn write_files(&self, cluster: &ClusterNode, report: &mut RunReport) -> bool {
        if let Err(e) = tokio::fs::create_dir_all(&cluster.workdir).await {
            report.failed(
                ResourceKind::File,
                cluster.workdir.display().to_string(),
                format!("cannot create workdir: {e}"),
            );
            return false;
        }

        for file in &cluster.files {
            let name = file.path.display().to_string();
            match write_file(&file.path, &file.content).await {
                Ok(()) => report.ok(ResourceKind::File, name, Outcome::Updated),
                Err(e) => report.failed(ResourceKind::File, name, e),
            }
        }
        true
    }

    /// Ensure every declared network. Returns the control-plane names of
    /// networks that failed.
    async fn ensure_networks(&self, graph: &ResourceGraph, report: &mut RunReport) -> BTreeSet<String> {
        let mut failed = BTreeSet::new();
        for network in graph.clusters.iter().flat_map(|c| c.networks.iter()) {
            let name = network.control_name();
            match self.networks.ensure(network).await {
                Ok(outcome) => {
                    let outcome = match outcome {
                        EnsureOutcome::Defined => Outcome::Created,
                        EnsureOutcome::Updated => Outcome::Updated,
                        EnsureOutcome::Unchanged => Outcome::Skipped,
                    };
                    report.ok(ResourceKind::Network, name, outcome);
                }
                Err(e) => {
                    record_error(report, ResourceKind::Network, name, e.into());
                    failed.insert(name.to_string());
                }
            }
        }
        failed
    }

    /// Create new VMs and reconcile existing ones, in declaration order.
    async fn provision_vms<'a>(&self, cluster: &'a ClusterNode, report: &mut RunReport) -> Vec<Pending<'a>> {
        let mut pending = Vec::with_capacity(cluster.vms.len());
        for vm in &cluster.vms {
            match self.provision_vm(cluster, vm).await {
                Ok(outcome) => pending.push(Pending { vm, outcome }),
                Err(e) => record_error(report, ResourceKind::Vm, &vm.control_name, e),
            }
        }
        pending
    }

    async fn provision_vm(&self, cluster: &ClusterNode, vm: &VmNode) -> Result<Outcome> {
        let state = self
            .control
            .domain_state(&vm.control_name)
            .await
            .map_err(|e| BoxmanError::control(format!("VM {}", vm.control_name), e))?;

        if state != DomainState::Absent && !self.settings.force {
            return self.reconcile_vm(cluster, vm, state).await;
        }

        self.vms.clone(vm, self.settings.force).await?;
        self.vms.configure(vm, &cluster.workdir).await?;
        self.vms.attach_adapters(vm).await?;
        self.vms.start(vm).await?;
        Ok(Outcome::Created)
    }

    /// Bring an existing VM up. A shut-off VM first gets whatever disks,
    /// adapters or resources an interrupted run left out.
    async fn reconcile_vm(&self, cluster: &ClusterNode, vm: &VmNode, state: DomainState) -> Result<Outcome> {
        info!(vm = %vm.control_name, %state, "VM exists, reconciling");
        let changed = if state == DomainState::ShutOff {
            self.vms.reconcile(vm, &cluster.workdir).await?
        } else {
            false
        };
        let transition = self.power.bring_up(&vm.control_name, state).await?;
        Ok(match transition {
            Transition::Noop if !changed => Outcome::Skipped,
            _ => Outcome::Updated,
        })
    }

    /// Wait for each VM's address in turn. A timeout degrades that VM only.
    async fn wait_for_addresses(&self, pending: Vec<Pending<'_>>, report: &mut RunReport) -> Vec<HostEntry> {
        let mut hosts = Vec::with_capacity(pending.len());
        for Pending { vm, outcome } in pending {
            match self.waiter.wait(&vm.control_name).await {
                Ok(leases) => {
                    if let Some(lease) = leases.first() {
                        hosts.push(HostEntry {
                            hostname: vm.hostname.clone(),
                            address: lease.address.clone(),
                        });
                    }
                    report.ok(ResourceKind::Vm, &vm.control_name, outcome);
                }
                Err(e) => record_error(report, ResourceKind::Vm, &vm.control_name, e.into()),
            }
        }
        hosts
    }

    async fn provision_access(
        &self,
        cluster: &ClusterNode,
        password: Option<&str>,
        hosts: &[HostEntry],
        report: &mut RunReport,
    ) {
        let keypair = format!("{} keypair", cluster.qualified_name());
        match self.access.ensure_keypair(cluster).await {
            Ok(true) => report.ok(ResourceKind::Access, &keypair, Outcome::Created),
            Ok(false) => report.ok(ResourceKind::Access, &keypair, Outcome::Skipped),
            Err(e) => {
                record_error(report, ResourceKind::Access, &keypair, e.into());
                return;
            }
        }

        match self.access.write_ssh_config(cluster, hosts).await {
            Ok(path) => report.ok(ResourceKind::File, path.display().to_string(), Outcome::Updated),
            Err(e) => {
                let name = cluster.ssh_config_path.display().to_string();
                record_error(report, ResourceKind::File, &name, e.into());
                return;
            }
        }

        for host in hosts {
            let name = format!("{}@{}", cluster.admin_user, host.hostname);
            let Some(password) = password else {
                report.degraded(ResourceKind::Access, name, "no admin_pass configured");
                continue;
            };
            match self.access.install_key(cluster, host, password).await {
                Ok(_) => report.ok(ResourceKind::Access, name, Outcome::Updated),
                Err(e) => record_error(report, ResourceKind::Access, &name, e.into()),
            }
        }
    }

    /// Remove every VM, then every declared network, continuing past
    /// individual failures. The project is unregistered only when nothing
    /// failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane is unreachable.
    pub async fn deprovision(&self, graph: &ResourceGraph) -> Result<RunReport> {
        self.preflight().await?;
        info!(project = %graph.project, "Deprovisioning");

        let mut report = RunReport::new();
        let vms: Vec<&VmNode> = graph.vms().map(|(_, vm)| vm).collect();
        for vm in vms.into_iter().rev() {
            match self.vms.destroy(vm).await {
                Ok(RemoveOutcome::Removed) => report.ok(ResourceKind::Vm, &vm.control_name, Outcome::Removed),
                Ok(RemoveOutcome::Absent) => report.ok(ResourceKind::Vm, &vm.control_name, Outcome::Skipped),
                Err(e) => record_error(&mut report, ResourceKind::Vm, &vm.control_name, e.into()),
            }
        }

        for network in graph.clusters.iter().rev().flat_map(|c| c.networks.iter().rev()) {
            let name = network.control_name();
            match self.networks.teardown(name).await {
                Ok(TeardownOutcome::Removed) => report.ok(ResourceKind::Network, name, Outcome::Removed),
                Ok(TeardownOutcome::Absent) => report.ok(ResourceKind::Network, name, Outcome::Skipped),
                Err(e) => record_error(&mut report, ResourceKind::Network, name, e.into()),
            }
        }

        if report.failures().is_empty() {
            match self.registry.unregister(&graph.project) {
                Ok(true) => report.ok(ResourceKind::Project, &graph.project, Outcome::Removed),
                Ok(false) => report.ok(ResourceKind::Project, &graph.project, Outcome::Skipped),
                Err(e) => report.failed(ResourceKind::Project, &graph.project, e),
            }
            if self.settings.destroy_runtime {
                let name = self.executor.name();
                match self.executor.teardown().await {
                    Ok(()) => report.ok(ResourceKind::Runtime, name, Outcome::Removed),
                    Err(e) => record_error(&mut report, ResourceKind::Runtime, name, e.into()),
                }
            }
        } else {
            warn!(project = %graph.project, "Leaving project registered; some resources were not removed");
        }

        info!(project = %graph.project, status = ?report.status(), "Deprovisioning finished");
        Ok(report)
    }

    /// Provision if any VM is absent, otherwise bring every VM to running
    /// without re-cloning.
    ///
    /// # Errors
    ///
    /// As for [`Self::provision`].
    pub async fn up(&self, graph: &ResourceGraph, config_path: &Path) -> Result<RunReport> {
        self.preflight().await?;

        let mut states = Vec::new();
        for (cluster, vm) in graph.vms() {
            let state = self
                .control
                .domain_state(&vm.control_name)
                .await
                .map_err(|e| BoxmanError::control(format!("VM {}", vm.control_name), e))?;
            states.push((cluster, vm, state));
        }

        if states.iter().any(|(_, _, state)| *state == DomainState::Absent) {
            info!(project = %graph.project, "Some VMs are absent, provisioning");
            return self.provision(graph, config_path).await;
        }

        let mut report = RunReport::new();
        for (cluster, vm, state) in states {
            match self.reconcile_vm(cluster, vm, state).await {
                Ok(outcome) => report.ok(ResourceKind::Vm, &vm.control_name, outcome),
                Err(e) => record_error(&mut report, ResourceKind::Vm, &vm.control_name, e),
            }
        }
        Ok(report)
    }

    /// Build the selected templates from their cloud images. Existing
    /// templates are skipped unless `force` is set.
    ///
    /// # Errors
    ///
    /// Returns [`BoxmanError::Config`] if `selection` names an unknown
    /// template, or an error if the control plane is unreachable.
    pub async fn create_templates(
        &self,
        graph: &ResourceGraph,
        selection: &Machines,
        force: bool,
    ) -> Result<RunReport> {
        let selected = graph.select_templates(selection)?;
        self.preflight().await?;
        let mut report = RunReport::new();
        for template in selected {
            match self.templates.build(template, force).await {
                Ok(TemplateOutcome::Created) => report.ok(ResourceKind::Template, &template.name, Outcome::Created),
                Ok(TemplateOutcome::Exists) => report.ok(ResourceKind::Template, &template.name, Outcome::Skipped),
                Err(e) => record_error(&mut report, ResourceKind::Template, &template.name, e.into()),
            }
        }
        Ok(report)
    }

    /// Apply a power action to the selected VMs.
    ///
    /// # Errors
    ///
    /// Returns [`BoxmanError::Config`] if `machines` names an unknown VM,
    /// or an error if the control plane is unreachable.
    pub async fn power(
        &self,
        graph: &ResourceGraph,
        machines: &Machines,
        action: PowerAction,
    ) -> Result<RunReport> {
        let selected = graph.select(machines)?;
        self.preflight().await?;
        let mut report = RunReport::new();
        for (_, vm) in selected {
            match self.power.apply(&vm.control_name, action).await {
                Ok(Transition::Noop) => report.ok(ResourceKind::Vm, &vm.control_name, Outcome::Skipped),
                Ok(Transition::Invoke(_)) => report.ok(ResourceKind::Vm, &vm.control_name, Outcome::Updated),
                Err(e) => record_error(&mut report, ResourceKind::Vm, &vm.control_name, e.into()),
            }
        }
        Ok(report)
    }

    /// Snapshot the selected VMs under one name (a UTC timestamp if none is
    /// given).
    ///
    /// # Errors
    ///
    /// Returns [`BoxmanError::Config`] if `machines` names an unknown VM.
    pub async fn snapshot_create(
        &self,
        graph: &ResourceGraph,
        machines: &Machines,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<RunReport> {
        let name = name.map_or_else(default_snapshot_name, str::to_string);
        self.for_each_snapshot(graph, machines, &name, SnapshotOp::Create { description })
            .await
    }

    /// # Errors
    ///
    /// Returns [`BoxmanError::Config`] if `machines` names an unknown VM.
    pub async fn snapshot_restore(
        &self,
        graph: &ResourceGraph,
        machines: &Machines,
        name: &str,
    ) -> Result<RunReport> {
        self.for_each_snapshot(graph, machines, name, SnapshotOp::Restore)
            .await
    }

    /// # Errors
    ///
    /// Returns [`BoxmanError::Config`] if `machines` names an unknown VM.
    pub async fn snapshot_delete(
        &self,
        graph: &ResourceGraph,
        machines: &Machines,
        name: &str,
    ) -> Result<RunReport> {
        self.for_each_snapshot(graph, machines, name, SnapshotOp::Delete)
            .await
    }

    async fn for_each_snapshot(
        &self,
        graph: &ResourceGraph,
        machines: &Machines,
        snapshot: &str,
        op: SnapshotOp<'_>,
    ) -> Result<RunReport> {
        let selected = graph.select(machines)?;
        self.preflight().await?;
        let mut report = RunReport::new();
        for (_, vm) in selected {
            let vm = vm.control_name.as_str();
            let (result, success) = match op {
                SnapshotOp::Create { description } => (
                    self.snapshots.create(vm, snapshot, description).await,
                    Outcome::Created,
                ),
                SnapshotOp::Restore => (self.snapshots.restore(vm, snapshot).await, Outcome::Updated),
                SnapshotOp::Delete => (self.snapshots.delete(vm, snapshot).await, Outcome::Removed),
            };
            let label = format!("{vm}@{snapshot}");
            match result {
                Ok(()) => report.ok(ResourceKind::Snapshot, label, success),
                Err(e) => {
                    let error = BoxmanError::control(format!("snapshot {label}"), e);
                    record_error(&mut report, ResourceKind::Snapshot, &label, error);
                }
            }
        }
        Ok(report)
    }

    /// Snapshots of the selected VMs. VMs whose snapshots cannot be listed
    /// are recorded in the report.
    ///
    /// # Errors
    ///
    /// Returns [`BoxmanError::Config`] if `machines` names an unknown VM.
    pub async fn snapshot_list(
        &self,
        graph: &ResourceGraph,
        machines: &Machines,
    ) -> Result<(Vec<VmSnapshots>, RunReport)> {
        let selected = graph.select(machines)?;
        self.preflight().await?;
        let mut listed = Vec::with_capacity(selected.len());
        let mut report = RunReport::new();
        for (_, vm) in selected {
            match self.snapshots.list(&vm.control_name).await {
                Ok(snapshots) => listed.push(VmSnapshots {
                    vm: vm.control_name.clone(),
                    snapshots,
                }),
                Err(e) => {
                    let error = BoxmanError::control(format!("VM {}", vm.control_name), e);
                    record_error(&mut report, ResourceKind::Vm, &vm.control_name, error);
                }
            }
        }
        Ok((listed, report))
    }

    /// Current state and leased addresses of every VM. Does not wait for
    /// addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if a VM's state cannot be read.
    pub async fn connect_info(&self, graph: &ResourceGraph) -> Result<Vec<ConnectInfo>> {
        self.preflight().await?;
        let mut infos = Vec::new();
        for (cluster, vm) in graph.vms() {
            let resource = || format!("VM {}", vm.control_name);
            let state = self
                .control
                .domain_state(&vm.control_name)
                .await
                .map_err(|e| BoxmanError::control(resource(), e))?;
            let addresses = if state == DomainState::Running {
                self.control
                    .domain_leases(&vm.control_name)
                    .await
                    .map_err(|e| BoxmanError::control(resource(), e))?
                    .into_iter()
                    .map(|lease| lease.address)
                    .collect()
            } else {
                Vec::new()
            };
            infos.push(ConnectInfo {
                vm: vm.control_name.clone(),
                hostname: vm.hostname.clone(),
                state,
                addresses,
                user: cluster.admin_user.clone(),
                key_path: cluster.key_path.clone(),
                ssh_config: cluster.ssh_config_path.clone(),
            });
        }
        Ok(infos)
    }
}
