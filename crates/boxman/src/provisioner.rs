//! VM creation and removal.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::control::{CloneRequest, ControlError, ControlPlane, DomainState};
use crate::graph::{AdapterNode, DiskNode, VmNode};
use crate::retry::{retry, Attempt, RetryPolicy};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// The VM exists and overwriting was not requested.
    #[error("VM {vm} already exists")]
    Collision { vm: String },

    #[error("VM {vm}: {source}")]
    Control {
        vm: String,
        #[source]
        source: ControlError,
    },

    /// A disk failed; earlier disks of the same VM stay in place.
    #[error("VM {vm}: disk {disk} failed: {source}")]
    Disk {
        vm: String,
        disk: String,
        /// Disks created before the failure.
        created: Vec<String>,
        #[source]
        source: ControlError,
    },

    /// An adapter's network is missing or inactive at attach time.
    #[error("VM {vm}: adapter {adapter} needs network {network}, which is not active")]
    NetworkNotActive {
        vm: String,
        adapter: String,
        network: String,
    },
}

/// What `destroy` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    Absent,
}

pub struct VmProvisioner {
    control: Arc<dyn ControlPlane>,
    shutdown_policy: RetryPolicy,
}

impl VmProvisioner {
    #[must_use]
    pub fn new(control: Arc<dyn ControlPlane>, shutdown_policy: RetryPolicy) -> Self {
        Self {
            control,
            shutdown_policy,
        }
    }

    fn control_error(vm: &VmNode) -> impl Fn(ControlError) -> ProvisionError + '_ {
        move |source| ProvisionError::Control {
            vm: vm.control_name.clone(),
            source,
        }
    }

    /// Clone the VM from its source. With `overwrite`, an existing VM of the
    /// same name is removed first.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Collision`] if the VM exists and
    /// `overwrite` is off.
    pub async fn clone(&self, vm: &VmNode, overwrite: bool) -> Result<(), ProvisionError> {
        let state = self
            .control
            .domain_state(&vm.control_name)
            .await
            .map_err(Self::control_error(vm))?;

        if state != DomainState::Absent {
            if !overwrite {
                return Err(ProvisionError::Collision {
                    vm: vm.control_name.clone(),
                });
            }
            warn!(vm = %vm.control_name, "Replacing existing VM");
            self.destroy(vm).await?;
        }

        let request = CloneRequest {
            source: vm.source.clone(),
            name: vm.control_name.clone(),
            disk_path: vm.os_disk.clone(),
        };
        match self.control.clone_domain(&request).await {
            Ok(()) => {
                info!(vm = %vm.control_name, source = %vm.source, "VM cloned");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Err(ProvisionError::Collision {
                vm: vm.control_name.clone(),
            }),
            Err(e) => Err(Self::control_error(vm)(e)),
        }
    }

    /// Apply CPU and memory, then create and attach each disk in order.
    /// Returns the names of the disks created.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Disk`] at the first failing disk, carrying
    /// the disks already created.
    pub async fn configure(&self, vm: &VmNode, workdir: &Path) -> Result<Vec<String>, ProvisionError> {
        self.control
            .set_cpu_memory(&vm.control_name, vm.cpus, vm.memory_mib, workdir)
            .await
            .map_err(Self::control_error(vm))?;

        let mut created = Vec::with_capacity(vm.disks.len());
        for disk in &vm.disks {
            if let Err(source) = self.add_disk(vm, disk, true).await {
                return Err(Self::disk_error(vm, disk, created, source));
            }
            created.push(disk.name.clone());
        }
        Ok(created)
    }

    /// Attach adapters in declaration order after checking each network is
    /// active. Returns the number attached.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NetworkNotActive`] before attaching to an
    /// inactive network, or the control-plane failure of an attach.
    pub async fn attach_adapters(&self, vm: &VmNode) -> Result<usize, ProvisionError> {
        self.attach_each(vm, &vm.adapters.iter().collect::<Vec<_>>())
            .await
    }

    /// Finish a shut-off VM whose earlier provisioning stopped partway.
    ///
    /// CPU and memory are reapplied when they differ from the definition.
    /// Declared disks whose target slot is empty are attached, reusing an
    /// image already on disk. Declared adapters with no matching interface
    /// (same network, and same MAC when one is declared) are attached.
    /// Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// As for [`Self::configure`] and [`Self::attach_adapters`].
    pub async fn reconcile(&self, vm: &VmNode, workdir: &Path) -> Result<bool, ProvisionError> {
        let layout = self
            .control
            .domain_layout(&vm.control_name)
            .await
            .map_err(Self::control_error(vm))?;
        let mut changed = false;

        let cpus_differ = vm.cpus.is_some_and(|cpus| layout.vcpus != Some(cpus.vcpus()));
        let memory_differs = vm.memory_mib.is_some_and(|mib| layout.memory_mib != Some(mib));
        if cpus_differ || memory_differs {
            info!(vm = %vm.control_name, "Reapplying CPU and memory");
            self.control
                .set_cpu_memory(&vm.control_name, vm.cpus, vm.memory_mib, workdir)
                .await
                .map_err(Self::control_error(vm))?;
            changed = true;
        }

        let mut attached = Vec::new();
        for disk in &vm.disks {
            if layout.disk_targets.contains(&disk.attachment.target) {
                continue;
            }
            let result = match self.control.disk_image_exists(&disk.attachment.path).await {
                Ok(exists) => self.add_disk(vm, disk, !exists).await,
                Err(e) => Err(e),
            };
            if let Err(source) = result {
                return Err(Self::disk_error(vm, disk, attached, source));
            }
            attached.push(disk.name.clone());
            changed = true;
        }

        let mut present = layout.interfaces;
        let mut missing = Vec::new();
        for adapter in &vm.adapters {
            let wanted = &adapter.attachment;
            let found = present.iter().position(|interface| {
                interface.network.as_deref() == Some(wanted.network.as_str())
                    && wanted.mac.as_ref().map_or(true, |mac| {
                        interface
                            .mac
                            .as_ref()
                            .is_some_and(|m| m.eq_ignore_ascii_case(mac))
                    })
            });
            match found {
                Some(index) => {
                    present.remove(index);
                }
                None => missing.push(adapter),
            }
        }
        if !missing.is_empty() {
            self.attach_each(vm, &missing).await?;
            changed = true;
        }

        if changed {
            info!(vm = %vm.control_name, disks = attached.len(), adapters = missing.len(), "VM reconciled");
        }
        Ok(changed)
    }

    async fn add_disk(&self, vm: &VmNode, disk: &DiskNode, create_image: bool) -> Result<(), ControlError> {
        if create_image {
            self.control
                .create_disk_image(&disk.attachment.path, &disk.attachment.format, disk.size_mib)
                .await?;
        }
        self.control
            .attach_disk(&vm.control_name, &disk.attachment)
            .await?;
        info!(
            vm = %vm.control_name,
            disk = %disk.name,
            target = %disk.attachment.target,
            size_mib = disk.size_mib,
            "Disk attached"
        );
        Ok(())
    }

    fn disk_error(vm: &VmNode, disk: &DiskNode, created: Vec<String>, source: ControlError) -> ProvisionError {
        warn!(vm = %vm.control_name, disk = %disk.name, error = %source, "Disk failed");
        ProvisionError::Disk {
            vm: vm.control_name.clone(),
            disk: disk.name.clone(),
            created,
            source,
        }
    }

    async fn attach_each(&self, vm: &VmNode, adapters: &[&AdapterNode]) -> Result<usize, ProvisionError> {
        for adapter in adapters {
            let network = &adapter.attachment.network;
            let active = self
                .control
                .network_info(network)
                .await
                .map_err(Self::control_error(vm))?
                .is_some_and(|info| info.active);
            if !active {
                return Err(ProvisionError::NetworkNotActive {
                    vm: vm.control_name.clone(),
                    adapter: adapter.name.clone(),
                    network: adapter.network.to_string(),
                });
            }
            self.control
                .attach_interface(&vm.control_name, &adapter.attachment)
                .await
                .map_err(Self::control_error(vm))?;
            info!(vm = %vm.control_name, adapter = %adapter.name, network = %network, "Adapter attached");
        }
        Ok(adapters.len())
    }

    /// Start the VM. Returns `false` if it was already running.
    ///
    /// # Errors
    ///
    /// Propagates control-plane failures.
    pub async fn start(&self, vm: &VmNode) -> Result<bool, ProvisionError> {
        match self.control.start_domain(&vm.control_name).await {
            Ok(()) => {
                info!(vm = %vm.control_name, "VM started");
                Ok(true)
            }
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(Self::control_error(vm)(e)),
        }
    }

    /// Stop (gracefully, then forcibly), delete snapshots, undefine and
    /// remove disk images.
    ///
    /// # Errors
    ///
    /// Returns the first control-plane failure that prevents removal.
    pub async fn destroy(&self, vm: &VmNode) -> Result<RemoveOutcome, ProvisionError> {
        let name = vm.control_name.as_str();
        let to_err = Self::control_error(vm);

        let state = self.control.domain_state(name).await.map_err(&to_err)?;
        if state == DomainState::Absent {
            info!(vm = %name, "VM already absent");
            return Ok(RemoveOutcome::Absent);
        }

        if matches!(state, DomainState::Running | DomainState::Paused | DomainState::Unknown) {
            self.stop(name).await.map_err(&to_err)?;
        }

        let snapshots = self.control.list_snapshots(name).await.map_err(&to_err)?;
        for snapshot in &snapshots {
            self.control
                .delete_snapshot(name, &snapshot.name)
                .await
                .map_err(&to_err)?;
        }

        match self.control.undefine_domain(name).await {
            Err(e) if !e.is_not_found() => return Err(to_err(e)),
            _ => {}
        }

        for disk in &vm.disks {
            if let Err(e) = self.control.remove_disk_image(&disk.attachment.path).await {
                warn!(vm = %name, disk = %disk.name, error = %e, "Could not remove disk image");
            }
        }

        info!(vm = %name, snapshots = snapshots.len(), "VM removed");
        Ok(RemoveOutcome::Removed)
    }

    /// Ask the guest to shut down and wait for it; destroy it if it does not
    /// stop in time.
    pub(crate) async fn stop(&self, name: &str) -> Result<(), ControlError> {
        if self.control.shutdown_domain(name).await.is_ok() {
            let control = &self.control;
            let stopped = retry(&self.shutdown_policy, "guest shutdown", move |_| async move {
                match control.domain_state(name).await {
                    Ok(DomainState::ShutOff | DomainState::Saved | DomainState::Absent) => {
                        Attempt::Done(())
                    }
                    Ok(state) => Attempt::Retry(format!("still {state}")),
                    Err(e) => Attempt::Fatal(e.to_string()),
                }
            })
            .await;
            if stopped.is_ok() {
                info!(vm = %name, "VM shut down");
                return Ok(());
            }
        }

        info!(vm = %name, "Forcing VM off");
        match self.control.destroy_domain(name).await {
            Ok(()) => Ok(()),
            // Stopped on its own in the meantime.
            Err(e) => match self.control.domain_state(name).await? {
                DomainState::ShutOff | DomainState::Saved | DomainState::Absent => Ok(()),
                _ => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_project;
    use crate::control::NetworkInfo;
    use crate::graph::ResourceGraph;
    use crate::testing::FakeControlPlane;
    use std::time::Duration;

    const DOC: &str = r"
project: p
clusters:
  c:
    base_image: base
    workdir: /w
    networks:
      n1: { ip: { address: 10.1.0.1 } }
      n2: { ip: { address: 10.2.0.1 } }
    vms:
      vm1:
        cpus: { sockets: 1, cores: 2, threads: 1 }
        memory: 1024
        disks:
          - { name: d1, target: vdb, size: 10 }
          - { name: d2, target: vdc, size: 10 }
          - { name: d3, target: vdd, size: 10 }
        network_adapters:
          - { network_source: n1 }
          - { network_source: n2 }
";

    fn vm() -> VmNode {
        let config = parse_project(Path::new("conf.yml"), DOC).unwrap();
        ResourceGraph::build(&config).unwrap().clusters[0].vms[0].clone()
    }

    fn active() -> NetworkInfo {
        NetworkInfo {
            active: true,
            ..NetworkInfo::default()
        }
    }

    fn provisioner(control: &Arc<FakeControlPlane>) -> VmProvisioner {
        VmProvisioner::new(
            control.clone(),
            RetryPolicy::fixed(Duration::from_secs(1), Duration::from_secs(30)),
        )
    }

    #[tokio::test]
    async fn test_clone_collision_without_overwrite() {
        let control = Arc::new(FakeControlPlane::new());
        control.add_domain("p_c_vm1", DomainState::Running);

        let err = provisioner(&control).clone(&vm(), false).await.unwrap_err();
        assert_eq!(
            err,
            ProvisionError::Collision {
                vm: "p_c_vm1".into()
            }
        );
        assert!(control.calls_to("clone_domain").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_with_overwrite_replaces() {
        let control = Arc::new(FakeControlPlane::new());
        control.add_domain("p_c_vm1", DomainState::Running);

        provisioner(&control).clone(&vm(), true).await.unwrap();
        assert_eq!(control.calls_to("undefine_domain").len(), 1);
        assert_eq!(control.domain("p_c_vm1").unwrap().source, "base");
        assert_eq!(control.state_of("p_c_vm1"), DomainState::ShutOff);
    }

    #[tokio::test]
    async fn test_configure_applies_resources_and_disks() {
        let control = Arc::new(FakeControlPlane::new());
        let vm = vm();
        let provisioner = provisioner(&control);
        provisioner.clone(&vm, false).await.unwrap();

        let created = provisioner.configure(&vm, Path::new("/w")).await.unwrap();
        assert_eq!(created, ["d1", "d2", "d3"]);

        let domain = control.domain("p_c_vm1").unwrap();
        assert_eq!(domain.memory_mib, Some(1024));
        assert_eq!(domain.cpus.map(|c| c.vcpus()), Some(2));
        assert_eq!(domain.disks, ["vdb", "vdc", "vdd"]);
        assert!(control.has_image(Path::new("/w/p_c_vm1_d2.qcow2")));
    }

    #[tokio::test]
    async fn test_disk_failure_keeps_earlier_disks_and_stops() {
        let control = Arc::new(FakeControlPlane::new());
        control.fail(
            "create_disk_image",
            "/w/p_c_vm1_d2.qcow2",
            ControlError::Failed {
                command: "qemu-img".into(),
                code: 1,
                stderr: "No space left on device".into(),
            },
        );
        let vm = vm();
        let provisioner = provisioner(&control);
        provisioner.clone(&vm, false).await.unwrap();

        match provisioner.configure(&vm, Path::new("/w")).await {
            Err(ProvisionError::Disk { disk, created, .. }) => {
                assert_eq!(disk, "d2");
                assert_eq!(created, ["d1"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(control.has_image(Path::new("/w/p_c_vm1_d1.qcow2")));
        assert_eq!(control.domain("p_c_vm1").unwrap().disks, ["vdb"]);
        assert!(!control
            .calls()
            .iter()
            .any(|c| c.contains("p_c_vm1_d3")));
    }

    #[tokio::test]
    async fn test_adapters_attach_in_declaration_order() {
        let control = Arc::new(FakeControlPlane::new());
        control.add_network("p_c_n1", active());
        control.add_network("p_c_n2", active());
        let vm = vm();
        let provisioner = provisioner(&control);
        provisioner.clone(&vm, false).await.unwrap();

        assert_eq!(provisioner.attach_adapters(&vm).await.unwrap(), 2);
        let networks: Vec<String> = control
            .domain("p_c_vm1")
            .unwrap()
            .interfaces
            .into_iter()
            .map(|i| i.network)
            .collect();
        assert_eq!(networks, ["p_c_n1", "p_c_n2"]);
    }

    #[tokio::test]
    async fn test_inactive_network_blocks_attach() {
        let control = Arc::new(FakeControlPlane::new());
        control.add_network("p_c_n1", active());
        control.add_network("p_c_n2", NetworkInfo::default());
        let vm = vm();
        let provisioner = provisioner(&control);
        provisioner.clone(&vm, false).await.unwrap();

        let err = provisioner.attach_adapters(&vm).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NetworkNotActive { network, .. } if network == "p::c::n2"));
        assert_eq!(control.calls_to("attach_interface").len(), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let control = Arc::new(FakeControlPlane::new());
        control.add_domain("p_c_vm1", DomainState::ShutOff);
        let provisioner = provisioner(&control);
        let vm = vm();

        assert!(provisioner.start(&vm).await.unwrap());
        assert!(!provisioner.start(&vm).await.unwrap());
        assert_eq!(control.state_of("p_c_vm1"), DomainState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_removes_snapshots_and_disks() {
        let control = Arc::new(FakeControlPlane::new());
        let vm = vm();
        let provisioner = provisioner(&control);
        provisioner.clone(&vm, false).await.unwrap();
        provisioner.configure(&vm, Path::new("/w")).await.unwrap();
        provisioner.start(&vm).await.unwrap();
        control.add_snapshot("p_c_vm1", "s1");

        assert_eq!(provisioner.destroy(&vm).await.unwrap(), RemoveOutcome::Removed);
        assert_eq!(control.state_of("p_c_vm1"), DomainState::Absent);
        assert_eq!(control.calls_to("delete_snapshot"), ["delete_snapshot p_c_vm1 s1"]);
        assert!(!control.has_image(Path::new("/w/p_c_vm1_d1.qcow2")));
        assert!(control.calls_to("destroy_domain").is_empty());

        assert_eq!(provisioner.destroy(&vm).await.unwrap(), RemoveOutcome::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_forces_off_when_shutdown_refused() {
        let control = Arc::new(FakeControlPlane::new());
        control.add_domain("p_c_vm1", DomainState::Paused);

        provisioner(&control).destroy(&vm()).await.unwrap();
        assert_eq!(control.calls_to("destroy_domain").len(), 1);
        assert_eq!(control.state_of("p_c_vm1"), DomainState::Absent);
    }

    #[tokio::test]
    async fn test_reconcile_finishes_partial_vm() {
        let control = Arc::new(FakeControlPlane::new());
        control.add_network("p_c_n1", active());
        control.add_network("p_c_n2", active());
        control.fail_times(
            "attach_disk",
            "p_c_vm1 vdc",
            ControlError::Invalid("XML error: target vdc already in use".into()),
            1,
        );
        let vm = vm();
        let provisioner = provisioner(&control);
        provisioner.clone(&vm, false).await.unwrap();
        assert!(provisioner.configure(&vm, Path::new("/w")).await.is_err());
        assert!(control.has_image(Path::new("/w/p_c_vm1_d2.qcow2")));

        assert!(provisioner.reconcile(&vm, Path::new("/w")).await.unwrap());

        let domain = control.domain("p_c_vm1").unwrap();
        assert_eq!(domain.disks, ["vdb", "vdc", "vdd"]);
        assert_eq!(domain.interfaces.len(), 2);
        // The image left by the failed attach is reused.
        assert_eq!(
            control.calls_to("create_disk_image"),
            [
                "create_disk_image /w/p_c_vm1_d1.qcow2",
                "create_disk_image /w/p_c_vm1_d2.qcow2",
                "create_disk_image /w/p_c_vm1_d3.qcow2",
            ]
        );
        assert_eq!(control.calls_to("set_cpu_memory").len(), 1);

        assert!(!provisioner.reconcile(&vm, Path::new("/w")).await.unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_reapplies_resources_when_they_differ() {
        let control = Arc::new(FakeControlPlane::new());
        control.fail_times(
            "set_cpu_memory",
            "p_c_vm1",
            ControlError::Invalid("domain has no <vcpu> element".into()),
            1,
        );
        let mut vm = vm();
        vm.adapters.clear();
        let provisioner = provisioner(&control);
        provisioner.clone(&vm, false).await.unwrap();
        assert!(provisioner.configure(&vm, Path::new("/w")).await.is_err());

        assert!(provisioner.reconcile(&vm, Path::new("/w")).await.unwrap());
        let domain = control.domain("p_c_vm1").unwrap();
        assert_eq!(domain.memory_mib, Some(1024));
        assert_eq!(domain.disks, ["vdb", "vdc", "vdd"]);
    }
}
