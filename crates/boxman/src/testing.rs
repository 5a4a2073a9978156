//! In-memory control plane and executor for tests.
//!
//! Both record every call so tests can assert on what was (and was not)
//! attempted, and both accept injected failures.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::control::{
    CloneRequest, ControlError, ControlPlane, CpuTopology, DiskAttachment, DomainLayout,
    DomainState, ImportRequest, InterfaceAttachment, InterfaceInfo, Lease, NetworkDefinition,
    NetworkInfo, SnapshotInfo,
};
use crate::executor::{CommandOutput, CommandSpec, ExecError, Executor};

/// When a running fake VM reports a DHCP lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeasePlan {
    Immediate,
    AfterPolls(u32),
    Never,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeDomain {
    pub state: DomainState,
    pub source: String,
    pub cpus: Option<CpuTopology>,
    pub memory_mib: Option<u64>,
    pub disks: Vec<String>,
    pub interfaces: Vec<InterfaceAttachment>,
    pub snapshots: Vec<SnapshotInfo>,
    pub leases: LeasePlan,
    pub polls: u32,
    pub address: String,
}

impl FakeDomain {
    fn new(state: DomainState, source: &str, index: usize) -> Self {
        Self {
            state,
            source: source.to_string(),
            cpus: None,
            memory_mib: None,
            disks: Vec::new(),
            interfaces: Vec::new(),
            snapshots: Vec::new(),
            leases: LeasePlan::Immediate,
            polls: 0,
            address: format!("10.0.0.{}", 10 + index),
        }
    }
}

#[derive(Default)]
struct FakeState {
    networks: BTreeMap<String, NetworkInfo>,
    domains: BTreeMap<String, FakeDomain>,
    images: BTreeSet<PathBuf>,
    calls: Vec<String>,
    /// `"op target"` -> (error, remaining uses; `None` = forever)
    failures: HashMap<String, (ControlError, Option<u32>)>,
    lease_plans: HashMap<String, LeasePlan>,
    /// State an imported VM is in once `import_domain` returns.
    import_state: Option<DomainState>,
    imports: Vec<ImportRequest>,
    created: usize,
}

#[derive(Default)]
pub(crate) struct FakeControlPlane {
    state: Mutex<FakeState>,
}

fn not_running(op: &str, name: &str) -> ControlError {
    ControlError::Failed {
        command: format!("{op} {name}"),
        code: 1,
        stderr: "Requested operation is not valid: domain is not running".into(),
    }
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_network(&self, name: &str, info: NetworkInfo) {
        self.state
            .lock()
            .unwrap()
            .networks
            .insert(name.to_string(), info);
    }

    pub fn add_domain(&self, name: &str, state: DomainState) {
        let mut s = self.state.lock().unwrap();
        s.created += 1;
        let domain = FakeDomain::new(state, "preexisting", s.created);
        s.domains.insert(name.to_string(), domain);
    }

    pub fn add_snapshot(&self, domain: &str, name: &str) {
        let mut s = self.state.lock().unwrap();
        if let Some(d) = s.domains.get_mut(domain) {
            d.snapshots.push(SnapshotInfo {
                name: name.to_string(),
                description: None,
                state: Some("running".into()),
            });
        }
    }

    /// Lease behaviour for a VM, applied when it is created or already exists.
    pub fn set_leases(&self, domain: &str, plan: LeasePlan) {
        let mut s = self.state.lock().unwrap();
        s.lease_plans.insert(domain.to_string(), plan);
        if let Some(d) = s.domains.get_mut(domain) {
            d.leases = plan;
        }
    }

    /// Fail every `op` on `target`.
    pub fn fail(&self, op: &str, target: &str, error: ControlError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(format!("{op} {target}"), (error, None));
    }

    /// Fail the next `times` calls of `op` on `target`.
    pub fn fail_times(&self, op: &str, target: &str, error: ControlError, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(format!("{op} {target}"), (error, Some(times)));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls whose operation is `op`.
    pub fn calls_to(&self, op: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .collect()
    }

    pub fn domain(&self, name: &str) -> Option<FakeDomain> {
        self.state.lock().unwrap().domains.get(name).cloned()
    }

    pub fn state_of(&self, name: &str) -> DomainState {
        self.domain(name).map_or(DomainState::Absent, |d| d.state)
    }

    pub fn network(&self, name: &str) -> Option<NetworkInfo> {
        self.state.lock().unwrap().networks.get(name).cloned()
    }

    pub fn add_image(&self, path: &Path) {
        self.state.lock().unwrap().images.insert(path.to_path_buf());
    }

    /// Imported VMs start in `state` (running by default).
    pub fn set_import_state(&self, state: DomainState) {
        self.state.lock().unwrap().import_state = Some(state);
    }

    pub fn imports(&self) -> Vec<ImportRequest> {
        self.state.lock().unwrap().imports.clone()
    }

    pub fn has_image(&self, path: &Path) -> bool {
        self.state.lock().unwrap().images.contains(path)
    }

    fn record(&self, op: &str, target: &str) -> Result<(), ControlError> {
        let mut s = self.state.lock().unwrap();
        let key = format!("{op} {target}");
        s.calls.push(key.clone());
        let Some((error, remaining)) = s.failures.get_mut(&key) else {
            return Ok(());
        };
        let error = error.clone();
        match remaining {
            None => Err(error),
            Some(0) => Ok(()),
            Some(n) => {
                *n -= 1;
                Err(error)
            }
        }
    }

    fn with_domain<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut FakeDomain) -> Result<T, ControlError>,
    ) -> Result<T, ControlError> {
        let mut s = self.state.lock().unwrap();
        match s.domains.get_mut(name) {
            Some(domain) => f(domain),
            None => Err(ControlError::NotFound(format!("domain {name}"))),
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn check(&self) -> Result<(), ControlError> {
        self.record("check", "")
    }

    async fn network_info(&self, name: &str) -> Result<Option<NetworkInfo>, ControlError> {
        self.record("network_info", name)?;
        Ok(self.network(name))
    }

    async fn define_network(&self, definition: &NetworkDefinition) -> Result<(), ControlError> {
        self.record("define_network", &definition.name)?;
        let mut s = self.state.lock().unwrap();
        if s.networks.contains_key(&definition.name) {
            return Err(ControlError::AlreadyExists(definition.name.clone()));
        }
        s.networks.insert(
            definition.name.clone(),
            NetworkInfo {
                active: false,
                autostart: false,
                mode: Some(definition.mode.to_string()),
                bridge: definition.bridge.name.clone(),
                address: Some(definition.address.clone()),
                netmask: Some(definition.netmask.clone()),
            },
        );
        Ok(())
    }

    async fn set_network_autostart(&self, name: &str) -> Result<(), ControlError> {
        self.record("set_network_autostart", name)?;
        let mut s = self.state.lock().unwrap();
        let net = s
            .networks
            .get_mut(name)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        net.autostart = true;
        Ok(())
    }

    async fn start_network(&self, name: &str) -> Result<(), ControlError> {
        self.record("start_network", name)?;
        let mut s = self.state.lock().unwrap();
        let net = s
            .networks
            .get_mut(name)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        if net.active {
            return Err(ControlError::AlreadyExists(format!("network {name} is already active")));
        }
        net.active = true;
        Ok(())
    }

    async fn stop_network(&self, name: &str) -> Result<(), ControlError> {
        self.record("stop_network", name)?;
        let mut s = self.state.lock().unwrap();
        let net = s
            .networks
            .get_mut(name)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        net.active = false;
        Ok(())
    }

    async fn undefine_network(&self, name: &str) -> Result<(), ControlError> {
        self.record("undefine_network", name)?;
        self.state
            .lock()
            .unwrap()
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ControlError::NotFound(name.to_string()))
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState, ControlError> {
        self.record("domain_state", name)?;
        Ok(self.state_of(name))
    }

    async fn clone_domain(&self, request: &CloneRequest) -> Result<(), ControlError> {
        self.record("clone_domain", &request.name)?;
        let mut s = self.state.lock().unwrap();
        if s.domains.contains_key(&request.name) {
            return Err(ControlError::AlreadyExists(request.name.clone()));
        }
        s.created += 1;
        let mut domain = FakeDomain::new(DomainState::ShutOff, &request.source, s.created);
        if let Some(plan) = s.lease_plans.get(&request.name) {
            domain.leases = *plan;
        }
        s.domains.insert(request.name.clone(), domain);
        s.images.insert(request.disk_path.clone());
        Ok(())
    }

    async fn import_domain(&self, request: &ImportRequest) -> Result<(), ControlError> {
        self.record("import_domain", &request.name)?;
        let mut s = self.state.lock().unwrap();
        if s.domains.contains_key(&request.name) {
            return Err(ControlError::AlreadyExists(request.name.clone()));
        }
        if !s.images.contains(&request.disk_path) {
            return Err(ControlError::NotFound(request.disk_path.display().to_string()));
        }
        s.created += 1;
        let state = s.import_state.unwrap_or(DomainState::Running);
        let mut domain = FakeDomain::new(state, "import", s.created);
        domain.memory_mib = Some(request.memory_mib);
        domain.disks.push("vda".into());
        s.domains.insert(request.name.clone(), domain);
        s.imports.push(request.clone());
        Ok(())
    }

    async fn domain_layout(&self, name: &str) -> Result<DomainLayout, ControlError> {
        self.record("domain_layout", name)?;
        self.with_domain(name, |d| {
            Ok(DomainLayout {
                vcpus: d.cpus.map(|c| c.vcpus()),
                memory_mib: d.memory_mib,
                disk_targets: d.disks.clone(),
                interfaces: d
                    .interfaces
                    .iter()
                    .map(|i| InterfaceInfo {
                        network: Some(i.network.clone()),
                        mac: i.mac.clone(),
                    })
                    .collect(),
            })
        })
    }

    async fn set_cpu_memory(
        &self,
        name: &str,
        cpus: Option<CpuTopology>,
        memory_mib: Option<u64>,
        _workdir: &Path,
    ) -> Result<(), ControlError> {
        self.record("set_cpu_memory", name)?;
        self.with_domain(name, |d| {
            d.cpus = cpus;
            d.memory_mib = memory_mib;
            Ok(())
        })
    }

    async fn create_disk_image(
        &self,
        path: &Path,
        _format: &str,
        _size_mib: u64,
    ) -> Result<(), ControlError> {
        self.record("create_disk_image", &path.display().to_string())?;
        self.state.lock().unwrap().images.insert(path.to_path_buf());
        Ok(())
    }

    async fn remove_disk_image(&self, path: &Path) -> Result<(), ControlError> {
        self.record("remove_disk_image", &path.display().to_string())?;
        self.state.lock().unwrap().images.remove(path);
        Ok(())
    }

    async fn disk_image_exists(&self, path: &Path) -> Result<bool, ControlError> {
        self.record("disk_image_exists", &path.display().to_string())?;
        Ok(self.has_image(path))
    }

    async fn copy_disk_image(&self, source: &Path, destination: &Path) -> Result<(), ControlError> {
        self.record("copy_disk_image", &destination.display().to_string())?;
        let mut s = self.state.lock().unwrap();
        if !s.images.contains(source) {
            return Err(ControlError::NotFound(source.display().to_string()));
        }
        s.images.insert(destination.to_path_buf());
        Ok(())
    }

    async fn download_disk_image(&self, _url: &str, destination: &Path) -> Result<(), ControlError> {
        self.record("download_disk_image", &destination.display().to_string())?;
        self.state.lock().unwrap().images.insert(destination.to_path_buf());
        Ok(())
    }

    async fn resize_disk_image(&self, path: &Path, size: &str) -> Result<(), ControlError> {
        self.record("resize_disk_image", &format!("{} {size}", path.display()))
    }

    async fn build_seed_image(&self, _nocloud_dir: &Path, path: &Path) -> Result<(), ControlError> {
        self.record("build_seed_image", &path.display().to_string())?;
        self.state.lock().unwrap().images.insert(path.to_path_buf());
        Ok(())
    }

    async fn attach_disk(&self, domain: &str, disk: &DiskAttachment) -> Result<(), ControlError> {
        self.record("attach_disk", &format!("{domain} {}", disk.target))?;
        self.with_domain(domain, |d| {
            d.disks.push(disk.target.clone());
            Ok(())
        })
    }

    async fn attach_interface(
        &self,
        domain: &str,
        interface: &InterfaceAttachment,
    ) -> Result<(), ControlError> {
        self.record("attach_interface", &format!("{domain} {}", interface.network))?;
        self.with_domain(domain, |d| {
            d.interfaces.push(interface.clone());
            Ok(())
        })
    }

    async fn start_domain(&self, name: &str) -> Result<(), ControlError> {
        self.record("start_domain", name)?;
        self.with_domain(name, |d| match d.state {
            DomainState::Running => Err(ControlError::AlreadyExists(format!(
                "domain {name} is already active"
            ))),
            _ => {
                d.state = DomainState::Running;
                Ok(())
            }
        })
    }

    async fn suspend_domain(&self, name: &str) -> Result<(), ControlError> {
        self.record("suspend_domain", name)?;
        self.with_domain(name, |d| match d.state {
            DomainState::Running => {
                d.state = DomainState::Paused;
                Ok(())
            }
            _ => Err(not_running("suspend", name)),
        })
    }

    async fn resume_domain(&self, name: &str) -> Result<(), ControlError> {
        self.record("resume_domain", name)?;
        self.with_domain(name, |d| match d.state {
            DomainState::Paused => {
                d.state = DomainState::Running;
                Ok(())
            }
            _ => Err(not_running("resume", name)),
        })
    }

    async fn save_domain(&self, name: &str) -> Result<(), ControlError> {
        self.record("save_domain", name)?;
        self.with_domain(name, |d| match d.state {
            DomainState::Running | DomainState::Paused => {
                d.state = DomainState::Saved;
                Ok(())
            }
            _ => Err(not_running("managedsave", name)),
        })
    }

    async fn restore_domain(&self, name: &str) -> Result<(), ControlError> {
        self.record("restore_domain", name)?;
        self.with_domain(name, |d| match d.state {
            DomainState::Saved | DomainState::ShutOff => {
                d.state = DomainState::Running;
                Ok(())
            }
            _ => Err(not_running("start", name)),
        })
    }

    async fn shutdown_domain(&self, name: &str) -> Result<(), ControlError> {
        self.record("shutdown_domain", name)?;
        self.with_domain(name, |d| match d.state {
            DomainState::Running => {
                d.state = DomainState::ShutOff;
                Ok(())
            }
            _ => Err(not_running("shutdown", name)),
        })
    }

    async fn destroy_domain(&self, name: &str) -> Result<(), ControlError> {
        self.record("destroy_domain", name)?;
        self.with_domain(name, |d| match d.state {
            DomainState::Running | DomainState::Paused => {
                d.state = DomainState::ShutOff;
                Ok(())
            }
            _ => Err(not_running("destroy", name)),
        })
    }

    async fn undefine_domain(&self, name: &str) -> Result<(), ControlError> {
        self.record("undefine_domain", name)?;
        self.state
            .lock()
            .unwrap()
            .domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ControlError::NotFound(format!("domain {name}")))
    }

    async fn domain_leases(&self, name: &str) -> Result<Vec<Lease>, ControlError> {
        self.record("domain_leases", name)?;
        self.with_domain(name, |d| {
            if d.state != DomainState::Running {
                return Ok(Vec::new());
            }
            d.polls += 1;
            let ready = match d.leases {
                LeasePlan::Immediate => true,
                LeasePlan::AfterPolls(n) => d.polls > n,
                LeasePlan::Never => false,
            };
            Ok(if ready {
                vec![Lease {
                    interface: "vnet0".into(),
                    mac: "52:54:00:00:00:01".into(),
                    address: d.address.clone(),
                }]
            } else {
                Vec::new()
            })
        })
    }

    async fn create_snapshot(
        &self,
        domain: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<(), ControlError> {
        self.record("create_snapshot", &format!("{domain} {name}"))?;
        self.with_domain(domain, |d| {
            if d.snapshots.iter().any(|s| s.name == name) {
                return Err(ControlError::AlreadyExists(name.to_string()));
            }
            d.snapshots.push(SnapshotInfo {
                name: name.to_string(),
                description: description.map(str::to_string),
                state: Some(d.state.to_string()),
            });
            Ok(())
        })
    }

    async fn list_snapshots(&self, domain: &str) -> Result<Vec<SnapshotInfo>, ControlError> {
        self.record("list_snapshots", domain)?;
        self.with_domain(domain, |d| Ok(d.snapshots.clone()))
    }

    async fn revert_snapshot(&self, domain: &str, name: &str) -> Result<(), ControlError> {
        self.record("revert_snapshot", &format!("{domain} {name}"))?;
        self.with_domain(domain, |d| {
            if d.snapshots.iter().any(|s| s.name == name) {
                Ok(())
            } else {
                Err(ControlError::NotFound(format!("snapshot {name}")))
            }
        })
    }

    async fn delete_snapshot(&self, domain: &str, name: &str) -> Result<(), ControlError> {
        self.record("delete_snapshot", &format!("{domain} {name}"))?;
        self.with_domain(domain, |d| {
            let before = d.snapshots.len();
            d.snapshots.retain(|s| s.name != name);
            if d.snapshots.len() == before {
                Err(ControlError::NotFound(format!("snapshot {name}")))
            } else {
                Ok(())
            }
        })
    }
}

/// Executor that pretends every command succeeds.
///
/// `ssh-keygen -f <path>` writes a placeholder keypair so callers can see
/// the files appear. Programs can be made to fail a number of times.
#[derive(Default)]
pub(crate) struct FakeExecutor {
    commands: Mutex<Vec<CommandSpec>>,
    failures: Mutex<HashMap<String, u32>>,
    teardowns: Mutex<u32>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` runs of `program` exit non-zero.
    pub fn fail_program(&self, program: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(program.to_string(), times);
    }

    pub fn commands(&self) -> Vec<CommandSpec> {
        self.commands.lock().unwrap().clone()
    }

    pub fn teardowns(&self) -> u32 {
        *self.teardowns.lock().unwrap()
    }

    pub fn count(&self, program: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.program == program)
            .count()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn ensure_ready(&self) -> Result<(), ExecError> {
        Ok(())
    }

    async fn teardown(&self) -> Result<(), ExecError> {
        *self.teardowns.lock().unwrap() += 1;
        Ok(())
    }

    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        self.commands.lock().unwrap().push(command.clone());

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&command.program) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(CommandOutput {
                        stdout: String::new(),
                        stderr: "Permission denied, please try again.".into(),
                        exit_code: 1,
                    });
                }
            }
        }

        let mut stdout = String::new();
        match command.program.as_str() {
            "ssh-keygen" => {
                if let Some(pos) = command.args.iter().position(|a| a == "-f") {
                    let private = PathBuf::from(&command.args[pos + 1]);
                    let mut public = private.clone().into_os_string();
                    public.push(".pub");
                    std::fs::write(&private, "PRIVATE KEY\n").unwrap();
                    std::fs::write(public, "ssh-ed25519 AAAAtest boxman\n").unwrap();
                }
            }
            "ssh" => stdout.push_str("guest\n"),
            _ => {}
        }

        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }
}
