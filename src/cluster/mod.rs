/*
* Cluster Orchestration
* ---------------------
* @module: cluster
*
* Multi-resource workflows for one cluster: storage pool, network, volumes
* and VMs, followed by the configuration-management hand-off.
*
* Every public operation runs inside one state transaction (flock held from
* load to save). The `*_in` variants take the already-loaded state so the
* system layer can chain several clusters under the same lock.
*
* Within an operation:
*   1. ownership and bookkeeping happen sequentially on `&mut GlobalState`
*   2. independent hypervisor calls fan out through a bounded pool
*      (`buffer_unordered(max_workers)`)
*   3. results are folded back into the state sequentially
*
* A failed start is unwound through `RollbackStack` and the state goes back
* to the pre-start snapshot. Anything rollback could not remove stays on the
* cluster record with `reconcile_pending` set.
*/

pub mod plan;
pub mod provision;
pub mod rollback;
pub mod system;

use futures_util::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{ClusterSpec, Settings, VmSpec};
use crate::core::lifecycle::apply_observation;
use crate::core::{
    DomainDefinition, DomainStatus, Hypervisor, NetworkDefinition, PoolDefinition, StopOutcome,
    VmLifecycle, VmState, VolumeDefinition,
};
use crate::errors::{ConfigError, FailureLog, FieldError, GpuError, ManagerError, ManagerResult, VmError};
use crate::gpu::{find_conflict, GpuAllocator};
use crate::state::{
    ClusterState, GlobalState, NetworkInfo, StateStore, StoragePoolInfo, VmInfo, VolumeInfo,
};

pub use plan::Plan;
pub use provision::{AnsiblePlaybook, Provisioner, SkipProvisioning};
pub use rollback::{RollbackReport, RollbackStack, RollbackStep};
pub use system::{SystemManager, SystemState, SystemStatus};

/// Asks the operator before something destructive happens.
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Always says yes (`--force`, tests).
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

struct BootPlan<'a> {
    vm: &'a VmSpec,
    /// Volume already on the cluster record from an earlier run.
    volume_path: Option<String>,
    boot: bool,
}

struct BootReport<'a> {
    vm: &'a VmSpec,
    /// State before this attempt; `None` when it could not be observed.
    prior: Option<VmState>,
    volume_path: Option<String>,
    /// Volume this attempt asked for, whether or not the create succeeded.
    new_volume: Option<(String, String)>,
    created_volume: Option<VolumeInfo>,
    result: ManagerResult<DomainStatus>,
}

pub struct ClusterManager {
    store: StateStore,
    lifecycle: Arc<VmLifecycle>,
    provisioner: Arc<dyn Provisioner>,
    storage_root: PathBuf,
    max_workers: usize,
}

impl ClusterManager {
    pub fn new(store: StateStore, lifecycle: Arc<VmLifecycle>, settings: &Settings) -> Self {
        Self {
            store,
            lifecycle,
            provisioner: Arc::new(AnsiblePlaybook::new()),
            storage_root: settings.storage_root.clone(),
            max_workers: settings.max_workers.max(1),
        }
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn lifecycle(&self) -> &VmLifecycle {
        &self.lifecycle
    }

    fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        self.lifecycle.hypervisor()
    }

    // ---- transactional entry points -----------------------------------

    pub async fn start_cluster(&self, spec: &ClusterSpec) -> ManagerResult<ClusterState> {
        let mut tx = self.store.begin_async().await?;
        let result = self.start_in(&mut tx, spec).await;
        finish(tx, result).await
    }

    pub async fn stop_cluster(&self, spec: &ClusterSpec) -> ManagerResult<()> {
        let mut tx = self.store.begin_async().await?;
        let result = self.stop_in(&mut tx, spec).await;
        finish(tx, result).await
    }

    pub async fn destroy_cluster(&self, spec: &ClusterSpec, force: bool, confirm: &dyn Confirm) -> ManagerResult<()> {
        if !force && !confirm.confirm(&destroy_prompt(spec)) {
            return Err(ManagerError::Cancelled(format!("destroy of cluster {}", spec.name)));
        }
        let mut tx = self.store.begin_async().await?;
        let result = self.destroy_in(&mut tx, spec).await;
        finish(tx, result).await
    }

    pub async fn status_cluster(&self, spec: &ClusterSpec) -> ManagerResult<ClusterState> {
        let mut tx = self.store.begin_async().await?;
        let result = self.status_in(&mut tx, spec).await;
        finish(tx, result).await
    }

    pub async fn start_vm(&self, spec: &ClusterSpec, vm_name: &str) -> ManagerResult<VmInfo> {
        let mut tx = self.store.begin_async().await?;
        let result = self.start_vm_in(&mut tx, spec, vm_name).await;
        finish(tx, result).await
    }

    pub async fn stop_vm(&self, spec: &ClusterSpec, vm_name: &str) -> ManagerResult<StopOutcome> {
        let mut tx = self.store.begin_async().await?;
        let result = self.lifecycle.stop(&mut tx, &spec.name, vm_name).await;
        finish(tx, result).await
    }

    pub async fn pause_vm(&self, spec: &ClusterSpec, vm_name: &str) -> ManagerResult<VmState> {
        let mut tx = self.store.begin_async().await?;
        let result = self.lifecycle.pause(&mut tx, &spec.name, vm_name).await;
        finish(tx, result).await
    }

    pub async fn resume_vm(&self, spec: &ClusterSpec, vm_name: &str) -> ManagerResult<VmState> {
        let mut tx = self.store.begin_async().await?;
        let result = self.lifecycle.resume(&mut tx, &spec.name, vm_name).await;
        finish(tx, result).await
    }

    pub async fn recover_vm(&self, spec: &ClusterSpec, vm_name: &str) -> ManagerResult<VmState> {
        let mut tx = self.store.begin_async().await?;
        let result = self.lifecycle.recover(&mut tx, &spec.name, vm_name).await;
        finish(tx, result).await
    }

    /// Live state of one VM, folded into its record.
    pub async fn status_vm(&self, spec: &ClusterSpec, vm_name: &str) -> ManagerResult<VmInfo> {
        let mut tx = self.store.begin_async().await?;
        let result = self.lifecycle.refresh(&mut tx, &spec.name, vm_name).await;
        finish(tx, result).await
    }

    pub async fn restart_vm(&self, spec: &ClusterSpec, vm_name: &str) -> ManagerResult<VmInfo> {
        let mut tx = self.store.begin_async().await?;
        let result = self.restart_vm_in(&mut tx, spec, vm_name).await;
        finish(tx, result).await
    }

    // ---- start --------------------------------------------------------

    /// Pool, network, head VM, remaining VMs, provisioning. All or nothing.
    pub async fn start_in(&self, state: &mut GlobalState, spec: &ClusterSpec) -> ManagerResult<ClusterState> {
        let head = spec.head().ok_or_else(|| {
            ConfigError::Schema(vec![FieldError::new(
                format!("clusters.{}", spec.cluster_type),
                "cluster declares no head node",
            )])
        })?;
        preflight(state, spec)?;

        info!(cluster = %spec.name, vms = spec.vms.len(), "Starting cluster");
        let before = state.clone();
        let mut stack = RollbackStack::new();

        match self.bring_up(state, spec, head, &mut stack).await {
            Ok(()) => {
                let record = cluster_record(state, &spec.name)?;
                record.reconcile_pending = false;
                record.refresh_status();
                info!(cluster = %spec.name, status = %record.status, "Cluster started");
                Ok(record.clone())
            }
            Err(err) => {
                error!(cluster = %spec.name, error = %err, steps = stack.len(), "Start failed, rolling back");
                let attempt = state.cluster(&spec.name).cloned();
                let report = stack.unwind(&self.lifecycle).await;
                *state = before;
                if !report.is_clean() {
                    if let Some(attempt) = attempt {
                        self.remember_leftovers(state, spec, attempt, &report.leftovers).await;
                    }
                }
                Err(report.into_error(err))
            }
        }
    }

    async fn bring_up(
        &self,
        state: &mut GlobalState,
        spec: &ClusterSpec,
        head: &VmSpec,
        stack: &mut RollbackStack,
    ) -> ManagerResult<()> {
        state
            .clusters
            .entry(spec.name.clone())
            .or_insert_with(|| ClusterState::new(&spec.name, spec.cluster_type));

        self.ensure_pool(state, spec, stack).await?;
        self.ensure_network(state, spec, stack).await?;

        self.bring_up_vms(state, spec, vec![head], stack).await?;
        let rest: Vec<&VmSpec> = spec.vms.iter().filter(|vm| vm.name != head.name).collect();
        if !rest.is_empty() {
            self.bring_up_vms(state, spec, rest, stack).await?;
        }

        if let Some(provisioning) = &spec.provisioning {
            self.provisioner.provision(&spec.name, provisioning).await?;
        }
        Ok(())
    }

    async fn ensure_pool(&self, state: &mut GlobalState, spec: &ClusterSpec, stack: &mut RollbackStack) -> ManagerResult<()> {
        let record = cluster_record(state, &spec.name)?;
        if record.storage_pool.is_some() {
            debug!(cluster = %spec.name, pool = %spec.pool_name, "Storage pool already recorded");
            return Ok(());
        }
        let path = self.storage_root.join(&spec.name);
        // a create that fails half way may still leave the pool defined
        stack.push(RollbackStep::Pool {
            name: spec.pool_name.clone(),
        });
        self.hypervisor()
            .create_pool(&PoolDefinition {
                name: spec.pool_name.clone(),
                path: path.clone(),
            })
            .await?;
        record.storage_pool = Some(StoragePoolInfo {
            name: spec.pool_name.clone(),
            path: path.to_string_lossy().into_owned(),
        });
        Ok(())
    }

    async fn ensure_network(&self, state: &mut GlobalState, spec: &ClusterSpec, stack: &mut RollbackStack) -> ManagerResult<()> {
        let record = cluster_record(state, &spec.name)?;
        let network = &spec.network;
        if record.networks.iter().any(|n| n.name == network.name) {
            debug!(cluster = %spec.name, network = %network.name, "Network already recorded");
            return Ok(());
        }
        stack.push(RollbackStep::Network {
            name: network.name.clone(),
        });
        self.hypervisor()
            .create_network(&NetworkDefinition {
                name: network.name.clone(),
                bridge: network.bridge.clone(),
                subnet: network.subnet.clone(),
            })
            .await?;
        record.networks.push(NetworkInfo {
            name: network.name.clone(),
            subnet: network.subnet.clone(),
            bridge: network.bridge.clone(),
        });
        info!(cluster = %spec.name, network = %network.name, subnet = %network.subnet, "Network created");
        Ok(())
    }

    async fn bring_up_vms<'a>(
        &self,
        state: &mut GlobalState,
        spec: &'a ClusterSpec,
        vms: Vec<&'a VmSpec>,
        stack: &mut RollbackStack,
    ) -> ManagerResult<()> {
        let mut plans = Vec::with_capacity(vms.len());
        for vm in vms {
            if vm.auto_start {
                self.lifecycle.reserve_devices(state, &spec.name, vm)?;
            }
            plans.push(self.plan(state, spec, vm, vm.auto_start));
        }

        let reports: Vec<BootReport<'a>> = stream::iter(plans)
            .map(|plan| self.boot_one(spec, plan))
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        let mut first_error = None;
        for report in reports {
            let name = report.vm.name.clone();
            if let Some((pool, volume)) = &report.new_volume {
                stack.push(RollbackStep::Volume {
                    pool: pool.clone(),
                    name: volume.clone(),
                });
            }
            if let Some(volume) = &report.created_volume {
                cluster_record(state, &spec.name)?.volumes.push(volume.clone());
            }
            // an unobserved domain is left alone: it may predate this attempt
            match report.prior {
                Some(VmState::Undefined) => stack.push(RollbackStep::Vm { name: name.clone() }),
                Some(prior) if !prior.is_running() => stack.push(RollbackStep::StopVm { name: name.clone() }),
                _ => {}
            }

            match report.result {
                Ok(status) => {
                    let volumes = report.volume_path.into_iter().collect();
                    self.lifecycle.record(state, &spec.name, report.vm, volumes, &status)?;
                }
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(err) => warn!(cluster = %spec.name, vm = %name, error = %err, "Additional VM failure"),
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn plan<'a>(&self, state: &GlobalState, spec: &ClusterSpec, vm: &'a VmSpec, boot: bool) -> BootPlan<'a> {
        let volume_name = vm.volume_name();
        let volume_path = state.cluster(&spec.name).and_then(|record| {
            record
                .volumes
                .iter()
                .find(|v| v.name == volume_name && v.pool == spec.pool_name)
                .map(|v| v.path.clone())
        });
        BootPlan { vm, volume_path, boot }
    }

    /// Hypervisor half of bringing one VM up: volume, define, boot.
    async fn boot_one<'a>(&self, spec: &ClusterSpec, plan: BootPlan<'a>) -> BootReport<'a> {
        let vm = plan.vm;
        let mut report = BootReport {
            vm,
            prior: None,
            volume_path: plan.volume_path,
            new_volume: None,
            created_volume: None,
            result: Ok(DomainStatus::undefined()),
        };

        match self.hypervisor().status(&vm.name).await {
            Ok(status) => report.prior = Some(status.state),
            Err(err) => {
                report.result = Err(err);
                return report;
            }
        }

        let volume_path = match report.volume_path.clone() {
            Some(path) => path,
            None => {
                let volume = VolumeDefinition {
                    pool: spec.pool_name.clone(),
                    name: vm.volume_name(),
                    capacity_gb: vm.disk_gb,
                    backing_image: spec.base_image.clone(),
                };
                report.new_volume = Some((volume.pool.clone(), volume.name.clone()));
                match self.hypervisor().create_volume(&volume).await {
                    Ok(path) => {
                        report.created_volume = Some(VolumeInfo {
                            name: volume.name,
                            path: path.clone(),
                            size_gb: vm.disk_gb,
                            pool: volume.pool,
                        });
                        report.volume_path = Some(path.clone());
                        path
                    }
                    Err(err) => {
                        report.result = Err(err);
                        return report;
                    }
                }
            }
        };

        let domain = DomainDefinition::for_vm(vm, &spec.network.name, volume_path);
        report.result = if plan.boot {
            self.lifecycle.boot(&domain).await
        } else {
            self.lifecycle.define_only(&domain).await
        };
        report
    }

    /// Put whatever rollback could not remove back on the record so a later
    /// stop or destroy can find it.
    async fn remember_leftovers(
        &self,
        state: &mut GlobalState,
        spec: &ClusterSpec,
        attempt: ClusterState,
        leftovers: &[RollbackStep],
    ) {
        let record = state
            .clusters
            .entry(spec.name.clone())
            .or_insert_with(|| ClusterState::new(&spec.name, spec.cluster_type));
        for step in leftovers {
            match step {
                RollbackStep::Pool { .. } => record.storage_pool = attempt.storage_pool.clone(),
                RollbackStep::Network { name } => {
                    if let Some(network) = attempt.networks.iter().find(|n| &n.name == name) {
                        if !record.networks.iter().any(|n| &n.name == name) {
                            record.networks.push(network.clone());
                        }
                    }
                }
                RollbackStep::Volume { name, pool } => {
                    if let Some(volume) = attempt.volumes.iter().find(|v| &v.name == name && &v.pool == pool) {
                        if !record.volumes.iter().any(|v| &v.name == name && &v.pool == pool) {
                            record.volumes.push(volume.clone());
                        }
                    }
                }
                RollbackStep::Vm { .. } | RollbackStep::StopVm { .. } => {}
            }
        }

        // VMs need a live look: the failed step may have left them anywhere.
        for step in leftovers {
            let (RollbackStep::Vm { name } | RollbackStep::StopVm { name }) = step else {
                continue;
            };
            let Some(vm) = spec.vm(name) else { continue };
            let status = self
                .hypervisor()
                .status(name)
                .await
                .unwrap_or_else(|_| DomainStatus::undefined());
            if status.state == VmState::Undefined {
                continue;
            }
            if status.state.is_active() {
                if let Err(err) = self.lifecycle.reserve_devices(state, &spec.name, vm) {
                    warn!(vm = %name, error = %err, "Leftover VM holds devices that are owned elsewhere");
                }
            }
            let volumes = attempt.vm(name).map(|info| info.volumes.clone()).unwrap_or_default();
            if let Err(err) = self.lifecycle.record(state, &spec.name, vm, volumes, &status) {
                warn!(vm = %name, error = %err, "Could not record leftover VM");
            }
        }

        if let Some(record) = state.cluster_mut(&spec.name) {
            record.reconcile_pending = true;
            record.refresh_status();
            warn!(cluster = %spec.name, "Cluster needs reconciliation; run stop or destroy");
        }
    }

    // ---- single VM ----------------------------------------------------

    /// Start one VM of an already deployed cluster, including VMs declared
    /// with `auto_start: false`.
    pub async fn start_vm_in(&self, state: &mut GlobalState, spec: &ClusterSpec, vm_name: &str) -> ManagerResult<VmInfo> {
        let vm = spec.vm(vm_name).ok_or_else(|| VmError::NotFound {
            cluster: spec.name.clone(),
            vm: vm_name.to_string(),
        })?;
        if state.cluster(&spec.name).is_none() {
            return Err(ManagerError::ClusterNotFound(spec.name.clone()));
        }

        let taken = self.lifecycle.reserve_devices(state, &spec.name, vm)?;
        let plan = self.plan(state, spec, vm, true);
        let report = self.boot_one(spec, plan).await;

        if let Some(volume) = report.created_volume {
            cluster_record(state, &spec.name)?.volumes.push(volume);
        }
        match report.result {
            Ok(status) => {
                let volumes = report.volume_path.into_iter().collect();
                self.lifecycle.record(state, &spec.name, vm, volumes, &status)
            }
            Err(err) => {
                self.lifecycle.release_reserved(state, &taken);
                Err(err)
            }
        }
    }

    pub async fn restart_vm_in(&self, state: &mut GlobalState, spec: &ClusterSpec, vm_name: &str) -> ManagerResult<VmInfo> {
        let vm = spec.vm(vm_name).ok_or_else(|| VmError::NotFound {
            cluster: spec.name.clone(),
            vm: vm_name.to_string(),
        })?;
        let disk = state
            .cluster(&spec.name)
            .ok_or_else(|| ManagerError::ClusterNotFound(spec.name.clone()))?
            .vm(vm_name)
            .and_then(|info| info.volumes.first().cloned())
            .ok_or_else(|| VmError::NotFound {
                cluster: spec.name.clone(),
                vm: vm_name.to_string(),
            })?;
        let domain = DomainDefinition::for_vm(vm, &spec.network.name, disk);
        self.lifecycle.restart(state, &spec.name, vm, &domain).await
    }

    // ---- stop ---------------------------------------------------------

    /// Stop every recorded VM; failures are collected, not fatal.
    pub async fn stop_in(&self, state: &mut GlobalState, spec: &ClusterSpec) -> ManagerResult<()> {
        let names = recorded_vms(state, &spec.name)?;
        info!(cluster = %spec.name, vms = names.len(), "Stopping cluster");

        let outcomes: Vec<(String, ManagerResult<StopOutcome>)> = stream::iter(names)
            .map(|name| async move {
                let result = self.lifecycle.shutdown(&name).await;
                (name, result)
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        let mut failures = FailureLog::new(format!("stop cluster {}", spec.name));
        for (name, result) in outcomes {
            if failures.record(format!("vm {name}"), result).is_some() {
                self.lifecycle.record_stopped(state, &spec.name, &name)?;
            }
        }

        let record = cluster_record(state, &spec.name)?;
        record.reconcile_pending = !failures.is_empty();
        record.refresh_status();
        failures.into_result()
    }

    // ---- destroy ------------------------------------------------------

    /// Tear down VMs, volumes, network and pool, then forget the cluster.
    ///
    /// Works from the record plus the names the configuration implies, so resources
    /// left by an interrupted run are found too. Whatever cannot be removed
    /// stays on the record.
    pub async fn destroy_in(&self, state: &mut GlobalState, spec: &ClusterSpec) -> ManagerResult<()> {
        let record = state
            .cluster(&spec.name)
            .cloned()
            .unwrap_or_else(|| ClusterState::new(&spec.name, spec.cluster_type));

        let mut vm_names: Vec<String> = record.vms.iter().map(|vm| vm.name.clone()).collect();
        for vm in &spec.vms {
            if !vm_names.contains(&vm.name) {
                vm_names.push(vm.name.clone());
            }
        }
        let mut volumes: Vec<(String, String)> =
            record.volumes.iter().map(|v| (v.pool.clone(), v.name.clone())).collect();
        for vm in &spec.vms {
            let key = (spec.pool_name.clone(), vm.volume_name());
            if !volumes.contains(&key) {
                volumes.push(key);
            }
        }
        let mut networks: Vec<String> = record.networks.iter().map(|n| n.name.clone()).collect();
        if !networks.contains(&spec.network.name) {
            networks.push(spec.network.name.clone());
        }
        let pool = record
            .storage_pool
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| spec.pool_name.clone());

        info!(cluster = %spec.name, vms = vm_names.len(), "Destroying cluster");
        let mut failures = FailureLog::new(format!("destroy cluster {}", spec.name));

        let torn_down: Vec<(String, ManagerResult<()>)> = stream::iter(vm_names)
            .map(|name| async move {
                let result = self.lifecycle.teardown(&name).await;
                (name, result)
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;
        let mut removed_vms = Vec::new();
        for (name, result) in torn_down {
            if failures.record(format!("vm {name}"), result).is_some() {
                removed_vms.push(name);
            }
        }

        let mut removed_volumes = Vec::new();
        for (pool, name) in volumes {
            let result = self.hypervisor().delete_volume(&pool, &name).await;
            if failures.record(format!("volume {name}"), result).is_some() {
                removed_volumes.push((pool, name));
            }
        }

        let mut removed_networks = Vec::new();
        for name in networks {
            let result = self.hypervisor().destroy_network(&name).await;
            if failures.record(format!("network {name}"), result).is_some() {
                removed_networks.push(name);
            }
        }

        let pool_removed = failures
            .record(format!("storage pool {pool}"), self.hypervisor().destroy_pool(&pool).await)
            .is_some();

        if failures.is_empty() {
            state.remove_cluster(&spec.name);
            info!(cluster = %spec.name, "Cluster destroyed");
            return Ok(());
        }

        if let Some(record) = state.cluster_mut(&spec.name) {
            for name in &removed_vms {
                record.remove_vm(name);
            }
            record
                .volumes
                .retain(|v| !removed_volumes.contains(&(v.pool.clone(), v.name.clone())));
            record.networks.retain(|n| !removed_networks.contains(&n.name));
            if pool_removed {
                record.storage_pool = None;
            }
            record.reconcile_pending = true;
            record.refresh_status();
        }
        let mut allocator = GpuAllocator::new(state);
        for name in &removed_vms {
            allocator.release_owned_by(&spec.name, name);
        }
        failures.into_result()
    }

    // ---- status -------------------------------------------------------

    /// Refresh every recorded VM from the hypervisor.
    pub async fn status_in(&self, state: &mut GlobalState, spec: &ClusterSpec) -> ManagerResult<ClusterState> {
        let names = recorded_vms(state, &spec.name)?;
        let observed: Vec<(String, ManagerResult<DomainStatus>)> = stream::iter(names)
            .map(|name| async move {
                let result = self.hypervisor().status(&name).await;
                (name, result)
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        for (name, result) in observed {
            match result {
                Ok(status) => {
                    apply_observation(state, &spec.name, &name, &status)?;
                }
                Err(err) => warn!(cluster = %spec.name, vm = %name, error = %err, "Could not query VM"),
            }
        }

        let record = cluster_record(state, &spec.name)?;
        record.refresh_status();
        Ok(record.clone())
    }
}

/// Reject the start before anything is created if another cluster (or
/// another VM) holds a device this cluster will claim.
fn preflight(state: &GlobalState, spec: &ClusterSpec) -> ManagerResult<()> {
    for vm in spec.vms.iter().filter(|vm| vm.auto_start) {
        for pci in vm.pci_addresses() {
            if let Some(conflict) = find_conflict(state, &pci, &spec.name, Some(&vm.name)) {
                warn!(cluster = %spec.name, vm = %vm.name, device = %pci, owner = %conflict.owner_cluster, "Device conflict");
                return Err(GpuError::ResourceConflict(conflict).into());
            }
        }
    }
    Ok(())
}

fn destroy_prompt(spec: &ClusterSpec) -> String {
    format!(
        "Destroy cluster '{}' ({} VMs, network {}, pool {})? This deletes all VM disks.",
        spec.name,
        spec.vms.len(),
        spec.network.name,
        spec.pool_name
    )
}

fn cluster_record<'a>(state: &'a mut GlobalState, name: &str) -> ManagerResult<&'a mut ClusterState> {
    state
        .cluster_mut(name)
        .ok_or_else(|| ManagerError::ClusterNotFound(name.to_string()))
}

fn recorded_vms(state: &GlobalState, cluster: &str) -> ManagerResult<Vec<String>> {
    state
        .cluster(cluster)
        .map(|record| record.vms.iter().map(|vm| vm.name.clone()).collect())
        .ok_or_else(|| ManagerError::ClusterNotFound(cluster.to_string()))
}

/// Persist what the operation left in memory, success or not. A failed save
/// after a failed operation is logged so the original error surfaces.
pub(crate) async fn finish<T>(tx: crate::state::Transaction, result: ManagerResult<T>) -> ManagerResult<T> {
    match result {
        Ok(value) => {
            tx.commit_async().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(save) = tx.commit_async().await {
                error!(error = %save, "Could not save state after failed operation");
            }
            Err(err)
        }
    }
}
