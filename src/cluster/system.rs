//! Both clusters at once.
//!
//! Start order is HPC then Cloud; stop order is the reverse, because Cloud
//! workloads read artifacts the HPC cluster produces. A system start is all
//! or nothing: if Cloud fails, HPC goes back to where it was.
//!
//! A shared GPU can also be handed from a VM of one cluster to a VM of the
//! other without stopping the source cluster (`transfer_gpu`).

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use super::{finish, ClusterManager, Confirm};
use crate::config::{ClusterSpec, SystemConfig, VmSpec};
use crate::core::{DomainDefinition, VmEvent, VmState};
use crate::errors::{FailureLog, GpuError, ManagerError, ManagerResult, ResourceFailure, VmError};
use crate::gpu::{Claimant, GpuAllocator};
use crate::state::{ClusterState, ClusterStatus, GlobalState, GpuOwnership};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    Running,
    Stopped,
    Mixed,
    Error,
}

impl SystemState {
    pub fn aggregate(statuses: &[ClusterStatus]) -> Self {
        if statuses.contains(&ClusterStatus::Error) {
            SystemState::Error
        } else if !statuses.is_empty() && statuses.iter().all(|s| *s == ClusterStatus::Running) {
            SystemState::Running
        } else if statuses.iter().all(|s| *s == ClusterStatus::Stopped) {
            SystemState::Stopped
        } else {
            SystemState::Mixed
        }
    }
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SystemState::Running => "running",
            SystemState::Stopped => "stopped",
            SystemState::Mixed => "mixed",
            SystemState::Error => "error",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub overall: SystemState,
    pub clusters: Vec<ClusterState>,
    /// Configured clusters with no record yet.
    pub not_deployed: Vec<String>,
    pub gpu_allocations: BTreeMap<String, GpuOwnership>,
}

pub struct SystemManager {
    clusters: ClusterManager,
}

impl SystemManager {
    pub fn new(clusters: ClusterManager) -> Self {
        Self { clusters }
    }

    pub fn clusters(&self) -> &ClusterManager {
        &self.clusters
    }

    pub async fn start(&self, config: &SystemConfig) -> ManagerResult<()> {
        let mut tx = self.clusters.store().begin_async().await?;
        let result = self.start_in(&mut tx, config).await;
        finish(tx, result).await
    }

    pub async fn stop(&self, config: &SystemConfig) -> ManagerResult<()> {
        let mut tx = self.clusters.store().begin_async().await?;
        let result = self.stop_in(&mut tx, config).await;
        finish(tx, result).await
    }

    pub async fn destroy(&self, config: &SystemConfig, force: bool, confirm: &dyn Confirm) -> ManagerResult<()> {
        let names: Vec<&str> = config.clusters().map(|c| c.name.as_str()).collect();
        let prompt = format!("Destroy clusters {} and every VM disk they own?", names.join(", "));
        if !force && !confirm.confirm(&prompt) {
            return Err(ManagerError::Cancelled("system destroy".to_string()));
        }
        let mut tx = self.clusters.store().begin_async().await?;
        let result = self.destroy_in(&mut tx, config).await;
        finish(tx, result).await
    }

    pub async fn status(&self, config: &SystemConfig) -> ManagerResult<SystemStatus> {
        let mut tx = self.clusters.store().begin_async().await?;
        let result = self.status_in(&mut tx, config).await;
        finish(tx, result).await
    }

    pub async fn transfer_gpu(&self, config: &SystemConfig, pci_address: &str, from_vm: &str, to_vm: &str) -> ManagerResult<()> {
        let mut tx = self.clusters.store().begin_async().await?;
        let result = self.transfer_gpu_in(&mut tx, config, pci_address, from_vm, to_vm).await;
        finish(tx, result).await
    }

    /// HPC first, and Cloud only once a live look confirms every HPC VM
    /// that was meant to boot is RUNNING.
    pub async fn start_in(&self, state: &mut GlobalState, config: &SystemConfig) -> ManagerResult<()> {
        let hpc_before = config
            .hpc
            .as_ref()
            .and_then(|hpc| state.cluster(&hpc.name))
            .map(|record| record.status);

        if let Some(hpc) = &config.hpc {
            self.clusters.start_in(state, hpc).await?;
            let record = self.clusters.status_in(state, hpc).await?;
            let idle = not_running(&record);
            if !idle.is_empty() {
                let err = ManagerError::NotReady {
                    cluster: hpc.name.clone(),
                    vms: idle,
                };
                error!(cluster = %hpc.name, error = %err, "HPC cluster is not running, Cloud left untouched");
                return Err(self.undo_hpc(state, hpc, hpc_before, err).await);
            }
            info!(cluster = %hpc.name, status = %record.status, "HPC cluster up");
        }
        let Some(cloud) = &config.cloud else {
            return Ok(());
        };

        let err = match self.clusters.start_in(state, cloud).await {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };
        let Some(hpc) = &config.hpc else {
            return Err(err);
        };

        error!(cluster = %cloud.name, error = %err, "Cloud start failed, rolling back HPC cluster");
        Err(self.undo_hpc(state, hpc, hpc_before, err).await)
    }

    /// Put HPC back where it was before this system start.
    async fn undo_hpc(
        &self,
        state: &mut GlobalState,
        hpc: &ClusterSpec,
        before: Option<ClusterStatus>,
        err: ManagerError,
    ) -> ManagerError {
        let undo = match before {
            None => self.clusters.destroy_in(state, hpc).await,
            Some(ClusterStatus::Running) => {
                debug!(cluster = %hpc.name, "HPC cluster was already running, leaving it");
                return err;
            }
            Some(_) => self.clusters.stop_in(state, hpc).await,
        };
        cross_cluster_rollback(err, hpc, undo)
    }

    /// Cloud first. HPC is only touched once every Cloud VM is off.
    pub async fn stop_in(&self, state: &mut GlobalState, config: &SystemConfig) -> ManagerResult<()> {
        for spec in config.cloud.iter().chain(config.hpc.iter()) {
            if state.cluster(&spec.name).is_none() {
                debug!(cluster = %spec.name, "Not deployed, nothing to stop");
                continue;
            }
            self.clusters.stop_in(state, spec).await?;
        }
        Ok(())
    }

    pub async fn destroy_in(&self, state: &mut GlobalState, config: &SystemConfig) -> ManagerResult<()> {
        let mut failures = FailureLog::new("destroy system");
        for spec in config.cloud.iter().chain(config.hpc.iter()) {
            let result = self.clusters.destroy_in(state, spec).await;
            failures.record(format!("cluster {}", spec.name), result);
        }
        failures.into_result()
    }

    pub async fn status_in(&self, state: &mut GlobalState, config: &SystemConfig) -> ManagerResult<SystemStatus> {
        let mut clusters = Vec::new();
        let mut not_deployed = Vec::new();
        for spec in config.clusters() {
            if state.cluster(&spec.name).is_none() {
                not_deployed.push(spec.name.clone());
                continue;
            }
            clusters.push(self.clusters.status_in(state, spec).await?);
        }
        let statuses: Vec<ClusterStatus> = clusters.iter().map(|c| c.status).collect();
        Ok(SystemStatus {
            overall: SystemState::aggregate(&statuses),
            clusters,
            not_deployed,
            gpu_allocations: state.gpu_allocations.clone(),
        })
    }
}

impl SystemManager {
    /// Hand a passthrough device from one VM to another, across clusters.
    ///
    /// The source keeps running without the card (live detach). The target
    /// must be defined and off; it declares the card in its definition, so
    /// booting it picks the card up. Ownership moves in the same transaction.
    /// If the target does not come up, ownership and the live device go back
    /// to the source.
    pub async fn transfer_gpu_in(
        &self,
        state: &mut GlobalState,
        config: &SystemConfig,
        pci_address: &str,
        from_vm: &str,
        to_vm: &str,
    ) -> ManagerResult<()> {
        let (from_spec, _) = locate(config, from_vm)?;
        let (to_spec, target) = locate(config, to_vm)?;
        if !target.pci_addresses().iter().any(|pci| pci == pci_address) {
            return Err(GpuError::NotDeclared {
                pci_address: pci_address.to_string(),
                vm: to_vm.to_string(),
            }
            .into());
        }
        let from = Claimant::new(&from_spec.name, from_vm);
        let to = Claimant::new(&to_spec.name, to_vm);
        if !GpuAllocator::new(state).is_held_by(pci_address, &from) {
            return Err(GpuError::NotOwned {
                pci_address: pci_address.to_string(),
                cluster: from.cluster,
                vm: from.vm,
            }
            .into());
        }
        let disk = state
            .cluster(&to_spec.name)
            .and_then(|record| record.vm(to_vm))
            .and_then(|info| info.volumes.first().cloned())
            .ok_or_else(|| VmError::NotFound {
                cluster: to_spec.name.clone(),
                vm: to_vm.to_string(),
            })?;

        let lifecycle = self.clusters.lifecycle();
        let hypervisor = lifecycle.hypervisor();
        let target_state = hypervisor.status(to_vm).await?.state;
        if target_state != VmState::Shutoff {
            return Err(VmError::InvalidTransition {
                vm: to_vm.to_string(),
                from: target_state,
                event: VmEvent::Start,
            }
            .into());
        }

        let source_live = hypervisor.status(from_vm).await?.state.is_active();
        if source_live {
            hypervisor.detach_device(from_vm, pci_address).await?;
        }
        GpuAllocator::new(state).transfer(pci_address, &from, &to)?;

        let domain = DomainDefinition::for_vm(target, &to_spec.network.name, disk);
        match lifecycle.boot(&domain).await {
            Ok(status) => {
                lifecycle.record(state, &to_spec.name, target, Vec::new(), &status)?;
                info!(pci = %pci_address, from = %from_vm, to = %to_vm, "GPU handed over");
                Ok(())
            }
            Err(err) => {
                error!(pci = %pci_address, to = %to_vm, error = %err, "Target did not boot, giving the GPU back");
                GpuAllocator::new(state).transfer(pci_address, &to, &from)?;
                if source_live {
                    if let Err(back) = hypervisor.attach_device(from_vm, pci_address).await {
                        warn!(pci = %pci_address, vm = %from_vm, error = %back, "Could not re-attach GPU to its previous VM");
                    }
                }
                Err(err)
            }
        }
    }
}

/// VMs that were meant to boot but are not RUNNING.
fn not_running(record: &ClusterState) -> Vec<String> {
    record
        .vms
        .iter()
        .filter(|vm| vm.auto_start && !vm.state.is_running())
        .map(|vm| format!("{} ({})", vm.name, vm.state))
        .collect()
}

fn locate<'a>(config: &'a SystemConfig, vm: &str) -> ManagerResult<(&'a ClusterSpec, &'a VmSpec)> {
    config
        .clusters()
        .find_map(|spec| spec.vm(vm).map(|found| (spec, found)))
        .ok_or_else(|| {
            let names: Vec<&str> = config.clusters().map(|c| c.name.as_str()).collect();
            VmError::NotFound {
                cluster: names.join(" or "),
                vm: vm.to_string(),
            }
            .into()
        })
}

fn cross_cluster_rollback(original: ManagerError, hpc: &ClusterSpec, undo: ManagerResult<()>) -> ManagerError {
    let (rolled_back, failures) = match undo {
        Ok(()) => (vec![format!("cluster {}", hpc.name)], Vec::new()),
        Err(ManagerError::Aggregate { failures, .. }) => (Vec::new(), failures),
        Err(other) => (
            Vec::new(),
            vec![ResourceFailure {
                resource: format!("cluster {}", hpc.name),
                error: other,
            }],
        ),
    };
    ManagerError::Rollback {
        original: Box::new(original),
        rolled_back,
        failures,
    }
}
