/*
* VM Lifecycle
* ------------
* @module: core/lifecycle
*
* Drives one VM through the state machine in `core::vm` on top of a
* `Hypervisor`. Each operation comes in two halves:
*
*   - a hypervisor half (`boot`, `shutdown`, `teardown`) that never touches
*     the state, so the cluster layer can run many of them concurrently
*   - a bookkeeping half (`reserve_devices`, `record`, `record_stopped`)
*     that mutates the in-memory `GlobalState` and is called sequentially
*
* `start` / `stop` / `destroy` glue both halves together for single-VM use.
*
* Hypervisor failures are surfaced as-is. The only retry is the shutdown
* escalation: graceful request, poll until SHUTOFF, force after the timeout.
*/

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::hypervisor::{DomainDefinition, DomainStatus, Hypervisor, StopMode};
use super::vm::{self, VmEvent, VmState};
use crate::config::{Settings, VmSpec};
use crate::errors::{FailureLog, GpuError, HypervisorError, ManagerError, ManagerResult, VmError};
use crate::gpu::{find_conflict, Claimant, GpuAllocator, HostEnvironment};
use crate::state::{ClusterState, GlobalState, VmInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl From<&Settings> for ShutdownPolicy {
    fn from(settings: &Settings) -> Self {
        Self {
            timeout: settings.shutdown_timeout(),
            poll_interval: settings.poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    Graceful,
    Forced,
}

pub struct VmLifecycle {
    hypervisor: Arc<dyn Hypervisor>,
    policy: ShutdownPolicy,
    host: HostEnvironment,
}

impl VmLifecycle {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, policy: ShutdownPolicy) -> Self {
        Self {
            hypervisor,
            policy,
            host: HostEnvironment::system(),
        }
    }

    /// Host used to look up driver and IOMMU group for ownership records.
    pub fn with_host(mut self, host: HostEnvironment) -> Self {
        self.host = host;
        self
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn policy(&self) -> ShutdownPolicy {
        self.policy
    }

    // ---- start ----------------------------------------------------------

    /// Take ownership of every device `vm` declares, or of none of them.
    ///
    /// Returns only the addresses this call newly took. Devices the VM
    /// already held are re-acquired but not listed, so handing the result to
    /// [`release_reserved`](Self::release_reserved) never frees them.
    pub fn reserve_devices(&self, state: &mut GlobalState, cluster: &str, vm: &VmSpec) -> ManagerResult<Vec<String>> {
        let devices = vm.pci_addresses();
        for pci in &devices {
            if let Some(conflict) = find_conflict(state, pci, cluster, Some(&vm.name)) {
                return Err(GpuError::ResourceConflict(conflict).into());
            }
        }
        let who = Claimant::new(cluster, &vm.name);
        let mut allocator = GpuAllocator::new(state);
        let mut taken = Vec::new();
        for pci in devices {
            let held = allocator.owner(&pci).is_some();
            allocator.acquire(&pci, &who, self.host.binding(&pci))?;
            if !held {
                taken.push(pci);
            }
        }
        Ok(taken)
    }

    /// Undo a `reserve_devices` whose boot did not happen.
    pub fn release_reserved(&self, state: &mut GlobalState, taken: &[String]) {
        let mut allocator = GpuAllocator::new(state);
        for pci in taken {
            allocator.release(pci);
        }
    }

    /// Define the domain if the hypervisor does not know it, then bring it
    /// to RUNNING. Already running is fine.
    pub async fn boot(&self, domain: &DomainDefinition) -> ManagerResult<DomainStatus> {
        let name = domain.name.as_str();
        let current = self.hypervisor.status(name).await?.state;
        match current {
            VmState::Undefined => {
                vm::apply(name, current, VmEvent::Define)?;
                self.hypervisor.define(domain).await?;
                self.hypervisor.start(name).await?;
            }
            VmState::Shutoff => {
                vm::apply(name, current, VmEvent::Start)?;
                self.hypervisor.start(name).await?;
            }
            VmState::Paused | VmState::Pmsuspended => {
                vm::apply(name, current, VmEvent::Resume)?;
                self.hypervisor.resume(name).await?;
            }
            VmState::Crashed => {
                vm::apply(name, current, VmEvent::Recover)?;
                self.hypervisor.stop(name, StopMode::Force).await?;
                self.hypervisor.start(name).await?;
            }
            VmState::Running => debug!(vm = %name, "Already running"),
            VmState::Dying => {
                self.settle(name).await?;
                vm::apply(name, VmState::Shutoff, VmEvent::Start)?;
                self.hypervisor.start(name).await?;
            }
        }

        let status = self.hypervisor.status(name).await?;
        if !status.state.is_running() {
            return Err(HypervisorError::new("start", name, format!("domain reports {}", status.state)).into());
        }
        info!(vm = %name, ip = ?status.ip_address, "VM running");
        Ok(status)
    }

    /// Define without booting (`auto_start = false`). Takes no ownership.
    pub async fn define_only(&self, domain: &DomainDefinition) -> ManagerResult<DomainStatus> {
        let name = domain.name.as_str();
        let status = self.hypervisor.status(name).await?;
        if status.state != VmState::Undefined {
            return Ok(status);
        }
        let state = vm::apply(name, status.state, VmEvent::DefineInactive)?;
        self.hypervisor.define(domain).await?;
        info!(vm = %name, "VM defined, not started (auto_start = false)");
        Ok(DomainStatus {
            state,
            ip_address: None,
        })
    }

    /// Write the VM record from what the hypervisor reported.
    pub fn record(
        &self,
        state: &mut GlobalState,
        cluster: &str,
        vm: &VmSpec,
        volumes: Vec<String>,
        status: &DomainStatus,
    ) -> ManagerResult<VmInfo> {
        let cluster_state = cluster_mut(state, cluster)?;
        let now = Utc::now();
        let previous = cluster_state.vm(&vm.name).cloned();
        let info = VmInfo {
            name: vm.name.clone(),
            role: vm.role,
            cpu_cores: vm.cpu_cores,
            memory_gb: vm.memory_gb,
            state: status.state,
            ip_address: status.ip_address.clone().or_else(|| vm.ip_address.clone()),
            gpu_count: vm.gpu_count(),
            pci_addresses: vm.pci_addresses(),
            volumes: if volumes.is_empty() {
                previous.as_ref().map(|p| p.volumes.clone()).unwrap_or_default()
            } else {
                volumes
            },
            created_at: previous.map(|p| p.created_at).unwrap_or(now),
            last_seen: Some(now),
            auto_start: vm.auto_start,
        };
        cluster_state.upsert_vm(info.clone());
        Ok(info)
    }

    /// Reserve, boot, record. Ownership taken by this call is handed back if
    /// the boot fails; devices the VM held before stay with it.
    pub async fn start(
        &self,
        state: &mut GlobalState,
        cluster: &str,
        vm: &VmSpec,
        domain: &DomainDefinition,
    ) -> ManagerResult<VmInfo> {
        cluster_mut(state, cluster)?;
        let taken = self.reserve_devices(state, cluster, vm)?;
        match self.boot(domain).await {
            Ok(status) => {
                let disk = domain.disk_path.to_string_lossy().into_owned();
                self.record(state, cluster, vm, vec![disk], &status)
            }
            Err(err) => {
                self.release_reserved(state, &taken);
                Err(err)
            }
        }
    }

    // ---- stop -----------------------------------------------------------

    /// Graceful shutdown, poll, and force-stop once the policy timeout runs
    /// out. A VM that is already off is left alone.
    pub async fn shutdown(&self, name: &str) -> ManagerResult<StopOutcome> {
        let current = self.hypervisor.status(name).await?.state;
        if matches!(current, VmState::Shutoff | VmState::Undefined) {
            debug!(vm = %name, state = %current, "Already stopped");
            return Ok(StopOutcome::AlreadyStopped);
        }
        if current != VmState::Dying {
            vm::apply(name, current, VmEvent::Shutdown)?;
            self.hypervisor.stop(name, StopMode::Graceful).await?;
        }

        let outcome = self.settle(name).await?;
        if outcome == StopOutcome::Graceful {
            info!(vm = %name, "VM shut down");
        }
        Ok(outcome)
    }

    /// Let a DYING domain finish, forcing it off once the timeout runs out.
    async fn settle(&self, name: &str) -> ManagerResult<StopOutcome> {
        if self.wait_for_shutoff(name).await? {
            vm::apply(name, VmState::Dying, VmEvent::ShutdownComplete)?;
            return Ok(StopOutcome::Graceful);
        }

        vm::apply(name, VmState::Dying, VmEvent::Timeout)?;
        warn!(
            vm = %name,
            timeout_secs = self.policy.timeout.as_secs(),
            "Graceful shutdown timed out, forcing stop"
        );
        self.hypervisor.stop(name, StopMode::Force).await?;
        Ok(StopOutcome::Forced)
    }

    async fn wait_for_shutoff(&self, name: &str) -> ManagerResult<bool> {
        let deadline = Instant::now() + self.policy.timeout;
        loop {
            let state = self.hypervisor.status(name).await?.state;
            if matches!(state, VmState::Shutoff | VmState::Undefined) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.policy.poll_interval.min(deadline - now)).await;
        }
    }

    /// Mark the VM SHUTOFF and free every device it holds.
    pub fn record_stopped(&self, state: &mut GlobalState, cluster: &str, name: &str) -> ManagerResult<Vec<String>> {
        let cluster_state = cluster_mut(state, cluster)?;
        let info = vm_mut(cluster_state, name)?;
        info.state = VmState::Shutoff;
        info.ip_address = None;
        info.last_seen = Some(Utc::now());
        cluster_state.refresh_status();

        let freed = GpuAllocator::new(state).release_owned_by(cluster, name);
        if !freed.is_empty() {
            info!(vm = %name, devices = ?freed, "Released passthrough devices");
        }
        Ok(freed)
    }

    pub async fn stop(&self, state: &mut GlobalState, cluster: &str, name: &str) -> ManagerResult<StopOutcome> {
        vm_mut(cluster_mut(state, cluster)?, name)?;
        let outcome = self.shutdown(name).await?;
        self.record_stopped(state, cluster, name)?;
        Ok(outcome)
    }

    /// Shut down and boot again, keeping the VM's devices across the gap.
    ///
    /// If the boot fails the devices this call newly took are handed back;
    /// a VM left off by the failure is recorded SHUTOFF and frees the rest.
    pub async fn restart(
        &self,
        state: &mut GlobalState,
        cluster: &str,
        vm: &VmSpec,
        domain: &DomainDefinition,
    ) -> ManagerResult<VmInfo> {
        vm_mut(cluster_mut(state, cluster)?, &vm.name)?;
        let taken = self.reserve_devices(state, cluster, vm)?;
        let booted = match self.shutdown(&vm.name).await {
            Ok(outcome) => {
                debug!(vm = %vm.name, ?outcome, "Stopped for restart");
                self.boot(domain).await
            }
            Err(err) => Err(err),
        };
        match booted {
            Ok(status) => {
                info!(vm = %vm.name, "VM restarted");
                self.record(state, cluster, vm, Vec::new(), &status)
            }
            Err(err) => {
                self.release_reserved(state, &taken);
                let now_off = matches!(
                    self.hypervisor.status(&vm.name).await.map(|s| s.state),
                    Ok(VmState::Shutoff)
                );
                if now_off {
                    if let Err(record_err) = self.record_stopped(state, cluster, &vm.name) {
                        warn!(vm = %vm.name, error = %record_err, "Could not record VM as stopped");
                    }
                }
                Err(err)
            }
        }
    }

    // ---- destroy --------------------------------------------------------

    /// Stop if needed, then drop the domain definition. Unknown domains are
    /// treated as already gone.
    pub async fn teardown(&self, name: &str) -> ManagerResult<()> {
        let current = self.hypervisor.status(name).await?.state;
        match current {
            VmState::Undefined => {
                debug!(vm = %name, "Domain already gone");
                return Ok(());
            }
            VmState::Shutoff => {}
            VmState::Crashed => self.hypervisor.stop(name, StopMode::Force).await?,
            _ => {
                self.shutdown(name).await?;
            }
        }
        vm::apply(name, VmState::Shutoff, VmEvent::Destroy)?;
        self.hypervisor.destroy(name).await?;
        info!(vm = %name, "VM destroyed");
        Ok(())
    }

    /// Tear the VM down, delete its volumes, and forget it.
    ///
    /// Volumes that cannot be deleted stay on the cluster record so a later
    /// destroy can retry them.
    pub async fn destroy(&self, state: &mut GlobalState, cluster: &str, name: &str) -> ManagerResult<()> {
        let cluster_state = cluster_mut(state, cluster)?;
        let info = vm_mut(cluster_state, name)?.clone();
        let volumes: Vec<_> = cluster_state
            .volumes
            .iter()
            .filter(|vol| info.volumes.contains(&vol.path))
            .cloned()
            .collect();

        self.teardown(name).await?;

        let mut failures = FailureLog::new(format!("destroy VM {name}"));
        for volume in &volumes {
            failures.record(
                format!("volume {}", volume.name),
                self.hypervisor.delete_volume(&volume.pool, &volume.name).await,
            );
        }

        GpuAllocator::new(state).release_owned_by(cluster, name);
        let cluster_state = cluster_mut(state, cluster)?;
        cluster_state.remove_vm(name);
        for volume in volumes {
            if failures.failed(&format!("volume {}", volume.name)) {
                cluster_state.volumes.push(volume);
            }
        }
        failures.into_result()
    }

    // ---- the rest of the table -----------------------------------------

    pub async fn pause(&self, state: &mut GlobalState, cluster: &str, name: &str) -> ManagerResult<VmState> {
        vm_mut(cluster_mut(state, cluster)?, name)?;
        let current = self.hypervisor.status(name).await?.state;
        let next = vm::apply(name, current, VmEvent::Pause)?;
        self.hypervisor.pause(name).await?;
        self.set_state(state, cluster, name, next)
    }

    pub async fn resume(&self, state: &mut GlobalState, cluster: &str, name: &str) -> ManagerResult<VmState> {
        vm_mut(cluster_mut(state, cluster)?, name)?;
        let current = self.hypervisor.status(name).await?.state;
        let next = vm::apply(name, current, VmEvent::Resume)?;
        self.hypervisor.resume(name).await?;
        self.set_state(state, cluster, name, next)
    }

    /// Restart a CRASHED VM.
    pub async fn recover(&self, state: &mut GlobalState, cluster: &str, name: &str) -> ManagerResult<VmState> {
        vm_mut(cluster_mut(state, cluster)?, name)?;
        let current = self.hypervisor.status(name).await?.state;
        let next = vm::apply(name, current, VmEvent::Recover)?;
        self.hypervisor.stop(name, StopMode::Force).await?;
        self.hypervisor.start(name).await?;
        self.set_state(state, cluster, name, next)
    }

    /// Re-read live state and IP into the record.
    pub async fn refresh(&self, state: &mut GlobalState, cluster: &str, name: &str) -> ManagerResult<VmInfo> {
        vm_mut(cluster_mut(state, cluster)?, name)?;
        let status = self.hypervisor.status(name).await?;
        apply_observation(state, cluster, name, &status)
    }

    fn set_state(&self, state: &mut GlobalState, cluster: &str, name: &str, next: VmState) -> ManagerResult<VmState> {
        let cluster_state = cluster_mut(state, cluster)?;
        let info = vm_mut(cluster_state, name)?;
        info.state = next;
        info.last_seen = Some(Utc::now());
        cluster_state.refresh_status();
        Ok(next)
    }
}

/// Fold a hypervisor observation into the VM record.
pub fn apply_observation(
    state: &mut GlobalState,
    cluster: &str,
    name: &str,
    status: &DomainStatus,
) -> ManagerResult<VmInfo> {
    let cluster_state = cluster_mut(state, cluster)?;
    let info = vm_mut(cluster_state, name)?;
    if info.state != status.state {
        match vm::explain(info.state, status.state) {
            Some(VmEvent::Crash) => warn!(vm = %name, from = %info.state, "VM crashed; run recover-vm or destroy"),
            Some(event) => info!(vm = %name, from = %info.state, to = %status.state, %event, "VM state changed outside the manager"),
            None => warn!(vm = %name, from = %info.state, to = %status.state, "VM took a transition the lifecycle does not allow"),
        }
    }
    info.state = status.state;
    if status.ip_address.is_some() || !status.state.is_running() {
        info.ip_address = status.ip_address.clone();
    }
    info.last_seen = Some(Utc::now());
    let snapshot = info.clone();
    cluster_state.refresh_status();
    Ok(snapshot)
}

fn cluster_mut<'a>(state: &'a mut GlobalState, cluster: &str) -> ManagerResult<&'a mut ClusterState> {
    state
        .cluster_mut(cluster)
        .ok_or_else(|| ManagerError::ClusterNotFound(cluster.to_string()))
}

fn vm_mut<'a>(cluster: &'a mut ClusterState, name: &str) -> ManagerResult<&'a mut VmInfo> {
    let cluster_name = cluster.cluster_name.clone();
    cluster.vm_mut(name).ok_or_else(|| {
        VmError::NotFound {
            cluster: cluster_name,
            vm: name.to_string(),
        }
        .into()
    })
}
