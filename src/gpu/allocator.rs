use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use crate::errors::{GpuError, ManagerResult};
use crate::state::{GlobalState, GpuOwnership, StateStore};

/// Who is asking for a device (or, in a transfer, who hands it over).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimant {
    pub cluster: String,
    pub vm: String,
}

impl Claimant {
    pub fn new(cluster: impl Into<String>, vm: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            vm: vm.into(),
        }
    }
}

/// A device request that collides with an existing owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictInfo {
    pub pci_address: String,
    pub owner_cluster: String,
    pub owner_vm: Option<String>,
    pub requested_cluster: String,
    pub requested_vm: Option<String>,
}

impl fmt::Display for ConflictInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {} is owned by cluster '{}'", self.pci_address, self.owner_cluster)?;
        if let Some(vm) = &self.owner_vm {
            write!(f, " (VM '{vm}')")?;
        }
        write!(f, "; requested by cluster '{}'", self.requested_cluster)?;
        if let Some(vm) = &self.requested_vm {
            write!(f, " (VM '{vm}')")?;
        }
        write!(f, ". Stop '{}' first to free it", self.owner_cluster)
    }
}

/// Host facts recorded alongside ownership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceBinding {
    pub driver: Option<String>,
    pub iommu_group: Option<u32>,
}

/// Conflict check against a read-only snapshot.
///
/// A different cluster always conflicts. Within one cluster only two
/// different, named VMs conflict.
pub fn find_conflict(
    state: &GlobalState,
    pci_address: &str,
    cluster: &str,
    vm: Option<&str>,
) -> Option<ConflictInfo> {
    conflict_with(state.gpu_allocations.get(pci_address)?, pci_address, cluster, vm)
}

fn conflict_with(
    owner: &GpuOwnership,
    pci_address: &str,
    cluster: &str,
    vm: Option<&str>,
) -> Option<ConflictInfo> {
    let same_cluster = owner.cluster == cluster;
    let different_vm = matches!((owner.vm.as_deref(), vm), (Some(held), Some(wanted)) if held != wanted);
    if same_cluster && !different_vm {
        return None;
    }
    Some(ConflictInfo {
        pci_address: pci_address.to_string(),
        owner_cluster: owner.cluster.clone(),
        owner_vm: owner.vm.clone(),
        requested_cluster: cluster.to_string(),
        requested_vm: vm.map(str::to_string),
    })
}

/// Ownership table operations over an in-memory state.
///
/// Callers hold a `Transaction` around the state, so each method is one
/// atomic step as far as other invocations can observe.
pub struct GpuAllocator<'a> {
    allocations: &'a mut BTreeMap<String, GpuOwnership>,
}

impl<'a> GpuAllocator<'a> {
    pub fn new(state: &'a mut GlobalState) -> Self {
        Self {
            allocations: &mut state.gpu_allocations,
        }
    }

    pub fn owner(&self, pci_address: &str) -> Option<&GpuOwnership> {
        self.allocations.get(pci_address)
    }

    pub fn check_conflict(&self, pci_address: &str, cluster: &str, vm: Option<&str>) -> Option<ConflictInfo> {
        conflict_with(self.allocations.get(pci_address)?, pci_address, cluster, vm)
    }

    /// Record `who` as owner. Re-acquiring a device already held keeps the
    /// original acquisition time.
    pub fn acquire(&mut self, pci_address: &str, who: &Claimant, binding: DeviceBinding) -> ManagerResult<()> {
        if let Some(conflict) = self.check_conflict(pci_address, &who.cluster, Some(&who.vm)) {
            return Err(GpuError::ResourceConflict(conflict).into());
        }
        let acquired_at = self
            .allocations
            .get(pci_address)
            .map(|held| held.acquired_at)
            .unwrap_or_else(Utc::now);
        self.allocations.insert(
            pci_address.to_string(),
            GpuOwnership {
                cluster: who.cluster.clone(),
                vm: Some(who.vm.clone()),
                driver: binding.driver,
                iommu_group: binding.iommu_group,
                acquired_at,
            },
        );
        info!(pci = %pci_address, cluster = %who.cluster, vm = %who.vm, "GPU acquired");
        Ok(())
    }

    /// Clear ownership unconditionally.
    pub fn release(&mut self, pci_address: &str) -> Option<GpuOwnership> {
        let released = self.allocations.remove(pci_address);
        match &released {
            Some(owner) => info!(pci = %pci_address, cluster = %owner.cluster, "GPU released"),
            None => debug!(pci = %pci_address, "GPU already free"),
        }
        released
    }

    /// Release everything `vm` of `cluster` holds; returns the addresses freed.
    pub fn release_owned_by(&mut self, cluster: &str, vm: &str) -> Vec<String> {
        let freed: Vec<String> = self
            .allocations
            .iter()
            .filter(|(_, owner)| owner.cluster == cluster && owner.vm.as_deref() == Some(vm))
            .map(|(pci, _)| pci.clone())
            .collect();
        for pci in &freed {
            self.release(pci);
        }
        freed
    }

    pub fn is_held_by(&self, pci_address: &str, who: &Claimant) -> bool {
        self.allocations
            .get(pci_address)
            .map(|owner| owner.cluster == who.cluster && owner.vm.as_deref() == Some(who.vm.as_str()))
            .unwrap_or(false)
    }

    /// Move a device from one VM to another in a single step; the table
    /// never shows it unowned.
    pub fn transfer(&mut self, pci_address: &str, from: &Claimant, to: &Claimant) -> ManagerResult<()> {
        if !self.is_held_by(pci_address, from) {
            return Err(GpuError::NotOwned {
                pci_address: pci_address.to_string(),
                cluster: from.cluster.clone(),
                vm: from.vm.clone(),
            }
            .into());
        }
        if let Some(entry) = self.allocations.get_mut(pci_address) {
            entry.cluster = to.cluster.clone();
            entry.vm = Some(to.vm.clone());
            entry.acquired_at = Utc::now();
        }
        info!(
            pci = %pci_address,
            from = %format!("{}/{}", from.cluster, from.vm),
            to = %format!("{}/{}", to.cluster, to.vm),
            "GPU transferred"
        );
        Ok(())
    }
}

/// Store-backed allocator: every call is its own locked transaction.
#[derive(Debug, Clone)]
pub struct GpuRegistry {
    store: StateStore,
}

impl GpuRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub async fn check_conflict(&self, pci_address: &str, cluster: &str, vm: Option<&str>) -> ManagerResult<Option<ConflictInfo>> {
        let state = self.store.load_async().await?;
        Ok(find_conflict(&state, pci_address, cluster, vm))
    }

    pub async fn release(&self, pci_address: &str) -> ManagerResult<Option<GpuOwnership>> {
        let pci = pci_address.to_string();
        self.store
            .update(move |state| Ok(GpuAllocator::new(state).release(&pci)))
            .await
    }

    pub async fn allocations(&self) -> ManagerResult<BTreeMap<String, GpuOwnership>> {
        Ok(self.store.load_async().await?.gpu_allocations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GPU: &str = "0000:01:00.0";

    #[test]
    fn second_cluster_is_rejected_with_owner_identity() {
        let mut state = GlobalState::default();
        let mut alloc = GpuAllocator::new(&mut state);
        alloc.acquire(GPU, &Claimant::new("hpc", "hpc-compute-01"), DeviceBinding::default()).unwrap();

        let err = alloc
            .acquire(GPU, &Claimant::new("cloud", "cloud-gpu-worker-01"), DeviceBinding::default())
            .unwrap_err();
        assert!(err.is_resource_conflict());
        let text = err.to_string();
        assert!(text.contains("'hpc'"));
        assert!(text.contains("hpc-compute-01"));
    }

    #[test]
    fn same_owner_may_reacquire() {
        let mut state = GlobalState::default();
        let mut alloc = GpuAllocator::new(&mut state);
        let who = Claimant::new("hpc", "hpc-compute-01");
        alloc.acquire(GPU, &who, DeviceBinding::default()).unwrap();
        let first = alloc.owner(GPU).unwrap().acquired_at;

        alloc.acquire(GPU, &who, DeviceBinding { driver: Some("vfio-pci".into()), iommu_group: Some(3) }).unwrap();
        let owner = alloc.owner(GPU).unwrap();
        assert_eq!(owner.acquired_at, first);
        assert_eq!(owner.iommu_group, Some(3));
    }

    #[test]
    fn another_vm_in_same_cluster_conflicts() {
        let mut state = GlobalState::default();
        let mut alloc = GpuAllocator::new(&mut state);
        alloc.acquire(GPU, &Claimant::new("hpc", "a"), DeviceBinding::default()).unwrap();
        assert!(alloc.check_conflict(GPU, "hpc", Some("b")).is_some());
        assert!(alloc.check_conflict(GPU, "hpc", None).is_none());
        assert!(alloc.check_conflict("0000:02:00.0", "cloud", Some("x")).is_none());
    }

    #[test]
    fn release_is_unconditional_and_idempotent() {
        let mut state = GlobalState::default();
        let mut alloc = GpuAllocator::new(&mut state);
        alloc.acquire(GPU, &Claimant::new("hpc", "a"), DeviceBinding::default()).unwrap();
        assert!(alloc.release(GPU).is_some());
        assert!(alloc.release(GPU).is_none());
        alloc.acquire(GPU, &Claimant::new("cloud", "b"), DeviceBinding::default()).unwrap();
    }

    #[test]
    fn release_owned_by_only_touches_that_vm() {
        let mut state = GlobalState::default();
        let mut alloc = GpuAllocator::new(&mut state);
        alloc.acquire("0000:01:00.0", &Claimant::new("hpc", "a"), DeviceBinding::default()).unwrap();
        alloc.acquire("0000:01:00.1", &Claimant::new("hpc", "a"), DeviceBinding::default()).unwrap();
        alloc.acquire("0000:02:00.0", &Claimant::new("hpc", "b"), DeviceBinding::default()).unwrap();

        let freed = alloc.release_owned_by("hpc", "a");
        assert_eq!(freed, vec!["0000:01:00.0".to_string(), "0000:01:00.1".to_string()]);
        assert!(alloc.owner("0000:02:00.0").is_some());
    }

    #[test]
    fn transfer_requires_current_owner() {
        let mut state = GlobalState::default();
        let mut alloc = GpuAllocator::new(&mut state);
        let hpc = Claimant::new("hpc", "hpc-compute-01");
        let cloud = Claimant::new("cloud", "cloud-gpu-worker-01");

        assert!(alloc.transfer(GPU, &hpc, &cloud).is_err());
        alloc.acquire(GPU, &hpc, DeviceBinding::default()).unwrap();
        alloc.transfer(GPU, &hpc, &cloud).unwrap();
        assert!(alloc.is_held_by(GPU, &cloud));
        assert!(!alloc.is_held_by(GPU, &hpc));

        let owner = alloc.owner(GPU).unwrap();
        assert_eq!(owner.cluster, "cloud");
        assert_eq!(owner.vm.as_deref(), Some("cloud-gpu-worker-01"));
        assert!(alloc.check_conflict(GPU, "hpc", Some("hpc-compute-01")).is_some());
    }
}
