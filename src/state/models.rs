use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use crate::core::VmState;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    Hpc,
    Cloud,
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterType::Hpc => f.write_str("hpc"),
            ClusterType::Cloud => f.write_str("cloud"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Running,
    Stopped,
    Error,
    Partial,
}

impl ClusterStatus {
    /// Aggregate status of a set of VMs.
    ///
    /// `Running` only when every VM runs, `Partial` when some but not all do.
    /// With nothing running a crashed VM makes the cluster `Error`.
    pub fn derive(vms: &[VmInfo]) -> Self {
        if vms.is_empty() {
            return ClusterStatus::Stopped;
        }
        let running = vms.iter().filter(|vm| vm.state.is_running()).count();
        if running == vms.len() {
            ClusterStatus::Running
        } else if running > 0 {
            ClusterStatus::Partial
        } else if vms.iter().any(|vm| vm.state == VmState::Crashed) {
            ClusterStatus::Error
        } else {
            ClusterStatus::Stopped
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterStatus::Running => "running",
            ClusterStatus::Stopped => "stopped",
            ClusterStatus::Error => "error",
            ClusterStatus::Partial => "partial",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmRole {
    Controller,
    Compute,
    ControlPlane,
    CpuWorker,
    GpuWorker,
}

impl fmt::Display for VmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmRole::Controller => "controller",
            VmRole::Compute => "compute",
            VmRole::ControlPlane => "control-plane",
            VmRole::CpuWorker => "cpu-worker",
            VmRole::GpuWorker => "gpu-worker",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub role: VmRole,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub state: VmState,
    pub ip_address: Option<String>,
    pub gpu_count: u32,
    #[serde(default)]
    pub pci_addresses: Vec<String>,
    pub volumes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub auto_start: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
    pub subnet: String,
    pub bridge: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub path: String,
    pub size_gb: u32,
    pub pool: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePoolInfo {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster_name: String,
    pub cluster_type: ClusterType,
    pub status: ClusterStatus,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub vms: Vec<VmInfo>,
    pub networks: Vec<NetworkInfo>,
    pub volumes: Vec<VolumeInfo>,
    #[serde(default)]
    pub storage_pool: Option<StoragePoolInfo>,
    /// Set when a workflow left the cluster half-done; cleared only by a
    /// clean start, stop, or destroy. Status refreshes never clear it.
    #[serde(default)]
    pub reconcile_pending: bool,
}

impl ClusterState {
    pub fn new(name: impl Into<String>, cluster_type: ClusterType) -> Self {
        let now = Utc::now();
        Self {
            cluster_name: name.into(),
            cluster_type,
            status: ClusterStatus::Stopped,
            created_at: now,
            last_modified: now,
            vms: Vec::new(),
            networks: Vec::new(),
            volumes: Vec::new(),
            storage_pool: None,
            reconcile_pending: false,
        }
    }

    pub fn vm(&self, name: &str) -> Option<&VmInfo> {
        self.vms.iter().find(|vm| vm.name == name)
    }

    pub fn vm_mut(&mut self, name: &str) -> Option<&mut VmInfo> {
        self.vms.iter_mut().find(|vm| vm.name == name)
    }

    /// Replace the record with the same name, keeping its position.
    pub fn upsert_vm(&mut self, info: VmInfo) {
        match self.vms.iter_mut().find(|vm| vm.name == info.name) {
            Some(existing) => *existing = info,
            None => self.vms.push(info),
        }
        self.refresh_status();
    }

    pub fn remove_vm(&mut self, name: &str) -> Option<VmInfo> {
        let idx = self.vms.iter().position(|vm| vm.name == name)?;
        let removed = self.vms.remove(idx);
        self.volumes.retain(|vol| !removed.volumes.contains(&vol.path));
        self.refresh_status();
        Some(removed)
    }

    pub fn refresh_status(&mut self) {
        self.status = ClusterStatus::derive(&self.vms);
        self.last_modified = Utc::now();
    }
}

/// Who holds a passthrough device right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuOwnership {
    pub cluster: String,
    pub vm: Option<String>,
    pub driver: Option<String>,
    pub iommu_group: Option<u32>,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    pub version: u32,
    pub clusters: BTreeMap<String, ClusterState>,
    pub gpu_allocations: BTreeMap<String, GpuOwnership>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            clusters: BTreeMap::new(),
            gpu_allocations: BTreeMap::new(),
            last_updated: None,
        }
    }
}

impl GlobalState {
    pub fn cluster(&self, name: &str) -> Option<&ClusterState> {
        self.clusters.get(name)
    }

    pub fn cluster_mut(&mut self, name: &str) -> Option<&mut ClusterState> {
        self.clusters.get_mut(name)
    }

    /// Drop the cluster record and every ownership entry it holds.
    pub fn remove_cluster(&mut self, name: &str) -> Option<ClusterState> {
        self.gpu_allocations.retain(|_, owner| owner.cluster != name);
        self.clusters.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str, state: VmState) -> VmInfo {
        VmInfo {
            name: name.into(),
            role: VmRole::Compute,
            cpu_cores: 2,
            memory_gb: 4,
            state,
            ip_address: None,
            gpu_count: 0,
            pci_addresses: vec![],
            volumes: vec![format!("/pool/{name}.qcow2")],
            created_at: Utc::now(),
            last_seen: None,
            auto_start: true,
        }
    }

    #[test]
    fn status_is_derived_from_vm_states() {
        assert_eq!(ClusterStatus::derive(&[]), ClusterStatus::Stopped);
        assert_eq!(
            ClusterStatus::derive(&[vm("a", VmState::Running), vm("b", VmState::Running)]),
            ClusterStatus::Running
        );
        assert_eq!(
            ClusterStatus::derive(&[vm("a", VmState::Running), vm("b", VmState::Shutoff)]),
            ClusterStatus::Partial
        );
        assert_eq!(
            ClusterStatus::derive(&[vm("a", VmState::Shutoff), vm("b", VmState::Shutoff)]),
            ClusterStatus::Stopped
        );
        assert_eq!(
            ClusterStatus::derive(&[vm("a", VmState::Crashed), vm("b", VmState::Shutoff)]),
            ClusterStatus::Error
        );
    }

    #[test]
    fn removing_a_vm_drops_its_volumes() {
        let mut cluster = ClusterState::new("hpc", ClusterType::Hpc);
        cluster.upsert_vm(vm("a", VmState::Running));
        cluster.volumes.push(VolumeInfo {
            name: "a.qcow2".into(),
            path: "/pool/a.qcow2".into(),
            size_gb: 20,
            pool: "hpc-pool".into(),
        });
        assert_eq!(cluster.status, ClusterStatus::Running);

        cluster.remove_vm("a");
        assert!(cluster.vms.is_empty());
        assert!(cluster.volumes.is_empty());
        assert_eq!(cluster.status, ClusterStatus::Stopped);
    }

    #[test]
    fn removing_a_cluster_frees_its_devices() {
        let mut state = GlobalState::default();
        state.clusters.insert("hpc".into(), ClusterState::new("hpc", ClusterType::Hpc));
        for (pci, owner) in [("0000:01:00.0", "hpc"), ("0000:02:00.0", "cloud")] {
            state.gpu_allocations.insert(
                pci.into(),
                GpuOwnership {
                    cluster: owner.into(),
                    vm: None,
                    driver: None,
                    iommu_group: None,
                    acquired_at: Utc::now(),
                },
            );
        }

        state.remove_cluster("hpc");
        assert!(state.cluster("hpc").is_none());
        assert_eq!(state.gpu_allocations.len(), 1);
        assert!(state.gpu_allocations.contains_key("0000:02:00.0"));
    }
}
