use async_trait::async_trait;
use std::path::PathBuf;

use crate::config::VmSpec;
use crate::core::VmState;
use crate::errors::ManagerResult;

/// Live view of a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainStatus {
    pub state: VmState,
    pub ip_address: Option<String>,
}

impl DomainStatus {
    pub fn undefined() -> Self {
        Self {
            state: VmState::Undefined,
            ip_address: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// ACPI shutdown request; the guest decides when it is done.
    Graceful,
    /// Pull the plug.
    Force,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainDefinition {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_path: PathBuf,
    pub network: String,
    pub hostdevs: Vec<String>,
}

impl DomainDefinition {
    pub fn for_vm(vm: &VmSpec, network: &str, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            name: vm.name.clone(),
            vcpus: vm.cpu_cores,
            memory_mb: u64::from(vm.memory_gb) * 1024,
            disk_path: disk_path.into(),
            network: network.to_string(),
            hostdevs: vm.pci_addresses(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkDefinition {
    pub name: String,
    pub bridge: String,
    pub subnet: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolDefinition {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeDefinition {
    pub pool: String,
    pub name: String,
    pub capacity_gb: u32,
    pub backing_image: Option<PathBuf>,
}

/// Everything the manager needs from a hypervisor.
///
/// Calls are never retried here; callers decide what a failure means.
/// `status` on an unknown domain reports `Undefined` rather than failing, and
/// removing a network, pool or volume that is already gone succeeds.
/// Passthrough devices normally travel in `DomainDefinition::hostdevs`;
/// `attach_device` and `detach_device` change a running domain only and
/// leave its persistent definition alone.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn define(&self, domain: &DomainDefinition) -> ManagerResult<()>;
    async fn start(&self, name: &str) -> ManagerResult<()>;
    async fn stop(&self, name: &str, mode: StopMode) -> ManagerResult<()>;
    async fn pause(&self, name: &str) -> ManagerResult<()>;
    async fn resume(&self, name: &str) -> ManagerResult<()>;
    /// Remove the domain definition. The domain must not be running.
    async fn destroy(&self, name: &str) -> ManagerResult<()>;
    async fn status(&self, name: &str) -> ManagerResult<DomainStatus>;
    async fn attach_device(&self, name: &str, pci_address: &str) -> ManagerResult<()>;
    async fn detach_device(&self, name: &str, pci_address: &str) -> ManagerResult<()>;

    /// A create that fails part way removes what it already set up.
    async fn create_network(&self, network: &NetworkDefinition) -> ManagerResult<()>;
    async fn destroy_network(&self, name: &str) -> ManagerResult<()>;
    async fn create_pool(&self, pool: &PoolDefinition) -> ManagerResult<()>;
    async fn destroy_pool(&self, name: &str) -> ManagerResult<()>;
    /// Returns the path of the created volume.
    async fn create_volume(&self, volume: &VolumeDefinition) -> ManagerResult<String>;
    async fn delete_volume(&self, pool: &str, name: &str) -> ManagerResult<()>;
}
