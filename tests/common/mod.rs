// Shared fixtures for the integration suites. Not every suite uses every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use gpu_cluster_manager::cluster::{ClusterManager, Provisioner, SystemManager};
use gpu_cluster_manager::config::{ProvisioningSpec, Settings, SystemConfig};
use gpu_cluster_manager::core::{MockHypervisor, ShutdownPolicy, VmLifecycle};
use gpu_cluster_manager::errors::{ManagerError, ManagerResult};
use gpu_cluster_manager::gpu::HostEnvironment;
use gpu_cluster_manager::state::StateStore;

pub const SHARED_GPU: &str = "0000:01:00.0";

/// HPC: controller + two compute nodes, the first holding the shared GPU.
/// Cloud: control plane + one GPU worker wanting the same card.
pub const TWO_CLUSTERS: &str = r#"
version: "1.0"
clusters:
  hpc:
    name: hpc
    base_image_path: /images/hpc.qcow2
    network: { subnet: 192.168.100.0/24, bridge: virbr100 }
    controller: { cpu_cores: 4, memory_gb: 8, disk_gb: 100, ip_address: 192.168.100.10 }
    compute_nodes:
      - cpu_cores: 8
        memory_gb: 16
        disk_gb: 200
        pcie_passthrough:
          enabled: true
          devices:
            - { pci_address: "0000:01:00.0", device_type: gpu }
      - { cpu_cores: 8, memory_gb: 16, disk_gb: 200 }
  cloud:
    name: cloud
    base_image_path: /images/cloud.qcow2
    network: { subnet: 192.168.200.0/24, bridge: virbr200 }
    control_plane: { cpu_cores: 4, memory_gb: 8, disk_gb: 100 }
    worker_nodes:
      - cpu_cores: 8
        memory_gb: 32
        disk_gb: 200
        pcie_passthrough:
          enabled: true
          devices:
            - { pci_address: "0000:01:00.0", device_type: gpu }
"#;

/// Same two clusters without any device in common.
pub const DISJOINT_CLUSTERS: &str = r#"
version: "1.0"
clusters:
  hpc:
    name: hpc
    network: { subnet: 192.168.100.0/24, bridge: virbr100 }
    controller: { cpu_cores: 4, memory_gb: 8, disk_gb: 100 }
    compute_nodes:
      - cpu_cores: 8
        memory_gb: 16
        disk_gb: 200
        pcie_passthrough:
          enabled: true
          devices:
            - { pci_address: "0000:01:00.0", device_type: gpu }
  cloud:
    name: cloud
    network: { subnet: 192.168.200.0/24, bridge: virbr200 }
    control_plane: { cpu_cores: 4, memory_gb: 8, disk_gb: 100 }
    worker_nodes:
      - cpu_cores: 8
        memory_gb: 32
        disk_gb: 200
        pcie_passthrough:
          enabled: true
          devices:
            - { pci_address: "0000:02:00.0", device_type: gpu }
"#;

pub fn config(yaml: &str) -> SystemConfig {
    SystemConfig::from_yaml_str(yaml).expect("fixture config is valid")
}

pub struct Harness {
    pub dir: TempDir,
    pub hypervisor: Arc<MockHypervisor>,
    pub store: StateStore,
    pub settings: Settings,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let settings = Settings {
            state_path: dir.path().join("state.json"),
            storage_root: dir.path().join("pools"),
            max_workers: 4,
            shutdown_timeout_secs: 1,
            poll_interval_ms: 10,
            ..Settings::default()
        };
        Self {
            store: StateStore::new(&settings.state_path),
            hypervisor: Arc::new(MockHypervisor::new()),
            settings,
            dir,
        }
    }

    pub fn lifecycle(&self) -> Arc<VmLifecycle> {
        let policy = ShutdownPolicy {
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        };
        Arc::new(
            VmLifecycle::new(self.hypervisor.clone(), policy)
                .with_host(HostEnvironment::rooted(Path::new("/nonexistent"), "x86_64")),
        )
    }

    pub fn clusters(&self) -> ClusterManager {
        self.clusters_with(Arc::new(CountingProvisioner::default()))
    }

    pub fn clusters_with(&self, provisioner: Arc<dyn Provisioner>) -> ClusterManager {
        ClusterManager::new(self.store.clone(), self.lifecycle(), &self.settings).with_provisioner(provisioner)
    }

    pub fn system(&self) -> SystemManager {
        SystemManager::new(self.clusters())
    }
}

#[derive(Default)]
pub struct CountingProvisioner {
    pub runs: AtomicUsize,
}

#[async_trait]
impl Provisioner for CountingProvisioner {
    async fn provision(&self, _cluster: &str, _spec: &ProvisioningSpec) -> ManagerResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FailingProvisioner;

#[async_trait]
impl Provisioner for FailingProvisioner {
    async fn provision(&self, _cluster: &str, spec: &ProvisioningSpec) -> ManagerResult<()> {
        Err(ManagerError::Provisioning {
            playbook: spec.playbook.clone(),
            reason: "exit code 2".into(),
        })
    }
}
