//! Cluster configuration: the YAML document as written by the operator, and
//! the typed specs the rest of the crate works with once it has been
//! validated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use super::validation::validate_schema;
use crate::errors::{ConfigError, ManagerResult};
use crate::state::{ClusterType, VmRole};

// ---- raw document -------------------------------------------------------
// Required fields are `Option` so validation can name every missing one
// instead of stopping at the first serde error.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfigDocument {
    pub version: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_yaml::Value>,
    #[serde(default)]
    pub global: Option<serde_yaml::Value>,
    pub clusters: Option<ClustersDocument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClustersDocument {
    pub hpc: Option<ClusterDocument>,
    pub cloud: Option<ClusterDocument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterDocument {
    pub name: Option<String>,
    pub base_image_path: Option<PathBuf>,
    pub network: Option<NetworkDocument>,
    /// HPC head node.
    pub controller: Option<NodeDocument>,
    #[serde(default)]
    pub compute_nodes: Vec<NodeDocument>,
    /// Cloud head node.
    pub control_plane: Option<NodeDocument>,
    #[serde(default)]
    pub worker_nodes: Vec<NodeDocument>,
    pub provisioning: Option<ProvisioningDocument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkDocument {
    pub subnet: Option<String>,
    pub bridge: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDocument {
    pub cpu_cores: Option<u32>,
    pub memory_gb: Option<u32>,
    pub disk_gb: Option<u32>,
    pub ip_address: Option<String>,
    /// Short spelling used by compute and worker entries.
    pub ip: Option<String>,
    pub auto_start: Option<bool>,
    pub pcie_passthrough: Option<PassthroughDocument>,
}

impl NodeDocument {
    pub fn address(&self) -> Option<&str> {
        self.ip_address.as_deref().or(self.ip.as_deref())
    }

    /// Devices that will actually be passed through.
    pub fn enabled_devices(&self) -> &[DeviceDocument] {
        match &self.pcie_passthrough {
            Some(pt) if pt.enabled => &pt.devices,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassthroughDocument {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub devices: Vec<DeviceDocument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceDocument {
    pub pci_address: Option<String>,
    pub device_type: Option<String>,
    pub vendor_id: Option<String>,
    pub device_id: Option<String>,
    pub iommu_group: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisioningDocument {
    pub playbook: Option<PathBuf>,
    pub inventory: Option<PathBuf>,
}

// ---- typed specs --------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Gpu,
    Network,
    Storage,
    Audio,
    Other,
}

impl DeviceType {
    pub const ALL: [&'static str; 5] = ["gpu", "network", "storage", "audio", "other"];
}

impl FromStr for DeviceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "gpu" => Ok(DeviceType::Gpu),
            "network" => Ok(DeviceType::Network),
            "storage" => Ok(DeviceType::Storage),
            "audio" => Ok(DeviceType::Audio),
            "other" => Ok(DeviceType::Other),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Gpu => "gpu",
            DeviceType::Network => "network",
            DeviceType::Storage => "storage",
            DeviceType::Audio => "audio",
            DeviceType::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDeviceSpec {
    pub pci_address: String,
    pub device_type: DeviceType,
    pub vendor_id: Option<String>,
    pub device_id: Option<String>,
    pub iommu_group: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub role: VmRole,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
    pub ip_address: Option<String>,
    pub auto_start: bool,
    pub devices: Vec<PciDeviceSpec>,
}

impl VmSpec {
    pub fn pci_addresses(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.pci_address.clone()).collect()
    }

    pub fn gpu_count(&self) -> u32 {
        self.devices.iter().filter(|d| d.device_type == DeviceType::Gpu).count() as u32
    }

    pub fn volume_name(&self) -> String {
        format!("{}.qcow2", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub subnet: String,
    pub bridge: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningSpec {
    pub playbook: PathBuf,
    pub inventory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    pub name: String,
    pub cluster_type: ClusterType,
    pub base_image: Option<PathBuf>,
    pub network: NetworkSpec,
    pub pool_name: String,
    /// Head node first, then the rest in declaration order.
    pub vms: Vec<VmSpec>,
    pub provisioning: Option<ProvisioningSpec>,
}

impl ClusterSpec {
    pub fn head(&self) -> Option<&VmSpec> {
        self.vms.first()
    }

    pub fn vm(&self, name: &str) -> Option<&VmSpec> {
        self.vms.iter().find(|vm| vm.name == name)
    }

    pub fn pci_addresses(&self) -> BTreeSet<String> {
        self.vms.iter().flat_map(|vm| vm.pci_addresses()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    pub version: String,
    pub hpc: Option<ClusterSpec>,
    pub cloud: Option<ClusterSpec>,
}

impl SystemConfig {
    pub fn load(path: &Path) -> ManagerResult<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let doc = parse_document(&text, path)?;
        debug!(config = %path.display(), "Cluster configuration parsed");
        Self::from_document(&doc)
    }

    pub fn from_yaml_str(text: &str) -> ManagerResult<Self> {
        let doc = parse_document(text, Path::new("<inline>"))?;
        Self::from_document(&doc)
    }

    /// Validate once, then build the typed tree. The raw document is not
    /// consulted again after this.
    pub fn from_document(doc: &ClusterConfigDocument) -> ManagerResult<Self> {
        let problems = validate_schema(doc);
        if !problems.is_empty() {
            return Err(ConfigError::Schema(problems).into());
        }

        let clusters = doc.clusters.clone().unwrap_or_default();
        Ok(Self {
            version: doc.version.clone().unwrap_or_default(),
            hpc: clusters.hpc.as_ref().map(|c| build_cluster(c, ClusterType::Hpc)),
            cloud: clusters.cloud.as_ref().map(|c| build_cluster(c, ClusterType::Cloud)),
        })
    }

    /// Configured clusters in start order (HPC before Cloud).
    pub fn clusters(&self) -> impl Iterator<Item = &ClusterSpec> {
        self.hpc.iter().chain(self.cloud.iter())
    }

    pub fn cluster(&self, kind: ClusterType) -> ManagerResult<&ClusterSpec> {
        let spec = match kind {
            ClusterType::Hpc => self.hpc.as_ref(),
            ClusterType::Cloud => self.cloud.as_ref(),
        };
        spec.ok_or_else(|| ConfigError::MissingCluster(kind.to_string()).into())
    }

    /// The same configuration narrowed to one cluster, for per-cluster checks.
    pub fn only(&self, kind: ClusterType) -> ManagerResult<SystemConfig> {
        let spec = self.cluster(kind)?.clone();
        Ok(SystemConfig {
            version: self.version.clone(),
            hpc: (kind == ClusterType::Hpc).then(|| spec.clone()),
            cloud: (kind == ClusterType::Cloud).then_some(spec),
        })
    }

    /// Devices both clusters declare. Legal, but only one can hold them at a time.
    pub fn shared_devices(&self) -> Vec<String> {
        match (&self.hpc, &self.cloud) {
            (Some(hpc), Some(cloud)) => hpc
                .pci_addresses()
                .intersection(&cloud.pci_addresses())
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn parse_document(text: &str, path: &Path) -> ManagerResult<ClusterConfigDocument> {
    serde_yaml::from_str(text).map_err(|e| {
        ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
        .into()
    })
}

fn build_cluster(doc: &ClusterDocument, cluster_type: ClusterType) -> ClusterSpec {
    let name = doc.name.clone().unwrap_or_default();
    let network = doc.network.clone().unwrap_or_default();

    let mut vms = Vec::new();
    match cluster_type {
        ClusterType::Hpc => {
            if let Some(head) = &doc.controller {
                vms.push(build_vm(format!("{name}-controller"), VmRole::Controller, head));
            }
            for (i, node) in doc.compute_nodes.iter().enumerate() {
                vms.push(build_vm(format!("{name}-compute-{:02}", i + 1), VmRole::Compute, node));
            }
        }
        ClusterType::Cloud => {
            if let Some(head) = &doc.control_plane {
                vms.push(build_vm(format!("{name}-control-plane"), VmRole::ControlPlane, head));
            }
            let (mut cpu, mut gpu) = (0, 0);
            for node in &doc.worker_nodes {
                let has_gpu = node
                    .enabled_devices()
                    .iter()
                    .any(|d| d.device_type.as_deref() == Some("gpu"));
                let vm = if has_gpu {
                    gpu += 1;
                    build_vm(format!("{name}-gpu-worker-{gpu:02}"), VmRole::GpuWorker, node)
                } else {
                    cpu += 1;
                    build_vm(format!("{name}-cpu-worker-{cpu:02}"), VmRole::CpuWorker, node)
                };
                vms.push(vm);
            }
        }
    }

    ClusterSpec {
        network: NetworkSpec {
            name: format!("{name}-network"),
            subnet: network.subnet.unwrap_or_default(),
            bridge: network.bridge.unwrap_or_default(),
        },
        pool_name: format!("{name}-pool"),
        base_image: doc.base_image_path.clone(),
        provisioning: doc.provisioning.as_ref().and_then(|p| {
            p.playbook.clone().map(|playbook| ProvisioningSpec {
                playbook,
                inventory: p.inventory.clone(),
            })
        }),
        name,
        cluster_type,
        vms,
    }
}

fn build_vm(name: String, role: VmRole, node: &NodeDocument) -> VmSpec {
    VmSpec {
        name,
        role,
        cpu_cores: node.cpu_cores.unwrap_or_default(),
        memory_gb: node.memory_gb.unwrap_or_default(),
        disk_gb: node.disk_gb.unwrap_or_default(),
        ip_address: node.address().map(str::to_string),
        auto_start: node.auto_start.unwrap_or(true),
        devices: node
            .enabled_devices()
            .iter()
            .filter_map(|d| {
                Some(PciDeviceSpec {
                    pci_address: d.pci_address.clone()?,
                    device_type: d.device_type.as_deref()?.parse().ok()?,
                    vendor_id: d.vendor_id.clone(),
                    device_id: d.device_id.clone(),
                    iommu_group: d.iommu_group,
                })
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "1.0"
metadata:
  name: workstation
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
        ip: 192.168.100.11
        pcie_passthrough:
          enabled: true
          devices:
            - { pci_address: "0000:01:00.0", device_type: gpu, vendor_id: "10de", device_id: "2204" }
            - { pci_address: "0000:01:00.1", device_type: audio }
      - { cpu_cores: 8, memory_gb: 16, disk_gb: 200, auto_start: false }
  cloud:
    name: cloud
    base_image_path: /images/cloud.qcow2
    network: { subnet: 192.168.200.0/24, bridge: virbr200 }
    control_plane: { cpu_cores: 4, memory_gb: 8, disk_gb: 100 }
    worker_nodes:
      - { cpu_cores: 4, memory_gb: 8, disk_gb: 100 }
      - cpu_cores: 8
        memory_gb: 32
        disk_gb: 200
        pcie_passthrough:
          enabled: true
          devices:
            - { pci_address: "0000:01:00.0", device_type: gpu }
      - cpu_cores: 8
        memory_gb: 32
        disk_gb: 200
        pcie_passthrough:
          enabled: false
          devices:
            - { pci_address: "0000:02:00.0", device_type: gpu }
    provisioning:
      playbook: ansible/playbooks/k8s.yml
      inventory: output/cloud-inventory.ini
"#;

    #[test]
    fn names_vms_by_role() {
        let config = SystemConfig::from_yaml_str(SAMPLE).unwrap();
        let hpc = config.hpc.as_ref().unwrap();
        let names: Vec<&str> = hpc.vms.iter().map(|vm| vm.name.as_str()).collect();
        assert_eq!(names, vec!["hpc-controller", "hpc-compute-01", "hpc-compute-02"]);
        assert_eq!(hpc.network.name, "hpc-network");
        assert_eq!(hpc.pool_name, "hpc-pool");

        let cloud = config.cloud.as_ref().unwrap();
        let names: Vec<&str> = cloud.vms.iter().map(|vm| vm.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["cloud-control-plane", "cloud-cpu-worker-01", "cloud-gpu-worker-01", "cloud-cpu-worker-02"]
        );
        assert_eq!(
            cloud.provisioning.as_ref().map(|p| p.playbook.clone()),
            Some(PathBuf::from("ansible/playbooks/k8s.yml"))
        );
    }

    #[test]
    fn carries_devices_and_auto_start() {
        let config = SystemConfig::from_yaml_str(SAMPLE).unwrap();
        let hpc = config.cluster(ClusterType::Hpc).unwrap();
        let compute = hpc.vm("hpc-compute-01").unwrap();
        assert_eq!(compute.pci_addresses(), vec!["0000:01:00.0", "0000:01:00.1"]);
        assert_eq!(compute.gpu_count(), 1);
        assert_eq!(compute.ip_address.as_deref(), Some("192.168.100.11"));
        assert!(compute.auto_start);
        assert!(!hpc.vm("hpc-compute-02").unwrap().auto_start);

        // disabled passthrough is ignored
        let cloud = config.cluster(ClusterType::Cloud).unwrap();
        assert!(cloud.vm("cloud-cpu-worker-02").unwrap().devices.is_empty());
    }

    #[test]
    fn finds_devices_shared_between_clusters() {
        let config = SystemConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.shared_devices(), vec!["0000:01:00.0".to_string()]);
    }

    #[test]
    fn missing_cluster_is_invalid_argument() {
        let config = SystemConfig::from_yaml_str(SAMPLE).unwrap();
        let only_hpc = SystemConfig { cloud: None, ..config };
        let err = only_hpc.cluster(ClusterType::Cloud).unwrap_err();
        assert_eq!(err.exit_code(), crate::errors::EXIT_INVALID_ARGUMENT);
    }

    #[test]
    fn unreadable_yaml_is_a_parse_error() {
        let err = SystemConfig::from_yaml_str("clusters: [unterminated").unwrap_err();
        assert!(matches!(err, crate::errors::ManagerError::Config(ConfigError::Parse { .. })));
    }

    #[test]
    fn missing_file_exits_not_found() {
        let err = SystemConfig::load(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert_eq!(err.exit_code(), crate::errors::EXIT_NOT_FOUND);
    }

    #[test]
    fn shipped_example_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/cluster.yaml");
        let config = SystemConfig::load(&path).unwrap();
        assert_eq!(config.clusters().count(), 2);
        assert_eq!(config.shared_devices(), vec!["0000:01:00.0".to_string()]);
        let cloud = config.cluster(ClusterType::Cloud).unwrap();
        assert!(!cloud.vm("cloud-cluster-gpu-worker-01").unwrap().auto_start);
    }
}
