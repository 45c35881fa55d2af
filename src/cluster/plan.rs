//! Dry-run report of what a configuration would create.
//!
//! Built from the configuration and a read-only state snapshot; nothing is
//! locked and the hypervisor is never called.

use serde::Serialize;
use std::fmt::Write as _;

use crate::config::{ClusterSpec, SystemConfig, VmSpec};
use crate::gpu::{find_conflict, ConflictInfo};
use crate::state::{ClusterType, GlobalState, VmRole};

#[derive(Debug, Clone, Serialize)]
pub struct PlannedVm {
    pub name: String,
    pub role: VmRole,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
    pub ip_address: Option<String>,
    pub auto_start: bool,
    pub pci_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedCluster {
    pub name: String,
    pub cluster_type: ClusterType,
    pub network: String,
    pub subnet: String,
    pub bridge: String,
    pub pool: String,
    pub base_image: Option<String>,
    pub deployed: bool,
    pub vms: Vec<PlannedVm>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub clusters: Vec<PlannedCluster>,
    /// Devices both clusters declare.
    pub shared_devices: Vec<String>,
    /// Devices another cluster or VM holds right now; starting would fail.
    pub conflicts: Vec<ConflictInfo>,
}

impl Plan {
    pub fn build(config: &SystemConfig, state: &GlobalState) -> Self {
        let mut conflicts = Vec::new();
        for spec in config.clusters() {
            for vm in &spec.vms {
                for pci in vm.pci_addresses() {
                    if let Some(conflict) = find_conflict(state, &pci, &spec.name, Some(&vm.name)) {
                        conflicts.push(conflict);
                    }
                }
            }
        }
        Self {
            clusters: config
                .clusters()
                .map(|spec| planned_cluster(spec, state.cluster(&spec.name).is_some()))
                .collect(),
            shared_devices: config.shared_devices(),
            conflicts,
        }
    }

    pub fn vm_count(&self) -> usize {
        self.clusters.iter().map(|c| c.vms.len()).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Cluster Planning Report");
        let _ = writeln!(out, "=======================");
        let _ = writeln!(out, "Summary: {} cluster(s), {} VM(s)", self.clusters.len(), self.vm_count());
        for cluster in &self.clusters {
            let _ = writeln!(out);
            let _ = writeln!(out, "{} [{}]{}", cluster.name, cluster.cluster_type, deployed_note(cluster));
            let _ = writeln!(out, "  Network:    {} {} ({})", cluster.network, cluster.subnet, cluster.bridge);
            let _ = writeln!(out, "  Pool:       {}", cluster.pool);
            let _ = writeln!(out, "  Base image: {}", cluster.base_image.as_deref().unwrap_or("none"));
            let _ = writeln!(
                out,
                "  {:<28} {:<12} {:>4} {:>6} {:>6}  {:<16} {}",
                "VM", "ROLE", "CPU", "MEM", "DISK", "IP", "GPU"
            );
            for vm in &cluster.vms {
                let _ = writeln!(
                    out,
                    "  {:<28} {:<12} {:>4} {:>5}G {:>5}G  {:<16} {}",
                    vm.name,
                    vm.role.to_string(),
                    vm.cpu_cores,
                    vm.memory_gb,
                    vm.disk_gb,
                    vm.ip_address.as_deref().unwrap_or("dhcp"),
                    devices(vm)
                );
            }
        }
        self.render_notes(&mut out, "");
        out
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Cluster Planning Report\n");
        let _ = writeln!(out, "**Summary:** {} cluster(s), {} VM(s)", self.clusters.len(), self.vm_count());
        for cluster in &self.clusters {
            let _ = writeln!(out, "\n## {} ({}){}\n", cluster.name, cluster.cluster_type, deployed_note(cluster));
            let _ = writeln!(out, "- **Type:** {}", cluster.cluster_type);
            let _ = writeln!(out, "- **Network:** {} ({})", cluster.subnet, cluster.bridge);
            let _ = writeln!(out, "- **Base Image:** {}", cluster.base_image.as_deref().unwrap_or("none"));
            let _ = writeln!(out, "- **VMs:** {}\n", cluster.vms.len());
            let _ = writeln!(out, "| Name | Type | CPU | Memory (GB) | Disk (GB) | IP Address | GPU |");
            let _ = writeln!(out, "|------|------|-----|-------------|-----------|------------|-----|");
            for vm in &cluster.vms {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} | {} | {} | {} |",
                    vm.name,
                    vm.role,
                    vm.cpu_cores,
                    vm.memory_gb,
                    vm.disk_gb,
                    vm.ip_address.as_deref().unwrap_or("dhcp"),
                    devices(vm)
                );
            }
        }
        self.render_notes(&mut out, "- ");
        out
    }

    fn render_notes(&self, out: &mut String, bullet: &str) {
        if !self.shared_devices.is_empty() {
            let _ = writeln!(out);
            for pci in &self.shared_devices {
                let _ = writeln!(out, "{bullet}{pci} is shared: only one cluster can hold it at a time");
            }
        }
        if !self.conflicts.is_empty() {
            let _ = writeln!(out);
            for conflict in &self.conflicts {
                let _ = writeln!(out, "{bullet}CONFLICT: {conflict}");
            }
        }
    }
}

fn planned_cluster(spec: &ClusterSpec, deployed: bool) -> PlannedCluster {
    PlannedCluster {
        name: spec.name.clone(),
        cluster_type: spec.cluster_type,
        network: spec.network.name.clone(),
        subnet: spec.network.subnet.clone(),
        bridge: spec.network.bridge.clone(),
        pool: spec.pool_name.clone(),
        base_image: spec.base_image.as_ref().map(|p| p.display().to_string()),
        deployed,
        vms: spec.vms.iter().map(planned_vm).collect(),
    }
}

fn planned_vm(vm: &VmSpec) -> PlannedVm {
    PlannedVm {
        name: vm.name.clone(),
        role: vm.role,
        cpu_cores: vm.cpu_cores,
        memory_gb: vm.memory_gb,
        disk_gb: vm.disk_gb,
        ip_address: vm.ip_address.clone(),
        auto_start: vm.auto_start,
        pci_addresses: vm.pci_addresses(),
    }
}

fn devices(vm: &PlannedVm) -> String {
    if vm.pci_addresses.is_empty() {
        "-".to_string()
    } else {
        vm.pci_addresses.join(", ")
    }
}

fn deployed_note(cluster: &PlannedCluster) -> &'static str {
    if cluster.deployed {
        " (already deployed)"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::GpuOwnership;
    use chrono::Utc;

    const CONFIG: &str = r#"
version: "1.0"
clusters:
  hpc:
    name: hpc
    network: { subnet: 192.168.100.0/24, bridge: virbr100 }
    controller: { cpu_cores: 2, memory_gb: 4, disk_gb: 20, ip_address: 192.168.100.10 }
    compute_nodes:
      - cpu_cores: 4
        memory_gb: 8
        disk_gb: 40
        pcie_passthrough:
          enabled: true
          devices: [{ pci_address: "0000:01:00.0", device_type: gpu }]
  cloud:
    name: cloud
    network: { subnet: 192.168.200.0/24, bridge: virbr200 }
    control_plane: { cpu_cores: 2, memory_gb: 4, disk_gb: 20 }
    worker_nodes:
      - cpu_cores: 4
        memory_gb: 8
        disk_gb: 40
        pcie_passthrough:
          enabled: true
          devices: [{ pci_address: "0000:01:00.0", device_type: gpu }]
"#;

    fn held_by_hpc() -> GlobalState {
        let mut state = GlobalState::default();
        state.gpu_allocations.insert(
            "0000:01:00.0".into(),
            GpuOwnership {
                cluster: "hpc".into(),
                vm: Some("hpc-compute-01".into()),
                driver: None,
                iommu_group: None,
                acquired_at: Utc::now(),
            },
        );
        state
    }

    #[test]
    fn lists_every_vm_and_the_shared_card() {
        let config = SystemConfig::from_yaml_str(CONFIG).unwrap();
        let plan = Plan::build(&config, &GlobalState::default());
        assert_eq!(plan.clusters.len(), 2);
        assert_eq!(plan.vm_count(), 4);
        assert_eq!(plan.shared_devices, vec!["0000:01:00.0".to_string()]);
        assert!(plan.conflicts.is_empty());

        let text = plan.render_text();
        assert!(text.contains("Summary: 2 cluster(s), 4 VM(s)"));
        assert!(text.contains("192.168.100.10"));
        assert!(text.contains("0000:01:00.0 is shared"));
    }

    #[test]
    fn current_owner_shows_up_as_a_conflict() {
        let config = SystemConfig::from_yaml_str(CONFIG).unwrap();
        let plan = Plan::build(&config, &held_by_hpc());
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].requested_cluster, "cloud");
        assert!(plan.render_markdown().contains("CONFLICT:"));
    }

    #[test]
    fn markdown_has_one_row_per_vm() {
        let config = SystemConfig::from_yaml_str(CONFIG).unwrap();
        let markdown = Plan::build(&config, &GlobalState::default()).render_markdown();
        assert!(markdown.starts_with("# Cluster Planning Report"));
        assert!(markdown.contains("| Name | Type | CPU | Memory (GB) | Disk (GB) | IP Address | GPU |"));
        assert_eq!(markdown.lines().filter(|l| l.starts_with("| hpc-") || l.starts_with("| cloud-")).count(), 4);
    }

    #[test]
    fn json_is_machine_readable() {
        let config = SystemConfig::from_yaml_str(CONFIG).unwrap();
        let json = Plan::build(&config, &held_by_hpc()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["clusters"][1]["cluster_type"], "cloud");
        assert_eq!(value["conflicts"][0]["owner_cluster"], "hpc");
    }
}
