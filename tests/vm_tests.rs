// Per-VM lifecycle through the store-backed cluster manager.

mod common;

use common::{config, Harness};
use gpu_cluster_manager::core::{StopOutcome, VmState};
use gpu_cluster_manager::errors::{ManagerError, VmError};
use gpu_cluster_manager::state::ClusterType;

const AUTO_START_OFF: &str = r#"
version: "1.0"
clusters:
  hpc:
    name: hpc
    network: { subnet: 192.168.100.0/24, bridge: virbr100 }
    controller: { cpu_cores: 2, memory_gb: 4, disk_gb: 40 }
    compute_nodes:
      - cpu_cores: 8
        memory_gb: 16
        disk_gb: 200
        auto_start: false
        pcie_passthrough:
          enabled: true
          devices:
            - { pci_address: "0000:01:00.0", device_type: gpu }
"#;

// A VM declared with auto_start: false is defined but holds nothing until
// someone starts it explicitly.
#[tokio::test]
async fn test_auto_start_isolation() -> anyhow::Result<()> {
    let harness = Harness::new();
    let config = config(AUTO_START_OFF);
    let spec = config.cluster(ClusterType::Hpc)?;
    let clusters = harness.clusters();

    let record = clusters.start_cluster(spec).await?;
    assert_eq!(record.vm("hpc-compute-01").map(|vm| vm.state), Some(VmState::Shutoff));
    assert_eq!(harness.hypervisor.domain_state("hpc-compute-01"), Some(VmState::Shutoff));
    assert!(harness.store.load()?.gpu_allocations.is_empty());

    let vm = clusters.start_vm(spec, "hpc-compute-01").await?;
    assert_eq!(vm.state, VmState::Running);
    let state = harness.store.load()?;
    assert_eq!(state.gpu_allocations["0000:01:00.0"].vm.as_deref(), Some("hpc-compute-01"));

    clusters.stop_vm(spec, "hpc-compute-01").await?;
    assert!(harness.store.load()?.gpu_allocations.is_empty());
    Ok(())
}

// Stopping an already stopped VM succeeds and issues no hypervisor change.
#[tokio::test]
async fn test_stop_is_idempotent() -> anyhow::Result<()> {
    let harness = Harness::new();
    let config = config(common::DISJOINT_CLUSTERS);
    let spec = config.cluster(ClusterType::Hpc)?;
    let clusters = harness.clusters();
    clusters.start_cluster(spec).await?;

    assert_eq!(clusters.stop_vm(spec, "hpc-compute-01").await?, StopOutcome::Graceful);
    let before = harness.hypervisor.mutating_calls().len();
    assert_eq!(clusters.stop_vm(spec, "hpc-compute-01").await?, StopOutcome::AlreadyStopped);
    assert_eq!(harness.hypervisor.mutating_calls().len(), before);

    let state = harness.store.load()?;
    let record = state.cluster("hpc").unwrap();
    assert_eq!(record.vm("hpc-compute-01").unwrap().state, VmState::Shutoff);
    assert_eq!(record.status.to_string(), "partial");
    Ok(())
}

// A guest that ignores ACPI shutdown is forced off once the timeout passes.
#[tokio::test]
async fn test_shutdown_escalates_to_force() -> anyhow::Result<()> {
    let harness = Harness::new();
    let config = config(common::DISJOINT_CLUSTERS);
    let spec = config.cluster(ClusterType::Hpc)?;
    let clusters = harness.clusters();
    clusters.start_cluster(spec).await?;
    harness.hypervisor.ignore_shutdown("hpc-controller");

    let outcome = clusters.stop_vm(spec, "hpc-controller").await?;

    assert_eq!(outcome, StopOutcome::Forced);
    assert_eq!(harness.hypervisor.domain_state("hpc-controller"), Some(VmState::Shutoff));
    Ok(())
}

// Pause and resume follow the transition table; an illegal move is refused
// without touching the hypervisor.
#[tokio::test]
async fn test_pause_resume_and_illegal_transition() -> anyhow::Result<()> {
    let harness = Harness::new();
    let config = config(common::DISJOINT_CLUSTERS);
    let spec = config.cluster(ClusterType::Hpc)?;
    let clusters = harness.clusters();
    clusters.start_cluster(spec).await?;

    assert_eq!(clusters.pause_vm(spec, "hpc-controller").await?, VmState::Paused);
    assert_eq!(harness.store.load()?.cluster("hpc").unwrap().status.to_string(), "partial");

    let before = harness.hypervisor.mutating_calls().len();
    let err = clusters.pause_vm(spec, "hpc-controller").await.unwrap_err();
    assert!(matches!(err, ManagerError::Vm(VmError::InvalidTransition { .. })));
    assert_eq!(harness.hypervisor.mutating_calls().len(), before);

    assert_eq!(clusters.resume_vm(spec, "hpc-controller").await?, VmState::Running);
    assert_eq!(harness.store.load()?.cluster("hpc").unwrap().status.to_string(), "running");
    Ok(())
}

// A crash seen by status marks the cluster as error; recover brings it back.
#[tokio::test]
async fn test_crash_and_recover() -> anyhow::Result<()> {
    let harness = Harness::new();
    let config = config(common::DISJOINT_CLUSTERS);
    let spec = config.cluster(ClusterType::Hpc)?;
    let clusters = harness.clusters();
    clusters.start_cluster(spec).await?;

    harness.hypervisor.set_state("hpc-compute-01", VmState::Crashed);
    harness.hypervisor.set_state("hpc-controller", VmState::Shutoff);
    let record = clusters.status_cluster(spec).await?;
    assert_eq!(record.vm("hpc-compute-01").unwrap().state, VmState::Crashed);
    assert_eq!(record.status.to_string(), "error");

    assert_eq!(clusters.recover_vm(spec, "hpc-compute-01").await?, VmState::Running);
    assert_eq!(harness.hypervisor.domain_state("hpc-compute-01"), Some(VmState::Running));
    Ok(())
}

// Unknown VM names exit with "not found".
#[tokio::test]
async fn test_unknown_vm() -> anyhow::Result<()> {
    let harness = Harness::new();
    let config = config(common::DISJOINT_CLUSTERS);
    let spec = config.cluster(ClusterType::Hpc)?;
    let clusters = harness.clusters();
    clusters.start_cluster(spec).await?;

    let err = clusters.start_vm(spec, "hpc-compute-99").await.unwrap_err();
    assert_eq!(err.exit_code(), 2);
    Ok(())
}

// Restart cycles the guest and keeps its card; status reads the live state.
#[tokio::test]
async fn test_restart_and_status_vm() -> anyhow::Result<()> {
    let harness = Harness::new();
    let config = config(common::DISJOINT_CLUSTERS);
    let spec = config.cluster(ClusterType::Hpc)?;
    let clusters = harness.clusters();
    clusters.start_cluster(spec).await?;
    let before = harness.hypervisor.mutating_calls().len();

    let vm = clusters.restart_vm(spec, "hpc-compute-01").await?;

    assert_eq!(vm.state, VmState::Running);
    let ops: Vec<String> = harness.hypervisor.mutating_calls()[before..]
        .iter()
        .map(|call| call.op.clone())
        .collect();
    assert_eq!(ops, vec!["shutdown".to_string(), "start".to_string()]);
    let state = harness.store.load()?;
    assert_eq!(state.gpu_allocations["0000:01:00.0"].vm.as_deref(), Some("hpc-compute-01"));

    harness.hypervisor.set_state("hpc-compute-01", VmState::Paused);
    let seen = clusters.status_vm(spec, "hpc-compute-01").await?;
    assert_eq!(seen.state, VmState::Paused);
    assert_eq!(
        harness.store.load()?.cluster("hpc").unwrap().vm("hpc-compute-01").map(|vm| vm.state),
        Some(VmState::Paused)
    );
    Ok(())
}
