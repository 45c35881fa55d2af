// Runs against a real libvirt daemon. Needs virsh and rights on
// qemu:///system, so every test is ignored by default:
//   cargo test --test live_tests -- --ignored

use gpu_cluster_manager::core::{
    DomainDefinition, Hypervisor, PoolDefinition, StopMode, VirshHypervisor, VmState, VolumeDefinition,
};
use tempfile::TempDir;
use tracing::info;

const URI: &str = "qemu:///system";

async fn cleanup(hv: &VirshHypervisor, vm: &str, pool: &str) {
    if let Ok(status) = hv.status(vm).await {
        if status.state.is_active() {
            let _ = hv.stop(vm, StopMode::Force).await;
        }
        if status.state != VmState::Undefined {
            let _ = hv.destroy(vm).await;
        }
    }
    let _ = hv.delete_volume(pool, &format!("{vm}.qcow2")).await;
    let _ = hv.destroy_pool(pool).await;
}

// Unknown domains read as undefined instead of failing.
#[tokio::test]
#[ignore]
async fn test_live_missing_domain_is_undefined() -> anyhow::Result<()> {
    let hv = VirshHypervisor::new(URI);
    let status = hv.status("gcm-live-does-not-exist").await?;
    assert_eq!(status.state, VmState::Undefined);
    assert!(status.ip_address.is_none());
    Ok(())
}

// Pool, volume and domain round trip, cleaned up on the way out.
#[tokio::test]
#[ignore]
async fn test_live_define_start_stop_destroy() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let hv = VirshHypervisor::new(URI);
    let (vm, pool) = ("gcm-live-vm", "gcm-live-pool");
    cleanup(&hv, vm, pool).await;

    hv.create_pool(&PoolDefinition {
        name: pool.into(),
        path: dir.path().to_path_buf(),
    })
    .await?;
    let disk = hv
        .create_volume(&VolumeDefinition {
            pool: pool.into(),
            name: format!("{vm}.qcow2"),
            capacity_gb: 1,
            backing_image: None,
        })
        .await?;
    info!(%disk, "Volume created");

    hv.define(&DomainDefinition {
        name: vm.into(),
        vcpus: 1,
        memory_mb: 256,
        disk_path: disk.into(),
        network: "default".into(),
        hostdevs: vec![],
    })
    .await?;
    assert_eq!(hv.status(vm).await?.state, VmState::Shutoff);

    hv.start(vm).await?;
    assert_eq!(hv.status(vm).await?.state, VmState::Running);

    hv.stop(vm, StopMode::Force).await?;
    assert_eq!(hv.status(vm).await?.state, VmState::Shutoff);

    hv.destroy(vm).await?;
    assert_eq!(hv.status(vm).await?.state, VmState::Undefined);

    cleanup(&hv, vm, pool).await;
    Ok(())
}

// Removing things that are already gone is not an error.
#[tokio::test]
#[ignore]
async fn test_live_removal_of_missing_resources() -> anyhow::Result<()> {
    let hv = VirshHypervisor::new(URI);
    hv.destroy_network("gcm-live-no-network").await?;
    hv.destroy_pool("gcm-live-no-pool").await?;
    hv.delete_volume("gcm-live-no-pool", "missing.qcow2").await?;
    Ok(())
}
