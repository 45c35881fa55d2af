use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use gpu_cluster_manager::errors::ManagerResult;
use gpu_cluster_manager::gpu::{Claimant, DeviceBinding, GpuAllocator, GpuRegistry};
use gpu_cluster_manager::state::StateStore;

const GPU: &str = "0000:01:00.0";

fn store(dir: &TempDir) -> StateStore {
    StateStore::new(dir.path().join("state.json"))
}

fn registry(dir: &TempDir) -> GpuRegistry {
    GpuRegistry::new(store(dir))
}

async fn acquire(store: &StateStore, who: &Claimant) -> ManagerResult<()> {
    let who = who.clone();
    store
        .update(move |state| GpuAllocator::new(state).acquire(GPU, &who, DeviceBinding::default()))
        .await
}

async fn transfer(store: &StateStore, from: &Claimant, to: &Claimant) -> ManagerResult<()> {
    let (from, to) = (from.clone(), to.clone());
    store
        .update(move |state| GpuAllocator::new(state).transfer(GPU, &from, &to))
        .await
}

// Ten clusters race for one card: exactly one may win.
#[tokio::test]
async fn test_concurrent_allocations() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = store(&dir);
    let mut handles = vec![];

    for i in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let who = Claimant::new(format!("cluster{i}"), format!("vm{i}"));
            acquire(&store, &who).await
        }));
    }

    let results: Vec<_> = join_all(handles).await.into_iter().collect::<Result<_, _>>()?;
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|err| err.is_resource_conflict()));

    let allocations = registry(&dir).allocations().await?;
    assert_eq!(allocations.len(), 1);
    Ok(())
}

// Ownership survives the process: a fresh registry over the same file sees it.
#[tokio::test]
async fn test_ownership_is_persistent() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    acquire(&store(&dir), &Claimant::new("hpc", "hpc-compute-01")).await?;

    let conflict = registry(&dir).check_conflict(GPU, "cloud", Some("cloud-gpu-worker-01")).await?;
    let conflict = conflict.expect("device should be owned");
    assert_eq!(conflict.owner_cluster, "hpc");
    assert_eq!(conflict.owner_vm.as_deref(), Some("hpc-compute-01"));
    Ok(())
}

// Release frees the card for the other cluster.
#[tokio::test]
async fn test_release_then_acquire_elsewhere() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let (store, registry) = (store(&dir), registry(&dir));
    acquire(&store, &Claimant::new("hpc", "a")).await?;

    let refused = acquire(&store, &Claimant::new("cloud", "b")).await;
    assert!(refused.unwrap_err().is_resource_conflict());

    assert!(registry.release(GPU).await?.is_some());
    assert!(registry.release(GPU).await?.is_none());
    acquire(&store, &Claimant::new("cloud", "b")).await?;
    assert_eq!(registry.allocations().await?[GPU].cluster, "cloud");
    Ok(())
}

// A concurrent checker must never see the card unowned while it moves back
// and forth between an HPC node and a Cloud worker.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_has_no_unowned_window() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let (store, registry) = (store(&dir), registry(&dir));
    let hpc = Claimant::new("hpc", "hpc-compute-01");
    let cloud = Claimant::new("cloud", "cloud-gpu-worker-01");
    acquire(&store, &hpc).await?;

    let done = Arc::new(AtomicBool::new(false));
    let checker = {
        let registry = registry.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut observations = 0usize;
            while !done.load(Ordering::SeqCst) {
                let seen = registry.check_conflict(GPU, "watcher", Some("watcher-vm")).await?;
                assert!(seen.is_some(), "device observed unowned mid-transfer");
                observations += 1;
                tokio::task::yield_now().await;
            }
            anyhow::Ok(observations)
        })
    };

    for _ in 0..20 {
        transfer(&store, &hpc, &cloud).await?;
        transfer(&store, &cloud, &hpc).await?;
    }
    done.store(true, Ordering::SeqCst);

    let observations = checker.await??;
    assert!(observations > 0);
    assert_eq!(registry.allocations().await?[GPU].vm.as_deref(), Some("hpc-compute-01"));
    Ok(())
}

// Only the current owner may hand the card over.
#[tokio::test]
async fn test_transfer_requires_current_owner() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = store(&dir);
    acquire(&store, &Claimant::new("hpc", "a")).await?;

    let err = transfer(&store, &Claimant::new("cloud", "x"), &Claimant::new("cloud", "y"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        gpu_cluster_manager::errors::ManagerError::Gpu(gpu_cluster_manager::errors::GpuError::NotOwned { .. })
    ));
    assert_eq!(registry(&dir).allocations().await?[GPU].vm.as_deref(), Some("a"));
    Ok(())
}
