/*
* Cluster state persistence
* -------------------------
* @module: state/store
*
* One JSON document holds every cluster record plus the shared passthrough
* ownership table. Each CLI invocation loads it, mutates it in memory, and
* writes it back once.
*
* Write path (crash at any point leaves either the old or the new file):
*   1. serialize into a private temp file next to the target, fsync
*   2. copy the current file to `<state>.backup`
*   3. rename the temp file over the target, fsync the directory
*
* Concurrent invocations serialize on an flock(2) held on `<state>.lock`
* for the whole load-mutate-save cycle (see `Transaction`).
*/

use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::ops::{Deref, DerefMut};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::GlobalState;
use crate::errors::{ManagerResult, StateError};

const PRIVATE_MODE: u32 = 0o600;

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        with_suffix(&self.path, ".backup")
    }

    pub fn lock_path(&self) -> PathBuf {
        with_suffix(&self.path, ".lock")
    }

    /// Current state; an absent file is a fresh, empty state.
    pub fn load(&self) -> ManagerResult<GlobalState> {
        match read_state(&self.path, &self.backup_path())? {
            Some(state) => Ok(state),
            None => {
                debug!(path = %self.path.display(), "No state file yet, starting empty");
                Ok(GlobalState::default())
            }
        }
    }

    pub fn save(&self, state: &GlobalState) -> ManagerResult<()> {
        let _lock = StateLock::acquire(&self.lock_path())?;
        self.save_locked(state)
    }

    fn save_locked(&self, state: &GlobalState) -> ManagerResult<()> {
        let staged = self.stage(state)?;
        if self.path.exists() {
            copy_private(&self.path, &self.backup_path())?;
        }
        staged.commit()
    }

    /// Serialize `state` into a synced temp file without touching the live one.
    pub(crate) fn stage(&self, state: &GlobalState) -> ManagerResult<StagedWrite> {
        let dir = parent_dir(&self.path);
        fs::create_dir_all(&dir).map_err(|e| StateError::io("create directory", &dir, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.json".to_string());
        let temp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let bytes = serde_json::to_vec_pretty(state).map_err(StateError::from)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(PRIVATE_MODE)
            .open(&temp)
            .map_err(|e| StateError::io("create", &temp, e))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| StateError::io("write", &temp, e))?;

        Ok(StagedWrite {
            temp,
            target: self.path.clone(),
            done: false,
        })
    }

    /// Copy the live file to the backup slot.
    pub fn backup(&self) -> ManagerResult<PathBuf> {
        let _lock = StateLock::acquire(&self.lock_path())?;
        if !self.path.exists() {
            return Err(StateError::Missing(self.path.clone()).into());
        }
        let backup = self.backup_path();
        copy_private(&self.path, &backup)?;
        info!(backup = %backup.display(), "State backed up");
        Ok(backup)
    }

    /// Replace the live file with the backup after checking the backup parses.
    ///
    /// The file being replaced is kept as `<state>.pre-restore`.
    pub fn restore_backup(&self) -> ManagerResult<GlobalState> {
        let _lock = StateLock::acquire(&self.lock_path())?;
        let backup = self.backup_path();
        let state = read_state(&backup, &backup)?.ok_or_else(|| StateError::Missing(backup.clone()))?;

        if self.path.exists() {
            copy_private(&self.path, &with_suffix(&self.path, ".pre-restore"))?;
        }
        self.stage(&state)?.commit()?;
        warn!(from = %backup.display(), "State restored from backup");
        Ok(state)
    }

    /// Lock the store and load it; the lock is held until the transaction
    /// is committed or dropped.
    pub fn begin(&self) -> ManagerResult<Transaction> {
        let lock = StateLock::acquire(&self.lock_path())?;
        let state = self.load()?;
        Ok(Transaction {
            store: self.clone(),
            original: state.clone(),
            state,
            _lock: lock,
        })
    }

    pub async fn begin_async(&self) -> ManagerResult<Transaction> {
        let store = self.clone();
        blocking(move || store.begin()).await
    }

    pub async fn load_async(&self) -> ManagerResult<GlobalState> {
        let store = self.clone();
        blocking(move || store.load()).await
    }

    /// Load, apply `f`, and save, all under the lock. Nothing is written when
    /// `f` fails.
    pub async fn update<F, T>(&self, f: F) -> ManagerResult<T>
    where
        F: FnOnce(&mut GlobalState) -> ManagerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        blocking(move || {
            let mut tx = store.begin()?;
            let out = f(&mut tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> ManagerResult<T>
where
    F: FnOnce() -> ManagerResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StateError::Worker(e.to_string()))?
}

/// Locked, in-memory copy of the state.
pub struct Transaction {
    store: StateStore,
    original: GlobalState,
    state: GlobalState,
    _lock: StateLock,
}

impl Transaction {
    pub fn is_dirty(&self) -> bool {
        self.state != self.original
    }

    /// Persist the changes (if any) and release the lock.
    pub fn commit(mut self) -> ManagerResult<GlobalState> {
        if self.is_dirty() {
            self.state.last_updated = Some(Utc::now());
            self.store.save_locked(&self.state)?;
        }
        Ok(self.state)
    }

    pub async fn commit_async(self) -> ManagerResult<GlobalState> {
        blocking(move || self.commit()).await
    }
}

impl Deref for Transaction {
    type Target = GlobalState;

    fn deref(&self) -> &GlobalState {
        &self.state
    }
}

impl DerefMut for Transaction {
    fn deref_mut(&mut self) -> &mut GlobalState {
        &mut self.state
    }
}

/// Temp file waiting to be renamed over the live state.
pub(crate) struct StagedWrite {
    temp: PathBuf,
    target: PathBuf,
    done: bool,
}

impl StagedWrite {
    pub(crate) fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub(crate) fn commit(mut self) -> ManagerResult<()> {
        fs::rename(&self.temp, &self.target).map_err(|e| StateError::io("replace", &self.target, e))?;
        self.done = true;
        let dir = parent_dir(&self.target);
        File::open(&dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| StateError::io("sync directory", &dir, e))?;
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.done {
            let _ = fs::remove_file(&self.temp);
        }
    }
}

/// Exclusive flock(2) on the lock file, released on drop.
pub struct StateLock {
    file: File,
}

impl StateLock {
    pub fn acquire(path: &Path) -> ManagerResult<Self> {
        let dir = parent_dir(path);
        fs::create_dir_all(&dir).map_err(|e| StateError::io("create directory", &dir, e))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(PRIVATE_MODE)
            .open(path)
            .map_err(|e| StateError::io("open lock", path, e))?;

        loop {
            // SAFETY: the descriptor belongs to `file`, which outlives the call
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(StateError::io("lock", path, err).into());
            }
        }
        debug!(lock = %path.display(), "State lock acquired");
        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        // SAFETY: see acquire; closing the file would release it anyway
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn read_state(path: &Path, backup: &Path) -> ManagerResult<Option<GlobalState>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StateError::io("read", path, e).into()),
    };
    let corrupt = |message: String| StateError::Corruption {
        path: path.to_path_buf(),
        backup: backup.to_path_buf(),
        message,
    };
    if text.trim().is_empty() {
        return Err(corrupt("file is empty".to_string()).into());
    }
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| corrupt(e.to_string()).into())
}

fn copy_private(from: &Path, to: &Path) -> ManagerResult<()> {
    fs::copy(from, to).map_err(|e| StateError::io("copy to", to, e))?;
    fs::set_permissions(to, fs::Permissions::from_mode(PRIVATE_MODE))
        .map_err(|e| StateError::io("restrict", to, e))?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::VmState;
    use crate::state::{ClusterState, ClusterType, GpuOwnership, NetworkInfo, VmInfo, VmRole};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("output/state.json"));
        (dir, store)
    }

    fn sample_state() -> GlobalState {
        let mut cluster = ClusterState::new("hpc", ClusterType::Hpc);
        cluster.networks.push(NetworkInfo {
            name: "hpc-network".into(),
            subnet: "192.168.100.0/24".into(),
            bridge: "virbr100".into(),
        });
        cluster.upsert_vm(VmInfo {
            name: "hpc-compute-01".into(),
            role: VmRole::Compute,
            cpu_cores: 8,
            memory_gb: 16,
            state: VmState::Running,
            ip_address: Some("192.168.100.11".into()),
            gpu_count: 1,
            pci_addresses: vec!["0000:01:00.0".into()],
            volumes: vec!["/pool/hpc-compute-01.qcow2".into()],
            created_at: Utc::now(),
            last_seen: Some(Utc::now()),
            auto_start: true,
        });

        let mut state = GlobalState::default();
        state.clusters.insert("hpc".into(), cluster);
        state.gpu_allocations.insert(
            "0000:01:00.0".into(),
            GpuOwnership {
                cluster: "hpc".into(),
                vm: Some("hpc-compute-01".into()),
                driver: Some("vfio-pci".into()),
                iommu_group: Some(14),
                acquired_at: Utc::now(),
            },
        );
        state
    }

    #[test]
    fn missing_file_loads_empty_state() {
        let (_dir, store) = store();
        assert_eq!(store.load().unwrap(), GlobalState::default());
    }

    #[test]
    fn save_then_load_is_identical() {
        let (_dir, store) = store();
        let state = sample_state();
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn corrupt_file_is_reported_not_repaired() {
        let (_dir, store) = store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{ \"version\": 1, \"clusters\": ").unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(
            err,
            crate::errors::ManagerError::State(StateError::Corruption { .. })
        ));
        assert!(err.to_string().contains("state restore"));
        // untouched
        assert_eq!(
            fs::read_to_string(store.path()).unwrap(),
            "{ \"version\": 1, \"clusters\": "
        );
    }

    #[test]
    fn crash_before_rename_keeps_previous_file() {
        let (_dir, store) = store();
        let before = sample_state();
        store.save(&before).unwrap();

        let staged = store.stage(&GlobalState::default()).unwrap();
        let temp = staged.temp_path().to_path_buf();
        // process dies here: no rename, no cleanup
        std::mem::forget(staged);

        assert!(temp.exists());
        assert_eq!(store.load().unwrap(), before);
    }

    #[test]
    fn files_are_private() {
        let (_dir, store) = store();
        store.save(&sample_state()).unwrap();
        store.save(&GlobalState::default()).unwrap();

        for path in [store.path().to_path_buf(), store.backup_path()] {
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600, "{}", path.display());
        }
    }

    #[test]
    fn save_keeps_previous_version_as_backup() {
        let (_dir, store) = store();
        let first = sample_state();
        store.save(&first).unwrap();
        store.save(&GlobalState::default()).unwrap();

        let backup = StateStore::new(store.backup_path());
        assert_eq!(backup.load().unwrap(), first);
    }

    #[test]
    fn restore_brings_back_the_backup() {
        let (_dir, store) = store();
        let good = sample_state();
        store.save(&good).unwrap();
        store.backup().unwrap();
        fs::write(store.path(), "garbage").unwrap();

        assert_eq!(store.restore_backup().unwrap(), good);
        assert_eq!(store.load().unwrap(), good);
        let pre = fs::read_to_string(with_suffix(store.path(), ".pre-restore")).unwrap();
        assert_eq!(pre, "garbage");
    }

    #[test]
    fn backup_without_state_file_fails() {
        let (_dir, store) = store();
        let err = store.backup().unwrap_err();
        assert_eq!(err.exit_code(), crate::errors::EXIT_NOT_FOUND);
    }

    #[test]
    fn dropped_transaction_writes_nothing() {
        let (_dir, store) = store();
        {
            let mut tx = store.begin().unwrap();
            tx.clusters.insert("hpc".into(), ClusterState::new("hpc", ClusterType::Hpc));
        }
        assert!(!store.path().exists());
    }

    #[test]
    fn concurrent_transactions_do_not_lose_updates() {
        let (_dir, store) = store();
        let writers = 8;
        let rounds = 10;
        let barrier = Arc::new(Barrier::new(writers));

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for r in 0..rounds {
                        let mut tx = store.begin().unwrap();
                        let name = format!("cluster-{w}-{r}");
                        tx.clusters
                            .insert(name.clone(), ClusterState::new(name, ClusterType::Cloud));
                        tx.commit().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.load().unwrap().clusters.len(), writers * rounds);
    }

    #[tokio::test]
    async fn update_is_all_or_nothing() {
        let (_dir, store) = store();
        store
            .update(|state| {
                state.clusters.insert("hpc".into(), ClusterState::new("hpc", ClusterType::Hpc));
                Ok(())
            })
            .await
            .unwrap();

        let failed: ManagerResult<()> = store
            .update(|state| {
                state.clusters.clear();
                Err(StateError::Worker("boom".into()).into())
            })
            .await;
        assert!(failed.is_err());
        assert!(store.load_async().await.unwrap().cluster("hpc").is_some());
    }
}
