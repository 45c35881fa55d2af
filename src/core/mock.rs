//! In-memory hypervisor for dry runs and the test-suite.
//!
//! Keeps a log of every call so callers can assert on ordering, and lets a
//! test make chosen operations fail or make a guest ignore ACPI shutdown.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use super::hypervisor::{
    DomainDefinition, DomainStatus, Hypervisor, NetworkDefinition, PoolDefinition, StopMode,
    VolumeDefinition,
};
use crate::core::VmState;
use crate::errors::{HypervisorError, ManagerResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorCall {
    pub op: String,
    pub target: String,
}

#[derive(Debug)]
struct MockDomain {
    definition: DomainDefinition,
    state: VmState,
    ip_address: Option<String>,
    /// Devices the running guest sees; reset from the definition on start.
    attached: Vec<String>,
}

#[derive(Debug)]
struct FailureRule {
    op: String,
    target: String,
    remaining: Option<u32>,
    /// Fail after the side effect instead of before it.
    after: bool,
}

#[derive(Debug, Default)]
struct Inner {
    domains: BTreeMap<String, MockDomain>,
    networks: BTreeSet<String>,
    pools: BTreeMap<String, PathBuf>,
    volumes: BTreeMap<(String, String), String>,
    calls: Vec<HypervisorCall>,
    failures: Vec<FailureRule>,
    stubborn: BTreeSet<String>,
    next_ip: u8,
}

impl Inner {
    fn enter(&mut self, op: &str, target: &str) -> ManagerResult<()> {
        self.calls.push(HypervisorCall {
            op: op.to_string(),
            target: target.to_string(),
        });
        self.check(op, target, false)
    }

    /// Called once the side effect of `op` is in place.
    fn leave(&mut self, op: &str, target: &str) -> ManagerResult<()> {
        self.check(op, target, true)
    }

    fn check(&mut self, op: &str, target: &str, after: bool) -> ManagerResult<()> {
        let hit = self.failures.iter_mut().find(|rule| {
            rule.after == after && rule.op == op && (rule.target == target || rule.target == "*")
        });
        if let Some(rule) = hit {
            match rule.remaining.as_mut() {
                Some(0) => return Ok(()),
                Some(n) => *n -= 1,
                None => {}
            }
            return Err(HypervisorError::new(op, target, "injected failure").into());
        }
        Ok(())
    }

    fn domain_mut(&mut self, op: &str, name: &str) -> ManagerResult<&mut MockDomain> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::new(op, name, "domain not found").into())
    }
}

#[derive(Debug, Default)]
pub struct MockHypervisor {
    inner: Mutex<Inner>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking test thread must not hide the log from the others
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_rule(&self, op: &str, target: &str, remaining: Option<u32>, after: bool) {
        self.lock().failures.push(FailureRule {
            op: op.into(),
            target: target.into(),
            remaining,
            after,
        });
    }

    /// Every future `op` on `target` fails. `target` may be `*`.
    pub fn fail_on(&self, op: &str, target: &str) {
        self.add_rule(op, target, None, false);
    }

    /// The next `op` on `target` fails, later ones succeed.
    pub fn fail_once(&self, op: &str, target: &str) {
        self.add_rule(op, target, Some(1), false);
    }

    /// The next `op` on `target` does its work and then reports failure,
    /// like a multi-step create that died half way and could not clean up
    /// after itself. Honoured by `define` and the network, pool and volume
    /// creates.
    pub fn fail_after_once(&self, op: &str, target: &str) {
        self.add_rule(op, target, Some(1), true);
    }

    /// The guest ignores graceful shutdown and keeps running.
    pub fn ignore_shutdown(&self, name: &str) {
        self.lock().stubborn.insert(name.into());
    }

    /// Force a domain into `state`, e.g. to simulate a guest crash.
    pub fn set_state(&self, name: &str, state: VmState) {
        if let Some(domain) = self.lock().domains.get_mut(name) {
            domain.state = state;
        }
    }

    pub fn calls(&self) -> Vec<HypervisorCall> {
        self.lock().calls.clone()
    }

    /// Calls that change something, i.e. everything except `status`.
    pub fn mutating_calls(&self) -> Vec<HypervisorCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.op != "status")
            .cloned()
            .collect()
    }

    pub fn domain_state(&self, name: &str) -> Option<VmState> {
        self.lock().domains.get(name).map(|d| d.state)
    }

    pub fn domain_hostdevs(&self, name: &str) -> Option<Vec<String>> {
        self.lock().domains.get(name).map(|d| d.definition.hostdevs.clone())
    }

    /// Devices the running guest currently sees.
    pub fn attached_devices(&self, name: &str) -> Option<Vec<String>> {
        self.lock().domains.get(name).map(|d| d.attached.clone())
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.lock().domains.keys().cloned().collect()
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains(name)
    }

    pub fn has_pool(&self, name: &str) -> bool {
        self.lock().pools.contains_key(name)
    }

    pub fn volume_count(&self) -> usize {
        self.lock().volumes.len()
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn define(&self, domain: &DomainDefinition) -> ManagerResult<()> {
        let mut inner = self.lock();
        inner.enter("define", &domain.name)?;
        if inner.domains.contains_key(&domain.name) {
            return Err(HypervisorError::new("define", &domain.name, "domain already exists").into());
        }
        inner.domains.insert(
            domain.name.clone(),
            MockDomain {
                definition: domain.clone(),
                state: VmState::Shutoff,
                ip_address: None,
                attached: Vec::new(),
            },
        );
        inner.leave("define", &domain.name)
    }

    async fn start(&self, name: &str) -> ManagerResult<()> {
        let mut inner = self.lock();
        inner.enter("start", name)?;
        inner.next_ip = inner.next_ip.wrapping_add(1).max(2);
        let ip = format!("192.168.100.{}", inner.next_ip);
        let domain = inner.domain_mut("start", name)?;
        if !matches!(domain.state, VmState::Shutoff | VmState::Crashed) {
            return Err(HypervisorError::new("start", name, "domain is already active").into());
        }
        domain.state = VmState::Running;
        domain.ip_address = Some(ip);
        domain.attached = domain.definition.hostdevs.clone();
        Ok(())
    }

    async fn stop(&self, name: &str, mode: StopMode) -> ManagerResult<()> {
        let mut inner = self.lock();
        let op = match mode {
            StopMode::Graceful => "shutdown",
            StopMode::Force => "force_stop",
        };
        inner.enter(op, name)?;
        let stubborn = inner.stubborn.contains(name);
        let domain = inner.domain_mut(op, name)?;
        if mode == StopMode::Graceful && stubborn {
            return Ok(());
        }
        domain.state = VmState::Shutoff;
        domain.ip_address = None;
        domain.attached.clear();
        Ok(())
    }

    async fn pause(&self, name: &str) -> ManagerResult<()> {
        let mut inner = self.lock();
        inner.enter("pause", name)?;
        let domain = inner.domain_mut("pause", name)?;
        if domain.state != VmState::Running {
            return Err(HypervisorError::new("pause", name, "domain is not running").into());
        }
        domain.state = VmState::Paused;
        Ok(())
    }

    async fn resume(&self, name: &str) -> ManagerResult<()> {
        let mut inner = self.lock();
        inner.enter("resume", name)?;
        let domain = inner.domain_mut("resume", name)?;
        if domain.state != VmState::Paused {
            return Err(HypervisorError::new("resume", name, "domain is not paused").into());
        }
        domain.state = VmState::Running;
        Ok(())
    }

    async fn destroy(&self, name: &str) -> ManagerResult<()> {
        let mut inner = self.lock();
        inner.enter("destroy", name)?;
        let domain = inner.domain_mut("destroy", name)?;
        if domain.state.is_active() {
            return Err(HypervisorError::new("destroy", name, "domain is still active").into());
        }
        inner.domains.remove(name);
        Ok(())
    }

    async fn status(&self, name: &str) -> ManagerResult<DomainStatus> {
        let mut inner = self.lock();
        inner.enter("status", name)?;
        Ok(inner
            .domains
            .get(name)
            .map(|d| DomainStatus {
                state: d.state,
                ip_address: d.ip_address.clone(),
            })
            .unwrap_or_else(DomainStatus::undefined))
    }

    async fn attach_device(&self, name: &str, pci_address: &str) -> ManagerResult<()> {
        let mut inner = self.lock();
        inner.enter("attach_device", name)?;
        let domain = inner.domain_mut("attach_device", name)?;
        if !domain.state.is_active() {
            return Err(HypervisorError::new("attach_device", name, "domain is not running").into());
        }
        if !domain.attached.iter().any(|pci| pci == pci_address) {
            domain.attached.push(pci_address.to_string());
        }
        Ok(())
    }

    async fn detach_device(&self, name: &str, pci_address: &str) -> ManagerResult<()> {
        let mut inner = self.lock();
        inner.enter("detach_device", name)?;
        let domain = inner.domain_mut("detach_device", name)?;
        if !domain.state.is_active() {
            return Err(HypervisorError::new("detach_device", name, "domain is not running").into());
        }
        domain.attached.retain(|pci| pci != pci_address);
        Ok(())
    }

    async fn create_network(&self, network: &NetworkDefinition) -> ManagerResult<()> {
        let mut inner = self.lock();
        inner.enter("create_network", &network.name)?;
        if !inner.networks.insert(network.name.clone()) {
            return Err(
                HypervisorError::new("create_network", &network.name, "network already exists").into(),
            );
        }
        inner.leave("create_network", &network.name)
    }

    async fn destroy_network(&self, name: &str) -> ManagerResult<()> {
        let mut inner = self.lock();
        inner.enter("destroy_network", name)?;
        inner.networks.remove(name);
        Ok(())
    }

    async fn create_pool(&self, pool: &PoolDefinition) -> ManagerResult<()> {
        let mut inner = self.lock();
        inner.enter("create_pool", &pool.name)?;
        if inner.pools.contains_key(&pool.name) {
            return Err(HypervisorError::new("create_pool", &pool.name, "pool already exists").into());
        }
        inner.pools.insert(pool.name.clone(), pool.path.clone());
        inner.leave("create_pool", &pool.name)
    }

    async fn destroy_pool(&self, name: &str) -> ManagerResult<()> {
        let mut inner = self.lock();
        inner.enter("destroy_pool", name)?;
        inner.pools.remove(name);
        Ok(())
    }

    async fn create_volume(&self, volume: &VolumeDefinition) -> ManagerResult<String> {
        let mut inner = self.lock();
        inner.enter("create_volume", &volume.name)?;
        let pool_path = inner.pools.get(&volume.pool).cloned().ok_or_else(|| {
            HypervisorError::new("create_volume", &volume.name, format!("pool {} not found", volume.pool))
        })?;
        let path = pool_path.join(&volume.name).to_string_lossy().into_owned();
        inner
            .volumes
            .insert((volume.pool.clone(), volume.name.clone()), path.clone());
        inner.leave("create_volume", &volume.name)?;
        Ok(path)
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> ManagerResult<()> {
        let mut inner = self.lock();
        inner.enter("delete_volume", name)?;
        inner.volumes.remove(&(pool.to_string(), name.to_string()));
        Ok(())
    }
}
