//! Undo log for a cluster start.
//!
//! Every resource the start workflow creates is pushed here right after the
//! hypervisor confirms it. On failure the stack is unwound newest-first and
//! each step is attempted even when an earlier one fails.

use std::fmt;
use tracing::{info, warn};

use crate::core::VmLifecycle;
use crate::errors::{FailureLog, ManagerError, ResourceFailure};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackStep {
    Pool { name: String },
    Network { name: String },
    Volume { pool: String, name: String },
    /// Domain created by this attempt: stop and undefine it.
    Vm { name: String },
    /// Domain that existed before this attempt: only stop it again.
    StopVm { name: String },
}

impl fmt::Display for RollbackStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackStep::Pool { name } => write!(f, "storage pool {name}"),
            RollbackStep::Network { name } => write!(f, "network {name}"),
            RollbackStep::Volume { name, .. } => write!(f, "volume {name}"),
            RollbackStep::Vm { name } => write!(f, "vm {name}"),
            RollbackStep::StopVm { name } => write!(f, "vm {name} (stop)"),
        }
    }
}

#[derive(Debug, Default)]
pub struct RollbackStack {
    steps: Vec<RollbackStep>,
}

impl RollbackStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: RollbackStep) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[RollbackStep] {
        &self.steps
    }

    /// Undo everything in reverse creation order.
    pub async fn unwind(self, lifecycle: &VmLifecycle) -> RollbackReport {
        let hypervisor = lifecycle.hypervisor();
        let mut failures = FailureLog::new("rollback");
        let mut rolled_back = Vec::new();
        let mut leftovers = Vec::new();

        for step in self.steps.into_iter().rev() {
            let result = match &step {
                RollbackStep::Vm { name } => lifecycle.teardown(name).await,
                RollbackStep::StopVm { name } => lifecycle.shutdown(name).await.map(|_| ()),
                RollbackStep::Volume { pool, name } => hypervisor.delete_volume(pool, name).await,
                RollbackStep::Network { name } => hypervisor.destroy_network(name).await,
                RollbackStep::Pool { name } => hypervisor.destroy_pool(name).await,
            };
            match result {
                Ok(()) => {
                    info!(step = %step, "Rolled back");
                    rolled_back.push(step);
                }
                Err(err) => {
                    failures.push(step.to_string(), err);
                    leftovers.push(step);
                }
            }
        }

        if !leftovers.is_empty() {
            warn!(remaining = leftovers.len(), "Rollback left resources behind");
        }
        RollbackReport {
            rolled_back,
            leftovers,
            failures: failures.into_failures(),
        }
    }
}

#[derive(Debug)]
pub struct RollbackReport {
    pub rolled_back: Vec<RollbackStep>,
    /// Steps that failed, same order as `failures`.
    pub leftovers: Vec<RollbackStep>,
    pub failures: Vec<ResourceFailure>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Combine the error that triggered the rollback with what it did.
    pub fn into_error(self, original: ManagerError) -> ManagerError {
        ManagerError::Rollback {
            original: Box::new(original),
            rolled_back: self.rolled_back.iter().map(ToString::to_string).collect(),
            failures: self.failures,
        }
    }
}
