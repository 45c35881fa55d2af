//! Hand-off to configuration management once a cluster's VMs are up.
//!
//! Only the exit status matters here; playbook content is opaque.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ProvisioningSpec;
use crate::errors::{ManagerError, ManagerResult};

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, cluster: &str, spec: &ProvisioningSpec) -> ManagerResult<()>;
}

/// Runs `ansible-playbook [-i inventory] playbook`.
pub struct AnsiblePlaybook {
    binary: String,
}

impl AnsiblePlaybook {
    pub fn new() -> Self {
        Self {
            binary: "ansible-playbook".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for AnsiblePlaybook {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for AnsiblePlaybook {
    async fn provision(&self, cluster: &str, spec: &ProvisioningSpec) -> ManagerResult<()> {
        let mut cmd = Command::new(&self.binary);
        if let Some(inventory) = &spec.inventory {
            cmd.arg("-i").arg(inventory);
        }
        cmd.arg(&spec.playbook)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(cluster = %cluster, playbook = %spec.playbook.display(), "Running provisioning playbook");
        let output = cmd.output().await.map_err(|err| ManagerError::Provisioning {
            playbook: spec.playbook.clone(),
            reason: format!("cannot run {}: {err}", self.binary),
        })?;

        if output.status.success() {
            info!(cluster = %cluster, "Provisioning finished");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = match output.status.code() {
            Some(code) => format!("exit code {code}: {}", stderr.trim()),
            None => "terminated by signal".to_string(),
        };
        warn!(cluster = %cluster, reason = %reason, "Provisioning failed");
        Err(ManagerError::Provisioning {
            playbook: spec.playbook.clone(),
            reason,
        })
    }
}

/// Leaves freshly started VMs unconfigured (`--no-provision`).
pub struct SkipProvisioning;

#[async_trait]
impl Provisioner for SkipProvisioning {
    async fn provision(&self, cluster: &str, spec: &ProvisioningSpec) -> ManagerResult<()> {
        info!(cluster = %cluster, playbook = %spec.playbook.display(), "Provisioning skipped");
        Ok(())
    }
}
