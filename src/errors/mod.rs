/*
* Error taxonomy
* --------------
* @module: errors
*
* Every failure the manager can surface, grouped by the layer that raises it:
*
*   ConfigError     - bad cluster document, host not ready for passthrough
*   GpuError        - passthrough device owned by someone else
*   StateError      - state file unreadable, corrupt, or not writable
*   HypervisorError - the underlying hypervisor call failed
*   VmError         - lifecycle misuse (unknown VM, illegal transition)
*
* Multi-resource workflows wrap these in `Rollback` (start failed, here is
* what got cleaned up and what did not) or `Aggregate` (best-effort loop,
* here is every resource that failed).
*
* The CLI maps each variant to a process exit code via `exit_code()`.
*/

pub mod handlers;

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::gpu::ConflictInfo;
use crate::core::{VmEvent, VmState};

pub use handlers::FailureLog;

pub type ManagerResult<T> = Result<T, ManagerError>;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_NOT_FOUND: i32 = 2;
pub const EXIT_PERMISSION_DENIED: i32 = 3;
pub const EXIT_INVALID_ARGUMENT: i32 = 4;
pub const EXIT_SYSTEM: i32 = 5;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Configuration Error: {0}")]
    Config(#[from] ConfigError),

    #[error("GPU Error: {0}")]
    Gpu(#[from] GpuError),

    #[error("State Error: {0}")]
    State(#[from] StateError),

    #[error("Hypervisor Error: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("VM Error: {0}")]
    Vm(#[from] VmError),

    #[error("cluster '{0}' has no recorded state")]
    ClusterNotFound(String),

    #[error("provisioning playbook {} failed: {reason}", .playbook.display())]
    Provisioning { playbook: PathBuf, reason: String },

    #[error("cluster '{cluster}' did not reach running: {}", .vms.join(", "))]
    NotReady { cluster: String, vms: Vec<String> },

    #[error("{}", rollback_report(.original, .rolled_back, .failures))]
    Rollback {
        original: Box<ManagerError>,
        rolled_back: Vec<String>,
        failures: Vec<ResourceFailure>,
    },

    #[error("{}", aggregate_report(.operation, .failures))]
    Aggregate {
        operation: String,
        failures: Vec<ResourceFailure>,
    },

    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

/// One resource that a best-effort loop could not handle.
#[derive(Debug)]
pub struct ResourceFailure {
    pub resource: String,
    pub error: ManagerError,
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.error)
    }
}

fn rollback_report(
    original: &ManagerError,
    rolled_back: &[String],
    failures: &[ResourceFailure],
) -> String {
    let mut out = format!("{original}");
    if rolled_back.is_empty() {
        out.push_str("\n  rolled back: nothing");
    } else {
        out.push_str(&format!("\n  rolled back: {}", rolled_back.join(", ")));
    }
    if !failures.is_empty() {
        out.push_str("\n  could not remove:");
        for failure in failures {
            out.push_str(&format!("\n    - {failure}"));
        }
    }
    out
}

fn aggregate_report(operation: &str, failures: &[ResourceFailure]) -> String {
    let mut out = format!("{operation} failed for {} resource(s):", failures.len());
    for failure in failures {
        out.push_str(&format!("\n  - {failure}"));
    }
    out
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("schema validation failed:{}", bullet_list(.0))]
    Schema(Vec<FieldError>),

    #[error("host is not ready for PCIe passthrough:{}", bullet_list(.0))]
    PcieReadiness(Vec<SystemError>),

    #[error("no '{0}' cluster is defined in the configuration")]
    MissingCluster(String),

    #[error("settings: {0}")]
    Settings(#[from] ::config::ConfigError),
}

fn bullet_list<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(|item| format!("\n  - {item}")).collect()
}

/// Structural problem in the cluster document, addressed by its dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Host readiness problem with an optional remediation hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemError {
    pub check: String,
    pub message: String,
    pub hint: Option<String>,
}

impl SystemError {
    pub fn new(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for SystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.check, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {hint})")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum GpuError {
    #[error("{0}")]
    ResourceConflict(ConflictInfo),

    #[error("device {pci_address} is not owned by {cluster}/{vm}")]
    NotOwned {
        pci_address: String,
        cluster: String,
        vm: String,
    },

    #[error("device {pci_address} is not declared by VM '{vm}'")]
    NotDeclared { pci_address: String, vm: String },
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error(
        "state file {} is corrupt ({message}); it was left untouched. \
         Inspect it, or run `gpu-cluster state restore` to roll back to {}",
        .path.display(),
        .backup.display()
    )]
    Corruption {
        path: PathBuf,
        backup: PathBuf,
        message: String,
    },

    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no state file at {}", .0.display())]
    Missing(PathBuf),

    #[error("state worker failed: {0}")]
    Worker(String),
}

impl StateError {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StateError::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
#[error("{action} {resource} failed: {message}")]
pub struct HypervisorError {
    pub action: String,
    pub resource: String,
    pub message: String,
}

impl HypervisorError {
    pub fn new(
        action: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum VmError {
    #[error("VM '{vm}' not found in cluster '{cluster}'")]
    NotFound { cluster: String, vm: String },

    #[error("VM '{vm}' cannot {event} while {from}")]
    InvalidTransition {
        vm: String,
        from: VmState,
        event: VmEvent,
    },
}

impl ManagerError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ManagerError::Config(err) => match err {
                ConfigError::Read { source, .. } => io_exit_code(source),
                ConfigError::PcieReadiness(_) => EXIT_SYSTEM,
                ConfigError::Parse { .. }
                | ConfigError::Schema(_)
                | ConfigError::MissingCluster(_)
                | ConfigError::Settings(_) => EXIT_INVALID_ARGUMENT,
            },
            ManagerError::State(err) => match err {
                StateError::Io { source, .. } => io_exit_code(source),
                StateError::Missing(_) => EXIT_NOT_FOUND,
                _ => EXIT_FAILURE,
            },
            ManagerError::Hypervisor(_) => EXIT_SYSTEM,
            ManagerError::Vm(VmError::NotFound { .. }) | ManagerError::ClusterNotFound(_) => {
                EXIT_NOT_FOUND
            }
            ManagerError::Vm(VmError::InvalidTransition { .. }) => EXIT_INVALID_ARGUMENT,
            ManagerError::Rollback { original, .. } => original.exit_code(),
            ManagerError::Aggregate { failures, .. } => failures
                .first()
                .map(|failure| failure.error.exit_code())
                .unwrap_or(EXIT_FAILURE),
            ManagerError::Gpu(GpuError::NotDeclared { .. }) => EXIT_INVALID_ARGUMENT,
            ManagerError::Gpu(_)
            | ManagerError::Provisioning { .. }
            | ManagerError::NotReady { .. }
            | ManagerError::Cancelled(_) => EXIT_FAILURE,
        }
    }

    /// True when the error (or the error behind a rollback) is a GPU ownership conflict.
    pub fn is_resource_conflict(&self) -> bool {
        match self {
            ManagerError::Gpu(GpuError::ResourceConflict(_)) => true,
            ManagerError::Rollback { original, .. } => original.is_resource_conflict(),
            _ => false,
        }
    }
}

fn io_exit_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::NotFound => EXIT_NOT_FOUND,
        io::ErrorKind::PermissionDenied => EXIT_PERMISSION_DENIED,
        _ => EXIT_FAILURE,
    }
}
