pub mod cli;
pub mod cluster;
pub mod config;
pub mod core;
pub mod errors;
pub mod gpu;
pub mod state;
pub mod utils;

// Re-exports
pub use cluster::{ClusterManager, SystemManager};
pub use config::{Settings, SystemConfig};
pub use core::{Hypervisor, MockHypervisor, VirshHypervisor, VmLifecycle};
pub use errors::{ManagerError, ManagerResult};
pub use state::{GlobalState, StateStore};
