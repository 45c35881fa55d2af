pub mod models;
pub mod store;

pub use models::{
    ClusterState, ClusterStatus, ClusterType, GlobalState, GpuOwnership, NetworkInfo,
    StoragePoolInfo, VmInfo, VmRole, VmState, VolumeInfo,
};
pub use store::{StateLock, StateStore, Transaction};
