pub mod hypervisor;
pub mod libvirt;
pub mod lifecycle;
pub mod mock;
pub mod vm;

// flat paths for the orchestrators and the CLI
pub use hypervisor::{
    DomainDefinition, DomainStatus, Hypervisor, NetworkDefinition, PoolDefinition, StopMode,
    VolumeDefinition,
};
pub use libvirt::VirshHypervisor;
pub use lifecycle::{ShutdownPolicy, StopOutcome, VmLifecycle};
pub use mock::MockHypervisor;
pub use vm::{VmEvent, VmState};
