pub mod allocator;
pub mod passthrough;

pub use allocator::{find_conflict, Claimant, ConflictInfo, DeviceBinding, GpuAllocator, GpuRegistry};
pub use passthrough::{validate_pcie_readiness, HostEnvironment, PciDevice, PcieReadiness};
