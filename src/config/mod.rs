pub mod cluster;
pub mod settings;
pub mod validation;

pub use cluster::{
    ClusterConfigDocument, ClusterSpec, DeviceType, NetworkSpec, PciDeviceSpec, ProvisioningSpec,
    SystemConfig, VmSpec,
};
pub use settings::Settings;
pub use validation::{is_pci_address, validate_schema};
