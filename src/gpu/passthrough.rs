/*
* PCIe Passthrough Host Checks
* ----------------------------
* @module: gpu/passthrough
*
* Read-only view of the host as far as VFIO passthrough is concerned:
*
*   - which driver a PCI function is bound to (sysfs `driver` symlink)
*   - which IOMMU group it sits in (sysfs `iommu_group` symlink)
*   - whether the VFIO modules are loaded (/proc/modules, /sys/module)
*   - whether the kernel was booted with the IOMMU on (/proc/cmdline)
*   - whether KVM is usable (/dev/kvm)
*
* Nothing here binds or unbinds drivers. Devices are expected to be bound
* to vfio-pci by the operator (or by libvirt's managed hostdev) before a
* cluster is started.
*
* All paths hang off a `HostEnvironment` so tests can build a fake sysfs
* inside a temp directory.
*/

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::allocator::DeviceBinding;
use crate::config::SystemConfig;
use crate::errors::{ConfigError, ManagerResult, SystemError};
use crate::state::GlobalState;
use crate::utils::os;

pub const REQUIRED_VFIO_MODULES: [&str; 3] = ["vfio", "vfio_iommu_type1", "vfio_pci"];
pub const CONFLICTING_DRIVERS: [&str; 4] = ["nvidia", "nouveau", "radeon", "amdgpu"];
const IOMMU_KERNEL_FLAGS: [&str; 4] = ["intel_iommu=on", "amd_iommu=on", "iommu=pt", "iommu=on"];

pub fn is_vfio_driver(driver: &str) -> bool {
    driver.starts_with("vfio")
}

pub fn is_conflicting_driver(driver: &str) -> bool {
    CONFLICTING_DRIVERS.iter().any(|bad| driver.contains(bad))
}

#[derive(Debug, Clone)]
pub struct HostEnvironment {
    sys_root: PathBuf,
    proc_root: PathBuf,
    dev_root: PathBuf,
    arch: String,
}

impl HostEnvironment {
    pub fn system() -> Self {
        Self {
            sys_root: PathBuf::from("/sys"),
            proc_root: PathBuf::from("/proc"),
            dev_root: PathBuf::from("/dev"),
            arch: os::host_arch().to_string(),
        }
    }

    /// Host whose `sys`, `proc` and `dev` trees live under `root`.
    pub fn rooted(root: &Path, arch: impl Into<String>) -> Self {
        Self {
            sys_root: root.join("sys"),
            proc_root: root.join("proc"),
            dev_root: root.join("dev"),
            arch: arch.into(),
        }
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    fn pci_devices_dir(&self) -> PathBuf {
        self.sys_root.join("bus/pci/devices")
    }

    pub fn device_exists(&self, pci_address: &str) -> bool {
        self.pci_devices_dir().join(pci_address).exists()
    }

    pub fn current_driver(&self, pci_address: &str) -> Option<String> {
        link_name(&self.pci_devices_dir().join(pci_address).join("driver"))
    }

    pub fn iommu_group(&self, pci_address: &str) -> Option<u32> {
        link_name(&self.pci_devices_dir().join(pci_address).join("iommu_group"))?
            .parse()
            .ok()
    }

    pub fn binding(&self, pci_address: &str) -> DeviceBinding {
        DeviceBinding {
            driver: self.current_driver(pci_address),
            iommu_group: self.iommu_group(pci_address),
        }
    }

    fn attribute(&self, pci_address: &str, name: &str) -> Option<String> {
        fs::read_to_string(self.pci_devices_dir().join(pci_address).join(name))
            .ok()
            .map(|v| v.trim().to_string())
    }

    /// Modules listed in /proc/modules plus those built into the kernel.
    pub fn loaded_modules(&self) -> BTreeSet<String> {
        let mut modules: BTreeSet<String> = fs::read_to_string(self.proc_root.join("modules"))
            .unwrap_or_default()
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect();
        if let Ok(entries) = fs::read_dir(self.sys_root.join("module")) {
            modules.extend(entries.flatten().map(|e| e.file_name().to_string_lossy().into_owned()));
        }
        modules
    }

    pub fn kvm_available(&self) -> bool {
        self.dev_root.join("kvm").exists()
    }

    pub fn iommu_enabled(&self) -> bool {
        let cmdline = fs::read_to_string(self.proc_root.join("cmdline")).unwrap_or_default();
        if IOMMU_KERNEL_FLAGS.iter().any(|flag| cmdline.contains(flag)) {
            return true;
        }
        // some distros enable it by default; populated groups are proof enough
        fs::read_dir(self.sys_root.join("kernel/iommu_groups"))
            .map(|mut groups| groups.next().is_some())
            .unwrap_or(false)
    }

    /// Every PCI function on the host, sorted by address.
    pub fn list_pci_devices(&self) -> io::Result<Vec<PciDevice>> {
        let mut devices = Vec::new();
        for entry in fs::read_dir(self.pci_devices_dir())? {
            let address = entry?.file_name().to_string_lossy().into_owned();
            devices.push(PciDevice {
                class: self.attribute(&address, "class").unwrap_or_default(),
                vendor_id: self.attribute(&address, "vendor").unwrap_or_default(),
                device_id: self.attribute(&address, "device").unwrap_or_default(),
                driver: self.current_driver(&address),
                iommu_group: self.iommu_group(&address),
                address,
            });
        }
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(devices)
    }
}

fn link_name(link: &Path) -> Option<String> {
    fs::read_link(link)
        .ok()?
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    pub address: String,
    pub class: String,
    pub vendor_id: String,
    pub device_id: String,
    pub driver: Option<String>,
    pub iommu_group: Option<u32>,
}

impl PciDevice {
    /// Display controllers: VGA, 3D and friends (class 0x03xxxx).
    pub fn is_gpu(&self) -> bool {
        self.class.starts_with("0x03")
    }

    pub fn is_vfio_bound(&self) -> bool {
        self.driver.as_deref().map(is_vfio_driver).unwrap_or(false)
    }

    pub fn has_conflicting_driver(&self) -> bool {
        self.driver.as_deref().map(is_conflicting_driver).unwrap_or(false)
    }
}

/// Host readiness check for the passthrough devices a config declares.
pub struct PcieReadiness<'a> {
    host: &'a HostEnvironment,
    ownership: Option<&'a GlobalState>,
}

impl<'a> PcieReadiness<'a> {
    pub fn new(host: &'a HostEnvironment) -> Self {
        Self { host, ownership: None }
    }

    /// Also reject devices currently owned by a different cluster.
    pub fn with_ownership(mut self, state: &'a GlobalState) -> Self {
        self.ownership = Some(state);
        self
    }

    pub fn check(&self, config: &SystemConfig) -> Vec<SystemError> {
        let mut problems = Vec::new();

        if self.host.arch() != os::PASSTHROUGH_ARCH {
            problems.push(SystemError::new(
                "architecture",
                format!("host is {}, passthrough needs {}", self.host.arch(), os::PASSTHROUGH_ARCH),
            ));
        }
        if !self.host.kvm_available() {
            problems.push(
                SystemError::new("kvm", "/dev/kvm is missing")
                    .with_hint("enable virtualization in firmware and load kvm_intel or kvm_amd"),
            );
        }

        let declared: Vec<_> = config
            .clusters()
            .flat_map(|cluster| {
                cluster.vms.iter().flat_map(move |vm| {
                    vm.devices.iter().map(move |dev| (cluster.name.as_str(), vm.name.as_str(), dev))
                })
            })
            .collect();
        if declared.is_empty() {
            debug!("No passthrough devices declared, skipping VFIO checks");
            return problems;
        }

        let modules = self.host.loaded_modules();
        let missing: Vec<&str> = REQUIRED_VFIO_MODULES
            .iter()
            .copied()
            .filter(|m| !modules.contains(*m))
            .collect();
        if !missing.is_empty() {
            problems.push(
                SystemError::new("vfio", format!("kernel modules not loaded: {}", missing.join(", ")))
                    .with_hint(format!("load them with the kernel module loader: {}", missing.join(" "))),
            );
        }
        if !self.host.iommu_enabled() {
            problems.push(
                SystemError::new("iommu", "IOMMU is not enabled")
                    .with_hint("boot with intel_iommu=on or amd_iommu=on (plus iommu=pt)"),
            );
        }

        for (cluster, vm, device) in declared {
            let pci = device.pci_address.as_str();
            if !self.host.device_exists(pci) {
                problems.push(
                    SystemError::new("device", format!("{pci} (declared by {vm}) is not present on this host"))
                        .with_hint("list devices with `gpu-cluster inventory pcie`"),
                );
                continue;
            }

            if let Some(owner) = self.ownership.and_then(|s| s.gpu_allocations.get(pci)) {
                if owner.cluster != cluster {
                    let holder = owner.vm.as_deref().unwrap_or("-");
                    problems.push(
                        SystemError::new(
                            "ownership",
                            format!("{pci} (declared by {vm}) is held by cluster '{}' VM '{holder}'", owner.cluster),
                        )
                        .with_hint(format!("stop cluster '{}' first", owner.cluster)),
                    );
                }
            }

            match self.host.current_driver(pci) {
                Some(driver) if is_conflicting_driver(&driver) => problems.push(
                    SystemError::new("driver", format!("{pci} is bound to host driver {driver}"))
                        .with_hint("unbind it and bind vfio-pci (vfio-pci.ids=<vendor>:<device>)"),
                ),
                Some(driver) if is_vfio_driver(&driver) => {}
                Some(driver) => problems.push(
                    SystemError::new("driver", format!("{pci} is bound to {driver}, expected vfio-pci"))
                        .with_hint("bind the device to vfio-pci"),
                ),
                None => problems.push(
                    SystemError::new("driver", format!("{pci} is not bound to any driver"))
                        .with_hint("bind the device to vfio-pci"),
                ),
            }
        }

        problems
    }
}

/// Fail with `PcieReadiness` unless the host can pass through every
/// declared device. `skip` turns the whole check off.
pub fn validate_pcie_readiness(
    config: &SystemConfig,
    host: &HostEnvironment,
    ownership: Option<&GlobalState>,
    skip: bool,
) -> ManagerResult<()> {
    if skip {
        info!("PCIe passthrough validation skipped");
        return Ok(());
    }
    let mut check = PcieReadiness::new(host);
    if let Some(state) = ownership {
        check = check.with_ownership(state);
    }
    let problems = check.check(config);
    if problems.is_empty() {
        info!("PCIe passthrough validation passed");
        Ok(())
    } else {
        Err(ConfigError::PcieReadiness(problems).into())
    }
}
