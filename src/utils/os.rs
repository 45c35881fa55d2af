use serde::{Deserialize, Serialize};
use std::fmt;

/// The only architecture the domain XML and VFIO checks target.
pub const PASSTHROUGH_ARCH: &str = "x86_64";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOS,
    Windows,
    Unknown,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Linux => "linux",
            Platform::MacOS => "macos",
            Platform::Windows => "windows",
            Platform::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[cfg(target_os = "linux")]
pub fn current_platform() -> Platform {
    Platform::Linux
}

#[cfg(target_os = "macos")]
pub fn current_platform() -> Platform {
    Platform::MacOS
}

#[cfg(target_os = "windows")]
pub fn current_platform() -> Platform {
    Platform::Windows
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub fn current_platform() -> Platform {
    Platform::Unknown
}

pub fn host_arch() -> &'static str {
    std::env::consts::ARCH
}

/// KVM with VFIO passthrough only exists on Linux x86_64 hosts.
pub fn supports_passthrough(platform: Platform, arch: &str) -> bool {
    platform == Platform::Linux && arch == PASSTHROUGH_ARCH
}
