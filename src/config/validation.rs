use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use super::cluster::{ClusterConfigDocument, ClusterDocument, DeviceType, NodeDocument};
use crate::errors::FieldError;

/// `DDDD:BB:SS.F` with hex domain, bus and slot and a function in 0-7.
pub fn is_pci_address(text: &str) -> bool {
    let bytes = text.as_bytes();
    if bytes.len() != 12 || bytes[4] != b':' || bytes[7] != b':' || bytes[10] != b'.' {
        return false;
    }
    let hex = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_hexdigit);
    hex(0..4) && hex(5..7) && hex(8..10) && (b'0'..=b'7').contains(&bytes[11])
}

fn is_pci_id(text: &str) -> bool {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    digits.len() == 4 && digits.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_subnet(text: &str) -> bool {
    match text.split_once('/') {
        Some((addr, prefix)) => {
            addr.parse::<Ipv4Addr>().is_ok() && prefix.parse::<u8>().map(|p| p <= 32).unwrap_or(false)
        }
        None => false,
    }
}

fn is_resource_name(text: &str) -> bool {
    !text.is_empty()
        && text.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        && text.as_bytes()[0].is_ascii_alphanumeric()
}

/// Structural checks only; nothing on the host is looked at.
///
/// Returns every problem found, empty when the document is valid.
pub fn validate_schema(doc: &ClusterConfigDocument) -> Vec<FieldError> {
    let mut errors = Vec::new();

    match doc.version.as_deref() {
        None => errors.push(FieldError::new("version", "is required")),
        Some(v) if v.trim().is_empty() => errors.push(FieldError::new("version", "must not be empty")),
        _ => {}
    }

    let Some(clusters) = &doc.clusters else {
        errors.push(FieldError::new("clusters", "is required"));
        return errors;
    };
    if clusters.hpc.is_none() && clusters.cloud.is_none() {
        errors.push(FieldError::new("clusters", "must define at least one of hpc, cloud"));
    }

    if let Some(hpc) = &clusters.hpc {
        check_cluster(&mut errors, "clusters.hpc", hpc, ("controller", &hpc.controller), ("compute_nodes", &hpc.compute_nodes));
    }
    if let Some(cloud) = &clusters.cloud {
        check_cluster(
            &mut errors,
            "clusters.cloud",
            cloud,
            ("control_plane", &cloud.control_plane),
            ("worker_nodes", &cloud.worker_nodes),
        );
    }

    if let (Some(hpc), Some(cloud)) = (&clusters.hpc, &clusters.cloud) {
        if hpc.name.is_some() && hpc.name == cloud.name {
            errors.push(FieldError::new("clusters.cloud.name", "must differ from clusters.hpc.name"));
        }
        let (a, b) = (&hpc.network, &cloud.network);
        if let (Some(a), Some(b)) = (a, b) {
            if a.bridge.is_some() && a.bridge == b.bridge {
                errors.push(FieldError::new("clusters.cloud.network.bridge", "is already used by the hpc cluster"));
            }
        }
    }

    errors
}

fn check_cluster(
    errors: &mut Vec<FieldError>,
    path: &str,
    cluster: &ClusterDocument,
    (head_key, head): (&str, &Option<NodeDocument>),
    (nodes_key, nodes): (&str, &Vec<NodeDocument>),
) {
    match cluster.name.as_deref() {
        None => errors.push(FieldError::new(format!("{path}.name"), "is required")),
        Some(name) if !is_resource_name(name) => errors.push(FieldError::new(
            format!("{path}.name"),
            format!("'{name}' may only contain letters, digits, '-' and '_'"),
        )),
        _ => {}
    }

    match &cluster.network {
        None => errors.push(FieldError::new(format!("{path}.network"), "is required")),
        Some(net) => {
            match net.subnet.as_deref() {
                None => errors.push(FieldError::new(format!("{path}.network.subnet"), "is required")),
                Some(s) if !is_subnet(s) => errors.push(FieldError::new(
                    format!("{path}.network.subnet"),
                    format!("'{s}' is not an IPv4 CIDR block"),
                )),
                _ => {}
            }
            if net.bridge.as_deref().map(str::is_empty).unwrap_or(true) {
                errors.push(FieldError::new(format!("{path}.network.bridge"), "is required"));
            }
        }
    }

    if let Some(prov) = &cluster.provisioning {
        if prov.playbook.is_none() {
            errors.push(FieldError::new(format!("{path}.provisioning.playbook"), "is required"));
        }
    }

    // device -> first node path that claimed it
    let mut claimed: BTreeMap<String, String> = BTreeMap::new();

    match head {
        None => errors.push(FieldError::new(format!("{path}.{head_key}"), "is required")),
        Some(node) => check_node(errors, &format!("{path}.{head_key}"), node, &mut claimed),
    }
    for (i, node) in nodes.iter().enumerate() {
        check_node(errors, &format!("{path}.{nodes_key}[{i}]"), node, &mut claimed);
    }
}

fn check_node(errors: &mut Vec<FieldError>, path: &str, node: &NodeDocument, claimed: &mut BTreeMap<String, String>) {
    for (key, value) in [
        ("cpu_cores", node.cpu_cores),
        ("memory_gb", node.memory_gb),
        ("disk_gb", node.disk_gb),
    ] {
        match value {
            None => errors.push(FieldError::new(format!("{path}.{key}"), "is required")),
            Some(0) => errors.push(FieldError::new(format!("{path}.{key}"), "must be greater than 0")),
            _ => {}
        }
    }

    if let Some(ip) = node.address() {
        if ip.parse::<Ipv4Addr>().is_err() {
            errors.push(FieldError::new(format!("{path}.ip_address"), format!("'{ip}' is not an IPv4 address")));
        }
    }

    let Some(pt) = &node.pcie_passthrough else {
        return;
    };
    if pt.enabled && pt.devices.is_empty() {
        errors.push(FieldError::new(
            format!("{path}.pcie_passthrough.devices"),
            "must list at least one device when passthrough is enabled",
        ));
    }

    for (i, device) in pt.devices.iter().enumerate() {
        let dev_path = format!("{path}.pcie_passthrough.devices[{i}]");
        match device.pci_address.as_deref() {
            None => errors.push(FieldError::new(format!("{dev_path}.pci_address"), "is required")),
            Some(addr) if !is_pci_address(addr) => errors.push(FieldError::new(
                format!("{dev_path}.pci_address"),
                format!("'{addr}' does not match DDDD:BB:SS.F"),
            )),
            Some(addr) if pt.enabled => {
                if let Some(first) = claimed.get(addr) {
                    errors.push(FieldError::new(
                        format!("{dev_path}.pci_address"),
                        format!("{addr} is already assigned to {first}"),
                    ));
                } else {
                    claimed.insert(addr.to_string(), path.to_string());
                }
            }
            _ => {}
        }
        match device.device_type.as_deref() {
            None => errors.push(FieldError::new(format!("{dev_path}.device_type"), "is required")),
            Some(t) if t.parse::<DeviceType>().is_err() => errors.push(FieldError::new(
                format!("{dev_path}.device_type"),
                format!("'{t}' is not one of {}", DeviceType::ALL.join(", ")),
            )),
            _ => {}
        }
        for (key, value) in [("vendor_id", &device.vendor_id), ("device_id", &device.device_id)] {
            if let Some(id) = value {
                if !is_pci_id(id) {
                    errors.push(FieldError::new(format!("{dev_path}.{key}"), format!("'{id}' is not a 4-digit hex id")));
                }
            }
        }
    }
}
