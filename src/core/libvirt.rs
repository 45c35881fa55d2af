use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::hypervisor::{
    DomainDefinition, DomainStatus, Hypervisor, NetworkDefinition, PoolDefinition, StopMode,
    VolumeDefinition,
};
use crate::core::VmState;
use crate::errors::{HypervisorError, ManagerError, ManagerResult};

// virsh reads definitions from a path; piping through /dev/stdin keeps
// generated XML off the disk
const STDIN: &str = "/dev/stdin";

/// Hypervisor backed by libvirt, driven through the `virsh` CLI.
pub struct VirshHypervisor {
    uri: String,
    binary: PathBuf,
}

impl VirshHypervisor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            binary: PathBuf::from("virsh"),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    async fn virsh(&self, action: &str, resource: &str, args: &[&str]) -> ManagerResult<String> {
        self.run(action, resource, args, None).await
    }

    async fn run(
        &self,
        action: &str,
        resource: &str,
        args: &[&str],
        input: Option<&str>,
    ) -> ManagerResult<String> {
        debug!(uri = %self.uri, ?args, "virsh");
        let mut child = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HypervisorError::new(action, resource, format!("cannot run virsh: {e}")))?;

        if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| HypervisorError::new(action, resource, format!("cannot feed virsh: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| HypervisorError::new(action, resource, format!("virsh did not finish: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(HypervisorError::new(action, resource, stderr).into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn domain_ip(&self, name: &str) -> Option<String> {
        let out = self.virsh("query address of", name, &["domifaddr", name]).await.ok()?;
        first_ipv4(&out)
    }
}

fn is_missing(err: &ManagerError) -> bool {
    match err {
        ManagerError::Hypervisor(hv) => {
            let msg = hv.message.as_str();
            msg.contains("failed to get")
                || msg.contains("Domain not found")
                || msg.contains("Network not found")
                || msg.contains("Storage pool not found")
                || msg.contains("Storage volume not found")
        }
        _ => false,
    }
}

/// Log a failed clean-up of a half-finished create; the create's own error
/// is what the caller sees.
fn undo(kind: &str, name: &str, result: ManagerResult<()>) {
    match result {
        Ok(()) => debug!(kind, name, "Removed half-created resource"),
        Err(err) => warn!(kind, name, error = %err, "Could not remove half-created resource"),
    }
}

fn is_inactive(err: &ManagerError) -> bool {
    match err {
        ManagerError::Hypervisor(hv) => hv.message.contains("is not active"),
        _ => false,
    }
}

/// First `a.b.c.d/nn` token in `virsh domifaddr` output.
fn first_ipv4(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .filter_map(|token| token.split_once('/'))
        .find_map(|(addr, _)| addr.parse::<Ipv4Addr>().ok())
        .map(|addr| addr.to_string())
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

pub fn hostdev_xml(pci_address: &str) -> ManagerResult<String> {
    let invalid = || HypervisorError::new("pass through", pci_address, "malformed PCI address");
    let (domain, rest) = pci_address.split_once(':').ok_or_else(invalid)?;
    let (bus, rest) = rest.split_once(':').ok_or_else(invalid)?;
    let (slot, function) = rest.split_once('.').ok_or_else(invalid)?;
    Ok(format!(
        "<hostdev mode='subsystem' type='pci' managed='yes'>\
         <source><address domain='0x{domain}' bus='0x{bus}' slot='0x{slot}' function='0x{function}'/></source>\
         </hostdev>"
    ))
}

pub fn domain_xml(domain: &DomainDefinition) -> ManagerResult<String> {
    let mut hostdevs = String::new();
    for pci in &domain.hostdevs {
        hostdevs.push_str("\n    ");
        hostdevs.push_str(&hostdev_xml(pci)?);
    }
    Ok(format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
  <vcpu placement='static'>{vcpus}</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features><acpi/><apic/></features>
  <cpu mode='host-passthrough'/>
  <on_crash>preserve</on_crash>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <console type='pty'/>{hostdevs}
  </devices>
</domain>
"#,
        name = escape(&domain.name),
        memory_kib = domain.memory_mb * 1024,
        vcpus = domain.vcpus,
        disk = escape(&domain.disk_path.to_string_lossy()),
        network = escape(&domain.network),
    ))
}

pub fn network_xml(network: &NetworkDefinition) -> ManagerResult<String> {
    let invalid = || HypervisorError::new("create network", &network.name, format!("bad subnet {}", network.subnet));
    let (base, prefix) = network.subnet.split_once('/').ok_or_else(invalid)?;
    let base: Ipv4Addr = base.parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
    if !(8..=30).contains(&prefix) {
        return Err(invalid().into());
    }
    let mask = u32::MAX << (32 - prefix);
    let net = u32::from(base) & mask;
    let broadcast = net | !mask;
    let gateway = Ipv4Addr::from(net + 1);
    let dhcp_start = Ipv4Addr::from((net + 10).min(broadcast - 1));
    let dhcp_end = Ipv4Addr::from(broadcast - 1);

    Ok(format!(
        r#"<network>
  <name>{name}</name>
  <forward mode='nat'/>
  <bridge name='{bridge}' stp='on' delay='0'/>
  <ip address='{gateway}' netmask='{netmask}'>
    <dhcp>
      <range start='{dhcp_start}' end='{dhcp_end}'/>
    </dhcp>
  </ip>
</network>
"#,
        name = escape(&network.name),
        bridge = escape(&network.bridge),
        netmask = Ipv4Addr::from(mask),
    ))
}

fn pool_xml(pool: &PoolDefinition) -> String {
    format!(
        "<pool type='dir'><name>{}</name><target><path>{}</path></target></pool>",
        escape(&pool.name),
        escape(&pool.path.to_string_lossy())
    )
}

fn volume_xml(volume: &VolumeDefinition) -> String {
    let backing = volume
        .backing_image
        .as_ref()
        .map(|image| {
            format!(
                "<backingStore><path>{}</path><format type='qcow2'/></backingStore>",
                escape(&image.to_string_lossy())
            )
        })
        .unwrap_or_default();
    format!(
        "<volume><name>{}</name><capacity unit='G'>{}</capacity>\
         <target><format type='qcow2'/></target>{}</volume>",
        escape(&volume.name),
        volume.capacity_gb,
        backing
    )
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn define(&self, domain: &DomainDefinition) -> ManagerResult<()> {
        let xml = domain_xml(domain)?;
        self.run("define", &domain.name, &["define", STDIN], Some(&xml)).await?;
        info!(vm = %domain.name, "Domain defined");
        Ok(())
    }

    async fn start(&self, name: &str) -> ManagerResult<()> {
        self.virsh("start", name, &["start", name]).await?;
        info!(vm = %name, "Domain started");
        Ok(())
    }

    async fn stop(&self, name: &str, mode: StopMode) -> ManagerResult<()> {
        match mode {
            StopMode::Graceful => self.virsh("shut down", name, &["shutdown", name]).await?,
            StopMode::Force => self.virsh("force stop", name, &["destroy", name]).await?,
        };
        Ok(())
    }

    async fn pause(&self, name: &str) -> ManagerResult<()> {
        self.virsh("pause", name, &["suspend", name]).await.map(|_| ())
    }

    async fn resume(&self, name: &str) -> ManagerResult<()> {
        self.virsh("resume", name, &["resume", name]).await.map(|_| ())
    }

    async fn destroy(&self, name: &str) -> ManagerResult<()> {
        self.virsh("undefine", name, &["undefine", name]).await?;
        info!(vm = %name, "Domain undefined");
        Ok(())
    }

    async fn status(&self, name: &str) -> ManagerResult<DomainStatus> {
        let state = match self.virsh("query state of", name, &["domstate", name]).await {
            Ok(out) => VmState::from_virsh(&out),
            Err(err) if is_missing(&err) => return Ok(DomainStatus::undefined()),
            Err(err) => return Err(err),
        };
        let ip_address = if state.is_running() {
            self.domain_ip(name).await
        } else {
            None
        };
        Ok(DomainStatus { state, ip_address })
    }

    async fn attach_device(&self, name: &str, pci_address: &str) -> ManagerResult<()> {
        let xml = hostdev_xml(pci_address)?;
        self.run("attach device to", name, &["attach-device", name, STDIN, "--live"], Some(&xml))
            .await?;
        info!(vm = %name, pci = %pci_address, "Device attached");
        Ok(())
    }

    async fn detach_device(&self, name: &str, pci_address: &str) -> ManagerResult<()> {
        let xml = hostdev_xml(pci_address)?;
        self.run("detach device from", name, &["detach-device", name, STDIN, "--live"], Some(&xml))
            .await?;
        info!(vm = %name, pci = %pci_address, "Device detached");
        Ok(())
    }

    async fn create_network(&self, network: &NetworkDefinition) -> ManagerResult<()> {
        let xml = network_xml(network)?;
        let name = network.name.as_str();
        self.run("define network", name, &["net-define", STDIN], Some(&xml)).await?;
        let activated = async {
            self.virsh("start network", name, &["net-start", name]).await?;
            self.virsh("autostart network", name, &["net-autostart", name]).await
        }
        .await;
        if let Err(err) = activated {
            undo("network", name, self.destroy_network(name).await);
            return Err(err);
        }
        info!(network = %name, subnet = %network.subnet, "Network created");
        Ok(())
    }

    async fn destroy_network(&self, name: &str) -> ManagerResult<()> {
        match self.virsh("stop network", name, &["net-destroy", name]).await {
            Err(err) if is_missing(&err) => return Ok(()),
            Err(err) if !is_inactive(&err) => return Err(err),
            _ => {}
        }
        self.virsh("undefine network", name, &["net-undefine", name]).await?;
        info!(network = %name, "Network removed");
        Ok(())
    }

    async fn create_pool(&self, pool: &PoolDefinition) -> ManagerResult<()> {
        let name = pool.name.as_str();
        self.run("define pool", name, &["pool-define", STDIN], Some(&pool_xml(pool))).await?;
        let activated = async {
            self.virsh("build pool", name, &["pool-build", name]).await?;
            self.virsh("start pool", name, &["pool-start", name]).await?;
            self.virsh("autostart pool", name, &["pool-autostart", name]).await
        }
        .await;
        if let Err(err) = activated {
            undo("storage pool", name, self.destroy_pool(name).await);
            return Err(err);
        }
        info!(pool = %name, path = %pool.path.display(), "Storage pool created");
        Ok(())
    }

    async fn destroy_pool(&self, name: &str) -> ManagerResult<()> {
        match self.virsh("stop pool", name, &["pool-destroy", name]).await {
            Err(err) if is_missing(&err) => return Ok(()),
            Err(err) if !is_inactive(&err) => return Err(err),
            _ => {}
        }
        self.virsh("undefine pool", name, &["pool-undefine", name]).await?;
        info!(pool = %name, "Storage pool removed");
        Ok(())
    }

    async fn create_volume(&self, volume: &VolumeDefinition) -> ManagerResult<String> {
        let name = volume.name.as_str();
        let pool = volume.pool.as_str();
        self.run("create volume", name, &["vol-create", "--pool", pool, STDIN], Some(&volume_xml(volume)))
            .await?;
        match self.virsh("locate volume", name, &["vol-path", "--pool", pool, name]).await {
            Ok(path) => Ok(path.trim().to_string()),
            Err(err) => {
                undo("volume", name, self.delete_volume(pool, name).await);
                Err(err)
            }
        }
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> ManagerResult<()> {
        match self.virsh("delete volume", name, &["vol-delete", "--pool", pool, name]).await {
            Err(err) if is_missing(&err) => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_xml_carries_passthrough_devices() {
        let xml = domain_xml(&DomainDefinition {
            name: "hpc-compute-01".into(),
            vcpus: 8,
            memory_mb: 16 * 1024,
            disk_path: PathBuf::from("/var/lib/libvirt/images/hpc/hpc-compute-01.qcow2"),
            network: "hpc-network".into(),
            hostdevs: vec!["0000:01:00.0".into()],
        })
        .unwrap();

        assert!(xml.contains("<name>hpc-compute-01</name>"));
        assert!(xml.contains("<memory unit='KiB'>16777216</memory>"));
        assert!(xml.contains("<source network='hpc-network'/>"));
        assert!(xml.contains("bus='0x01' slot='0x00' function='0x0'"));
    }

    #[test]
    fn network_xml_derives_gateway_and_dhcp_range() {
        let xml = network_xml(&NetworkDefinition {
            name: "hpc-network".into(),
            bridge: "virbr100".into(),
            subnet: "192.168.100.0/24".into(),
        })
        .unwrap();
        assert!(xml.contains("address='192.168.100.1' netmask='255.255.255.0'"));
        assert!(xml.contains("start='192.168.100.10' end='192.168.100.254'"));
    }

    #[test]
    fn rejects_bad_subnet() {
        let err = network_xml(&NetworkDefinition {
            name: "n".into(),
            bridge: "b".into(),
            subnet: "not-a-subnet".into(),
        });
        assert!(err.is_err());
    }

    /// A stand-in for virsh: logs every call and fails the steps named in
    /// `failing`. Run as `sh -c <script> <args>` so the URI slot carries it.
    fn scripted_virsh(dir: &tempfile::TempDir, failing: &str) -> (VirshHypervisor, PathBuf) {
        let log = dir.path().join("virsh.log");
        let script = format!(
            "echo \"$0 $*\" >> '{log}'; cat > /dev/null; case \"$0\" in {failing}) echo 'error: injected' >&2; exit 1;; esac",
            log = log.display()
        );
        (VirshHypervisor::new(script).with_binary("sh"), log)
    }

    #[tokio::test]
    async fn half_created_resources_are_removed() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let (virsh, log) = scripted_virsh(&dir, "net-start|pool-start|vol-path");

        let network = NetworkDefinition {
            name: "hpc-network".into(),
            bridge: "virbr100".into(),
            subnet: "192.168.100.0/24".into(),
        };
        assert!(virsh.create_network(&network).await.is_err());
        let pool = PoolDefinition {
            name: "hpc-pool".into(),
            path: dir.path().join("pool"),
        };
        assert!(virsh.create_pool(&pool).await.is_err());
        let volume = VolumeDefinition {
            pool: "hpc-pool".into(),
            name: "hpc-controller.qcow2".into(),
            capacity_gb: 20,
            backing_image: None,
        };
        assert!(virsh.create_volume(&volume).await.is_err());

        let calls = std::fs::read_to_string(&log)?;
        assert!(calls.contains("net-undefine hpc-network"));
        assert!(calls.contains("pool-undefine hpc-pool"));
        assert!(calls.contains("vol-delete --pool hpc-pool hpc-controller.qcow2"));
        assert!(!calls.contains("net-autostart"));
        Ok(())
    }

    #[tokio::test]
    async fn complete_create_leaves_nothing_to_undo() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let (virsh, log) = scripted_virsh(&dir, "none");

        virsh
            .create_network(&NetworkDefinition {
                name: "cloud-network".into(),
                bridge: "virbr200".into(),
                subnet: "192.168.200.0/24".into(),
            })
            .await?;

        let calls = std::fs::read_to_string(&log)?;
        assert!(calls.contains("net-autostart cloud-network"));
        assert!(!calls.contains("net-undefine"));
        Ok(())
    }

    #[tokio::test]
    async fn live_device_changes_skip_the_saved_definition() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let (virsh, log) = scripted_virsh(&dir, "none");

        virsh.detach_device("hpc-compute-01", "0000:01:00.0").await?;
        virsh.attach_device("hpc-compute-01", "0000:01:00.0").await?;
        assert!(virsh.attach_device("hpc-compute-01", "not-a-pci").await.is_err());

        let calls = std::fs::read_to_string(&log)?;
        assert!(calls.contains("detach-device hpc-compute-01 /dev/stdin --live"));
        assert!(calls.contains("attach-device hpc-compute-01 /dev/stdin --live"));
        assert!(!calls.contains("--persistent"));
        assert_eq!(calls.lines().count(), 2);
        Ok(())
    }

    #[test]
    fn picks_first_ipv4_from_domifaddr() {
        let out = " Name       MAC address          Protocol     Address\n\
                   -------------------------------------------------------\n \
                   vnet0      52:54:00:6b:3c:12    ipv4         192.168.100.23/24\n";
        assert_eq!(first_ipv4(out).as_deref(), Some("192.168.100.23"));
        assert_eq!(first_ipv4("nothing here"), None);
    }
}
