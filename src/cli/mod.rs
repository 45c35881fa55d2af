/*
* Command Line Interface
* ----------------------
* @module: cli
*
* Command Structure:
* ---------------
* gpu-cluster [--state PATH] [--log-level LEVEL] [--settings FILE] [--uri URI]
* ├── validate <config> [--skip-pcie-validation]
* ├── plan <config> [--format text|json|markdown] [--output FILE]
* ├── hpc | cloud
* │   ├── start <config> [--skip-pcie-validation] [--no-provision]
* │   ├── stop <config>
* │   ├── status <config>
* │   ├── destroy <config> [--force]
* │   └── start-vm | stop-vm | restart-vm | status-vm | pause-vm | resume-vm | recover-vm <config> <vm>
* ├── system
* │   ├── start <config> [--skip-pcie-validation] [--no-provision]
* │   ├── stop | status <config>
* │   └── destroy <config> [--force]
* ├── gpu
* │   ├── list
* │   ├── check <pci> --cluster NAME [--vm VM]
* │   ├── release <pci> [--force]
* │   └── transfer <config> <pci> <from-vm> <to-vm>
* ├── inventory pcie
* └── state backup | restore [--force]
*
* User-facing output goes to stdout with `colored`; logs go to stderr via
* `tracing`. Errors come back as `anyhow::Error` with the `ManagerError` in
* the chain so `exit_code` can map them.
*/

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::{ColoredString, Colorize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cluster::{
    AssumeYes, ClusterManager, Confirm, Plan, SkipProvisioning, SystemManager, SystemState, SystemStatus,
};
use crate::config::{Settings, SystemConfig};
use crate::core::{Hypervisor, ShutdownPolicy, StopOutcome, VirshHypervisor, VmLifecycle, VmState};
use crate::errors::{GpuError, ManagerError, EXIT_FAILURE};
use crate::gpu::{validate_pcie_readiness, GpuRegistry, HostEnvironment};
use crate::state::{ClusterState, ClusterStatus, ClusterType, GlobalState, StateStore};
use crate::utils::{os, truncate};

const DEFAULT_CONFIG: &str = "config/cluster.yaml";

#[derive(Parser, Debug)]
#[command(name = "gpu-cluster")]
#[command(version)]
#[command(about = "Provision HPC and Cloud VM clusters that share passthrough GPUs", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// State file (overrides CLUSTER_MANAGER_STATE_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    pub state: Option<PathBuf>,

    /// trace, debug, info, warn or error
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Settings file layered over the built-in defaults
    #[arg(long, global = true, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Hypervisor connection URI (overrides LIBVIRT_DEFAULT_URI)
    #[arg(long, global = true, value_name = "URI")]
    pub uri: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check the configuration and host readiness without touching anything
    Validate {
        #[arg(default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long)]
        skip_pcie_validation: bool,
    },
    /// Show what a configuration would create, without creating it
    Plan {
        #[arg(default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(short, long, value_enum, default_value_t = PlanFormat::Text)]
        format: PlanFormat,
        /// Write the report here instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Manage the HPC (SLURM) cluster
    Hpc {
        #[command(subcommand)]
        command: ClusterCommands,
    },
    /// Manage the Cloud (Kubernetes) cluster
    Cloud {
        #[command(subcommand)]
        command: ClusterCommands,
    },
    /// Manage both clusters together
    System {
        #[command(subcommand)]
        command: SystemCommands,
    },
    /// Inspect or move passthrough device ownership
    Gpu {
        #[command(subcommand)]
        command: GpuCommands,
    },
    /// Inspect host hardware
    Inventory {
        #[command(subcommand)]
        command: InventoryCommands,
    },
    /// Back up or restore the state file
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanFormat {
    Text,
    Json,
    Markdown,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    #[arg(default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,
    #[arg(long)]
    pub skip_pcie_validation: bool,
    /// Do not run the provisioning playbook after the VMs are up
    #[arg(long)]
    pub no_provision: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArg {
    #[arg(default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,
}

#[derive(Args, Debug)]
pub struct DestroyArgs {
    #[arg(default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct VmArgs {
    pub config: PathBuf,
    pub vm: String,
}

#[derive(Subcommand, Debug)]
pub enum ClusterCommands {
    Start(StartArgs),
    Stop(ConfigArg),
    Status(ConfigArg),
    Destroy(DestroyArgs),
    /// Start one VM (also VMs declared with auto_start: false)
    StartVm(VmArgs),
    StopVm(VmArgs),
    /// Shut a VM down and boot it again
    RestartVm(VmArgs),
    /// Live state of one VM
    StatusVm(VmArgs),
    PauseVm(VmArgs),
    ResumeVm(VmArgs),
    /// Restart a crashed VM
    RecoverVm(VmArgs),
}

#[derive(Subcommand, Debug)]
pub enum SystemCommands {
    /// Start HPC, then Cloud
    Start(StartArgs),
    /// Stop Cloud, then HPC
    Stop(ConfigArg),
    Status(ConfigArg),
    Destroy(DestroyArgs),
}

#[derive(Subcommand, Debug)]
pub enum GpuCommands {
    /// Show who holds each passthrough device
    List,
    /// Would this cluster (and VM) be refused the device?
    Check {
        pci_address: String,
        #[arg(long)]
        cluster: String,
        #[arg(long)]
        vm: Option<String>,
    },
    /// Clear ownership of a device regardless of who holds it
    Release {
        pci_address: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Hand a device from a running VM to a stopped VM of either cluster
    Transfer {
        config: PathBuf,
        pci_address: String,
        from_vm: String,
        to_vm: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum InventoryCommands {
    /// List host PCI devices with driver binding and ownership
    Pcie,
}

#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Copy the live state file to its .backup
    Backup,
    /// Replace the live state file with its .backup
    Restore {
        #[arg(short, long)]
        force: bool,
    },
}

/// Settings with command-line flags applied last.
pub fn load_settings(cli: &Cli) -> Result<Settings, ManagerError> {
    let mut settings = Settings::load(cli.settings.as_deref()).map_err(ManagerError::from)?;
    if let Some(state) = &cli.state {
        settings.state_path = state.clone();
    }
    if let Some(level) = &cli.log_level {
        settings.log_level = level.clone();
    }
    if let Some(uri) = &cli.uri {
        settings.libvirt_uri = uri.clone();
    }
    Ok(settings)
}

/// Exit code for an error coming out of `run`.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ManagerError>())
        .map(ManagerError::exit_code)
        .unwrap_or(EXIT_FAILURE)
}

pub fn report_error(err: &anyhow::Error) {
    eprintln!("{} {err:#}", "error:".red().bold());
}

struct Context {
    settings: Settings,
    store: StateStore,
    host: HostEnvironment,
}

impl Context {
    fn new(settings: Settings) -> Self {
        let store = StateStore::new(&settings.state_path);
        Self {
            settings,
            store,
            host: HostEnvironment::system(),
        }
    }

    fn clusters(&self, no_provision: bool) -> ClusterManager {
        let hypervisor: Arc<dyn Hypervisor> = Arc::new(VirshHypervisor::new(&self.settings.libvirt_uri));
        let lifecycle = VmLifecycle::new(hypervisor, ShutdownPolicy::from(&self.settings)).with_host(self.host.clone());
        let manager = ClusterManager::new(self.store.clone(), Arc::new(lifecycle), &self.settings);
        if no_provision {
            manager.with_provisioner(Arc::new(SkipProvisioning))
        } else {
            manager
        }
    }

    /// Schema (inside `load`) and host readiness. Ownership is left to the
    /// allocator at start so its conflict error names the owner.
    fn load_checked(&self, path: &Path, kind: Option<ClusterType>, skip_pcie: bool) -> anyhow::Result<SystemConfig> {
        let config = SystemConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
        let scope = match kind {
            Some(kind) => config.only(kind)?,
            None => config.clone(),
        };
        validate_pcie_readiness(&scope, &self.host, None, skip_pcie)?;
        Ok(config)
    }
}

pub async fn run(cli: Cli, settings: Settings) -> anyhow::Result<()> {
    let ctx = Context::new(settings);
    info!(state = %ctx.store.path().display(), uri = %ctx.settings.libvirt_uri, "Using state file");

    match cli.command {
        Commands::Validate {
            config,
            skip_pcie_validation,
        } => validate(&ctx, &config, skip_pcie_validation),
        Commands::Plan { config, format, output } => plan(&ctx, &config, format, output.as_deref()),
        Commands::Hpc { command } => cluster_command(&ctx, ClusterType::Hpc, command).await,
        Commands::Cloud { command } => cluster_command(&ctx, ClusterType::Cloud, command).await,
        Commands::System { command } => system_command(&ctx, command).await,
        Commands::Gpu { command } => gpu_command(&ctx, command).await,
        Commands::Inventory {
            command: InventoryCommands::Pcie,
        } => inventory(&ctx),
        Commands::State { command } => state_command(&ctx, command),
    }
}

fn validate(ctx: &Context, path: &Path, skip_pcie: bool) -> anyhow::Result<()> {
    let config = SystemConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    println!("{} schema valid ({})", "✓".green(), path.display());

    for spec in config.clusters() {
        let gpus: usize = spec.vms.iter().map(|vm| vm.gpu_count() as usize).sum();
        println!(
            "  {} {}: {} VMs, {} GPU(s), network {} ({})",
            "•".cyan(),
            spec.name.bold(),
            spec.vms.len(),
            gpus,
            spec.network.name,
            spec.network.subnet
        );
    }
    for pci in config.shared_devices() {
        println!(
            "  {} {pci} is declared by both clusters; only one can hold it at a time",
            "!".yellow()
        );
    }

    let state = ctx.store.load()?;
    validate_pcie_readiness(&config, &ctx.host, Some(&state), skip_pcie)?;
    if skip_pcie {
        println!("{} PCIe passthrough checks skipped", "-".yellow());
    } else {
        println!("{} host ready for PCIe passthrough", "✓".green());
    }
    Ok(())
}

fn plan(ctx: &Context, path: &Path, format: PlanFormat, output: Option<&Path>) -> anyhow::Result<()> {
    let config = SystemConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    let plan = Plan::build(&config, &ctx.store.load()?);
    let report = match format {
        PlanFormat::Text => plan.render_text(),
        PlanFormat::Json => plan.to_json().context("encoding plan")?,
        PlanFormat::Markdown => plan.render_markdown(),
    };
    match output {
        Some(file) => {
            if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
            }
            fs::write(file, report).with_context(|| format!("writing {}", file.display()))?;
            println!("{} plan written to {}", "✓".green(), file.display());
        }
        None => print!("{report}"),
    }
    if !plan.conflicts.is_empty() {
        warn!(conflicts = plan.conflicts.len(), "Devices in this plan are held elsewhere");
    }
    Ok(())
}

async fn cluster_command(ctx: &Context, kind: ClusterType, command: ClusterCommands) -> anyhow::Result<()> {
    match command {
        ClusterCommands::Start(args) => {
            let config = ctx.load_checked(&args.config, Some(kind), args.skip_pcie_validation)?;
            let spec = config.cluster(kind)?;
            let record = ctx.clusters(args.no_provision).start_cluster(spec).await?;
            println!("{} {} cluster '{}' started", "✓".green(), kind, spec.name);
            print_cluster(&record);
        }
        ClusterCommands::Stop(args) => {
            let config = SystemConfig::load(&args.config)?;
            let spec = config.cluster(kind)?;
            ctx.clusters(true).stop_cluster(spec).await?;
            println!("{} {} cluster '{}' stopped", "✓".green(), kind, spec.name);
        }
        ClusterCommands::Status(args) => {
            let config = SystemConfig::load(&args.config)?;
            let spec = config.cluster(kind)?;
            match ctx.clusters(true).status_cluster(spec).await {
                Ok(record) => {
                    print_cluster(&record);
                    print_gpu_table(&ctx.store.load()?, Some(&spec.name));
                }
                Err(ManagerError::ClusterNotFound(name)) => {
                    println!("{} cluster '{name}' is not deployed", "-".yellow());
                }
                Err(err) => return Err(err.into()),
            }
        }
        ClusterCommands::Destroy(args) => {
            let config = SystemConfig::load(&args.config)?;
            let spec = config.cluster(kind)?;
            ctx.clusters(true).destroy_cluster(spec, args.force, &StdinConfirm).await?;
            println!("{} {} cluster '{}' destroyed", "✓".green(), kind, spec.name);
        }
        ClusterCommands::StartVm(args) => {
            let config = ctx.load_checked(&args.config, Some(kind), false)?;
            let spec = config.cluster(kind)?;
            let vm = ctx.clusters(true).start_vm(spec, &args.vm).await?;
            println!(
                "{} {} running ({})",
                "✓".green(),
                vm.name,
                vm.ip_address.as_deref().unwrap_or("no address yet")
            );
        }
        ClusterCommands::StopVm(args) => {
            let config = SystemConfig::load(&args.config)?;
            let spec = config.cluster(kind)?;
            let outcome = ctx.clusters(true).stop_vm(spec, &args.vm).await?;
            let how = match outcome {
                StopOutcome::AlreadyStopped => "was already stopped",
                StopOutcome::Graceful => "shut down",
                StopOutcome::Forced => "force-stopped after timeout",
            };
            println!("{} {} {how}", "✓".green(), args.vm);
        }
        ClusterCommands::RestartVm(args) => {
            let config = ctx.load_checked(&args.config, Some(kind), false)?;
            let vm = ctx.clusters(true).restart_vm(config.cluster(kind)?, &args.vm).await?;
            println!(
                "{} {} restarted ({})",
                "✓".green(),
                vm.name,
                vm.ip_address.as_deref().unwrap_or("no address yet")
            );
        }
        ClusterCommands::StatusVm(args) => {
            let config = SystemConfig::load(&args.config)?;
            let vm = ctx.clusters(true).status_vm(config.cluster(kind)?, &args.vm).await?;
            println!("{} {} {}", "VM".bold(), vm.name.bold(), paint_vm_state(vm.state));
            println!("  role     {}", vm.role);
            println!("  cpu      {}", vm.cpu_cores);
            println!("  memory   {}G", vm.memory_gb);
            println!("  ip       {}", vm.ip_address.as_deref().unwrap_or("-"));
            if !vm.pci_addresses.is_empty() {
                println!("  devices  {}", vm.pci_addresses.join(", "));
            }
            if let Some(seen) = vm.last_seen {
                println!("  seen     {}", seen.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        ClusterCommands::PauseVm(args) => {
            let config = SystemConfig::load(&args.config)?;
            let state = ctx.clusters(true).pause_vm(config.cluster(kind)?, &args.vm).await?;
            println!("{} {} {}", "✓".green(), args.vm, paint_vm_state(state));
        }
        ClusterCommands::ResumeVm(args) => {
            let config = SystemConfig::load(&args.config)?;
            let state = ctx.clusters(true).resume_vm(config.cluster(kind)?, &args.vm).await?;
            println!("{} {} {}", "✓".green(), args.vm, paint_vm_state(state));
        }
        ClusterCommands::RecoverVm(args) => {
            let config = SystemConfig::load(&args.config)?;
            let state = ctx.clusters(true).recover_vm(config.cluster(kind)?, &args.vm).await?;
            println!("{} {} {}", "✓".green(), args.vm, paint_vm_state(state));
        }
    }
    Ok(())
}

async fn system_command(ctx: &Context, command: SystemCommands) -> anyhow::Result<()> {
    match command {
        SystemCommands::Start(args) => {
            let config = ctx.load_checked(&args.config, None, args.skip_pcie_validation)?;
            SystemManager::new(ctx.clusters(args.no_provision)).start(&config).await?;
            println!("{} system started", "✓".green());
        }
        SystemCommands::Stop(args) => {
            let config = SystemConfig::load(&args.config)?;
            SystemManager::new(ctx.clusters(true)).stop(&config).await?;
            println!("{} system stopped", "✓".green());
        }
        SystemCommands::Status(args) => {
            let config = SystemConfig::load(&args.config)?;
            let status = SystemManager::new(ctx.clusters(true)).status(&config).await?;
            print_system_status(&status);
        }
        SystemCommands::Destroy(args) => {
            let config = SystemConfig::load(&args.config)?;
            SystemManager::new(ctx.clusters(true))
                .destroy(&config, args.force, &StdinConfirm)
                .await?;
            println!("{} system destroyed", "✓".green());
        }
    }
    Ok(())
}

async fn gpu_command(ctx: &Context, command: GpuCommands) -> anyhow::Result<()> {
    let registry = GpuRegistry::new(ctx.store.clone());
    match command {
        GpuCommands::List => {
            let state = GlobalState {
                gpu_allocations: registry.allocations().await?,
                ..GlobalState::default()
            };
            print_gpu_table(&state, None);
        }
        GpuCommands::Check { pci_address, cluster, vm } => {
            match registry.check_conflict(&pci_address, &cluster, vm.as_deref()).await? {
                Some(conflict) => return Err(ManagerError::from(GpuError::ResourceConflict(conflict)).into()),
                None => println!("{} {pci_address} is available to {cluster}", "✓".green()),
            }
        }
        GpuCommands::Release { pci_address, force } => {
            let prompt = format!("Release {pci_address} whoever holds it?");
            let confirm: &dyn Confirm = if force { &AssumeYes } else { &StdinConfirm };
            if !confirm.confirm(&prompt) {
                return Err(ManagerError::Cancelled("gpu release".into()).into());
            }
            match registry.release(&pci_address).await? {
                Some(owner) => println!(
                    "{} {pci_address} released from {}/{}",
                    "✓".green(),
                    owner.cluster,
                    owner.vm.as_deref().unwrap_or("-")
                ),
                None => println!("{} {pci_address} was not held", "-".yellow()),
            }
        }
        GpuCommands::Transfer {
            config,
            pci_address,
            from_vm,
            to_vm,
        } => {
            let config = ctx.load_checked(&config, None, false)?;
            SystemManager::new(ctx.clusters(true))
                .transfer_gpu(&config, &pci_address, &from_vm, &to_vm)
                .await?;
            println!("{} {pci_address} moved from {from_vm} to {to_vm}", "✓".green());
        }
    }
    Ok(())
}

fn inventory(ctx: &Context) -> anyhow::Result<()> {
    let platform = os::current_platform();
    println!(
        "{} {} / {} (kvm: {}, iommu: {})",
        "Host:".bold(),
        platform,
        ctx.host.arch(),
        yes_no(ctx.host.kvm_available()),
        yes_no(ctx.host.iommu_enabled())
    );
    if !os::supports_passthrough(platform, ctx.host.arch()) {
        warn!("This host cannot do VFIO passthrough");
    }

    let devices = ctx.host.list_pci_devices().context("listing PCI devices")?;
    let state = ctx.store.load()?;
    println!(
        "{:<14} {:<10} {:<11} {:<14} {:<7} {}",
        "ADDRESS".bold(),
        "CLASS".bold(),
        "VENDOR:DEV".bold(),
        "DRIVER".bold(),
        "IOMMU".bold(),
        "OWNER".bold()
    );
    for dev in devices.iter().filter(|d| d.is_gpu() || state.gpu_allocations.contains_key(&d.address)) {
        let driver = dev.driver.clone().unwrap_or_else(|| "-".into());
        let driver = if dev.is_vfio_bound() {
            driver.green()
        } else if dev.has_conflicting_driver() {
            driver.red()
        } else {
            driver.normal()
        };
        let owner = state
            .gpu_allocations
            .get(&dev.address)
            .map(|o| format!("{}/{}", o.cluster, o.vm.as_deref().unwrap_or("-")))
            .unwrap_or_else(|| "free".into());
        println!(
            "{:<14} {:<10} {:<11} {:<14} {:<7} {}",
            dev.address,
            dev.class,
            format!("{}:{}", dev.vendor_id.trim_start_matches("0x"), dev.device_id.trim_start_matches("0x")),
            driver,
            dev.iommu_group.map(|g| g.to_string()).unwrap_or_else(|| "-".into()),
            owner
        );
    }
    Ok(())
}

fn state_command(ctx: &Context, command: StateCommands) -> anyhow::Result<()> {
    match command {
        StateCommands::Backup => {
            let path = ctx.store.backup()?;
            println!("{} state backed up to {}", "✓".green(), path.display());
        }
        StateCommands::Restore { force } => {
            let prompt = format!(
                "Replace {} with {}?",
                ctx.store.path().display(),
                ctx.store.backup_path().display()
            );
            let confirm: &dyn Confirm = if force { &AssumeYes } else { &StdinConfirm };
            if !confirm.confirm(&prompt) {
                return Err(ManagerError::Cancelled("state restore".into()).into());
            }
            let state = ctx.store.restore_backup()?;
            println!(
                "{} state restored ({} cluster(s), {} GPU allocation(s))",
                "✓".green(),
                state.clusters.len(),
                state.gpu_allocations.len()
            );
        }
    }
    Ok(())
}

/// y/N prompt on the terminal.
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        print!("{} {prompt} [y/N] ", "?".yellow().bold());
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        if io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

fn yes_no(flag: bool) -> ColoredString {
    if flag {
        "yes".green()
    } else {
        "no".red()
    }
}

fn paint_vm_state(state: VmState) -> ColoredString {
    let text = state.to_string();
    match state {
        VmState::Running => text.green(),
        VmState::Shutoff | VmState::Undefined => text.normal(),
        VmState::Crashed => text.red(),
        _ => text.yellow(),
    }
}

fn paint_cluster_status(status: ClusterStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        ClusterStatus::Running => text.green(),
        ClusterStatus::Stopped => text.normal(),
        ClusterStatus::Partial => text.yellow(),
        ClusterStatus::Error => text.red(),
    }
}

fn print_cluster(record: &ClusterState) {
    println!(
        "{} {} [{}] {}",
        "Cluster".bold(),
        record.cluster_name.bold(),
        record.cluster_type,
        paint_cluster_status(record.status)
    );
    if record.reconcile_pending {
        println!("  {} leftovers from a failed run; stop or destroy to reconcile", "!".yellow());
    }
    for net in &record.networks {
        println!("  network {} {} ({})", net.name, net.subnet, net.bridge);
    }
    println!(
        "  {:<28} {:<12} {:<12} {:>4} {:>6} {:>4}  {}",
        "VM".bold(),
        "ROLE".bold(),
        "STATE".bold(),
        "CPU".bold(),
        "MEM".bold(),
        "GPU".bold(),
        "IP".bold()
    );
    for vm in &record.vms {
        println!(
            "  {:<28} {:<12} {:<12} {:>4} {:>5}G {:>4}  {}",
            truncate(&vm.name, 28),
            vm.role.to_string(),
            paint_vm_state(vm.state),
            vm.cpu_cores,
            vm.memory_gb,
            vm.gpu_count,
            vm.ip_address.as_deref().unwrap_or("-")
        );
    }
}

fn print_gpu_table(state: &GlobalState, only_cluster: Option<&str>) {
    let rows: Vec<_> = state
        .gpu_allocations
        .iter()
        .filter(|(_, owner)| only_cluster.map_or(true, |name| owner.cluster == name))
        .collect();
    if rows.is_empty() {
        println!("  no passthrough devices held");
        return;
    }
    println!("  {:<14} {:<12} {:<28} {}", "DEVICE".bold(), "CLUSTER".bold(), "VM".bold(), "DRIVER".bold());
    for (pci, owner) in rows {
        println!(
            "  {:<14} {:<12} {:<28} {}",
            pci,
            owner.cluster,
            owner.vm.as_deref().unwrap_or("-"),
            owner.driver.as_deref().unwrap_or("-")
        );
    }
}

fn print_system_status(status: &SystemStatus) {
    let overall = status.overall.to_string();
    let overall = match status.overall {
        SystemState::Running => overall.green(),
        SystemState::Stopped => overall.normal(),
        SystemState::Mixed => overall.yellow(),
        SystemState::Error => overall.red(),
    };
    println!("{} {}", "System".bold(), overall);
    for record in &status.clusters {
        print_cluster(record);
    }
    for name in &status.not_deployed {
        println!("{} {} not deployed", "Cluster".bold(), name.bold());
    }
    println!("{}", "GPU ownership".bold());
    let state = GlobalState {
        gpu_allocations: status.gpu_allocations.clone(),
        ..GlobalState::default()
    };
    print_gpu_table(&state, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cluster_start_flags() {
        let cli = Cli::try_parse_from(["gpu-cluster", "--state", "/tmp/s.json", "hpc", "start", "c.yaml", "--no-provision"])
            .unwrap();
        assert_eq!(cli.state.as_deref(), Some(Path::new("/tmp/s.json")));
        match cli.command {
            Commands::Hpc {
                command: ClusterCommands::Start(args),
            } => {
                assert_eq!(args.config, PathBuf::from("c.yaml"));
                assert!(args.no_provision);
                assert!(!args.skip_pcie_validation);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn config_path_defaults() {
        let cli = Cli::try_parse_from(["gpu-cluster", "system", "destroy", "-f"]).unwrap();
        match cli.command {
            Commands::System {
                command: SystemCommands::Destroy(args),
            } => {
                assert!(args.force);
                assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn vm_commands_need_a_vm_name() {
        assert!(Cli::try_parse_from(["gpu-cluster", "cloud", "stop-vm", "c.yaml"]).is_err());
        assert!(Cli::try_parse_from(["gpu-cluster", "cloud", "stop-vm", "c.yaml", "cloud-gpu-worker-01"]).is_ok());
    }

    #[test]
    fn plan_takes_format_and_output() {
        let cli = Cli::try_parse_from(["gpu-cluster", "plan", "c.yaml", "-f", "markdown", "-o", "out/plan.md"]).unwrap();
        match cli.command {
            Commands::Plan { config, format, output } => {
                assert_eq!(config, PathBuf::from("c.yaml"));
                assert_eq!(format, PlanFormat::Markdown);
                assert_eq!(output, Some(PathBuf::from("out/plan.md")));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["gpu-cluster", "plan", "c.yaml", "--format", "yaml"]).is_err());
    }

    #[test]
    fn restart_and_status_are_vm_commands() {
        let cli = Cli::try_parse_from(["gpu-cluster", "hpc", "restart-vm", "c.yaml", "hpc-compute-01"]).unwrap();
        assert!(matches!(cli.command, Commands::Hpc { command: ClusterCommands::RestartVm(_) }));
        let cli = Cli::try_parse_from(["gpu-cluster", "cloud", "status-vm", "c.yaml", "cloud-gpu-worker-01"]).unwrap();
        assert!(matches!(cli.command, Commands::Cloud { command: ClusterCommands::StatusVm(_) }));
    }

    #[test]
    fn gpu_transfer_names_both_vms() {
        let cli = Cli::try_parse_from([
            "gpu-cluster",
            "gpu",
            "transfer",
            "c.yaml",
            "0000:01:00.0",
            "hpc-compute-01",
            "cloud-gpu-worker-01",
        ])
        .unwrap();
        match cli.command {
            Commands::Gpu {
                command: GpuCommands::Transfer { from_vm, to_vm, .. },
            } => {
                assert_eq!(from_vm, "hpc-compute-01");
                assert_eq!(to_vm, "cloud-gpu-worker-01");
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["gpu-cluster", "gpu", "check", "0000:01:00.0"]).is_err());
    }

    #[test]
    fn exit_code_looks_through_context() {
        let err = anyhow::Error::from(ManagerError::ClusterNotFound("hpc".into())).context("status");
        assert_eq!(exit_code(&err), 2);
        assert_eq!(exit_code(&anyhow::anyhow!("plain")), EXIT_FAILURE);
    }
}
