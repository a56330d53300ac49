//! burrowd: the host-side container daemon.
//!
//! Wires the pools, firewall, depot, and supervisor plumbing together,
//! recovers state left by a previous run (snapshot restore + prune),
//! and then sits in the grace-time sweep loop until asked to shut
//! down, at which point it snapshots every live container.

mod backend;
mod lock;
mod rootfs;

use backend::Backend;
use burrow_container::{ProcessTracker, StdProcessTracker};
use burrow_network::bridge::{IpLinkDestroyer, SysfsBridgeLister};
use burrow_network::iptables::Chain;
use burrow_network::{
    BridgeManager, ChainTeardown, FilterProvider, InstanceFilterProvider, IptablesManager,
    PortPool, SubnetPool,
};
use burrow_pool::{ChownMkdirChowner, PoolConfig, ResourcePool};
use burrow_schema::Config;
use burrow_system::command::{LoggingRunner, RealCommandRunner};
use burrow_system::reaper::system_wait4;
use burrow_system::{CommandRunner, ProcessReaper};
use clap::Parser;
use lock::DepotLock;
use rootfs::{BasicRootFsCleaner, DirRootFsProvider};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "burrowd",
    version,
    about = "Linux container runtime daemon"
)]
struct Cli {
    /// Directory holding per-container state.
    #[arg(long)]
    depot: PathBuf,

    /// Directory holding setup.sh, create.sh, and destroy.sh.
    #[arg(long = "bin-path")]
    bin_path: PathBuf,

    /// Base rootfs copied for containers that do not name one.
    #[arg(long)]
    rootfs: PathBuf,

    /// Directory container rootfs copies are placed in.
    #[arg(long = "rootfs-store")]
    rootfs_store: Option<PathBuf>,

    /// Short tag namespacing chains and interfaces on a shared host.
    #[arg(long, default_value = "0")]
    tag: String,

    /// CIDR range carved into /30 container subnets.
    #[arg(long = "network-pool", default_value = "10.254.0.0/22")]
    network_pool: ipnetwork::Ipv4Network,

    #[arg(long = "port-pool-start", default_value_t = 61001)]
    port_pool_start: u32,

    #[arg(long = "port-pool-size", default_value_t = 5000)]
    port_pool_size: u32,

    /// CIDRs appended to the global chain as RETURN rules.
    #[arg(long = "allow-networks", value_delimiter = ',')]
    allow_networks: Vec<String>,

    /// CIDRs appended to the global chain as REJECT rules.
    #[arg(long = "deny-networks", value_delimiter = ',')]
    deny_networks: Vec<String>,

    /// Host IP containers reach the outside world through.
    #[arg(long = "external-ip")]
    external_ip: Ipv4Addr,

    #[arg(long, default_value_t = 1500)]
    mtu: u32,

    /// Host uid mapped to root inside unprivileged containers.
    #[arg(long = "uid-map-base", default_value_t = 700000)]
    uid_map_base: u32,

    /// Allow container traffic to reach the host itself.
    #[arg(long = "allow-host-access", default_value_t = false)]
    allow_host_access: bool,

    /// Use the kernel LOG target instead of NFLOG for packet logging.
    #[arg(long = "kernel-log-chains", default_value_t = false)]
    kernel_log_chains: bool,

    /// Seconds between grace-time sweeps.
    #[arg(long = "sweep-interval", default_value_t = 15)]
    sweep_interval: u64,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false)]
    trace: bool,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn install_signal_handler() {
    let _ = ctrlc::set_handler(|| {
        if SHUTDOWN.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, snapshotting containers...");
    });
}

fn init_logging(cli: &Cli) {
    let default = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .init();
}

fn build_backend(cli: &Cli, reaper: Arc<ProcessReaper>) -> Backend {
    let runner: Arc<dyn CommandRunner> = Arc::new(LoggingRunner::new(RealCommandRunner::new()));
    let config = Config::new(&cli.tag, cli.allow_host_access);

    let subnet_pool = Arc::new(SubnetPool::new(cli.network_pool));
    let bridges = Arc::new(BridgeManager::new(
        format!("{}b-", config.network_interface_prefix),
        Arc::new(IpLinkDestroyer::new(Arc::clone(&runner))),
        Arc::new(SysfsBridgeLister::new()),
    ));
    let port_pool = Arc::new(PortPool::new(cli.port_pool_start, cli.port_pool_size));
    let filter_provider: Arc<dyn FilterProvider> = Arc::new(InstanceFilterProvider::new(
        config.clone(),
        cli.kernel_log_chains,
        Arc::clone(&runner),
    ));
    let chain_teardown: Arc<dyn ChainTeardown> =
        Arc::new(IptablesManager::new(config.clone(), Arc::clone(&runner)));

    let rootfs_store = cli
        .rootfs_store
        .clone()
        .unwrap_or_else(|| cli.depot.join("tmp/rootfs"));
    let rootfs_provider = Arc::new(DirRootFsProvider::new(
        cli.rootfs.clone(),
        rootfs_store,
        Arc::clone(&runner),
    ));

    let version = semver::Version::parse(env!("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| semver::Version::new(0, 0, 0));

    let pool = Arc::new(ResourcePool::new(PoolConfig {
        bin_path: cli.bin_path.clone(),
        depot_path: cli.depot.clone(),
        config,
        uid_mapping_base: cli.uid_map_base,
        external_ip: cli.external_ip,
        mtu: cli.mtu,
        allow_networks: cli.allow_networks.clone(),
        deny_networks: cli.deny_networks.clone(),
        version,
        subnet_pool,
        bridges,
        chain_teardown,
        filter_provider: Arc::clone(&filter_provider),
        global_chain: Chain::new(
            format!("w-{}-default", cli.tag),
            Arc::clone(&runner),
        ),
        port_pool: Arc::clone(&port_pool),
        rootfs_provider,
        rootfs_cleaner: Arc::new(BasicRootFsCleaner),
        mkdir_chowner: Arc::new(ChownMkdirChowner),
        runner: Arc::clone(&runner),
    }));

    let tracker_runner = Arc::clone(&runner);
    Backend::new(
        pool,
        filter_provider,
        port_pool,
        runner,
        Box::new(move |record| {
            Arc::new(StdProcessTracker::new(
                record.container_path.clone(),
                Arc::clone(&reaper),
                Arc::clone(&tracker_runner),
            )) as Arc<dyn ProcessTracker>
        }),
    )
}

fn run(cli: Cli) -> Result<(), String> {
    let _lock = DepotLock::acquire(&cli.depot.join(".lock"))
        .map_err(|e| format!("acquire depot lock: {e}"))?;

    std::fs::create_dir_all(&cli.depot).map_err(|e| format!("create depot: {e}"))?;

    let reaper = Arc::new(
        ProcessReaper::start(system_wait4()).map_err(|e| format!("start reaper: {e}"))?,
    );
    let backend = build_backend(&cli, Arc::clone(&reaper));

    backend.setup().map_err(|e| format!("host setup: {e}"))?;

    let keep = backend
        .restore_depot()
        .map_err(|e| format!("restore depot: {e}"))?;
    match backend.prune_stale(&keep) {
        Ok(report) => {
            if !report.destroyed.is_empty() || !report.failures.is_empty() {
                info!(
                    destroyed = report.destroyed.len(),
                    failed = report.failures.len(),
                    "startup prune complete"
                );
            }
            for (container, reason) in &report.failures {
                warn!(container, reason, "prune left state behind");
            }
        }
        Err(e) => warn!(error = %e, "startup prune failed"),
    }

    install_signal_handler();
    info!(depot = %cli.depot.display(), "burrowd ready");

    let sweep_interval = Duration::from_secs(cli.sweep_interval.max(1));
    let mut last_sweep = std::time::Instant::now();
    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(250));
        if last_sweep.elapsed() >= sweep_interval {
            backend.sweep_idle();
            last_sweep = std::time::Instant::now();
        }
    }

    if let Err(e) = backend.snapshot_all() {
        error!(error = %e, "snapshot write failed");
    }
    reaper.stop();
    info!("burrowd stopped");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}
