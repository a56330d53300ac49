//! The resource pool: Acquire / Release / Prune / Restore.
//!
//! Acquire materializes a container's host-side state in a fixed order,
//! pushing an undo step for every completed stage; any failure unwinds
//! the completed stages in reverse, so either a fully materialized
//! record is returned or the host is back in its pre-call state.
//! Release is the forward teardown (fatal at the first failing step so
//! an operator can retry); Prune is the crash-recovery sweep that never
//! stops at a single bad container.

use crate::depot::Depot;
use crate::providers::{MkdirChowner, RootFsCleaner, RootFsProvider, RootFsSpec};
use crate::PoolError;
use burrow_network::iptables::Chain;
use burrow_network::{
    parse_network_selection, BridgeManager, ChainTeardown, FilterProvider, PortPool, SubnetPool,
};
use burrow_schema::record::{ContainerId, ContainerRecord, Handle, Resources, State};
use burrow_schema::snapshot::{parse_state, ContainerSnapshot};
use burrow_schema::types::{BindMount, BindMountOrigin, ContainerSpec};
use burrow_schema::{Config, Env};
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything the pool needs, bundled so construction sites stay
/// readable.
pub struct PoolConfig {
    /// Directory holding `setup.sh`, `create.sh`, and `destroy.sh`.
    pub bin_path: PathBuf,
    pub depot_path: PathBuf,
    pub config: Config,
    /// Host uid that maps to root inside unprivileged containers.
    pub uid_mapping_base: u32,
    pub external_ip: Ipv4Addr,
    pub mtu: u32,
    pub allow_networks: Vec<String>,
    pub deny_networks: Vec<String>,
    pub version: semver::Version,
    pub subnet_pool: Arc<SubnetPool>,
    pub bridges: Arc<BridgeManager>,
    pub chain_teardown: Arc<dyn ChainTeardown>,
    pub filter_provider: Arc<dyn FilterProvider>,
    pub global_chain: Chain,
    pub port_pool: Arc<PortPool>,
    pub rootfs_provider: Arc<dyn RootFsProvider>,
    pub rootfs_cleaner: Arc<dyn RootFsCleaner>,
    pub mkdir_chowner: Arc<dyn MkdirChowner>,
    pub runner: Arc<dyn burrow_system::CommandRunner>,
}

#[derive(Debug, Default)]
pub struct PruneReport {
    pub destroyed: Vec<String>,
    pub kept: Vec<String>,
    /// Per-container failures, as (container id, description). Pruning
    /// never halts on these; they are reported so operators see what
    /// was left behind.
    pub failures: Vec<(String, String)>,
}

type UndoStep = Box<dyn FnOnce(&ResourcePool)>;

pub struct ResourcePool {
    deps: PoolConfig,
    depot: Depot,
}

impl ResourcePool {
    pub fn new(deps: PoolConfig) -> Self {
        let depot = Depot::new(&deps.depot_path);
        Self { deps, depot }
    }

    pub fn depot(&self) -> &Depot {
        &self.depot
    }

    /// Upper bound on concurrently held containers: the dynamic subnet
    /// pool size.
    pub fn max_containers(&self) -> usize {
        self.deps.subnet_pool.capacity()
    }

    /// One-time host preparation: `setup.sh`, then the global default
    /// chain (allow rules in list order, then deny rules).
    pub fn setup(&self) -> Result<(), PoolError> {
        let mut cmd = burrow_system::Cmd::new(self.script_path("setup.sh")).env(vec![
            format!("CONTAINER_DEPOT_PATH={}", self.depot.root().display()),
            format!("PATH={}", host_path()),
        ]);
        self.deps.runner.run(&mut cmd)?;

        for network in &self.deps.allow_networks {
            if network.is_empty() {
                continue;
            }
            self.deps
                .global_chain
                .append_rule("", network, burrow_network::Action::Return)
                .map_err(PoolError::SetupAllowRules)?;
        }
        for network in &self.deps.deny_networks {
            if network.is_empty() {
                continue;
            }
            self.deps
                .global_chain
                .append_rule("", network, burrow_network::Action::Reject)
                .map_err(PoolError::SetupDenyRules)?;
        }
        Ok(())
    }

    pub fn acquire(&self, spec: ContainerSpec) -> Result<ContainerRecord, PoolError> {
        let id = generate_id();
        let mut undo: Vec<UndoStep> = Vec::new();

        match self.acquire_inner(&id, spec, &mut undo) {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(container = %id, error = %e, "acquire failed, unwinding");
                for step in undo.into_iter().rev() {
                    step(self);
                }
                Err(e)
            }
        }
    }

    fn acquire_inner(
        &self,
        id: &str,
        spec: ContainerSpec,
        undo: &mut Vec<UndoStep>,
    ) -> Result<ContainerRecord, PoolError> {
        let handle = if spec.handle.is_empty() {
            id.to_owned()
        } else {
            spec.handle.clone()
        };

        let (subnet_selector, ip_selector) = parse_network_selection(&spec.network)
            .map_err(|e| PoolError::CreateContainer(e.to_string()))?;

        let (network, first_tenant) =
            self.deps.subnet_pool.acquire(subnet_selector, ip_selector)?;
        undo.push(Box::new(move |pool| {
            if let Err(e) = pool.deps.subnet_pool.release(network) {
                warn!(error = %e, "failed to return subnet during unwind");
            }
        }));

        info!(container = %id, subnet = %network.subnet, first_tenant, "setup-bridge-starting");
        let bridge_name = self.deps.bridges.reserve(network.subnet, id)?;
        {
            let bridge_name = bridge_name.clone();
            let id = id.to_owned();
            undo.push(Box::new(move |pool| {
                if let Err(e) = pool.deps.bridges.release(&bridge_name, &id) {
                    warn!(error = %e, bridge = %bridge_name, "failed to release bridge during unwind");
                }
            }));
        }
        info!(container = %id, bridge = %bridge_name, "setup-bridge-ended");

        info!(container = %id, "provide-rootfs-starting");
        let rootfs_spec = RootFsSpec {
            rootfs: spec.rootfs.clone(),
            namespaced: !spec.privileged,
            quota_size: spec.disk_limits.byte_hard,
            quota_scope: spec.disk_limits.scope,
        };
        let (rootfs_path, rootfs_env) = self.deps.rootfs_provider.create(id, &rootfs_spec)?;
        {
            let id = id.to_owned();
            undo.push(Box::new(move |pool| {
                if let Err(e) = pool.deps.rootfs_provider.destroy(&id) {
                    warn!(error = %e, "failed to destroy rootfs during unwind");
                }
            }));
        }
        self.deps.rootfs_cleaner.clean(&rootfs_path)?;
        info!(container = %id, rootfs = %rootfs_path.display(), "provide-rootfs-ended");

        // Spec env takes precedence over image metadata env; malformed
        // image entries are dropped rather than fatal.
        let spec_env = Env::new(&spec.env)?;
        let merged_env = spec_env.merge(&lenient_env(rootfs_env));

        let container_path = self.depot.container_path(id);
        fs::create_dir_all(&container_path).map_err(PoolError::CreatingContainerDirectory)?;
        {
            let container_path = container_path.clone();
            undo.push(Box::new(move |_| {
                let _ = fs::remove_dir_all(&container_path);
            }));
        }
        fs::write(self.depot.bridge_name_file(id), &bridge_name)?;
        fs::write(
            self.depot.rootfs_provider_file(id),
            self.deps.rootfs_provider.name(),
        )?;
        fs::write(self.depot.version_file(id), self.deps.version.to_string())?;

        // Once create.sh has been attempted, host-side teardown must
        // run on any failure, even create.sh's own.
        {
            let id = id.to_owned();
            let container_path = container_path.clone();
            undo.push(Box::new(move |pool| {
                if let Err(e) = pool.run_destroy_script(&container_path) {
                    warn!(error = %e, "destroy script failed during unwind");
                }
                if let Err(e) = pool.deps.chain_teardown.container_teardown(&id) {
                    warn!(error = %e, "chain teardown failed during unwind");
                }
            }));
        }
        let root_uid = if spec.privileged {
            0
        } else {
            self.deps.uid_mapping_base
        };
        self.run_create_script(&container_path, id, &bridge_name, network, root_uid, &rootfs_path)?;

        self.append_bind_mount_hooks(id, &spec.bind_mounts, &rootfs_path)?;
        for mount in &spec.bind_mounts {
            let destination = join_inside(&rootfs_path, &mount.dst_path);
            self.deps
                .mkdir_chowner
                .mkdir_chown(&destination, root_uid, root_uid, 0o755)?;
        }

        info!(container = %id, "setup-iptables-starting");
        let filter = self.deps.filter_provider.provide(id);
        filter.setup(&handle).map_err(PoolError::SetUpFilter)?;
        undo.push(Box::new(move |_| filter.tear_down()));
        info!(container = %id, "setup-iptables-ended");

        if let Err(e) = self.deps.rootfs_provider.gc() {
            warn!(error = %e, "rootfs garbage collection failed");
        }

        Ok(ContainerRecord {
            id: ContainerId::new(id),
            handle: Handle::new(handle),
            state: State::Born,
            grace_time: spec.grace_time,
            events: Vec::new(),
            resources: Resources {
                root_uid,
                network,
                bridge_name,
                ports: Vec::new(),
            },
            rootfs_provider: self.deps.rootfs_provider.name().to_owned(),
            rootfs_path,
            version: Some(self.deps.version.clone()),
            env: merged_env.entries(),
            properties: spec.properties,
            bind_mounts: spec.bind_mounts,
            container_path,
        })
    }

    /// Destroy a container and return its resources. Firewall teardown
    /// is best-effort; everything after it stops at the first failure
    /// and leaves the remaining resources held for a retry.
    pub fn release(&self, record: &ContainerRecord) -> Result<(), PoolError> {
        let id = record.id.as_str();
        let container_path = self.depot.container_path(id);

        self.deps.filter_provider.provide(id).tear_down();
        if let Err(e) = self.deps.chain_teardown.container_teardown(id) {
            warn!(container = %id, error = %e, "chain teardown failed during release");
        }

        self.run_destroy_script(&container_path)?;

        let tag = self
            .depot
            .read_file(&self.depot.rootfs_provider_file(id))
            .unwrap_or_else(|| record.rootfs_provider.clone());
        self.destroy_rootfs(id, &tag)?;

        let bridge = self
            .depot
            .read_file(&self.depot.bridge_name_file(id))
            .unwrap_or_else(|| record.resources.bridge_name.clone());
        let bridge = bridge.trim();
        if !bridge.is_empty() {
            self.deps
                .bridges
                .release(bridge, id)
                .map_err(|e| PoolError::ReleaseBridge {
                    bridge: bridge.to_owned(),
                    source: e,
                })?;
        }

        if let Err(e) = self.deps.subnet_pool.release(record.resources.network) {
            debug!(container = %id, error = %e, "network was not held at release");
        }
        for port in &record.resources.ports {
            self.deps.port_pool.release(*port);
        }

        let _ = fs::remove_dir_all(&container_path);
        Ok(())
    }

    /// Destroy every depot entry whose id is not in `keep`. A failing
    /// container is reported and skipped, never fatal; afterwards
    /// bridges with no remaining reservation are removed.
    pub fn prune(&self, keep: &HashSet<String>) -> Result<PruneReport, PoolError> {
        let mut report = PruneReport::default();

        for id in self.depot.list()? {
            if keep.contains(&id) {
                report.kept.push(id);
                continue;
            }

            // Depot metadata must be read before destroy.sh tears the
            // directory down.
            let tag = self.depot.read_file(&self.depot.rootfs_provider_file(&id));
            let bridge = self.depot.read_file(&self.depot.bridge_name_file(&id));

            if let Err(e) = self.deps.chain_teardown.container_teardown(&id) {
                warn!(container = %id, error = %e, "chain teardown failed during prune");
                report.failures.push((id, format!("chain teardown: {e}")));
                continue;
            }

            if let Err(e) = self.run_destroy_script(&self.depot.container_path(&id)) {
                warn!(container = %id, error = %e, "destroy script failed during prune");
                report.failures.push((id, format!("destroy.sh: {e}")));
                continue;
            }

            // A missing tag file predates tag recording: clean with the
            // default provider. An empty or unrecognized tag means
            // nothing to clean.
            let effective_tag = tag.unwrap_or_else(|| self.deps.rootfs_provider.name().to_owned());
            if let Err(e) = self.destroy_rootfs(&id, &effective_tag) {
                warn!(container = %id, error = %e, "rootfs destroy failed during prune");
                report
                    .failures
                    .push((id.clone(), format!("rootfs destroy: {e}")));
            }

            if let Some(bridge) = bridge {
                let bridge = bridge.trim();
                if !bridge.is_empty() {
                    if let Err(e) = self.deps.bridges.release(bridge, &id) {
                        warn!(container = %id, bridge, error = %e, "bridge release failed during prune");
                        report
                            .failures
                            .push((id.clone(), format!("release bridge {bridge}: {e}")));
                    }
                }
            }

            let _ = fs::remove_dir_all(self.depot.container_path(&id));
            report.destroyed.push(id);
        }

        self.deps.bridges.prune()?;
        Ok(report)
    }

    /// Rebuild a record from a snapshot, claiming its resources from
    /// the pools so they are never handed out again.
    pub fn restore(&self, snapshot: impl Read) -> Result<ContainerRecord, PoolError> {
        let snapshot = ContainerSnapshot::decode(snapshot)?;
        let network = snapshot.network();

        self.deps.subnet_pool.remove(network)?;

        let mut claimed_ports = Vec::new();
        for port in &snapshot.resources.ports {
            if let Err(e) = self.deps.port_pool.remove(*port) {
                if let Err(release_err) = self.deps.subnet_pool.release(network) {
                    warn!(error = %release_err, "failed to return subnet after port claim failure");
                }
                for claimed in claimed_ports {
                    self.deps.port_pool.release(claimed);
                }
                return Err(e.into());
            }
            claimed_ports.push(*port);
        }

        if let Err(e) =
            self.deps
                .bridges
                .rereserve(&snapshot.resources.bridge, network.subnet, &snapshot.id)
        {
            if let Err(release_err) = self.deps.subnet_pool.release(network) {
                warn!(error = %release_err, "failed to return subnet after bridge rereserve failure");
            }
            return Err(e.into());
        }

        let version = match self.depot.read_file(&self.depot.version_file(&snapshot.id)) {
            Some(raw) => Some(semver::Version::parse(raw.trim())?),
            None => None,
        };

        let container_path = self.depot.container_path(&snapshot.id);
        let rootfs_provider = self
            .depot
            .read_file(&self.depot.rootfs_provider_file(&snapshot.id))
            .unwrap_or_default();

        info!(container = %snapshot.id, "restored container resources");
        Ok(ContainerRecord {
            id: ContainerId::new(&snapshot.id),
            handle: Handle::new(&snapshot.handle),
            state: parse_state(&snapshot.state),
            grace_time: snapshot.grace_time(),
            events: snapshot.events.clone(),
            properties: snapshot.properties.clone(),
            resources: snapshot.into_resources(),
            rootfs_provider,
            rootfs_path: PathBuf::new(),
            version,
            env: Vec::new(),
            bind_mounts: Vec::new(),
            container_path,
        })
    }

    fn destroy_rootfs(&self, id: &str, tag: &str) -> Result<(), PoolError> {
        if tag.is_empty() {
            return Ok(());
        }
        if tag != self.deps.rootfs_provider.name() {
            debug!(container = %id, tag, "unrecognized rootfs provider tag, nothing to clean");
            return Ok(());
        }
        self.deps.rootfs_provider.destroy(id)
    }

    fn script_path(&self, name: &str) -> String {
        self.deps.bin_path.join(name).to_string_lossy().into_owned()
    }

    fn run_destroy_script(&self, container_path: &Path) -> Result<(), PoolError> {
        let mut cmd = burrow_system::Cmd::new(self.script_path("destroy.sh"))
            .arg(container_path.to_string_lossy().into_owned());
        self.deps.runner.run(&mut cmd)?;
        Ok(())
    }

    fn run_create_script(
        &self,
        container_path: &Path,
        id: &str,
        bridge_name: &str,
        network: burrow_schema::record::Network,
        root_uid: u32,
        rootfs_path: &Path,
    ) -> Result<(), PoolError> {
        // Alphabetized keys; create.sh's documented environment.
        let env = vec![
            format!("PATH={}", host_path()),
            format!("bridge_iface={bridge_name}"),
            format!("container_iface_mtu={}", self.deps.mtu),
            format!("external_ip={}", self.deps.external_ip),
            format!("id={id}"),
            format!("network_cidr={}", network.subnet),
            format!("network_cidr_suffix={}", network.subnet.prefix()),
            format!("network_container_ip={}", network.ip),
            format!("network_host_ip={}", network.host_ip()),
            format!("root_uid={root_uid}"),
            format!("rootfs_path={}", rootfs_path.display()),
        ];

        let mut cmd = burrow_system::Cmd::new(self.script_path("create.sh"))
            .arg(container_path.to_string_lossy().into_owned())
            .env(env);
        self.deps.runner.run(&mut cmd)?;
        Ok(())
    }

    /// Each bind mount appends a blank separator, a bind line, and a
    /// remount line to the pre-clone hook script. Container-origin
    /// mounts source from inside the rootfs.
    fn append_bind_mount_hooks(
        &self,
        id: &str,
        mounts: &[BindMount],
        rootfs_path: &Path,
    ) -> Result<(), PoolError> {
        let hook = self.depot.hook_file(id);
        let hook = hook.display();

        for mount in mounts {
            let source = match mount.origin {
                BindMountOrigin::Host => mount.src_path.clone(),
                BindMountOrigin::Container => {
                    join_inside(rootfs_path, &mount.src_path).display().to_string()
                }
            };
            let destination = join_inside(rootfs_path, &mount.dst_path);
            let destination = destination.display();

            self.append_line(&format!("echo >> {hook}"))?;
            self.append_line(&format!(
                "echo mount -n --bind {source} {destination} >> {hook}"
            ))?;
            self.append_line(&format!(
                "echo mount -n --bind -o remount,{} {source} {destination} >> {hook}",
                mount.mode.remount_option()
            ))?;
        }
        Ok(())
    }

    fn append_line(&self, script: &str) -> Result<(), PoolError> {
        let mut cmd = burrow_system::Cmd::new("bash").args(["-c", script]);
        self.deps.runner.run(&mut cmd)?;
        Ok(())
    }
}

fn generate_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

fn host_path() -> String {
    std::env::var("PATH").unwrap_or_default()
}

/// Join a container-absolute path beneath a host directory.
fn join_inside(root: &Path, inner: &str) -> PathBuf {
    root.join(inner.trim_start_matches('/'))
}

/// Image metadata env can contain junk; keep only well-formed entries.
fn lenient_env(entries: Vec<String>) -> Env {
    let valid: Vec<String> = entries
        .into_iter()
        .filter(|entry| {
            entry
                .split_once('=')
                .map(|(key, _)| !key.is_empty())
                .unwrap_or(false)
        })
        .collect();
    Env::new(&valid).unwrap_or_default()
}
