//! The daemon's registry of live containers.
//!
//! The remote API layer (out of tree) resolves client requests to
//! handles; everything behind that seam happens here: create, lookup,
//! destroy, startup restore from snapshots, pruning of orphaned depot
//! entries, periodic grace-time sweeps, and snapshot writes on clean
//! shutdown.

use burrow_container::{Container, ContainerDeps, ContainerError, ProcessTracker};
use burrow_network::{FilterProvider, PortPool};
use burrow_pool::{PoolError, PruneReport, ResourcePool};
use burrow_schema::record::ContainerRecord;
use burrow_schema::snapshot::ContainerSnapshot;
use burrow_schema::types::ContainerSpec;
use burrow_system::CommandRunner;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("container handle already exists: {0}")]
    HandleAlreadyExists(String),
    #[error("unknown container handle: {0}")]
    HandleNotFound(String),
    #[error("{0}")]
    Pool(#[from] PoolError),
    #[error("{0}")]
    Container(#[from] ContainerError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

type TrackerFactory = Box<dyn Fn(&ContainerRecord) -> Arc<dyn ProcessTracker> + Send + Sync>;

pub struct Backend {
    pool: Arc<ResourcePool>,
    filter_provider: Arc<dyn FilterProvider>,
    port_pool: Arc<PortPool>,
    runner: Arc<dyn CommandRunner>,
    tracker_factory: TrackerFactory,
    containers: Mutex<HashMap<String, Arc<Container>>>,
}

impl Backend {
    pub fn new(
        pool: Arc<ResourcePool>,
        filter_provider: Arc<dyn FilterProvider>,
        port_pool: Arc<PortPool>,
        runner: Arc<dyn CommandRunner>,
        tracker_factory: TrackerFactory,
    ) -> Self {
        Self {
            pool,
            filter_provider,
            port_pool,
            runner,
            tracker_factory,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// One-time host preparation, delegated to the pool.
    pub fn setup(&self) -> Result<(), BackendError> {
        Ok(self.pool.setup()?)
    }

    fn build_container(&self, record: ContainerRecord) -> Arc<Container> {
        let deps = ContainerDeps {
            tracker: (self.tracker_factory)(&record),
            filter: self.filter_provider.provide(record.id.as_str()),
            port_pool: Arc::clone(&self.port_pool),
            runner: Arc::clone(&self.runner),
        };
        Arc::new(Container::new(record, deps))
    }

    pub fn create(&self, spec: ContainerSpec) -> Result<Arc<Container>, BackendError> {
        if !spec.handle.is_empty() && self.containers.lock().unwrap().contains_key(&spec.handle) {
            return Err(BackendError::HandleAlreadyExists(spec.handle));
        }

        let record = self.pool.acquire(spec)?;
        let handle = record.handle.to_string();
        let container = self.build_container(record);
        container.mark_active();

        self.containers
            .lock()
            .unwrap()
            .insert(handle.clone(), Arc::clone(&container));
        info!(handle, container = %container.id(), "created container");
        Ok(container)
    }

    pub fn lookup(&self, handle: &str) -> Result<Arc<Container>, BackendError> {
        self.containers
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .ok_or_else(|| BackendError::HandleNotFound(handle.to_owned()))
    }

    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
        handles.sort();
        handles
    }

    /// Stop and release a container. On release failure the handle is
    /// kept so the operator can retry.
    pub fn destroy(&self, handle: &str) -> Result<(), BackendError> {
        let container = self.lookup(handle)?;
        container.stop(true);

        if let Err(e) = self.pool.release(&container.record()) {
            warn!(handle, error = %e, "release failed; container kept for retry");
            return Err(e.into());
        }

        self.containers.lock().unwrap().remove(handle);
        info!(handle, "destroyed container");
        Ok(())
    }

    /// Rebuild containers from depot snapshots. Returns the ids of
    /// everything restored; those must survive the startup prune.
    pub fn restore_depot(&self) -> Result<HashSet<String>, BackendError> {
        let mut keep = HashSet::new();

        for id in self.pool.depot().list()? {
            let snapshot_path = self.pool.depot().snapshot_file(&id);
            if !snapshot_path.exists() {
                continue;
            }

            let file = std::fs::File::open(&snapshot_path)?;
            match self.pool.restore(file) {
                Ok(record) => {
                    let handle = record.handle.to_string();
                    let container = self.build_container(record);
                    self.containers
                        .lock()
                        .unwrap()
                        .insert(handle, container);
                    keep.insert(id);
                }
                Err(e) => {
                    warn!(container = %id, error = %e, "snapshot restore failed; container will be pruned");
                }
            }
        }

        info!(restored = keep.len(), "depot restore complete");
        Ok(keep)
    }

    /// Destroy every depot entry that did not restore.
    pub fn prune_stale(&self, keep: &HashSet<String>) -> Result<PruneReport, BackendError> {
        Ok(self.pool.prune(keep)?)
    }

    /// Write a snapshot for every live container, atomically.
    pub fn snapshot_all(&self) -> Result<(), BackendError> {
        for container in self.containers.lock().unwrap().values() {
            let record = container.record();
            let snapshot = ContainerSnapshot::from_record(&record);
            let path = self.pool.depot().snapshot_file(record.id.as_str());

            let dir = self.pool.depot().container_path(record.id.as_str());
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            serde_json::to_writer(&mut tmp, &snapshot)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            tmp.flush()?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
        }
        Ok(())
    }

    /// Release containers idle beyond their grace time. Returns the
    /// destroyed handles.
    pub fn sweep_idle(&self) -> Vec<String> {
        let expired: Vec<String> = {
            let containers = self.containers.lock().unwrap();
            containers
                .iter()
                .filter(|(_, container)| {
                    let grace = container.grace_time();
                    grace > Duration::ZERO && container.idle_for() > grace
                })
                .map(|(handle, _)| handle.clone())
                .collect()
        };

        let mut destroyed = Vec::new();
        for handle in expired {
            match self.destroy(&handle) {
                Ok(()) => {
                    info!(handle, "reaped idle container");
                    destroyed.push(handle);
                }
                Err(e) => warn!(handle, error = %e, "failed to reap idle container"),
            }
        }
        destroyed
    }
}
