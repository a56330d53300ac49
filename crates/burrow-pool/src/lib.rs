//! Resource pool and container lifecycle management.
//!
//! This crate ties the host-side allocators together into the
//! [`ResourcePool`]: given a container spec it materializes every host
//! resource (subnet + IP, bridge, depot directory, rootfs, firewall
//! chains) or leaves no side effects at all, and it owns the reverse
//! paths — release, crash-safe pruning, and snapshot restore.

pub mod depot;
pub mod pool;
pub mod providers;

pub use depot::Depot;
pub use pool::{PoolConfig, PruneReport, ResourcePool};
pub use providers::{
    ChownMkdirChowner, MkdirChowner, RootFsCleaner, RootFsProvider, RootFsSpec,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("create container: {0}")]
    CreateContainer(String),
    #[error("resource_pool: creating container directory: {0}")]
    CreatingContainerDirectory(std::io::Error),
    #[error("resource_pool: setting up allow rules in iptables: {0}")]
    SetupAllowRules(burrow_network::NetworkError),
    #[error("resource_pool: setting up deny rules in iptables: {0}")]
    SetupDenyRules(burrow_network::NetworkError),
    #[error("resource_pool: set up filter: {0}")]
    SetUpFilter(burrow_network::NetworkError),
    #[error("resource_pool: release bridge {bridge}: {source}")]
    ReleaseBridge {
        bridge: String,
        source: burrow_network::NetworkError,
    },
    #[error("resource_pool: invalid version file: {0}")]
    InvalidVersion(#[from] semver::Error),
    #[error("{0}")]
    RootFs(String),
    #[error("{0}")]
    Network(#[from] burrow_network::NetworkError),
    #[error("{0}")]
    Schema(#[from] burrow_schema::SchemaError),
    #[error("{0}")]
    Command(#[from] burrow_system::SystemError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
