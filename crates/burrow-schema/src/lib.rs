//! Declarative types shared across the burrow container daemon.
//!
//! This crate defines the schema layer: container and process
//! specifications (`ContainerSpec`, `ProcessSpec`), egress rule
//! structures (`NetOutRule`), environment-variable list handling
//! (`Env`), daemon naming configuration (`Config`), the persistent
//! container record, and the on-disk snapshot format.

pub mod config;
pub mod env;
pub mod record;
pub mod snapshot;
pub mod types;

pub use config::{Config, FilterConfig, NatConfig};
pub use env::Env;
pub use record::{ContainerId, ContainerRecord, Handle, Network, Resources, State};
pub use snapshot::{ContainerSnapshot, NetworkSnapshot, ResourcesSnapshot};
pub use types::{
    BandwidthLimits, BandwidthStat, BindMount, BindMountMode, BindMountOrigin, ContainerSpec,
    DiskLimitScope, DiskLimits, IcmpControl, IpRange, NetOutRule, PortRange, ProcessIo,
    ProcessSpec, Protocol, ResourceLimits, TtySpec, WindowSize,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("process: malformed environment: {0:?}")]
    MalformedEnvironment(String),
    #[error("snapshot decode: {0}")]
    SnapshotDecode(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
