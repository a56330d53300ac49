//! The per-container handle and its process machinery.
//!
//! A [`Container`] wraps the record the pool produced and routes
//! process execution into the in-container supervisor via the `wsh`
//! client binary, tracks running processes and their exit statuses,
//! delivers signals (link or pidfile-based, by container version), and
//! exposes the bandwidth, port-mapping, and egress-rule surfaces.

pub mod bandwidth;
pub mod container;
pub mod signaller;
pub mod tracker;

pub use bandwidth::BandwidthManager;
pub use container::{Container, ContainerDeps, ContainerInfo};
pub use signaller::{LinkSignaller, NamespacedSignaller, Signaller};
pub use tracker::{ProcessHandle, ProcessTracker, SignallerSpec, StdProcessTracker};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("a user for the process to run as must be specified")]
    UserNotSpecified,
    #[error("process {0} not found")]
    ProcessNotFound(u32),
    #[error("stream operation failed with status {0}")]
    StreamFailed(u8),
    #[error("pidfile {0} was never written")]
    PidfileUnavailable(PathBuf),
    #[error("unparseable rate limit output: {0:?}")]
    UnparseableRate(String),
    #[error("{0}")]
    Schema(#[from] burrow_schema::SchemaError),
    #[error("{0}")]
    Network(#[from] burrow_network::NetworkError),
    #[error("{0}")]
    System(#[from] burrow_system::SystemError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
