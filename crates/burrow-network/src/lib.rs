//! Host network resources for the burrow container daemon.
//!
//! This crate implements the allocators the resource pool draws from —
//! the subnet pool (subnet+IP pairs), the refcounted bridge manager,
//! and the host port pool — and the iptables layer that turns
//! high-level egress rules into deterministic command sequences.

pub mod bridge;
pub mod filter;
pub mod iptables;
pub mod ports;
pub mod subnets;

pub use bridge::{BridgeDestroyer, BridgeLister, BridgeManager, SysfsBridgeLister};
pub use filter::{
    ChainTeardown, Filter, FilterProvider, InstanceFilter, InstanceFilterProvider, IptablesManager,
};
pub use iptables::{Action, Chain};
pub use ports::PortPool;
pub use subnets::{parse_network_selection, IpSelector, SubnetPool, SubnetSelector};

use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("invalid network spec: {0}")]
    InvalidNetworkSpec(String),
    #[error("insufficient subnets remaining in the pool")]
    InsufficientSubnets,
    #[error("insufficient IPs remaining in the subnet")]
    InsufficientIps,
    #[error("the requested IP is already allocated: {0}")]
    IpAlreadyAcquired(Ipv4Addr),
    #[error("the requested IP is not within the subnet")]
    IpOutsideSubnet(Ipv4Addr),
    #[error("the subnet overlaps the dynamic allocation range")]
    OverlapsDynamicRange,
    #[error("released network was not allocated")]
    ReleasedUnallocatedNetwork,
    #[error("port pool is exhausted")]
    PortPoolExhausted,
    #[error("the requested port is already allocated: {0}")]
    PortAlreadyAcquired(u32),
    #[error("cannot re-reserve an empty bridge name")]
    EmptyBridgeName,
    #[error("iptables: log chain setup: {0}")]
    LogChainSetup(String),
    #[error("iptables: {0}")]
    Iptables(String),
    #[error("invalid protocol: {0}")]
    InvalidProtocol(u8),
    #[error("Ports cannot be specified for Protocol {0}")]
    PortsNotAllowed(&'static str),
    #[error("{0}")]
    Command(#[from] burrow_system::SystemError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
