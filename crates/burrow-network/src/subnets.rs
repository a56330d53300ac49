//! The subnet pool: an allocator over a configured IP range handing out
//! (subnet, IP) pairs.
//!
//! Dynamic allocations carve /30 subnets out of the configured range,
//! so each dynamically-networked container is the sole tenant of its
//! subnet. Static subnets are caller-chosen, may host many containers,
//! and must not overlap the dynamic range. `remove` claims a pair
//! without allocating it, so state restored from snapshots is never
//! handed out twice.

use crate::NetworkError;
use burrow_schema::record::Network;
use ipnetwork::Ipv4Network;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetSelector {
    Dynamic,
    Static(Ipv4Network),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSelector {
    Dynamic,
    Static(Ipv4Addr),
}

/// Parse a container spec's network string into selectors.
///
/// Empty ⇒ dynamic subnet and IP. `A.B.C.D/N` with zero host bits ⇒
/// static subnet, dynamic IP; non-zero host bits pin the IP too. A bare
/// address is treated as a /30.
pub fn parse_network_selection(
    spec: &str,
) -> Result<(SubnetSelector, IpSelector), NetworkError> {
    if spec.is_empty() {
        return Ok((SubnetSelector::Dynamic, IpSelector::Dynamic));
    }

    let with_suffix = if spec.contains('/') {
        spec.to_owned()
    } else {
        format!("{spec}/30")
    };

    let requested: Ipv4Network = with_suffix
        .parse()
        .map_err(|e| NetworkError::InvalidNetworkSpec(format!("{e}: {with_suffix}")))?;

    let subnet = Ipv4Network::new(requested.network(), requested.prefix())
        .map_err(|e| NetworkError::InvalidNetworkSpec(e.to_string()))?;

    let ip = if requested.ip() == requested.network() {
        IpSelector::Dynamic
    } else {
        IpSelector::Static(requested.ip())
    };

    Ok((SubnetSelector::Static(subnet), ip))
}

pub struct SubnetPool {
    dynamic_range: Ipv4Network,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Free /30 subnets within the dynamic range, in allocation order.
    dynamic_free: Vec<Ipv4Network>,
    /// Container IPs allocated per subnet (dynamic and static alike).
    allocated: HashMap<Ipv4Network, Vec<Ipv4Addr>>,
}

impl SubnetPool {
    pub fn new(dynamic_range: Ipv4Network) -> Self {
        let mut free = Vec::new();
        let base = u32::from(dynamic_range.network());
        let count = dynamic_range.size() / 4;
        for i in 0..count {
            if let Ok(subnet) = Ipv4Network::new(Ipv4Addr::from(base + i * 4), 30) {
                free.push(subnet);
            }
        }

        Self {
            dynamic_range,
            state: Mutex::new(PoolState {
                dynamic_free: free,
                allocated: HashMap::new(),
            }),
        }
    }

    /// Total number of dynamic subnets the pool can hand out.
    pub fn capacity(&self) -> usize {
        (self.dynamic_range.size() / 4) as usize
    }

    /// Allocate a (subnet, IP) pair. The boolean is true when the
    /// container is the first tenant of the subnet.
    pub fn acquire(
        &self,
        subnet: SubnetSelector,
        ip: IpSelector,
    ) -> Result<(Network, bool), NetworkError> {
        let mut state = self.state.lock().unwrap();

        let chosen = match subnet {
            SubnetSelector::Dynamic => {
                if state.dynamic_free.is_empty() {
                    return Err(NetworkError::InsufficientSubnets);
                }
                state.dynamic_free.remove(0)
            }
            SubnetSelector::Static(subnet) => {
                if subnet.overlaps(self.dynamic_range) {
                    return Err(NetworkError::OverlapsDynamicRange);
                }
                subnet
            }
        };

        let first = state
            .allocated
            .get(&chosen)
            .map(Vec::is_empty)
            .unwrap_or(true);

        let result = Self::pick_ip(&mut state, chosen, ip);
        match result {
            Ok(chosen_ip) => Ok((
                Network {
                    ip: chosen_ip,
                    subnet: chosen,
                },
                first,
            )),
            Err(e) => {
                // Hand a dynamically carved subnet straight back.
                if matches!(subnet, SubnetSelector::Dynamic) {
                    state.dynamic_free.insert(0, chosen);
                }
                Err(e)
            }
        }
    }

    fn pick_ip(
        state: &mut PoolState,
        subnet: Ipv4Network,
        selector: IpSelector,
    ) -> Result<Ipv4Addr, NetworkError> {
        let taken = state.allocated.entry(subnet).or_default();

        let network = u32::from(subnet.network());
        let gateway = Ipv4Addr::from(network + 1);
        let broadcast = subnet.broadcast();

        let ip = match selector {
            IpSelector::Static(ip) => {
                if !subnet.contains(ip) {
                    return Err(NetworkError::IpOutsideSubnet(ip));
                }
                if ip == subnet.network() || ip == gateway || ip == broadcast {
                    return Err(NetworkError::IpAlreadyAcquired(ip));
                }
                if taken.contains(&ip) {
                    return Err(NetworkError::IpAlreadyAcquired(ip));
                }
                ip
            }
            IpSelector::Dynamic => {
                let mut found = None;
                for candidate in (network + 2)..u32::from(broadcast) {
                    let candidate = Ipv4Addr::from(candidate);
                    if !taken.contains(&candidate) {
                        found = Some(candidate);
                        break;
                    }
                }
                found.ok_or(NetworkError::InsufficientIps)?
            }
        };

        taken.push(ip);
        Ok(ip)
    }

    /// Return a pair to the pool. True when the container was the last
    /// tenant and the subnet itself became free.
    pub fn release(&self, network: Network) -> Result<bool, NetworkError> {
        let mut state = self.state.lock().unwrap();

        let taken = state
            .allocated
            .get_mut(&network.subnet)
            .ok_or(NetworkError::ReleasedUnallocatedNetwork)?;
        let position = taken
            .iter()
            .position(|ip| *ip == network.ip)
            .ok_or(NetworkError::ReleasedUnallocatedNetwork)?;
        taken.remove(position);

        let last = taken.is_empty();
        if last {
            state.allocated.remove(&network.subnet);
            if self.dynamic_range.contains(network.subnet.network()) {
                state.dynamic_free.push(network.subnet);
            }
        }
        Ok(last)
    }

    /// Claim a restored pair so it is never allocated dynamically.
    pub fn remove(&self, network: Network) -> Result<(), NetworkError> {
        let mut state = self.state.lock().unwrap();

        if let Some(position) = state
            .dynamic_free
            .iter()
            .position(|subnet| *subnet == network.subnet)
        {
            state.dynamic_free.remove(position);
        }

        let taken = state.allocated.entry(network.subnet).or_default();
        if taken.contains(&network.ip) {
            return Err(NetworkError::IpAlreadyAcquired(network.ip));
        }
        taken.push(network.ip);
        Ok(())
    }
}
