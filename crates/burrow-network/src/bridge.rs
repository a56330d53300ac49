//! Refcounted bridge management.
//!
//! A bridge exists while at least one container occupies its subnet.
//! The manager owns naming and reservation counting; actual interface
//! creation happens in `create.sh` (which receives the name), and
//! destruction goes through the [`BridgeDestroyer`] seam when the last
//! reservation is released.

use crate::NetworkError;
use burrow_system::{Cmd, CommandRunner};
use ipnetwork::Ipv4Network;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub trait BridgeDestroyer: Send + Sync {
    fn destroy(&self, name: &str) -> Result<(), NetworkError>;
}

pub trait BridgeLister: Send + Sync {
    fn list(&self) -> Result<Vec<String>, NetworkError>;
}

/// Destroys bridges with `ip link del`.
pub struct IpLinkDestroyer {
    runner: Arc<dyn CommandRunner>,
}

impl IpLinkDestroyer {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl BridgeDestroyer for IpLinkDestroyer {
    fn destroy(&self, name: &str) -> Result<(), NetworkError> {
        let mut cmd = Cmd::new("ip").args(["link", "del", name]);
        self.runner.run(&mut cmd)?;
        Ok(())
    }
}

/// Lists host interfaces from `/sys/class/net`.
pub struct SysfsBridgeLister {
    root: PathBuf,
}

impl SysfsBridgeLister {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/sys/class/net"),
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsBridgeLister {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeLister for SysfsBridgeLister {
    fn list(&self) -> Result<Vec<String>, NetworkError> {
        let mut names = Vec::new();
        if !self.root.exists() {
            return Ok(names);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        Ok(names)
    }
}

pub struct BridgeManager {
    prefix: String,
    destroyer: Arc<dyn BridgeDestroyer>,
    lister: Arc<dyn BridgeLister>,
    reservations: Mutex<HashMap<String, HashSet<String>>>,
}

impl BridgeManager {
    /// `prefix` is the interface prefix bridges are named under
    /// (e.g. `w0b-`); only interfaces carrying it are ever touched.
    pub fn new(
        prefix: impl Into<String>,
        destroyer: Arc<dyn BridgeDestroyer>,
        lister: Arc<dyn BridgeLister>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            destroyer,
            lister,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// The deterministic bridge name for a subnet, within IFNAMSIZ.
    pub fn bridge_name(&self, subnet: Ipv4Network) -> String {
        let mut name = format!("{}{:08x}", self.prefix, u32::from(subnet.network()));
        name.truncate(15);
        name
    }

    /// Reserve the subnet's bridge for a container. The returned name
    /// goes into `create.sh`'s environment; the script creates the
    /// interface when this is the first reservation.
    pub fn reserve(
        &self,
        subnet: Ipv4Network,
        container_id: &str,
    ) -> Result<String, NetworkError> {
        let name = self.bridge_name(subnet);
        let mut reservations = self.reservations.lock().unwrap();
        reservations
            .entry(name.clone())
            .or_default()
            .insert(container_id.to_owned());
        debug!(bridge = %name, container = container_id, "reserved bridge");
        Ok(name)
    }

    /// Re-install a reservation recorded in a snapshot.
    pub fn rereserve(
        &self,
        name: &str,
        _subnet: Ipv4Network,
        container_id: &str,
    ) -> Result<(), NetworkError> {
        if name.is_empty() {
            return Err(NetworkError::EmptyBridgeName);
        }
        let mut reservations = self.reservations.lock().unwrap();
        reservations
            .entry(name.to_owned())
            .or_default()
            .insert(container_id.to_owned());
        Ok(())
    }

    /// Drop a reservation; the last one out destroys the bridge.
    pub fn release(&self, name: &str, container_id: &str) -> Result<(), NetworkError> {
        let destroy = {
            let mut reservations = self.reservations.lock().unwrap();
            match reservations.get_mut(name) {
                Some(owners) => {
                    owners.remove(container_id);
                    if owners.is_empty() {
                        reservations.remove(name);
                        true
                    } else {
                        false
                    }
                }
                // Unknown bridge: nothing holds it, so destroy it.
                None => true,
            }
        };

        if destroy {
            debug!(bridge = %name, "destroying unreserved bridge");
            self.destroyer.destroy(name)?;
        }
        Ok(())
    }

    /// Destroy every host bridge carrying our prefix that has no
    /// reservation. Per-bridge failures are logged, not surfaced.
    pub fn prune(&self) -> Result<(), NetworkError> {
        let names = self.lister.list()?;
        let reservations = self.reservations.lock().unwrap();
        for name in names {
            if !name.starts_with(&self.prefix) || reservations.contains_key(&name) {
                continue;
            }
            if let Err(e) = self.destroyer.destroy(&name) {
                warn!(bridge = %name, error = %e, "failed to prune bridge");
            }
        }
        Ok(())
    }
}

pub mod fake {
    use super::*;

    /// Records destroyed bridge names; optionally fails.
    #[derive(Default)]
    pub struct FakeBridgeDestroyer {
        pub destroyed: Mutex<Vec<String>>,
        pub fail: Mutex<Option<String>>,
    }

    impl BridgeDestroyer for FakeBridgeDestroyer {
        fn destroy(&self, name: &str) -> Result<(), NetworkError> {
            if let Some(message) = self.fail.lock().unwrap().clone() {
                return Err(NetworkError::Iptables(message));
            }
            self.destroyed.lock().unwrap().push(name.to_owned());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeBridgeLister {
        pub names: Mutex<Vec<String>>,
    }

    impl BridgeLister for FakeBridgeLister {
        fn list(&self) -> Result<Vec<String>, NetworkError> {
            Ok(self.names.lock().unwrap().clone())
        }
    }
}
