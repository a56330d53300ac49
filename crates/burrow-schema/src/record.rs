//! The persistent container record and its resource bundle.

use crate::types::BindMount;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::Deref;
use std::path::PathBuf;
use std::time::Duration;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<std::path::Path> for $name {
            fn as_ref(&self) -> &std::path::Path {
                std::path::Path::new(&self.0)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Short opaque container identifier, also used as the depot
    /// directory name and as a suffix in chain and bridge names.
    ContainerId
);

string_newtype!(
    /// Client-chosen container name, unique within the host.
    Handle
);

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Born,
    Active,
    Stopped,
    Destroyed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Born => write!(f, "born"),
            State::Active => write!(f, "active"),
            State::Stopped => write!(f, "stopped"),
            State::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// The (subnet, IP) pair a container occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    pub ip: Ipv4Addr,
    pub subnet: Ipv4Network,
}

impl Network {
    /// The host-side gateway address of the subnet (first host address).
    pub fn host_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.network()) + 1)
    }
}

/// Host resources held by one container.
#[derive(Debug, Clone)]
pub struct Resources {
    pub root_uid: u32,
    pub network: Network,
    pub bridge_name: String,
    pub ports: Vec<u32>,
}

/// Everything the daemon knows about one container. A record exists iff
/// the container's depot directory exists.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub handle: Handle,
    pub state: State,
    pub grace_time: Duration,
    pub events: Vec<String>,
    pub resources: Resources,
    /// Tag of the rootfs backend that owns the root directory. Empty
    /// means there is nothing to clean up on destroy.
    pub rootfs_provider: String,
    pub rootfs_path: PathBuf,
    /// Daemon version that created the container; `None` for containers
    /// created before versions were recorded. Selects the in-container
    /// signalling mechanism.
    pub version: Option<semver::Version>,
    pub env: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub bind_mounts: Vec<BindMount>,
    pub container_path: PathBuf,
}
