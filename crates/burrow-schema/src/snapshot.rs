//! On-disk snapshot format.
//!
//! A snapshot captures the resources a container holds so the daemon can
//! re-claim them from the pools after a restart. It deliberately does
//! not duplicate what the depot directory already records (bridge name
//! file, rootfs provider tag, version file).

use crate::record::{ContainerRecord, Network, Resources, State};
use crate::SchemaError;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub id: String,
    pub handle: String,
    pub grace_time_ns: u64,
    pub state: String,
    #[serde(default)]
    pub events: Vec<String>,
    pub resources: ResourcesSnapshot,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesSnapshot {
    pub root_uid: u32,
    pub network: NetworkSnapshot,
    pub bridge: String,
    pub ports: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub ip: Ipv4Addr,
    pub subnet: Ipv4Network,
}

impl ContainerSnapshot {
    pub fn decode(reader: impl Read) -> Result<Self, SchemaError> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn encode(&self, writer: impl Write) -> Result<(), SchemaError> {
        Ok(serde_json::to_writer(writer, self)?)
    }

    pub fn from_record(record: &ContainerRecord) -> Self {
        Self {
            id: record.id.to_string(),
            handle: record.handle.to_string(),
            grace_time_ns: record.grace_time.as_nanos() as u64,
            state: record.state.to_string(),
            events: record.events.clone(),
            resources: ResourcesSnapshot {
                root_uid: record.resources.root_uid,
                network: NetworkSnapshot {
                    ip: record.resources.network.ip,
                    subnet: record.resources.network.subnet,
                },
                bridge: record.resources.bridge_name.clone(),
                ports: record.resources.ports.clone(),
            },
            properties: record.properties.clone(),
        }
    }

    pub fn grace_time(&self) -> Duration {
        Duration::from_nanos(self.grace_time_ns)
    }

    pub fn network(&self) -> Network {
        Network {
            ip: self.resources.network.ip,
            subnet: self.resources.network.subnet,
        }
    }

    pub fn into_resources(self) -> Resources {
        Resources {
            root_uid: self.resources.root_uid,
            network: Network {
                ip: self.resources.network.ip,
                subnet: self.resources.network.subnet,
            },
            bridge_name: self.resources.bridge,
            ports: self.resources.ports,
        }
    }
}

/// Parse a snapshot's state string back into a [`State`]. Unknown
/// strings map to `Stopped` so a newer daemon never resurrects a state
/// it cannot reason about.
pub fn parse_state(s: &str) -> State {
    match s {
        "born" => State::Born,
        "active" => State::Active,
        "destroyed" => State::Destroyed,
        _ => State::Stopped,
    }
}
