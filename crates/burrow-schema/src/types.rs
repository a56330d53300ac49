//! Specification structures handed to the daemon by the API layer.
//!
//! These mirror the remote protocol's request bodies but are plain data:
//! the wire encoding lives outside this repository.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Declarative request for a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Client-chosen name, unique within the host. Empty means the
    /// daemon picks the container id as the handle.
    pub handle: String,
    /// Network selection string. Empty for fully dynamic allocation;
    /// `A.B.C.D/N` for a static subnet (non-zero host bits also pin the
    /// IP); a bare address is treated as a /30.
    pub network: String,
    /// Rootfs location understood by the rootfs provider. Empty selects
    /// the provider's default image.
    pub rootfs: String,
    pub privileged: bool,
    pub grace_time: Duration,
    pub env: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub bind_mounts: Vec<BindMount>,
    pub disk_limits: DiskLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    pub mode: BindMountMode,
    pub origin: BindMountOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindMountMode {
    ReadOnly,
    ReadWrite,
}

impl BindMountMode {
    pub fn remount_option(self) -> &'static str {
        match self {
            BindMountMode::ReadOnly => "ro",
            BindMountMode::ReadWrite => "rw",
        }
    }
}

/// Where the bind-mount source lives: on the host, or inside the
/// container's own rootfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindMountOrigin {
    Host,
    Container,
}

/// Disk quota request, forwarded verbatim to the rootfs provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskLimits {
    pub byte_hard: u64,
    pub scope: DiskLimitScope,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiskLimitScope {
    #[default]
    Total,
    Exclusive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthLimits {
    pub rate_in_bytes_per_second: u64,
    pub burst_rate_in_bytes_per_second: u64,
}

/// Observed bandwidth configuration, as reported by `net.sh`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthStat {
    pub in_rate: u64,
    pub in_burst: u64,
    pub out_rate: u64,
    pub out_burst: u64,
}

/// Request to run a process inside a container.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Name of the user to run as. Required.
    pub user: String,
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub dir: Option<String>,
    pub tty: Option<TtySpec>,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtySpec {
    pub window_size: Option<WindowSize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
}

/// Optional rlimits for a spawned process. Only set members are applied,
/// and only set members appear in the `RLIMIT_*` environment handed to
/// the supervisor client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub r#as: Option<u64>,
    pub core: Option<u64>,
    pub cpu: Option<u64>,
    pub data: Option<u64>,
    pub fsize: Option<u64>,
    pub locks: Option<u64>,
    pub memlock: Option<u64>,
    pub msgqueue: Option<u64>,
    pub nice: Option<u64>,
    pub nofile: Option<u64>,
    pub nproc: Option<u64>,
    pub rss: Option<u64>,
    pub rtprio: Option<u64>,
    pub sigpending: Option<u64>,
    pub stack: Option<u64>,
}

impl ResourceLimits {
    /// The set limits as `RLIMIT_<NAME>=<n>` strings, in the fixed order
    /// the supervisor client expects.
    pub fn to_env(&self) -> Vec<String> {
        let pairs: [(&str, Option<u64>); 15] = [
            ("AS", self.r#as),
            ("CORE", self.core),
            ("CPU", self.cpu),
            ("DATA", self.data),
            ("FSIZE", self.fsize),
            ("LOCKS", self.locks),
            ("MEMLOCK", self.memlock),
            ("MSGQUEUE", self.msgqueue),
            ("NICE", self.nice),
            ("NOFILE", self.nofile),
            ("NPROC", self.nproc),
            ("RSS", self.rss),
            ("RTPRIO", self.rtprio),
            ("SIGPENDING", self.sigpending),
            ("STACK", self.stack),
        ];

        pairs
            .iter()
            .filter_map(|(name, value)| value.map(|v| format!("RLIMIT_{name}={v}")))
            .collect()
    }
}

/// Streams attached to a running process. Any side may be absent; an
/// absent stdin reads as immediate EOF inside the container.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<Box<dyn Read + Send>>,
    pub stdout: Option<Box<dyn Write + Send>>,
    pub stderr: Option<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// High-level egress allow-rule, translated by the firewall into
/// iptables invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetOutRule {
    pub protocol: Protocol,
    pub networks: Vec<IpRange>,
    pub ports: Vec<PortRange>,
    pub icmps: Option<IcmpControl>,
    pub log: bool,
}

/// Egress protocol selector. Remote clients send protocols as numbers,
/// so values outside the known set are representable and rejected at
/// translation time rather than at decode time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    All,
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl Protocol {
    pub fn from_wire(n: u8) -> Self {
        match n {
            0 => Protocol::All,
            1 => Protocol::Tcp,
            2 => Protocol::Udp,
            3 => Protocol::Icmp,
            other => Protocol::Other(other),
        }
    }
}

/// Destination address range. Either bound may be absent; a single
/// bound means an exact destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpRange {
    pub start: Option<Ipv4Addr>,
    pub end: Option<Ipv4Addr>,
}

impl IpRange {
    pub fn single(ip: Ipv4Addr) -> Self {
        Self {
            start: Some(ip),
            end: None,
        }
    }

    pub fn range(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpControl {
    pub icmp_type: u8,
    pub code: Option<u8>,
}
