//! The container handle.
//!
//! All client-visible operations on a live container route through
//! here: process execution and attachment, stream in/out, info,
//! bandwidth and port-mapping changes, and egress rules. The handle
//! owns the per-container process-id counter and picks the signalling
//! mechanism from the record's version.

use crate::bandwidth::BandwidthManager;
use crate::tracker::{ProcessHandle, ProcessTracker, SignallerSpec};
use crate::ContainerError;
use burrow_network::{Filter, PortPool};
use burrow_schema::record::{ContainerRecord, State};
use burrow_schema::types::{
    BandwidthLimits, BandwidthStat, NetOutRule, ProcessIo, ProcessSpec,
};
use burrow_schema::Env;
use burrow_system::{Cmd, CommandRunner};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct ContainerDeps {
    pub tracker: Arc<dyn ProcessTracker>,
    pub filter: Arc<dyn Filter>,
    pub port_pool: Arc<PortPool>,
    pub runner: Arc<dyn CommandRunner>,
}

/// Point-in-time view of a container.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub state: String,
    pub events: Vec<String>,
    pub host_ip: Ipv4Addr,
    pub container_ip: Ipv4Addr,
    pub container_path: PathBuf,
    pub process_ids: Vec<u32>,
    pub properties: BTreeMap<String, String>,
    pub mapped_ports: Vec<u32>,
}

pub struct Container {
    record: Mutex<ContainerRecord>,
    deps: ContainerDeps,
    bandwidth: BandwidthManager,
    next_process_id: AtomicU32,
    last_activity: Mutex<Instant>,
}

impl Container {
    pub fn new(record: ContainerRecord, deps: ContainerDeps) -> Self {
        let bandwidth = BandwidthManager::new(
            record.container_path.clone(),
            record.id.as_str(),
            Arc::clone(&deps.runner),
        );
        Self {
            record: Mutex::new(record),
            deps,
            bandwidth,
            next_process_id: AtomicU32::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> String {
        self.record.lock().unwrap().id.to_string()
    }

    pub fn handle(&self) -> String {
        self.record.lock().unwrap().handle.to_string()
    }

    /// Snapshot of the record, for persistence and inspection.
    pub fn record(&self) -> ContainerRecord {
        self.record.lock().unwrap().clone()
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Time since the last client-driven operation.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn grace_time(&self) -> Duration {
        self.record.lock().unwrap().grace_time
    }

    pub fn set_grace_time(&self, grace_time: Duration) {
        self.touch();
        self.record.lock().unwrap().grace_time = grace_time;
    }

    pub fn mark_active(&self) {
        self.record.lock().unwrap().state = State::Active;
    }

    /// Spawn a process inside the container via `wsh`.
    pub fn run(
        &self,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Arc<dyn ProcessHandle>, ContainerError> {
        self.touch();

        if spec.user.is_empty() {
            return Err(ContainerError::UserNotSpecified);
        }

        let spec_env = Env::new(&spec.env)?;
        let (container_path, container_env, version) = {
            let record = self.record.lock().unwrap();
            (
                record.container_path.clone(),
                record.env.clone(),
                record.version.clone(),
            )
        };
        // The record env was validated at acquire time.
        let container_env = Env::new(&container_env).unwrap_or_default();
        let merged = spec_env.merge(&container_env);

        let process_id = self.next_process_id.fetch_add(1, Ordering::SeqCst) + 1;

        let socket = container_path.join("run/wshd.sock");
        let mut args: Vec<String> = vec![
            "--socket".to_owned(),
            socket.to_string_lossy().into_owned(),
            "--readSignals".to_owned(),
            "--user".to_owned(),
            spec.user.clone(),
        ];
        for entry in merged.entries() {
            args.push("--env".to_owned());
            args.push(entry);
        }
        if let Some(dir) = &spec.dir {
            args.push("--dir".to_owned());
            args.push(dir.clone());
        }

        let signaller = if version.is_some() {
            SignallerSpec::Link
        } else {
            // Old containers have no signal stream; signals go through
            // a pidfile and an in-container kill.
            let pidfile = container_path.join(format!("processes/{process_id}.pid"));
            args.push("--pidfile".to_owned());
            args.push(pidfile.to_string_lossy().into_owned());
            SignallerSpec::Namespaced { pidfile }
        };

        if let Some(tty) = &spec.tty {
            args.push("--tty".to_owned());
            if let Some(window) = tty.window_size {
                args.push("--windowColumns".to_owned());
                args.push(window.columns.to_string());
                args.push("--windowRows".to_owned());
                args.push(window.rows.to_string());
            }
        }

        args.push(spec.path.clone());
        args.extend(spec.args.iter().cloned());

        let wsh = container_path.join("bin/wsh");
        let cmd = Cmd {
            path: wsh.to_string_lossy().into_owned(),
            args,
            env: Some(spec.limits.to_env()),
            ..Default::default()
        };

        debug!(container = %self.id(), process = process_id, path = %spec.path, "running process");
        self.deps.tracker.run(process_id, cmd, io, signaller)
    }

    /// Re-attach new streams to a process started earlier.
    pub fn attach(
        &self,
        process_id: u32,
        io: ProcessIo,
    ) -> Result<Arc<dyn ProcessHandle>, ContainerError> {
        self.touch();
        self.deps.tracker.attach(process_id, io)
    }

    /// Extract a tar stream into a directory inside the container.
    pub fn stream_in(
        &self,
        user: &str,
        dst_path: &str,
        source: Box<dyn Read + Send>,
    ) -> Result<(), ContainerError> {
        let process = self.run(
            ProcessSpec {
                user: user.to_owned(),
                path: "tar".to_owned(),
                args: vec!["xf".to_owned(), "-".to_owned(), "-C".to_owned(), dst_path.to_owned()],
                ..Default::default()
            },
            ProcessIo {
                stdin: Some(source),
                ..Default::default()
            },
        )?;

        match process.wait()? {
            0 => Ok(()),
            status => Err(ContainerError::StreamFailed(status)),
        }
    }

    /// Produce a tar stream of a path inside the container.
    pub fn stream_out(
        &self,
        user: &str,
        src_path: &str,
        sink: Box<dyn Write + Send>,
    ) -> Result<(), ContainerError> {
        let (dir, name) = split_stream_source(src_path);
        let process = self.run(
            ProcessSpec {
                user: user.to_owned(),
                path: "tar".to_owned(),
                args: vec!["cf".to_owned(), "-".to_owned(), "-C".to_owned(), dir, name],
                ..Default::default()
            },
            ProcessIo {
                stdout: Some(sink),
                ..Default::default()
            },
        )?;

        match process.wait()? {
            0 => Ok(()),
            status => Err(ContainerError::StreamFailed(status)),
        }
    }

    pub fn info(&self) -> ContainerInfo {
        let record = self.record.lock().unwrap();
        ContainerInfo {
            state: record.state.to_string(),
            events: record.events.clone(),
            host_ip: record.resources.network.host_ip(),
            container_ip: record.resources.network.ip,
            container_path: record.container_path.clone(),
            process_ids: self.deps.tracker.active_process_ids(),
            properties: record.properties.clone(),
            mapped_ports: record.resources.ports.clone(),
        }
    }

    pub fn limit_bandwidth(&self, limits: BandwidthLimits) -> Result<(), ContainerError> {
        self.touch();
        self.bandwidth.set_limits(limits)
    }

    pub fn bandwidth_limits(&self) -> Result<BandwidthStat, ContainerError> {
        self.bandwidth.get_limits()
    }

    /// Map a host port to a container port. Zero means "pick for me":
    /// the host port comes from the pool and the container port
    /// defaults to the host port.
    pub fn net_in(
        &self,
        host_port: u32,
        container_port: u32,
    ) -> Result<(u32, u32), ContainerError> {
        self.touch();

        let host_port = if host_port == 0 {
            self.deps.port_pool.acquire()?
        } else {
            host_port
        };
        let container_port = if container_port == 0 {
            host_port
        } else {
            container_port
        };

        let (container_path, id) = {
            let record = self.record.lock().unwrap();
            (record.container_path.clone(), record.id.to_string())
        };
        let script = container_path.join("net.sh");
        let mut cmd = Cmd::new(script.to_string_lossy().into_owned())
            .arg("in")
            .env(vec![
                format!("HOST_PORT={host_port}"),
                format!("CONTAINER_PORT={container_port}"),
                format!("ID={id}"),
            ]);
        self.deps.runner.run(&mut cmd)?;

        self.record
            .lock()
            .unwrap()
            .resources
            .ports
            .push(host_port);

        info!(container = %id, host_port, container_port, "mapped port");
        Ok((host_port, container_port))
    }

    /// Whitelist outbound traffic by prepending to the instance chain.
    pub fn net_out(&self, rule: NetOutRule) -> Result<(), ContainerError> {
        self.touch();
        Ok(self.deps.filter.net_out(&rule)?)
    }

    /// Signal every tracked process and mark the container stopped.
    pub fn stop(&self, kill: bool) {
        self.touch();
        self.deps.tracker.stop(kill);
        self.record.lock().unwrap().state = State::Stopped;
    }
}

/// `tar` wants a working directory and a member name; a trailing slash
/// means "the directory itself".
fn split_stream_source(src_path: &str) -> (String, String) {
    if src_path.ends_with('/') {
        return (src_path.to_owned(), ".".to_owned());
    }
    let path = Path::new(src_path);
    let dir = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_owned());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_owned());
    (dir, name)
}
