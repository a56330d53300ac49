//! Process tracking: spawning `wsh`, streaming its stdio, and
//! delivering exit statuses.
//!
//! The tracker owns the host-side lifetime of every process started in
//! a container. Each spawn goes through the process reaper so exit
//! statuses arrive even when `SIGCHLD`s coalesce; stdio is pumped by
//! copy threads into fan-out sinks so later `attach` calls see the same
//! streams.

use crate::signaller::{LinkSignaller, NamespacedSignaller, Signaller};
use crate::ContainerError;
use burrow_schema::types::ProcessIo;
use burrow_system::{Cmd, CommandRunner, ProcessReaper};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, warn};

/// Which signalling mechanism the spawned process gets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignallerSpec {
    Link,
    Namespaced { pidfile: PathBuf },
}

pub trait ProcessHandle: Send + Sync + std::fmt::Debug {
    fn id(&self) -> u32;

    /// Block until the process exits; returns the exit status byte.
    fn wait(&self) -> Result<u8, ContainerError>;

    fn signal(&self, signal: i32) -> Result<(), ContainerError>;
}

pub trait ProcessTracker: Send + Sync {
    fn run(
        &self,
        process_id: u32,
        cmd: Cmd,
        io: ProcessIo,
        signaller: SignallerSpec,
    ) -> Result<Arc<dyn ProcessHandle>, ContainerError>;

    fn attach(
        &self,
        process_id: u32,
        io: ProcessIo,
    ) -> Result<Arc<dyn ProcessHandle>, ContainerError>;

    fn active_process_ids(&self) -> Vec<u32>;

    /// Signal every tracked process (TERM, or KILL when `kill`).
    fn stop(&self, kill: bool);
}

type Sinks = Arc<Mutex<Vec<Box<dyn Write + Send>>>>;

struct ExitState {
    status: Mutex<Option<u8>>,
    exited: Condvar,
}

struct Process {
    id: u32,
    exit: ExitState,
    stdin: Mutex<Option<Box<dyn Write + Send>>>,
    stdout_sinks: Sinks,
    stderr_sinks: Sinks,
    signaller: Box<dyn Signaller>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").field("id", &self.id).finish()
    }
}

impl ProcessHandle for Process {
    fn id(&self) -> u32 {
        self.id
    }

    fn wait(&self) -> Result<u8, ContainerError> {
        let mut status = self.exit.status.lock().unwrap();
        while status.is_none() {
            status = self.exit.exited.wait(status).unwrap();
        }
        Ok(status.unwrap())
    }

    fn signal(&self, signal: i32) -> Result<(), ContainerError> {
        self.signaller.signal(signal)
    }
}

impl Process {
    fn deliver_exit(&self, status: u8) {
        let mut slot = self.exit.status.lock().unwrap();
        *slot = Some(status);
        self.exit.exited.notify_all();
    }
}

pub struct StdProcessTracker {
    container_path: PathBuf,
    reaper: Arc<ProcessReaper>,
    runner: Arc<dyn CommandRunner>,
    processes: Mutex<HashMap<u32, Arc<Process>>>,
}

impl StdProcessTracker {
    pub fn new(
        container_path: PathBuf,
        reaper: Arc<ProcessReaper>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            container_path,
            reaper,
            runner,
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn build_signaller(
        &self,
        spec: &SignallerSpec,
        link: Option<std::fs::File>,
    ) -> Box<dyn Signaller> {
        match spec {
            SignallerSpec::Link => Box::new(LinkSignaller::new(
                link.expect("link pipe exists for link signallers"),
            )),
            SignallerSpec::Namespaced { pidfile } => Box::new(NamespacedSignaller::new(
                self.container_path.clone(),
                pidfile.clone(),
                Arc::clone(&self.runner),
            )),
        }
    }
}

impl ProcessTracker for StdProcessTracker {
    fn run(
        &self,
        process_id: u32,
        cmd: Cmd,
        io: ProcessIo,
        signaller: SignallerSpec,
    ) -> Result<Arc<dyn ProcessHandle>, ContainerError> {
        let mut command = Command::new(&cmd.path);
        command
            .args(&cmd.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = &cmd.env {
            command.env_clear();
            for entry in env {
                if let Some((key, value)) = entry.split_once('=') {
                    command.env(key, value);
                }
            }
        }

        // Link-signalled processes get the read side of the signal
        // stream on fd 3.
        let mut link_write: Option<std::fs::File> = None;
        let mut link_read: Option<OwnedFd> = None;
        if signaller == SignallerSpec::Link {
            let (read_end, write_end): (OwnedFd, OwnedFd) =
                nix::unistd::pipe().map_err(std::io::Error::from)?;
            link_write = Some(write_end.into());
            let raw = read_end.as_raw_fd();
            link_read = Some(read_end);
            // SAFETY: dup2 is async-signal-safe; the read end is held
            // open in the parent until after spawn returns.
            unsafe {
                command.pre_exec(move || {
                    nix::unistd::dup2(raw, 3).map_err(std::io::Error::from)?;
                    Ok(())
                });
            }
        }

        let mut child = self.reaper.spawn(&mut command)?;
        drop(link_read);

        let process = Arc::new(Process {
            id: process_id,
            exit: ExitState {
                status: Mutex::new(None),
                exited: Condvar::new(),
            },
            stdin: Mutex::new(None),
            stdout_sinks: Arc::new(Mutex::new(Vec::new())),
            stderr_sinks: Arc::new(Mutex::new(Vec::new())),
            signaller: self.build_signaller(&signaller, link_write),
        });

        let child_stdin = child.child.stdin.take();
        let child_stdout = child.child.stdout.take();
        let child_stderr = child.child.stderr.take();

        match io.stdin {
            Some(mut source) => {
                if let Some(mut stdin) = child_stdin {
                    std::thread::spawn(move || {
                        let _ = std::io::copy(&mut source, &mut stdin);
                    });
                }
            }
            None => {
                // Held for later writes through an attach.
                *process.stdin.lock().unwrap() =
                    child_stdin.map(|s| Box::new(s) as Box<dyn Write + Send>);
            }
        }

        if let Some(stdout) = io.stdout {
            process.stdout_sinks.lock().unwrap().push(stdout);
        }
        if let Some(stderr) = io.stderr {
            process.stderr_sinks.lock().unwrap().push(stderr);
        }
        if let Some(out) = child_stdout {
            pump(out, Arc::clone(&process.stdout_sinks));
        }
        if let Some(err) = child_stderr {
            pump(err, Arc::clone(&process.stderr_sinks));
        }

        self.processes
            .lock()
            .unwrap()
            .insert(process_id, Arc::clone(&process));

        let exit_process = Arc::clone(&process);
        std::thread::spawn(move || {
            let status = child.wait();
            debug!(process = exit_process.id, status, "process exited");
            exit_process.deliver_exit(status);
        });

        Ok(process)
    }

    fn attach(
        &self,
        process_id: u32,
        io: ProcessIo,
    ) -> Result<Arc<dyn ProcessHandle>, ContainerError> {
        let process = self
            .processes
            .lock()
            .unwrap()
            .get(&process_id)
            .cloned()
            .ok_or(ContainerError::ProcessNotFound(process_id))?;

        if let Some(stdout) = io.stdout {
            process.stdout_sinks.lock().unwrap().push(stdout);
        }
        if let Some(stderr) = io.stderr {
            process.stderr_sinks.lock().unwrap().push(stderr);
        }
        if let Some(mut source) = io.stdin {
            if let Some(mut stdin) = process.stdin.lock().unwrap().take() {
                std::thread::spawn(move || {
                    let _ = std::io::copy(&mut source, &mut stdin);
                });
            }
        }

        Ok(process)
    }

    fn active_process_ids(&self) -> Vec<u32> {
        let processes = self.processes.lock().unwrap();
        let mut ids: Vec<u32> = processes
            .values()
            .filter(|p| p.exit.status.lock().unwrap().is_none())
            .map(|p| p.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn stop(&self, kill: bool) {
        let signal = if kill { libc::SIGKILL } else { libc::SIGTERM };
        for process in self.processes.lock().unwrap().values() {
            if process.exit.status.lock().unwrap().is_some() {
                continue;
            }
            if let Err(e) = process.signal(signal) {
                warn!(process = process.id, error = %e, "failed to signal process");
            }
        }
    }
}

fn pump(mut source: impl Read + Send + 'static, sinks: Sinks) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut sinks = sinks.lock().unwrap();
                    for sink in sinks.iter_mut() {
                        let _ = sink.write_all(&buf[..n]);
                        let _ = sink.flush();
                    }
                }
            }
        }
    });
}

pub mod fake {
    use super::*;

    /// Recorded arguments of one `run` call.
    pub struct RunCall {
        pub process_id: u32,
        pub cmd: Cmd,
        pub signaller: SignallerSpec,
    }

    #[derive(Debug)]
    pub struct FakeProcessHandle {
        pub process_id: u32,
        pub exit_status: u8,
    }

    impl ProcessHandle for FakeProcessHandle {
        fn id(&self) -> u32 {
            self.process_id
        }

        fn wait(&self) -> Result<u8, ContainerError> {
            Ok(self.exit_status)
        }

        fn signal(&self, _signal: i32) -> Result<(), ContainerError> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeProcessTracker {
        pub run_calls: Mutex<Vec<RunCall>>,
        pub attach_calls: Mutex<Vec<u32>>,
        pub exit_status: Mutex<u8>,
        pub run_error: Mutex<Option<String>>,
    }

    impl ProcessTracker for FakeProcessTracker {
        fn run(
            &self,
            process_id: u32,
            cmd: Cmd,
            _io: ProcessIo,
            signaller: SignallerSpec,
        ) -> Result<Arc<dyn ProcessHandle>, ContainerError> {
            if let Some(message) = self.run_error.lock().unwrap().clone() {
                return Err(ContainerError::System(burrow_system::SystemError::Failed(
                    message,
                )));
            }
            self.run_calls.lock().unwrap().push(RunCall {
                process_id,
                cmd,
                signaller,
            });
            Ok(Arc::new(FakeProcessHandle {
                process_id,
                exit_status: *self.exit_status.lock().unwrap(),
            }))
        }

        fn attach(
            &self,
            process_id: u32,
            _io: ProcessIo,
        ) -> Result<Arc<dyn ProcessHandle>, ContainerError> {
            self.attach_calls.lock().unwrap().push(process_id);
            Ok(Arc::new(FakeProcessHandle {
                process_id,
                exit_status: *self.exit_status.lock().unwrap(),
            }))
        }

        fn active_process_ids(&self) -> Vec<u32> {
            self.run_calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.process_id)
                .collect()
        }

        fn stop(&self, _kill: bool) {}
    }
}
