//! The supervisor server (`wshd`).
//!
//! One connection per spawned process: the client sends a spawn
//! request, receives four descriptors (stdin, stdout, stderr, status)
//! over SCM_RIGHTS, may send signal frames while the process runs, and
//! finally receives the exit frame. The supervisor reaps its children
//! through the shared process reaper, so exit statuses survive
//! coalesced `SIGCHLD`s.

use crate::proc_starter::lookup_user;
use crate::protocol::{read_frame, send_fds, write_frame, Request, Response, SpawnRequest};
use crate::SupervisorError;
use burrow_system::ProcessReaper;
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{dup2, fork, ForkResult, Pid};
use std::collections::HashSet;
use std::ffi::CString;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

pub struct WshDaemon {
    listener: UnixListener,
    reaper: Arc<ProcessReaper>,
    proc_starter: PathBuf,
    tracked: Arc<Mutex<HashSet<i32>>>,
}

/// Descriptors for one spawn. `far` goes to the client in protocol
/// order (stdin write, stdout read, stderr read, status read); `near`
/// becomes the child's fds 0–3.
struct Plumbing {
    far: [OwnedFd; 4],
    near: [OwnedFd; 4],
}

impl WshDaemon {
    pub fn new(
        listener: UnixListener,
        reaper: Arc<ProcessReaper>,
        proc_starter: PathBuf,
    ) -> Self {
        Self {
            listener,
            reaper,
            proc_starter,
            tracked: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Accept loop. Each connection is served on its own thread.
    pub fn run(self: &Arc<Self>) {
        info!("supervisor listening");
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let daemon = Arc::clone(self);
                    std::thread::spawn(move || {
                        if let Err(e) = daemon.handle_connection(stream) {
                            debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn handle_connection(&self, mut stream: UnixStream) -> Result<(), SupervisorError> {
        match read_frame::<Request>(&mut stream)? {
            Request::Spawn(request) => self.spawn(stream, request),
            Request::Signal { pid, signal } => {
                self.deliver_signal(pid, signal);
                Ok(())
            }
        }
    }

    fn deliver_signal(&self, pid: i32, signal: i32) {
        if !self.tracked.lock().unwrap().contains(&pid) {
            debug!(pid, "signal for untracked pid discarded");
            return;
        }
        match Signal::try_from(signal) {
            Ok(signal) => {
                if let Err(e) = kill(Pid::from_raw(pid), signal) {
                    warn!(pid, error = %e, "kill failed");
                }
            }
            Err(_) => warn!(pid, signal, "unknown signal number"),
        }
    }

    fn spawn(
        &self,
        mut stream: UnixStream,
        request: SpawnRequest,
    ) -> Result<(), SupervisorError> {
        let (uid, gid, home) = match lookup_user(&request.user) {
            Ok(found) => found,
            Err(e) => {
                write_frame(
                    &mut stream,
                    &Response::Error {
                        message: e.to_string(),
                    },
                )?;
                return Err(e);
            }
        };

        let plumbing = open_plumbing(&request)?;
        let starter_args = self.starter_args(&request, uid, gid);
        let env = spawn_environment(&request, &home);

        let (child_pid, exit) = self.reaper.track(|| {
            // SAFETY: the child calls only dup2/execve/_exit before
            // exec; all preparation happened pre-fork.
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => Ok((child.as_raw(), child.as_raw())),
                Ok(ForkResult::Child) => exec_child(&plumbing, &starter_args, &env),
                Err(e) => Err(std::io::Error::from(e)),
            }
        })?;

        let Plumbing { far, near } = plumbing;
        drop(near);

        self.tracked.lock().unwrap().insert(child_pid);
        debug!(pid = child_pid, argv = ?request.argv, "spawned process");

        write_frame(
            &mut stream,
            &Response::Fds {
                count: 4,
                pid: child_pid,
            },
        )?;
        let raw: Vec<RawFd> = far.iter().map(|fd| fd.as_raw_fd()).collect();
        send_fds(&stream, &raw)?;
        drop(far);

        // Signal frames may arrive while the process runs.
        let reader = stream.try_clone()?;
        let tracked = Arc::clone(&self.tracked);
        let signal_thread = std::thread::spawn(move || {
            let mut reader = reader;
            while let Ok(request) = read_frame::<Request>(&mut reader) {
                if let Request::Signal { pid, signal } = request {
                    if tracked.lock().unwrap().contains(&pid) {
                        if let Ok(signal) = Signal::try_from(signal) {
                            let _ = kill(Pid::from_raw(pid), signal);
                        }
                    }
                }
            }
        });

        let status = exit.recv().unwrap_or(255);
        self.tracked.lock().unwrap().remove(&child_pid);
        write_frame(&mut stream, &Response::Exit { status })?;
        let _ = stream.shutdown(std::net::Shutdown::Both);
        let _ = signal_thread.join();

        debug!(pid = child_pid, status, "delivered exit status");
        Ok(())
    }

    fn starter_args(&self, request: &SpawnRequest, uid: u32, gid: u32) -> Vec<String> {
        let rlimits: Vec<String> = request
            .rlimits
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();

        let mut args = vec![
            self.proc_starter.to_string_lossy().into_owned(),
            format!("-uid={uid}"),
            format!("-gid={gid}"),
            format!("-rlimits={}", rlimits.join(",")),
        ];
        if let Some(dir) = &request.dir {
            args.push(format!("-workDir={dir}"));
        }
        if !request.drop_capabilities {
            args.push("-dropCapabilities=false".to_owned());
        }
        args.push("--".to_owned());
        args.extend(request.argv.iter().cloned());
        args
    }
}

fn spawn_environment(request: &SpawnRequest, home: &str) -> Vec<String> {
    let mut env = request.env.clone();
    if !env.iter().any(|e| e.starts_with("HOME=")) {
        env.push(format!("HOME={home}"));
    }
    if !env.iter().any(|e| e.starts_with("USER=")) {
        env.push(format!("USER={}", request.user));
    }
    if !env.iter().any(|e| e.starts_with("PATH=")) {
        env.push("PATH=/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_owned());
    }
    env
}

fn owned(fd: RawFd) -> OwnedFd {
    // SAFETY: callers pass descriptors freshly returned by dup().
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Open the four streams for a spawn: three stdio pipes, or with a tty
/// request a pty carrying stdin/stdout (stderr stays a pipe so it can
/// be demultiplexed), plus the status pipe.
fn open_plumbing(request: &SpawnRequest) -> Result<Plumbing, SupervisorError> {
    let (status_read, status_write) = nix::unistd::pipe()?;
    let (stderr_read, stderr_write) = nix::unistd::pipe()?;

    if let Some(tty) = &request.tty {
        let winsize = tty.window_size.map(|window| Winsize {
            ws_row: window.rows,
            ws_col: window.columns,
            ws_xpixel: 0,
            ws_ypixel: 0,
        });
        let pty = openpty(winsize.as_ref(), None)?;

        let master_for_writes = owned(nix::unistd::dup(pty.master.as_raw_fd())?);
        let slave_for_stdout = owned(nix::unistd::dup(pty.slave.as_raw_fd())?);

        return Ok(Plumbing {
            far: [master_for_writes, pty.master, stderr_read, status_read],
            near: [pty.slave, slave_for_stdout, stderr_write, status_write],
        });
    }

    let (stdin_read, stdin_write) = nix::unistd::pipe()?;
    let (stdout_read, stdout_write) = nix::unistd::pipe()?;

    Ok(Plumbing {
        far: [stdin_write, stdout_read, stderr_read, status_read],
        near: [stdin_read, stdout_write, stderr_write, status_write],
    })
}

/// Runs in the forked child: wire stdio and the status fd, then exec
/// the starter. Never returns.
fn exec_child(plumbing: &Plumbing, starter_args: &[String], env: &[String]) -> ! {
    let result = (|| -> Result<(), SupervisorError> {
        dup2(plumbing.near[0].as_raw_fd(), 0)?;
        dup2(plumbing.near[1].as_raw_fd(), 1)?;
        dup2(plumbing.near[2].as_raw_fd(), 2)?;
        dup2(plumbing.near[3].as_raw_fd(), 3)?;

        let program = CString::new(starter_args[0].clone()).unwrap();
        let argv: Vec<CString> = starter_args
            .iter()
            .map(|arg| CString::new(arg.clone()).unwrap())
            .collect();
        let envp: Vec<CString> = env
            .iter()
            .map(|entry| CString::new(entry.clone()).unwrap())
            .collect();

        nix::unistd::execve(&program, &argv, &envp)?;
        unreachable!("execve returned without an error");
    })();

    // Exec failed: report on the status fd (dup'd to 3) so the client
    // sees a structured error instead of silence.
    if let Err(e) = result {
        // SAFETY: fd 3 is the status pipe write end in this child.
        let mut status = unsafe { std::fs::File::from_raw_fd(3) };
        let _ = write!(
            status,
            "{}",
            serde_json::json!({ "type": "error", "message": e.to_string() })
        );
    }
    // SAFETY: _exit is always safe.
    unsafe { libc::_exit(255) }
}

/// Bind the supervisor socket, replacing a stale one.
pub fn bind_socket(path: &std::path::Path) -> Result<UnixListener, SupervisorError> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(UnixListener::bind(path)?)
}
