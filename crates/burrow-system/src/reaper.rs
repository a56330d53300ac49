//! Process-wide `SIGCHLD` demultiplexer.
//!
//! One reaper instance owns child reaping for its process: a dedicated
//! thread drains a signalfd and loops the injected `wait4` with
//! `WNOHANG` until no more children are pending, delivering each exit
//! status to whichever caller tracked that pid. Children must be
//! spawned through the reaper — registration happens under the same
//! lock as the fork, so the signal thread can never reap a tracked
//! child before its waiter is installed. Reaped pids nobody tracks are
//! discarded; a re-registered pid (PID reuse) replaces the stale waiter.
//!
//! `wait4` is injectable so PID-reuse interleavings can be tested
//! deterministically.

use crate::SystemError;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::unistd::pipe;
use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Injectable non-blocking wait. Returns `(pid, status)`; a pid of zero
/// means no further children are pending.
pub type Wait4 = Box<dyn Fn() -> std::io::Result<(libc::pid_t, libc::c_int)> + Send>;

/// The real thing: `wait4(-1, …, WNOHANG, NULL)`, with "no children at
/// all" folded into the no-pending case.
pub fn system_wait4() -> Wait4 {
    Box::new(|| {
        let mut status: libc::c_int = 0;
        // SAFETY: status points at a live local; wait4 with WNOHANG
        // never blocks and writes only through that pointer.
        let pid = unsafe { libc::wait4(-1, &mut status, libc::WNOHANG, std::ptr::null_mut()) };
        if pid < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ECHILD) {
                return Ok((0, 0));
            }
            return Err(err);
        }
        Ok((pid, status))
    })
}

fn exit_byte(status: libc::c_int) -> u8 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status) as u8
    } else if libc::WIFSIGNALED(status) {
        128u8.wrapping_add(libc::WTERMSIG(status) as u8)
    } else {
        255
    }
}

pub struct ProcessReaper {
    waiters: Arc<Mutex<HashMap<libc::pid_t, Sender<u8>>>>,
    stop_write: OwnedFd,
    handle: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// A child tracked by the reaper. Do not call `Child::wait` on the
/// inner handle; the reaper owns reaping.
pub struct ReapedChild {
    pub child: Child,
    exit: Receiver<u8>,
}

impl std::fmt::Debug for ReapedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReapedChild")
            .field("child", &self.child)
            .finish()
    }
}

impl ReapedChild {
    pub fn pid(&self) -> libc::pid_t {
        self.child.id() as libc::pid_t
    }

    /// Block until the reaper delivers the child's exit status byte
    /// (128+signum for signal deaths).
    pub fn wait(&self) -> u8 {
        self.exit.recv().unwrap_or(255)
    }
}

impl ProcessReaper {
    /// Start the reaper with the given wait implementation. `SIGCHLD`
    /// is blocked on the calling thread (threads spawned afterwards
    /// inherit the mask) and consumed through a signalfd.
    pub fn start(wait4: Wait4) -> Result<Self, SystemError> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;

        let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
        let (stop_read, stop_write) = pipe()?;

        let waiters: Arc<Mutex<HashMap<libc::pid_t, Sender<u8>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let thread_waiters = Arc::clone(&waiters);
        let handle = std::thread::Builder::new()
            .name("sigchld-reaper".to_owned())
            .spawn(move || {
                signal_loop(signal_fd, stop_read, wait4, thread_waiters);
            })?;

        Ok(Self {
            waiters,
            stop_write,
            handle: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn a command and register its pid before the child can be
    /// reaped. Stdio configuration on the command is honoured.
    pub fn spawn(&self, command: &mut Command) -> Result<ReapedChild, SystemError> {
        let (pid_holder, exit) = self.track(|| {
            let child = command.spawn()?;
            Ok((child.id() as libc::pid_t, child))
        })?;
        Ok(ReapedChild {
            child: pid_holder,
            exit,
        })
    }

    /// Run an arbitrary fork under the waiter-map lock and register the
    /// resulting pid. The lock spans the fork so `SIGCHLD` handling
    /// cannot observe the child before its waiter exists.
    pub fn track<T>(
        &self,
        spawn: impl FnOnce() -> std::io::Result<(libc::pid_t, T)>,
    ) -> Result<(T, Receiver<u8>), SystemError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SystemError::ReaperStopped);
        }

        let mut waiters = self.waiters.lock().unwrap();
        let (pid, value) = spawn()?;
        let (tx, rx) = channel();
        if waiters.insert(pid, tx).is_some() {
            debug!(pid, "replacing stale waiter for reused pid");
        }
        Ok((value, rx))
    }

    /// Shut down the signal thread. Idempotent; `spawn`/`track` fail
    /// afterwards.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = nix::unistd::write(self.stop_write.as_fd(), b"x");
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Number of children currently tracked and not yet reaped.
    pub fn tracked_children(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

impl Drop for ProcessReaper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn signal_loop(
    mut signal_fd: SignalFd,
    stop_read: OwnedFd,
    wait4: Wait4,
    waiters: Arc<Mutex<HashMap<libc::pid_t, Sender<u8>>>>,
) {
    loop {
        {
            let mut fds = [
                PollFd::new(signal_fd.as_fd(), PollFlags::POLLIN),
                PollFd::new(stop_read.as_fd(), PollFlags::POLLIN),
            ];
            // The timeout makes the drain below run even if a SIGCHLD
            // was delivered to a thread that never blocked it.
            match poll(&mut fds, PollTimeout::from(100u16)) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "reaper poll failed");
                    return;
                }
            }
            if fds[1]
                .revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false)
            {
                return;
            }
        }

        // Signals coalesce; drain the fd, then drain the children.
        while let Ok(Some(_)) = signal_fd.read_signal() {}

        loop {
            match wait4() {
                Ok((pid, status)) if pid > 0 => {
                    let waiter = waiters.lock().unwrap().remove(&pid);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(exit_byte(status));
                        }
                        None => debug!(pid, "reaped untracked child"),
                    }
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "wait4 failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_byte_decodes_normal_exit() {
        // status layout per wait(2): exit code in bits 8..16
        assert_eq!(exit_byte(3 << 8), 3);
        assert_eq!(exit_byte(0), 0);
    }

    #[test]
    fn exit_byte_encodes_signal_death_as_128_plus_signum() {
        assert_eq!(exit_byte(9), 128 + 9);
        assert_eq!(exit_byte(15), 128 + 15);
    }
}
