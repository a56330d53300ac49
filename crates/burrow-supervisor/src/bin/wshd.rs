//! The in-container supervisor daemon.
//!
//! Listens on the container's `run/wshd.sock` (or on a pre-created
//! listener passed as fd 3 at clone time) and serves spawn requests.

use burrow_supervisor::daemon::{bind_socket, WshDaemon};
use burrow_system::reaper::system_wait4;
use burrow_system::ProcessReaper;
use clap::Parser;
use std::os::fd::FromRawFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "wshd", about = "burrow in-container supervisor")]
struct Cli {
    /// Directory where the server socket is placed.
    #[arg(long, default_value = "./run")]
    run: PathBuf,

    /// Socket path; defaults to <run>/wshd.sock.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Cosmetic process title suffix.
    #[arg(long, default_value = "")]
    title: String,
}

/// The host daemon may pass the pre-bound listener as fd 3.
fn inherited_listener() -> Option<UnixListener> {
    let stat = nix::sys::stat::fstat(3).ok()?;
    if stat.st_mode & libc::S_IFMT == libc::S_IFSOCK {
        // SAFETY: fd 3 was verified to be a socket handed to us by the
        // parent; we take ownership exactly once, at startup.
        Some(unsafe { UnixListener::from_raw_fd(3) })
    } else {
        None
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let _ = cli.title;

    let listener = match inherited_listener() {
        Some(listener) => listener,
        None => {
            let path = cli
                .socket
                .unwrap_or_else(|| cli.run.join("wshd.sock"));
            match bind_socket(&path) {
                Ok(listener) => listener,
                Err(e) => {
                    eprintln!("wshd: create listener: {e}");
                    return ExitCode::from(8);
                }
            }
        }
    };

    let reaper = match ProcessReaper::start(system_wait4()) {
        Ok(reaper) => Arc::new(reaper),
        Err(e) => {
            eprintln!("wshd: start reaper: {e}");
            return ExitCode::from(5);
        }
    };

    let proc_starter = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("proc_starter")))
        .unwrap_or_else(|| PathBuf::from("/sbin/proc_starter"));

    let daemon = Arc::new(WshDaemon::new(listener, reaper, proc_starter));
    daemon.run();
    ExitCode::SUCCESS
}
