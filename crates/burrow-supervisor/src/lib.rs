//! The in-container supervisor and its host-side client.
//!
//! `wshd` runs inside each container, listening on a UNIX socket for
//! framed spawn requests. For every request it opens the process's
//! stdio (pipes or a pty), hands the far ends back over SCM_RIGHTS
//! together with a status descriptor, forks, and execs the
//! `proc_starter` helper which applies rlimits and credentials before
//! the target program. `wsh` is the client the daemon spawns on the
//! host side of the socket: it proxies stdio, forwards signal numbers,
//! and exits with the process's status.

pub mod daemon;
pub mod proc_starter;
pub mod protocol;

pub use daemon::WshDaemon;
pub use protocol::{read_frame, recv_fds, send_fds, write_frame, Request, Response, SpawnRequest};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("expected {expected} descriptors, got {got}")]
    MissingDescriptors { expected: usize, got: usize },
    #[error("user '{0}' not found")]
    UserNotFound(String),
    #[error("working directory '{0}' does not exist")]
    WorkingDirectoryMissing(String),
    #[error("malformed rlimit entry: {0:?}")]
    MalformedRlimit(String),
    #[error("unknown rlimit: {0}")]
    UnknownRlimit(String),
    #[error("dropping capabilities: {0}")]
    Capabilities(String),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Sys(#[from] nix::Error),
    #[error("{0}")]
    System(#[from] burrow_system::SystemError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
