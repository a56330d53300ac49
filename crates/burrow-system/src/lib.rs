//! Subprocess plumbing for the burrow container daemon.
//!
//! Two concerns live here: the [`CommandRunner`] seam through which
//! every external tool (`create.sh`, `destroy.sh`, `iptables`, …) is
//! invoked, with a recording fake for tests; and the [`ProcessReaper`],
//! the process-wide `SIGCHLD` demultiplexer that hands exit statuses
//! back to whichever caller tracked the child.

pub mod command;
pub mod reaper;

pub use command::{fake, Cmd, CommandRunner, RealCommandRunner};
pub use reaper::{ProcessReaper, ReapedChild, Wait4};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("exit status {0}")]
    ExitStatus(i32),
    #[error("{0}")]
    Failed(String),
    #[error("{0}")]
    Sys(#[from] nix::Error),
    #[error("reaper stopped: no new children can be tracked")]
    ReaperStopped,
}
