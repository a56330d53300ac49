//! Signal delivery to in-container processes.
//!
//! Containers created by a version-recording daemon carry a dedicated
//! signal stream: the spawned `wsh` holds its read side on fd 3 and
//! forwards written signal numbers to the supervisor. Legacy containers
//! predate that stream; for them the target pid is read from a pidfile
//! in the depot and the signal is delivered by running `kill` inside
//! the container through a fresh `wsh` invocation.

use crate::ContainerError;
use burrow_system::{Cmd, CommandRunner};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

pub trait Signaller: Send + Sync {
    fn signal(&self, signal: i32) -> Result<(), ContainerError>;
}

/// Writes decimal signal numbers to the signal stream shared with the
/// spawned `wsh` process.
pub struct LinkSignaller {
    link: Mutex<File>,
}

impl LinkSignaller {
    pub fn new(link: File) -> Self {
        Self {
            link: Mutex::new(link),
        }
    }
}

impl Signaller for LinkSignaller {
    fn signal(&self, signal: i32) -> Result<(), ContainerError> {
        let mut link = self.link.lock().unwrap();
        writeln!(link, "{signal}")?;
        link.flush()?;
        Ok(())
    }
}

/// Reads the process's pid from its pidfile (polling briefly, since the
/// file is written after spawn) and runs `kill` inside the container.
pub struct NamespacedSignaller {
    container_path: PathBuf,
    pidfile: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl NamespacedSignaller {
    pub fn new(
        container_path: PathBuf,
        pidfile: PathBuf,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            container_path,
            pidfile,
            runner,
        }
    }

    fn read_pid(&self) -> Result<u32, ContainerError> {
        for _ in 0..20 {
            if let Ok(contents) = std::fs::read_to_string(&self.pidfile) {
                let contents = contents.trim();
                if !contents.is_empty() {
                    if let Ok(pid) = contents.parse() {
                        return Ok(pid);
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        Err(ContainerError::PidfileUnavailable(self.pidfile.clone()))
    }
}

impl Signaller for NamespacedSignaller {
    fn signal(&self, signal: i32) -> Result<(), ContainerError> {
        let pid = self.read_pid()?;
        debug!(pid, signal, "delivering signal via in-container kill");

        let wsh = self.container_path.join("bin/wsh");
        let socket = self.container_path.join("run/wshd.sock");
        let mut cmd = Cmd::new(wsh.to_string_lossy().into_owned()).args([
            "--socket".to_owned(),
            socket.to_string_lossy().into_owned(),
            "--user".to_owned(),
            "root".to_owned(),
            "kill".to_owned(),
            format!("-{signal}"),
            pid.to_string(),
        ]);
        self.runner.run(&mut cmd)?;
        Ok(())
    }
}
