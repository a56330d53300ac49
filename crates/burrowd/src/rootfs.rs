//! Standalone rootfs provisioning.
//!
//! Production deployments plug a layered image store in behind the
//! provider seam; for a self-contained daemon a plain copy of a base
//! rootfs directory per container is enough. The tree lives outside
//! the depot so `destroy.sh` never races the provider's own cleanup.

use burrow_pool::{PoolError, RootFsCleaner, RootFsProvider, RootFsSpec};
use burrow_system::{Cmd, CommandRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub struct DirRootFsProvider {
    default_rootfs: PathBuf,
    store: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl DirRootFsProvider {
    pub fn new(
        default_rootfs: PathBuf,
        store: PathBuf,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            default_rootfs,
            store,
            runner,
        }
    }
}

impl RootFsProvider for DirRootFsProvider {
    fn name(&self) -> &str {
        "dir"
    }

    fn create(
        &self,
        container_id: &str,
        spec: &RootFsSpec,
    ) -> Result<(PathBuf, Vec<String>), PoolError> {
        let source = if spec.rootfs.is_empty() {
            self.default_rootfs.clone()
        } else {
            PathBuf::from(&spec.rootfs)
        };
        let target = self.store.join(container_id);
        std::fs::create_dir_all(&self.store)?;

        debug!(container = container_id, source = %source.display(), "copying rootfs");
        let mut cmd = Cmd::new("cp").args([
            "-a".to_owned(),
            source.to_string_lossy().into_owned(),
            target.to_string_lossy().into_owned(),
        ]);
        self.runner.run(&mut cmd)?;

        Ok((target, Vec::new()))
    }

    fn destroy(&self, container_id: &str) -> Result<(), PoolError> {
        let target = self.store.join(container_id);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        Ok(())
    }

    fn gc(&self) -> Result<(), PoolError> {
        Ok(())
    }
}

/// Clears remnants a reused base tree may carry: a stale supervisor
/// socket and the mutable scratch directories.
pub struct BasicRootFsCleaner;

impl RootFsCleaner for BasicRootFsCleaner {
    fn clean(&self, rootfs_path: &Path) -> Result<(), PoolError> {
        let stale_socket = rootfs_path.join("run/wshd.sock");
        if stale_socket.exists() {
            std::fs::remove_file(&stale_socket)?;
        }
        for scratch in ["tmp", "run", "proc", "sys", "dev"] {
            std::fs::create_dir_all(rootfs_path.join(scratch))?;
        }
        Ok(())
    }
}
