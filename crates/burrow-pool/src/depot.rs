//! Depot directory layout.
//!
//! One directory per container under the depot root holds everything
//! the daemon persists outside the pools: the bridge name, the rootfs
//! provider tag, the creating daemon's version, the pre-clone hook
//! script, and (on clean shutdown) the snapshot.

use crate::PoolError;
use std::fs;
use std::path::{Path, PathBuf};

pub const BRIDGE_NAME_FILE: &str = "bridge-name";
pub const ROOTFS_PROVIDER_FILE: &str = "rootfs-provider";
pub const VERSION_FILE: &str = "version";
pub const SNAPSHOT_FILE: &str = "snapshot";
pub const HOOK_FILE: &str = "lib/hook-parent-before-clone.sh";

#[derive(Debug, Clone)]
pub struct Depot {
    root: PathBuf,
}

impl Depot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_path(&self, container_id: &str) -> PathBuf {
        self.root.join(container_id)
    }

    pub fn bridge_name_file(&self, container_id: &str) -> PathBuf {
        self.container_path(container_id).join(BRIDGE_NAME_FILE)
    }

    pub fn rootfs_provider_file(&self, container_id: &str) -> PathBuf {
        self.container_path(container_id).join(ROOTFS_PROVIDER_FILE)
    }

    pub fn version_file(&self, container_id: &str) -> PathBuf {
        self.container_path(container_id).join(VERSION_FILE)
    }

    pub fn snapshot_file(&self, container_id: &str) -> PathBuf {
        self.container_path(container_id).join(SNAPSHOT_FILE)
    }

    pub fn hook_file(&self, container_id: &str) -> PathBuf {
        self.container_path(container_id).join(HOOK_FILE)
    }

    /// Container ids present on disk, skipping the scratch `tmp`
    /// directory some scripts leave behind.
    pub fn list(&self) -> Result<Vec<String>, PoolError> {
        let mut ids = Vec::new();
        if !self.root.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name == "tmp" {
                    continue;
                }
                ids.push(name.to_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Read a small per-container file, `None` when absent.
    pub fn read_file(&self, path: &Path) -> Option<String> {
        fs::read_to_string(path).ok()
    }
}
