//! Seams to the components that materialize container filesystems.
//!
//! The rootfs provider is an external collaborator: it turns a rootfs
//! request into a host path (optionally user-namespaced) and owns the
//! later destruction of that tree. The cleaner sanitizes a freshly
//! provided tree; the mkdir-chowner creates bind-mount targets beneath
//! it with the container's root ownership.

use crate::PoolError;
use burrow_schema::types::DiskLimitScope;
use std::path::{Path, PathBuf};

/// What the pool asks the rootfs provider for.
#[derive(Debug, Clone)]
pub struct RootFsSpec {
    /// Provider-interpreted rootfs location; empty selects the default.
    pub rootfs: String,
    /// Whether the tree must present a user-namespaced uid view.
    pub namespaced: bool,
    /// Disk quota, forwarded verbatim. Zero means unlimited.
    pub quota_size: u64,
    pub quota_scope: DiskLimitScope,
}

pub trait RootFsProvider: Send + Sync {
    /// Tag written to the depot so destroy/prune know who owns the tree.
    fn name(&self) -> &str;

    /// Materialize the container's root directory. Returns the absolute
    /// host path and environment entries from the image metadata.
    fn create(
        &self,
        container_id: &str,
        spec: &RootFsSpec,
    ) -> Result<(PathBuf, Vec<String>), PoolError>;

    fn destroy(&self, container_id: &str) -> Result<(), PoolError>;

    /// Opportunistic cleanup of unreferenced layers.
    fn gc(&self) -> Result<(), PoolError>;
}

pub trait RootFsCleaner: Send + Sync {
    fn clean(&self, rootfs_path: &Path) -> Result<(), PoolError>;
}

pub trait MkdirChowner: Send + Sync {
    fn mkdir_chown(&self, path: &Path, uid: u32, gid: u32, mode: u32) -> Result<(), PoolError>;
}

/// Creates the directory chain and chowns every component it created.
#[derive(Debug, Default)]
pub struct ChownMkdirChowner;

impl MkdirChowner for ChownMkdirChowner {
    fn mkdir_chown(&self, path: &Path, uid: u32, gid: u32, mode: u32) -> Result<(), PoolError> {
        use std::os::unix::fs::DirBuilderExt;

        let mut created = Vec::new();
        let mut cursor = path;
        while !cursor.exists() {
            created.push(cursor.to_path_buf());
            match cursor.parent() {
                Some(parent) => cursor = parent,
                None => break,
            }
        }

        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(path)?;

        for dir in created.into_iter().rev() {
            nix::unistd::chown(
                &dir,
                Some(nix::unistd::Uid::from_raw(uid)),
                Some(nix::unistd::Gid::from_raw(gid)),
            )
            .map_err(|e| PoolError::RootFs(format!("chown {}: {e}", dir.display())))?;
        }
        Ok(())
    }
}

pub mod fake {
    use super::*;
    use std::sync::Mutex;

    pub struct FakeRootFsProvider {
        pub provider_name: String,
        /// Path and env handed back from `create`.
        pub create_result: Mutex<(PathBuf, Vec<String>)>,
        pub create_error: Mutex<Option<String>>,
        pub destroy_error: Mutex<Option<String>>,
        pub gc_error: Mutex<Option<String>>,
        pub created: Mutex<Vec<(String, RootFsSpec)>>,
        pub destroyed: Mutex<Vec<String>>,
        pub gc_count: Mutex<usize>,
    }

    impl Default for FakeRootFsProvider {
        fn default() -> Self {
            Self {
                provider_name: "fake-provider".to_owned(),
                create_result: Mutex::new((PathBuf::from("/provided/rootfs/path"), Vec::new())),
                create_error: Mutex::new(None),
                destroy_error: Mutex::new(None),
                gc_error: Mutex::new(None),
                created: Mutex::new(Vec::new()),
                destroyed: Mutex::new(Vec::new()),
                gc_count: Mutex::new(0),
            }
        }
    }

    impl RootFsProvider for FakeRootFsProvider {
        fn name(&self) -> &str {
            &self.provider_name
        }

        fn create(
            &self,
            container_id: &str,
            spec: &RootFsSpec,
        ) -> Result<(PathBuf, Vec<String>), PoolError> {
            if let Some(message) = self.create_error.lock().unwrap().clone() {
                return Err(PoolError::RootFs(message));
            }
            self.created
                .lock()
                .unwrap()
                .push((container_id.to_owned(), spec.clone()));
            Ok(self.create_result.lock().unwrap().clone())
        }

        fn destroy(&self, container_id: &str) -> Result<(), PoolError> {
            if let Some(message) = self.destroy_error.lock().unwrap().clone() {
                return Err(PoolError::RootFs(message));
            }
            self.destroyed.lock().unwrap().push(container_id.to_owned());
            Ok(())
        }

        fn gc(&self) -> Result<(), PoolError> {
            if let Some(message) = self.gc_error.lock().unwrap().clone() {
                return Err(PoolError::RootFs(message));
            }
            *self.gc_count.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeRootFsCleaner {
        pub cleaned: Mutex<Vec<PathBuf>>,
        pub clean_error: Mutex<Option<String>>,
    }

    impl RootFsCleaner for FakeRootFsCleaner {
        fn clean(&self, rootfs_path: &Path) -> Result<(), PoolError> {
            if let Some(message) = self.clean_error.lock().unwrap().clone() {
                return Err(PoolError::RootFs(message));
            }
            self.cleaned.lock().unwrap().push(rootfs_path.to_path_buf());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeMkdirChowner {
        pub calls: Mutex<Vec<(PathBuf, u32, u32, u32)>>,
        pub fail: Mutex<Option<String>>,
    }

    impl MkdirChowner for FakeMkdirChowner {
        fn mkdir_chown(
            &self,
            path: &Path,
            uid: u32,
            gid: u32,
            mode: u32,
        ) -> Result<(), PoolError> {
            if let Some(message) = self.fail.lock().unwrap().clone() {
                return Err(PoolError::RootFs(message));
            }
            self.calls
                .lock()
                .unwrap()
                .push((path.to_path_buf(), uid, gid, mode));
            Ok(())
        }
    }
}
