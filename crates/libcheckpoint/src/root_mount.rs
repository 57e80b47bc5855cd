//! The restore root.
//!
//! CRIU needs the container's root file system mounted somewhere it can
//! pivot into. The rootfs is bind mounted (recursively) at
//! `<runtime_dir>/<container>/criu-root` for the duration of one restore and
//! detached afterwards.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};

pub const CRIU_ROOT_DIR: &str = "criu-root";

/// Mount syscalls used by [`RootMount`], behind a trait so the restore flow
/// can be tested without privileges.
pub trait Mounter {
    fn bind_mount(&self, source: &Path, target: &Path) -> nix::Result<()>;
    fn unmount(&self, target: &Path) -> nix::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxMounter;

impl Mounter for LinuxMounter {
    fn bind_mount(&self, source: &Path, target: &Path) -> nix::Result<()> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
    }

    fn unmount(&self, target: &Path) -> nix::Result<()> {
        umount2(target, MntFlags::MNT_DETACH)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RootMountError {
    #[error("invalid container name {name:?}")]
    InvalidContainerName { name: String },
    #[error("rootfs {rootfs:?} is not accessible")]
    Rootfs {
        rootfs: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create mount point {path:?}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind mount {rootfs:?} on {target:?}")]
    Mount {
        rootfs: PathBuf,
        target: PathBuf,
        source: nix::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("failed to unmount {path:?}")]
    Unmount { path: PathBuf, source: nix::Error },
    #[error("failed to remove {path:?}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A bind-mounted restore root. Unmounted on [`RootMount::teardown`] or, at
/// the latest, on drop.
pub struct RootMount<'m> {
    mounter: &'m dyn Mounter,
    container_dir: PathBuf,
    target: PathBuf,
    torn_down: bool,
}

impl std::fmt::Debug for RootMount<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootMount")
            .field("target", &self.target)
            .field("torn_down", &self.torn_down)
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(), RootMountError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(RootMountError::InvalidContainerName {
            name: name.to_string(),
        });
    }
    Ok(())
}

impl<'m> RootMount<'m> {
    pub fn prepare(
        mounter: &'m dyn Mounter,
        runtime_dir: &Path,
        container_name: &str,
        rootfs: &Path,
    ) -> Result<Self, RootMountError> {
        validate_name(container_name)?;
        let rootfs = fs::canonicalize(rootfs).map_err(|err| {
            tracing::error!(?rootfs, ?err, "failed to resolve rootfs");
            RootMountError::Rootfs {
                rootfs: rootfs.to_path_buf(),
                source: err,
            }
        })?;

        let container_dir = runtime_dir.join(container_name);
        let target = container_dir.join(CRIU_ROOT_DIR);
        fs::create_dir_all(&target).map_err(|err| {
            tracing::error!(?target, ?err, "failed to create criu-root directory");
            RootMountError::CreateDir {
                path: target.clone(),
                source: err,
            }
        })?;

        if let Err(err) = mounter.bind_mount(&rootfs, &target) {
            tracing::error!(?rootfs, ?target, ?err, "failed to bind mount rootfs");
            let _ = fs::remove_dir(&target);
            let _ = fs::remove_dir(&container_dir);
            return Err(RootMountError::Mount {
                rootfs,
                target,
                source: err,
            });
        }
        tracing::debug!(?rootfs, ?target, "restore root mounted");

        Ok(Self {
            mounter,
            container_dir,
            target,
            torn_down: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.target
    }

    /// Detaches the mount and removes the mount point. Safe to call more than
    /// once; what is already gone is skipped.
    pub fn teardown(&mut self) -> Result<(), CleanupError> {
        self.torn_down = true;
        match self.mounter.unmount(&self.target) {
            // not mounted, or mount point already removed
            Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
            Err(err) => {
                return Err(CleanupError::Unmount {
                    path: self.target.clone(),
                    source: err,
                })
            }
        }
        match fs::remove_dir(&self.target) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(CleanupError::Remove {
                    path: self.target.clone(),
                    source: err,
                })
            }
        }
        // Other files may live next to the mount point; leave them be.
        let _ = fs::remove_dir(&self.container_dir);
        Ok(())
    }
}

impl Drop for RootMount<'_> {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        if let Err(err) = self.teardown() {
            tracing::warn!(?err, "failed to tear down restore root");
        }
    }
}
