//! The directory holding a checkpoint's images.
//!
//! Both operations hand the engine an open descriptor rather than a path. On
//! dump the directory is created if needed. On restore the caller opens it and
//! passes it in, so the path is only recovered for logging and for sidecar
//! files.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::ErrorKind;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::{SFlag, fstat};

use crate::engine::ImagesDir;

#[derive(Debug, thiserror::Error)]
pub enum ImageDirError {
    #[error("failed to create image directory {path:?}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path:?} exists and is not a directory")]
    NotADirectory { path: PathBuf },
    #[error("failed to open image directory {path:?}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("descriptor {fd} is not a usable image directory")]
    Descriptor { fd: i32, source: nix::Error },
    #[error("descriptor {fd} does not refer to a directory")]
    DescriptorNotADirectory { fd: i32 },
    #[error("failed to resolve path of descriptor {fd}")]
    Resolve { fd: i32, source: std::io::Error },
}

type Result<T> = std::result::Result<T, ImageDirError>;

/// An image directory opened for a dump. Owns its descriptor.
#[derive(Debug)]
pub struct ImageDir {
    dir: File,
    path: PathBuf,
}

impl ImageDir {
    /// Creates `path` (and any missing parents) with mode 0700 and opens it.
    /// An existing directory is reused as is.
    pub fn prepare_for_dump<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Err(err) = DirBuilder::new().recursive(true).mode(0o700).create(path) {
            // recursive create reports an existing file as AlreadyExists
            if err.kind() == ErrorKind::AlreadyExists || err.raw_os_error() == Some(libc::ENOTDIR) {
                return Err(ImageDirError::NotADirectory {
                    path: path.to_path_buf(),
                });
            }
            tracing::error!(?path, ?err, "failed to create image directory");
            return Err(ImageDirError::Create {
                path: path.to_path_buf(),
                source: err,
            });
        }

        let dir = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
            .open(path)
            .map_err(|err| {
                if err.raw_os_error() == Some(libc::ENOTDIR) {
                    return ImageDirError::NotADirectory {
                        path: path.to_path_buf(),
                    };
                }
                ImageDirError::Open {
                    path: path.to_path_buf(),
                    source: err,
                }
            })?;
        let path = resolve_for_restore(dir.as_fd())?;
        tracing::debug!(?path, "image directory ready");
        Ok(Self { dir, path })
    }

    /// Absolute path the descriptor resolved to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn images_dir(&self) -> ImagesDir {
        ImagesDir::new(self.dir.as_raw_fd(), self.path.clone())
    }
}

impl AsFd for ImageDir {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.dir.as_fd()
    }
}

/// The engine's view of a directory descriptor owned by someone else.
pub fn images_dir_from_fd(fd: BorrowedFd<'_>) -> Result<ImagesDir> {
    let path = resolve_for_restore(fd)?;
    Ok(ImagesDir::new(fd.as_raw_fd(), path))
}

/// Confirms `fd` is a directory and returns the path it is open on.
pub fn resolve_for_restore(fd: BorrowedFd<'_>) -> Result<PathBuf> {
    let raw = fd.as_raw_fd();
    let stat = fstat(raw).map_err(|source| ImageDirError::Descriptor { fd: raw, source })?;
    if SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT != SFlag::S_IFDIR {
        return Err(ImageDirError::DescriptorNotADirectory { fd: raw });
    }
    std::fs::read_link(format!("/proc/self/fd/{raw}"))
        .map_err(|source| ImageDirError::Resolve { fd: raw, source })
}
