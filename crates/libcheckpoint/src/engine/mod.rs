//! The checkpoint/restore engine seam.
//!
//! The orchestration code only ever talks to [`Engine`]. Which transport sits
//! behind it (CRIU's RPC service, the `criu` command line, or nothing at all)
//! is a configuration decision, see [`crate::config::Transport`].

use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use nix::unistd::Pid;

pub mod baseline;
mod cli;
#[cfg(test)]
pub(crate) mod fake;
mod options;
mod rpc;
mod unsupported;

pub use cli::CriuCli;
pub use options::{
    CgroupMode, EngineOptions, EngineOptionsBuilder, Feature, ImagesDir, MAX_LOG_LEVEL,
};
pub use rpc::{CRIU_VERSION_MINIMUM, CriuRpc};
pub use unsupported::Unsupported;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("engine reported failure: {message}")]
    InvocationFailed {
        message: String,
        log_file: Option<PathBuf>,
    },
    #[error("engine did not finish within {after:?}")]
    Timeout {
        after: Duration,
        log_file: Option<PathBuf>,
    },
    #[error("invalid option {option}: {reason}")]
    OptionRejected { option: String, reason: String },
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("nix error")]
    Nix(#[from] nix::Error),
    #[error("failed to encode or decode engine message")]
    Protobuf(#[from] protobuf::Error),
}

impl EngineError {
    /// The engine log worth looking at, when the failure happened after the
    /// engine started writing one.
    pub fn log_file(&self) -> Option<&Path> {
        match self {
            EngineError::InvocationFailed { log_file, .. }
            | EngineError::Timeout { log_file, .. } => log_file.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Result of the availability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// The engine can be used. `version` is in CRIU's `MAJOR * 10000 +
    /// MINOR * 100 + PATCH` form when the transport can tell.
    Available { version: Option<u32> },
    Unavailable { reason: String },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available { .. })
    }
}

pub trait Engine {
    /// Checks whether the engine can be used at all. Must not have side
    /// effects on the host besides spawning the engine to ask it.
    fn availability(&self) -> Availability;

    /// Dumps the process tree rooted at `options.pid()` into the images
    /// directory.
    fn dump(&self, options: &EngineOptions) -> Result<()>;

    /// Restores the tree recorded in the images directory and returns the pid
    /// of its root process.
    fn restore(&self, options: &EngineOptions) -> Result<Pid>;
}

/// Keeps `fds` open across the exec of `cmd` under the same numbers.
/// Inherited descriptors are referenced by number in the options, so they
/// have to survive the exec. Only the child's copies lose `FD_CLOEXEC`, the
/// caller's descriptors are left untouched.
pub(crate) fn inherit_into_child(cmd: &mut Command, fds: Vec<RawFd>) {
    // SAFETY: the hook only calls fcntl, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            for fd in &fds {
                clear_cloexec(*fd)?;
            }
            Ok(())
        });
    }
}

fn clear_cloexec(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if flags & libc::FD_CLOEXEC == 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
