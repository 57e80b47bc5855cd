//! The container's controlling terminal across a checkpoint.
//!
//! The pty slave lives inside the checkpointed tree, the master does not. At
//! dump time the slave's device number is recorded next to the images in
//! `tty.info` and declared external to the engine under the key
//! `tty[<major>:<minor>]`. At restore time the caller hands in a new tty
//! descriptor and the engine is told to use it for that same key.

use std::fmt::Display;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::errno::Errno;
use nix::fcntl::{OFlag, openat};
use nix::sys::stat::{FileStat, Mode, SFlag, major, minor, stat};
use procfs::process::Process;

use crate::engine::{EngineOptionsBuilder, ImagesDir};

/// Sidecar file, inside the image directory.
pub const TTY_INFO_FILE: &str = "tty.info";

/// UNIX98_PTY_SLAVE_MAJOR from <linux/major.h>
const PTY_SLAVE_MAJOR: u32 = 136;
/// UNIX98_PTY_MAJOR_COUNT from <linux/tty.h>
const PTY_SLAVE_MAJOR_COUNT: u32 = 8;

#[derive(Debug, thiserror::Error)]
pub enum TtyError {
    #[error("failed to read process information for pid {pid}")]
    Proc {
        pid: i32,
        source: procfs::ProcError,
    },
    #[error("failed to stat {path:?}")]
    Stat { path: PathBuf, source: nix::Error },
    #[error("{path:?} is not a character device")]
    NotCharDevice { path: PathBuf },
    #[error("controlling terminal {tty} of pid {pid} is not a pty slave")]
    NotPtySlave { pid: i32, tty: TtyIdentity },
    #[error("controlling terminal {tty} of pid {pid} is not open on stdio")]
    SlaveNotFound { pid: i32, tty: TtyIdentity },
    #[error("malformed tty identity {content:?}")]
    Malformed { content: String },
    #[error("failed to write {path:?}")]
    WriteSidecar {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read {path:?}")]
    ReadSidecar {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("image {image:?} was taken with console {tty} but no tty was supplied")]
    MissingDescriptor { image: PathBuf, tty: TtyIdentity },
}

type Result<T> = std::result::Result<T, TtyError>;

/// Device number of a pty slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TtyIdentity {
    major: u32,
    minor: u32,
}

impl TtyIdentity {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    fn from_rdev(rdev: u64) -> Self {
        Self::new(major(rdev) as u32, minor(rdev) as u32)
    }

    fn from_stat(path: &Path, stat: &FileStat) -> Result<Self> {
        let mode_type = SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT;
        if mode_type != SFlag::S_IFCHR {
            return Err(TtyError::NotCharDevice {
                path: path.to_path_buf(),
            });
        }
        Ok(Self::from_rdev(stat.st_rdev))
    }

    /// Identity of the character device at `path`, following symlinks (and
    /// so `/proc/<pid>/fd/<n>` links).
    pub fn from_device_node<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let stat = stat(path).map_err(|source| TtyError::Stat {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_stat(path, &stat)
    }

    pub fn is_pty_slave(&self) -> bool {
        (PTY_SLAVE_MAJOR..PTY_SLAVE_MAJOR + PTY_SLAVE_MAJOR_COUNT).contains(&self.major)
    }

    /// Stable key under which the engine records the tty. Same text as the
    /// sidecar content.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl Display for TtyIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tty[{:x}:{:x}]", self.major, self.minor)
    }
}

impl FromStr for TtyIdentity {
    type Err = TtyError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || TtyError::Malformed {
            content: s.to_string(),
        };
        let inner = s
            .strip_prefix("tty[")
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(malformed)?;
        let (major, minor) = inner.split_once(':').ok_or_else(malformed)?;
        Ok(Self::new(
            parse_hex(major).ok_or_else(malformed)?,
            parse_hex(minor).ok_or_else(malformed)?,
        ))
    }
}

// from_str_radix alone would also take a sign and uppercase digits
fn parse_hex(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

/// The controlling terminal of `pid`, if it has one.
///
/// The terminal number comes from `/proc/<pid>/stat`. The slave node itself
/// is then looked up among the process's standard descriptors and stat'ed, so
/// the identity recorded is the one of a node the process really has open.
pub fn controlling_tty(pid: i32) -> Result<Option<TtyIdentity>> {
    let stat = Process::new(pid)
        .and_then(|p| p.stat())
        .map_err(|source| TtyError::Proc { pid, source })?;
    if stat.tty_nr == 0 {
        tracing::debug!(pid, "process has no controlling terminal");
        return Ok(None);
    }
    let (tty_major, tty_minor) = stat.tty_nr();
    let expected = TtyIdentity::new(tty_major as u32, tty_minor as u32);
    if !expected.is_pty_slave() {
        return Err(TtyError::NotPtySlave { pid, tty: expected });
    }

    let candidates = (0..3).map(|n| PathBuf::from(format!("/proc/{pid}/fd/{n}")));
    match locate_slave(expected, candidates)? {
        Some(path) => {
            tracing::debug!(pid, tty = %expected, ?path, "resolved controlling terminal");
            Ok(Some(expected))
        }
        None => Err(TtyError::SlaveNotFound { pid, tty: expected }),
    }
}

fn locate_slave<I>(expected: TtyIdentity, candidates: I) -> Result<Option<PathBuf>>
where
    I: IntoIterator<Item = PathBuf>,
{
    for path in candidates {
        let stat = match stat(&path) {
            Ok(stat) => stat,
            // closed descriptor
            Err(Errno::ENOENT) => continue,
            Err(source) => return Err(TtyError::Stat { path, source }),
        };
        match TtyIdentity::from_stat(&path, &stat) {
            Ok(identity) if identity == expected => return Ok(Some(path)),
            Ok(_) | Err(TtyError::NotCharDevice { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}

fn open_sidecar(dir: &ImagesDir, flags: OFlag, mode: Mode) -> nix::Result<File> {
    let fd = openat(
        Some(dir.fd()),
        TTY_INFO_FILE,
        flags | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW,
        mode,
    )?;
    // SAFETY: openat just returned this descriptor and nothing else owns it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Writes the sidecar through the directory descriptor, so it lands next to
/// the images even if the directory was moved after it was opened.
pub fn write_sidecar(dir: &ImagesDir, tty: &TtyIdentity) -> Result<()> {
    let path = dir.path().join(TTY_INFO_FILE);
    let mut file = open_sidecar(
        dir,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        Mode::from_bits_truncate(0o644),
    )
    .map_err(|errno| TtyError::WriteSidecar {
        path: path.clone(),
        source: errno.into(),
    })?;
    file.write_all(tty.to_string().as_bytes())
        .map_err(|source| TtyError::WriteSidecar { path, source })
}

/// Reads the sidecar through the directory descriptor. A missing file means
/// the dump had no controlling tty.
pub fn read_sidecar(dir: &ImagesDir) -> Result<Option<TtyIdentity>> {
    let path = dir.path().join(TTY_INFO_FILE);
    let mut file = match open_sidecar(dir, OFlag::O_RDONLY, Mode::empty()) {
        Ok(file) => file,
        Err(Errno::ENOENT) => return Ok(None),
        Err(errno) => {
            return Err(TtyError::ReadSidecar {
                path,
                source: errno.into(),
            })
        }
    };
    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|source| TtyError::ReadSidecar { path, source })?;
    let line = content.strip_suffix('\n').unwrap_or(&content);
    if line.contains('\n') {
        return Err(TtyError::Malformed { content });
    }
    line.parse().map(Some)
}

/// Resolves the controlling terminal of `pid`, records it in the image
/// directory and declares it external. Any failure here fails the dump: an
/// image that silently lost its console is worse than no image.
pub fn declare_for_dump(
    builder: &mut EngineOptionsBuilder,
    pid: i32,
    image_dir: &ImagesDir,
) -> Result<Option<TtyIdentity>> {
    let Some(tty) = controlling_tty(pid)? else {
        return Ok(None);
    };
    write_sidecar(image_dir, &tty)?;
    builder.external(tty.key());
    Ok(Some(tty))
}

/// What became of the console on restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleMapping {
    /// The supplied descriptor replaces the recorded tty.
    Inherited(TtyIdentity),
    /// Restore goes ahead without an interactive console.
    Degraded { reason: String },
}

/// Maps the caller's `tty` descriptor onto the tty recorded at dump time.
pub fn map_for_restore(
    builder: &mut EngineOptionsBuilder,
    image_dir: &ImagesDir,
    tty: Option<BorrowedFd<'_>>,
) -> Result<ConsoleMapping> {
    let recorded = read_sidecar(image_dir)?;
    match (recorded, tty) {
        (Some(recorded), Some(fd)) => {
            builder.inherit_fd(recorded.key(), fd.as_raw_fd());
            tracing::debug!(tty = %recorded, fd = fd.as_raw_fd(), "inheriting console");
            Ok(ConsoleMapping::Inherited(recorded))
        }
        (Some(recorded), None) => Err(TtyError::MissingDescriptor {
            image: image_dir.path().to_path_buf(),
            tty: recorded,
        }),
        (None, Some(_)) => Ok(ConsoleMapping::Degraded {
            reason: format!(
                "no {TTY_INFO_FILE} in {:?}, supplied tty left unused",
                image_dir.path()
            ),
        }),
        (None, None) => Ok(ConsoleMapping::Degraded {
            reason: format!(
                "no {TTY_INFO_FILE} in {:?}, no console to restore",
                image_dir.path()
            ),
        }),
    }
}
