//! Engine options.
//!
//! Every checkpoint or restore builds a fresh [`EngineOptions`] through
//! [`EngineOptionsBuilder`]. The built value is immutable and validated, so
//! the transports only have to encode it.

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{EngineError, Result};

/// Highest verbosity understood by CRIU.
pub const MAX_LOG_LEVEL: i32 = 4;

/// Boolean switches understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    TcpEstablished,
    FileLocks,
    LinkRemap,
    ForceIrmap,
    ManageCgroups,
    AutoExternalMounts,
    ExternalSharing,
    ExternalMasters,
    LeaveRunning,
    ExtUnixSk,
    ShellJob,
    /// Restore only: the restored tree must outlive the engine process.
    Detach,
}

/// How the engine treats cgroups on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupMode {
    /// Cgroups must already exist. Properties are not touched and nothing is
    /// created.
    #[default]
    None,
    /// Properties are restored only into cgroups the engine had to create.
    Soft,
    /// Cgroups and their properties are restored unconditionally.
    Full,
}

impl CgroupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CgroupMode::None => "none",
            CgroupMode::Soft => "soft",
            CgroupMode::Full => "full",
        }
    }
}

/// The image directory as handed to the engine: an open descriptor plus the
/// path it resolved to, for transports that can only take a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagesDir {
    fd: RawFd,
    path: PathBuf,
}

impl ImagesDir {
    pub fn new(fd: RawFd, path: PathBuf) -> Self {
        Self { fd, path }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    images_dir: ImagesDir,
    log_file: String,
    log_level: i32,
    pid: Option<i32>,
    features: BTreeSet<Feature>,
    cgroup_mode: Option<CgroupMode>,
    enable_fs: BTreeSet<String>,
    external: BTreeSet<String>,
    ext_mounts: BTreeMap<String, String>,
    inherit_fds: BTreeMap<String, RawFd>,
    skip_mounts: BTreeSet<String>,
    root: Option<String>,
    pid_file: Option<PathBuf>,
}

impl EngineOptions {
    pub fn images_dir(&self) -> &ImagesDir {
        &self.images_dir
    }

    /// Log file name, relative to the images directory.
    pub fn log_file(&self) -> &str {
        &self.log_file
    }

    /// Where the engine log ends up on the host.
    pub fn log_path(&self) -> PathBuf {
        self.images_dir.path.join(&self.log_file)
    }

    pub fn log_level(&self) -> i32 {
        self.log_level
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn has(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    pub fn features(&self) -> impl Iterator<Item = Feature> + '_ {
        self.features.iter().copied()
    }

    pub fn cgroup_mode(&self) -> Option<CgroupMode> {
        self.cgroup_mode
    }

    pub fn enable_fs(&self) -> &BTreeSet<String> {
        &self.enable_fs
    }

    pub fn external(&self) -> &BTreeSet<String> {
        &self.external
    }

    pub fn ext_mounts(&self) -> &BTreeMap<String, String> {
        &self.ext_mounts
    }

    pub fn inherit_fds(&self) -> &BTreeMap<String, RawFd> {
        &self.inherit_fds
    }

    pub fn skip_mounts(&self) -> &BTreeSet<String> {
        &self.skip_mounts
    }

    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file.as_deref()
    }
}

/// Accumulates options for exactly one engine invocation.
#[derive(Debug, Clone)]
pub struct EngineOptionsBuilder {
    images_dir: ImagesDir,
    log_file: String,
    log_level: i32,
    pid: Option<i32>,
    features: BTreeSet<Feature>,
    cgroup_mode: Option<CgroupMode>,
    enable_fs: BTreeSet<String>,
    external: BTreeSet<String>,
    ext_mounts: Vec<(String, String)>,
    inherit_fds: Vec<(String, RawFd)>,
    skip_mounts: BTreeSet<String>,
    root: Option<PathBuf>,
    pid_file: Option<PathBuf>,
}

impl EngineOptionsBuilder {
    pub fn new(images_dir: ImagesDir) -> Self {
        Self {
            images_dir,
            log_file: String::new(),
            log_level: 2,
            pid: None,
            features: BTreeSet::new(),
            cgroup_mode: None,
            enable_fs: BTreeSet::new(),
            external: BTreeSet::new(),
            ext_mounts: Vec::new(),
            inherit_fds: Vec::new(),
            skip_mounts: BTreeSet::new(),
            root: None,
            pid_file: None,
        }
    }

    pub fn log_file<S: Into<String>>(&mut self, name: S) -> &mut Self {
        self.log_file = name.into();
        self
    }

    pub fn log_level(&mut self, level: i32) -> &mut Self {
        self.log_level = level;
        self
    }

    pub fn pid(&mut self, pid: i32) -> &mut Self {
        self.pid = Some(pid);
        self
    }

    pub fn feature(&mut self, feature: Feature, enabled: bool) -> &mut Self {
        if enabled {
            self.features.insert(feature);
        } else {
            self.features.remove(&feature);
        }
        self
    }

    pub fn cgroup_mode(&mut self, mode: CgroupMode) -> &mut Self {
        self.cgroup_mode = Some(mode);
        self
    }

    pub fn enable_fs<S: Into<String>>(&mut self, fs_type: S) -> &mut Self {
        self.enable_fs.insert(fs_type.into());
        self
    }

    /// Declares an external resource by its stable key, e.g. `tty[88:3]`.
    pub fn external<S: Into<String>>(&mut self, key: S) -> &mut Self {
        self.external.insert(key.into());
        self
    }

    /// Declares an external mount. On dump `key` is the mount point and
    /// `value` the key recorded in the image; on restore `key` is that
    /// recorded key and `value` the host path to mount.
    pub fn ext_mount<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) -> &mut Self {
        self.ext_mounts.push((key.into(), value.into()));
        self
    }

    /// Asks the engine to use `fd` for the external resource `key`.
    pub fn inherit_fd<S: Into<String>>(&mut self, key: S, fd: RawFd) -> &mut Self {
        self.inherit_fds.push((key.into(), fd));
        self
    }

    pub fn skip_mount<S: Into<String>>(&mut self, path: S) -> &mut Self {
        self.skip_mounts.insert(path.into());
        self
    }

    pub fn root<P: Into<PathBuf>>(&mut self, root: P) -> &mut Self {
        self.root = Some(root.into());
        self
    }

    pub fn pid_file<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
        self.pid_file = Some(path.into());
        self
    }

    pub fn build(&self) -> Result<EngineOptions> {
        if self.images_dir.fd < 0 {
            return Err(rejected("images_dir", "negative descriptor"));
        }
        if self.log_file.is_empty() || self.log_file.contains('/') {
            return Err(rejected(
                "log_file",
                format!("{:?} must be a plain file name", self.log_file),
            ));
        }
        if !(0..=MAX_LOG_LEVEL).contains(&self.log_level) {
            return Err(rejected(
                "log_level",
                format!("{} is outside 0..={MAX_LOG_LEVEL}", self.log_level),
            ));
        }
        if let Some(pid) = self.pid {
            if pid <= 0 {
                return Err(rejected("pid", format!("{pid} is not a process id")));
            }
        }
        if self.cgroup_mode.is_some() && !self.features.contains(&Feature::ManageCgroups) {
            return Err(rejected(
                "cgroup_mode",
                "requires cgroup management to be enabled",
            ));
        }
        for fs_type in &self.enable_fs {
            check_token("enable_fs", fs_type)?;
            if fs_type.contains(',') {
                return Err(rejected("enable_fs", format!("{fs_type:?} contains ','")));
            }
        }
        for key in &self.external {
            check_token("external", key)?;
        }

        let mut ext_mounts = BTreeMap::new();
        for (key, value) in &self.ext_mounts {
            check_token("ext_mount", key)?;
            check_token("ext_mount", value)?;
            if ext_mounts.insert(key.clone(), value.clone()).is_some() {
                return Err(rejected("ext_mount", format!("{key:?} declared twice")));
            }
        }

        let mut inherit_fds = BTreeMap::new();
        for (key, fd) in &self.inherit_fds {
            check_token("inherit_fd", key)?;
            if *fd < 0 {
                return Err(rejected("inherit_fd", format!("negative descriptor for {key:?}")));
            }
            if inherit_fds.insert(key.clone(), *fd).is_some() {
                return Err(rejected("inherit_fd", format!("{key:?} declared twice")));
            }
        }

        for path in &self.skip_mounts {
            if !path.starts_with('/') {
                return Err(rejected("skip_mount", format!("{path:?} is not absolute")));
            }
            check_token("skip_mount", path)?;
        }

        let root = match &self.root {
            Some(root) => {
                if !root.is_absolute() {
                    return Err(rejected("root", format!("{root:?} is not absolute")));
                }
                let root = root
                    .to_str()
                    .ok_or_else(|| rejected("root", format!("{root:?} is not valid utf-8")))?;
                Some(root.to_owned())
            }
            None => None,
        };

        Ok(EngineOptions {
            images_dir: self.images_dir.clone(),
            log_file: self.log_file.clone(),
            log_level: self.log_level,
            pid: self.pid,
            features: self.features.clone(),
            cgroup_mode: self.cgroup_mode,
            enable_fs: self.enable_fs.clone(),
            external: self.external.clone(),
            ext_mounts,
            inherit_fds,
            skip_mounts: self.skip_mounts.clone(),
            root,
            pid_file: self.pid_file.clone(),
        })
    }
}

fn rejected<R: Into<String>>(option: &str, reason: R) -> EngineError {
    EngineError::OptionRejected {
        option: option.to_string(),
        reason: reason.into(),
    }
}

// Values end up as single command line arguments or protobuf strings, so
// anything empty or containing whitespace is a bug upstream.
fn check_token(option: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(rejected(option, "empty value"));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(rejected(option, format!("{value:?} contains whitespace")));
    }
    Ok(())
}
