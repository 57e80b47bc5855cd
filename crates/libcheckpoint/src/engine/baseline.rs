//! Options every container checkpoint or restore carries, independent of the
//! container's external resources.

use std::path::Path;

use super::{EngineOptionsBuilder, Feature, ImagesDir};
use crate::config::Config;

pub const CRIU_CHECKPOINT_LOG_FILE: &str = "dump.log";
pub const CRIU_RESTORE_LOG_FILE: &str = "restore.log";
/// Pid file the command line transport asks CRIU to write on restore, inside
/// the images directory.
pub const CRIU_RESTORE_PID_FILE: &str = "restore.pid";

fn common(config: &Config, images_dir: ImagesDir, log_file: &str) -> EngineOptionsBuilder {
    let mut builder = EngineOptionsBuilder::new(images_dir);
    builder
        .log_file(log_file)
        .log_level(config.log_level)
        .feature(Feature::TcpEstablished, true)
        .feature(Feature::FileLocks, true)
        .feature(Feature::LinkRemap, true)
        .feature(Feature::ForceIrmap, true)
        // Mounts that are not part of the container's own tree are supplied
        // from the outside on restore.
        .feature(Feature::AutoExternalMounts, true)
        .feature(Feature::ExternalSharing, true)
        .feature(Feature::ExternalMasters, true)
        .feature(Feature::ExtUnixSk, config.ext_unix_sk)
        .feature(Feature::ShellJob, config.shell_job);
    // CRIU refuses file systems it does not know unless they are listed here.
    for fs_type in &config.enable_fs {
        builder.enable_fs(fs_type.as_str());
    }
    builder
}

/// Options for dumping `pid`. Cgroups belong to the caller's cgroup manager,
/// so the engine does not manage them.
pub fn dump(
    config: &Config,
    images_dir: ImagesDir,
    pid: i32,
    leave_running: bool,
) -> EngineOptionsBuilder {
    let mut builder = common(config, images_dir, CRIU_CHECKPOINT_LOG_FILE);
    builder
        .pid(pid)
        .feature(Feature::ManageCgroups, false)
        .feature(Feature::LeaveRunning, leave_running);
    builder
}

/// Options for restoring into the bind-mounted `root`.
pub fn restore(config: &Config, images_dir: ImagesDir, root: &Path) -> EngineOptionsBuilder {
    let pid_file = images_dir.path().join(CRIU_RESTORE_PID_FILE);
    let mut builder = common(config, images_dir, CRIU_RESTORE_LOG_FILE);
    builder
        .feature(Feature::ManageCgroups, true)
        .cgroup_mode(config.restore_cgroup_mode)
        .feature(Feature::Detach, true)
        .root(root)
        .pid_file(pid_file);
    builder
}
