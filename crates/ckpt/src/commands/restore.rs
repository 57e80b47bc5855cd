//! Contains functionality of restore container command
use std::fs::{File, OpenOptions};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use libcheckpoint::{CheckpointRestore, Config, RestoreRequest, RestoreWarning};
use libcheckpoint_cli::Restore;
use nix::fcntl::OFlag;

use super::container_config;

fn open_image_dir(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(OFlag::O_DIRECTORY.bits())
        .open(path)
        .with_context(|| format!("failed to open image directory {path:?}"))
}

fn open_tty(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        // must not become our own controlling terminal
        .custom_flags(OFlag::O_NOCTTY.bits())
        .open(path)
        .with_context(|| format!("failed to open tty {path:?}"))
}

pub fn restore(args: Restore, config: Config) -> Result<()> {
    tracing::debug!("start restoring container {}", args.container_name);
    let container = container_config(args.bundle.as_deref(), args.rootfs.as_deref())?;

    let image_dir = open_image_dir(&args.image_path)?;
    let tty = args.tty.as_deref().map(open_tty).transpose()?;

    let request = RestoreRequest {
        container_name: args.container_name.clone(),
        image_dir: image_dir.as_fd(),
        tty: tty.as_ref().map(|t| t.as_fd()),
        rootfs: container.rootfs,
        mounts: container.mounts,
    };
    let outcome = CheckpointRestore::new(config)
        .restore(&request)
        .with_context(|| format!("failed to restore container {}", args.container_name))?;

    for warning in &outcome.warnings {
        match warning {
            RestoreWarning::ConsoleDegraded { reason } => {
                eprintln!("warning: console not restored: {reason}")
            }
        }
    }
    println!("{}", outcome.pid);
    Ok(())
}
