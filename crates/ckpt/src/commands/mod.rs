use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use libcheckpoint::bundle::ContainerConfig;

pub mod checkpoint;
pub mod restore;

/// Rootfs and bind mounts of the container, from `--bundle`, `--rootfs`, or
/// the bundle in the current directory.
fn container_config(bundle: Option<&Path>, rootfs: Option<&Path>) -> Result<ContainerConfig> {
    match (bundle, rootfs) {
        (_, Some(rootfs)) => {
            let rootfs = fs::canonicalize(rootfs)
                .with_context(|| format!("failed to canonicalize rootfs {rootfs:?}"))?;
            Ok(ContainerConfig::from_rootfs(rootfs))
        }
        (Some(bundle), None) => ContainerConfig::from_bundle(bundle)
            .with_context(|| format!("failed to load bundle {bundle:?}")),
        (None, None) => ContainerConfig::from_bundle(".")
            .context("failed to load bundle from the current directory"),
    }
}

/// Like [`container_config`], but a dump needs neither a bundle nor a rootfs.
/// Without them no bind mounts are declared and the rootfs, which is only
/// logged, is the process's own root.
fn dump_config(
    bundle: Option<&Path>,
    rootfs: Option<&Path>,
    pid: i32,
) -> Result<ContainerConfig> {
    match (bundle, rootfs) {
        (None, None) => Ok(ContainerConfig::from_rootfs(format!("/proc/{pid}/root"))),
        _ => container_config(bundle, rootfs),
    }
}
