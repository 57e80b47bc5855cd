//! Contains functionality of checkpoint container command
use anyhow::{Context, Result};
use libcheckpoint::{CheckpointRequest, CheckpointRestore, Config};
use libcheckpoint_cli::Checkpoint;

use super::dump_config;

pub fn checkpoint(args: Checkpoint, config: Config) -> Result<()> {
    tracing::debug!("start checkpointing container {}", args.container_name);
    let container = dump_config(args.bundle.as_deref(), args.rootfs.as_deref(), args.pid)?;

    let request = CheckpointRequest {
        container_name: args.container_name,
        pid: args.pid,
        image_path: args.image_path,
        rootfs: container.rootfs,
        mounts: container.mounts,
        leave_running: args.leave_running,
    };
    let outcome = CheckpointRestore::new(config)
        .checkpoint(&request)
        .with_context(|| format!("failed to checkpoint container {}", request.container_name))?;

    tracing::info!(
        image_path = ?outcome.image_path,
        tty = ?outcome.tty,
        log_file = ?outcome.log_file,
        "checkpointed container {}",
        request.container_name
    );
    Ok(())
}
