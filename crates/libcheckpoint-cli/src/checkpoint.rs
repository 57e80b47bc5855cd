use std::path::PathBuf;

use clap::Parser;

/// Checkpoint a running container
#[derive(Parser, Debug)]
pub struct Checkpoint {
    /// Directory for the image files, created if missing
    #[clap(long)]
    pub image_path: PathBuf,
    /// Pid of the container's init process
    #[clap(long, value_parser = clap::value_parser!(i32).range(1..))]
    pub pid: i32,
    /// OCI bundle to read the rootfs and bind mounts from. Without a bundle
    /// no bind mounts are declared
    #[clap(short, long, conflicts_with = "rootfs")]
    pub bundle: Option<PathBuf>,
    /// Root file system of the container, when there is no bundle
    #[clap(long)]
    pub rootfs: Option<PathBuf>,
    /// Leave the process running after checkpointing
    #[clap(long)]
    pub leave_running: bool,

    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_name: String,
}
