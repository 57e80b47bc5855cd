use std::path::PathBuf;

use clap::Parser;

/// Restore a container from a checkpoint
#[derive(Parser, Debug)]
pub struct Restore {
    /// Directory holding the image files
    #[clap(long)]
    pub image_path: PathBuf,
    /// Terminal to hand to the restored container as its console
    #[clap(long)]
    pub tty: Option<PathBuf>,
    /// OCI bundle to read the rootfs and bind mounts from
    #[clap(short, long, conflicts_with = "rootfs")]
    pub bundle: Option<PathBuf>,
    /// Root file system of the container, when there is no bundle
    #[clap(long)]
    pub rootfs: Option<PathBuf>,

    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_name: String,
}
