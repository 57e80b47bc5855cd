use std::path::PathBuf;

use clap::{Parser, ValueEnum};

mod checkpoint;
mod restore;

pub use checkpoint::Checkpoint;
pub use restore::Restore;

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
pub struct GlobalOpts {
    /// Path to the JSON configuration file
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Enable debug logging
    #[clap(long, global = true)]
    pub debug: bool,
    /// Write logs to this file instead of stderr
    #[clap(long, global = true)]
    pub log: Option<PathBuf>,
    #[clap(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Parser, Debug)]
pub enum Command {
    Checkpoint(Checkpoint),
    Restore(Restore),
}
