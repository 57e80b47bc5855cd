mod commands;
mod observability;

use anyhow::{Context, Result};
use clap::Parser;
use libcheckpoint::Config;
use libcheckpoint_cli::{Command, GlobalOpts};

/// Checkpoint and restore containers with CRIU
#[derive(Parser, Debug)]
#[clap(version, author)]
struct Opts {
    #[clap(flatten)]
    global: GlobalOpts,
    #[clap(subcommand)]
    command: Command,
}

fn load_config(opts: &GlobalOpts) -> Result<Config> {
    match &opts.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("failed to load config {path:?}"))
        }
        None => Ok(Config::default()),
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Err(e) = observability::init(&opts.global) {
        eprintln!("failed to initialize logging: {e:?}");
    }
    tracing::debug!(
        "started by user {} with {:?}",
        nix::unistd::geteuid(),
        std::env::args_os()
    );

    let config = load_config(&opts.global)?;
    let cmd_result = match opts.command {
        Command::Checkpoint(args) => commands::checkpoint::checkpoint(args, config),
        Command::Restore(args) => commands::restore::restore(args, config),
    };

    if let Err(ref e) = cmd_result {
        tracing::error!("error in executing command: {:?}", e);
    }
    cmd_result
}
