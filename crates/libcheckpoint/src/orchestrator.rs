//! Entry point for callers: one [`CheckpointRestore`] per host configuration.
//! The operations themselves live in `checkpoint.rs` and `restore.rs`.

use crate::config::Config;
use crate::engine::{Availability, Engine};
use crate::error::LibcheckpointError;
use crate::root_mount::{LinuxMounter, Mounter};

pub struct CheckpointRestore {
    pub(crate) engine: Box<dyn Engine>,
    pub(crate) mounter: Box<dyn Mounter>,
    pub(crate) config: Config,
}

impl CheckpointRestore {
    /// Uses the engine selected by `config` and the host's mount syscalls.
    pub fn new(config: Config) -> Self {
        Self {
            engine: config.engine(),
            mounter: Box::new(LinuxMounter),
            config,
        }
    }

    pub fn with_engine(mut self, engine: Box<dyn Engine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_mounter(mut self, mounter: Box<dyn Mounter>) -> Self {
        self.mounter = mounter;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn availability(&self) -> Availability {
        self.engine.availability()
    }

    /// Fails with [`LibcheckpointError::UnsupportedCapability`] unless the
    /// engine can be used. Runs before anything touches the host.
    pub fn ensure_available(&self) -> Result<(), LibcheckpointError> {
        match self.engine.availability() {
            Availability::Available { version } => {
                tracing::debug!(?version, "checkpoint/restore engine available");
                Ok(())
            }
            Availability::Unavailable { reason } => {
                tracing::warn!(%reason, "checkpoint/restore engine unavailable");
                Err(LibcheckpointError::UnsupportedCapability { reason })
            }
        }
    }
}
