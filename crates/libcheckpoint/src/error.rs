use std::path::PathBuf;

use crate::bundle::BundleError;
use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::external::tty::TtyError;
use crate::image_dir::ImageDirError;
use crate::root_mount::RootMountError;

/// Coarse classification of a failure, used by callers that only care about
/// how to react (degrade, retry later, report a bug) and not about the detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The engine is missing or disabled. Reported once, not retried.
    UnsupportedCapability,
    /// A directory, mount or descriptor could not be acquired.
    ResourceAcquisition,
    /// A resource straddling the checkpoint boundary could not be resolved.
    ExternalResource,
    /// The engine ran and reported failure.
    EngineInvocation,
    /// A malformed engine option. Indicates a bug in this crate.
    Defect,
}

#[derive(Debug, thiserror::Error)]
pub enum LibcheckpointError {
    #[error("checkpoint/restore engine is not available: {reason}")]
    UnsupportedCapability { reason: String },
    #[error(transparent)]
    ImageDir(#[from] ImageDirError),
    #[error(transparent)]
    RootMount(#[from] RootMountError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    ExternalResource(#[from] TtyError),
    #[error("engine invocation failed (log: {log_file:?})")]
    EngineInvocation {
        source: EngineError,
        log_file: Option<PathBuf>,
    },
    #[error("invalid engine option")]
    InvalidEngineOption(#[source] EngineError),
}

impl LibcheckpointError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedCapability { .. } => ErrorKind::UnsupportedCapability,
            Self::ImageDir(_) | Self::RootMount(_) | Self::Config(_) | Self::Bundle(_) => {
                ErrorKind::ResourceAcquisition
            }
            Self::ExternalResource(_) => ErrorKind::ExternalResource,
            Self::EngineInvocation { .. } => ErrorKind::EngineInvocation,
            Self::InvalidEngineOption(_) => ErrorKind::Defect,
        }
    }
}

impl From<EngineError> for LibcheckpointError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable { reason } => Self::UnsupportedCapability { reason },
            EngineError::OptionRejected { .. } => {
                tracing::error!(?err, "engine option rejected, this is a bug");
                Self::InvalidEngineOption(err)
            }
            err => {
                let log_file = err.log_file().map(|p| p.to_path_buf());
                Self::EngineInvocation {
                    source: err,
                    log_file,
                }
            }
        }
    }
}
