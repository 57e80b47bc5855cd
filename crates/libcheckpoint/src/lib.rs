//! Checkpoint/restore orchestration for containers, on top of CRIU.
//!
//! [`CheckpointRestore`] is the entry point. It prepares the image directory
//! and the restore root, maps the container's external resources (its
//! console and bind mounts) and drives the engine selected in [`Config`].

pub mod bundle;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod external;
pub mod image_dir;
pub mod orchestrator;
pub mod restore;
pub mod root_mount;

pub use checkpoint::{CheckpointOutcome, CheckpointRequest};
pub use config::{Config, Transport};
pub use error::{ErrorKind, LibcheckpointError};
pub use external::BindMount;
pub use orchestrator::CheckpointRestore;
pub use restore::{RestoreOutcome, RestoreRequest, RestoreWarning};
