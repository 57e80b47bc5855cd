use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::EngineOptionsBuilder;

/// A mount whose source lives outside the container.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Mount point inside the container.
    pub destination: PathBuf,
    /// Host path, may differ between dump and restore.
    pub source: PathBuf,
}

impl BindMount {
    pub fn new<D: Into<PathBuf>, S: Into<PathBuf>>(destination: D, source: S) -> Self {
        Self {
            destination: destination.into(),
            source: source.into(),
        }
    }
}

fn lossy(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Records every bind mount under its own destination. The image only
/// remembers the key, which is what makes the source replaceable on restore.
pub fn declare_for_dump(
    builder: &mut EngineOptionsBuilder,
    mounts: &[BindMount],
    skip_mounts: &[String],
) {
    for mount in mounts {
        let destination = lossy(&mount.destination);
        tracing::debug!(%destination, "declaring external mount");
        builder.ext_mount(destination.clone(), destination);
    }
    for path in skip_mounts {
        builder.skip_mount(path.as_str());
    }
}

/// Maps the keys recorded at dump time onto the current host sources.
pub fn declare_for_restore(
    builder: &mut EngineOptionsBuilder,
    mounts: &[BindMount],
    skip_mounts: &[String],
) {
    for mount in mounts {
        let (destination, source) = (lossy(&mount.destination), lossy(&mount.source));
        tracing::debug!(%destination, %source, "mapping external mount");
        builder.ext_mount(destination, source);
    }
    for path in skip_mounts {
        builder.skip_mount(path.as_str());
    }
}
