//! Reads what checkpoint/restore needs from an OCI bundle.
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use oci_spec::runtime::Spec;

use crate::external::BindMount;

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("failed to load {path:?}")]
    LoadSpec {
        path: PathBuf,
        source: oci_spec::OciSpecError,
    },
    #[error("{path:?} has no root")]
    MissingRoot { path: PathBuf },
    #[error("rootfs {rootfs:?} does not exist, it must be mounted before restore")]
    RootfsNotFound { rootfs: PathBuf },
    #[error("failed to canonicalize rootfs {rootfs:?}")]
    Canonicalize {
        rootfs: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, BundleError>;

/// The container's root file system and its externally sourced mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    pub rootfs: PathBuf,
    pub mounts: Vec<BindMount>,
}

impl ContainerConfig {
    pub fn from_bundle<P: AsRef<Path>>(bundle: P) -> Result<Self> {
        let bundle = bundle.as_ref();
        let path = bundle.join("config.json");
        let spec = Spec::load(&path).map_err(|err| {
            tracing::error!(?path, ?err, "failed to load spec");
            BundleError::LoadSpec {
                path: path.clone(),
                source: err,
            }
        })?;
        let root = spec
            .root()
            .as_ref()
            .ok_or_else(|| BundleError::MissingRoot { path: path.clone() })?;

        let rootfs = if root.path().is_absolute() {
            root.path().to_path_buf()
        } else {
            bundle.join(root.path())
        };
        if !rootfs.exists() {
            tracing::error!(?rootfs, "rootfs does not exist");
            return Err(BundleError::RootfsNotFound { rootfs });
        }
        let rootfs = std::fs::canonicalize(&rootfs).map_err(|err| {
            tracing::error!(?rootfs, ?err, "failed to canonicalize rootfs path");
            BundleError::Canonicalize {
                rootfs: rootfs.clone(),
                source: err,
            }
        })?;

        Ok(Self {
            rootfs,
            mounts: external_mounts(&spec),
        })
    }

    /// A container described only by its root file system.
    pub fn from_rootfs<P: Into<PathBuf>>(rootfs: P) -> Self {
        Self {
            rootfs: rootfs.into(),
            mounts: Vec::new(),
        }
    }
}

fn external_mounts(spec: &Spec) -> Vec<BindMount> {
    let mut mounts = Vec::new();
    for m in spec.mounts().iter().flatten() {
        let is_bind = m.typ().as_deref() == Some("bind")
            || m
                .options()
                .iter()
                .flatten()
                .any(|o| o == "bind" || o == "rbind");
        if !is_bind {
            continue;
        }
        if let Some(source) = m.source() {
            mounts.push(BindMount::new(m.destination(), source));
        }
    }

    if let Some(linux) = spec.linux() {
        // masked paths are bind mounts of /dev/null
        if linux.masked_paths().as_ref().is_some_and(|p| !p.is_empty()) {
            mounts.push(BindMount::new("/dev/null", "/dev/null"));
        }
        for device in linux.devices().iter().flatten() {
            mounts.push(BindMount::new(device.path(), device.path()));
        }
    }

    // a destination is one key to the engine, the first declaration wins
    let mut seen = HashSet::new();
    mounts.retain(|m| seen.insert(m.destination.clone()));
    mounts
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result;
    use oci_spec::runtime::{LinuxBuilder, LinuxDeviceBuilder, LinuxDeviceType, MountBuilder};

    use super::*;
    use crate::engine::{EngineOptionsBuilder, ImagesDir};
    use crate::external::mounts::declare_for_dump;

    fn bundle_with(spec: &Spec) -> Result<tempfile::TempDir> {
        let bundle = tempfile::tempdir()?;
        fs::create_dir(bundle.path().join("rootfs"))?;
        spec.save(bundle.path().join("config.json"))?;
        Ok(bundle)
    }

    #[test]
    fn test_from_bundle_collects_bind_mounts() -> Result<()> {
        let mut spec = Spec::default();
        spec.set_mounts(Some(vec![
            MountBuilder::default()
                .destination("/proc")
                .typ("proc")
                .source("proc")
                .build()?,
            MountBuilder::default()
                .destination("/data")
                .typ("bind")
                .source("/srv/data")
                .build()?,
            MountBuilder::default()
                .destination("/etc/hosts")
                .typ("none")
                .source("/run/demo/hosts")
                .options(vec!["rbind".to_string(), "ro".to_string()])
                .build()?,
        ]));
        spec.set_linux(Some(
            LinuxBuilder::default()
                .masked_paths(vec!["/proc/kcore".to_string()])
                .devices(vec![LinuxDeviceBuilder::default()
                    .path("/dev/fuse")
                    .typ(LinuxDeviceType::C)
                    .major(10)
                    .minor(229)
                    .build()?])
                .build()?,
        ));
        let bundle = bundle_with(&spec)?;

        let config = ContainerConfig::from_bundle(bundle.path())?;
        assert_eq!(config.rootfs, fs::canonicalize(bundle.path().join("rootfs"))?);
        assert_eq!(
            config.mounts,
            vec![
                BindMount::new("/data", "/srv/data"),
                BindMount::new("/etc/hosts", "/run/demo/hosts"),
                BindMount::new("/dev/null", "/dev/null"),
                BindMount::new("/dev/fuse", "/dev/fuse"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_from_bundle_device_also_bind_mounted() -> Result<()> {
        let mut spec = Spec::default();
        spec.set_mounts(Some(vec![MountBuilder::default()
            .destination("/dev/fuse")
            .typ("bind")
            .source("/dev/fuse")
            .options(vec!["bind".to_string()])
            .build()?]));
        spec.set_linux(Some(
            LinuxBuilder::default()
                .devices(vec![LinuxDeviceBuilder::default()
                    .path("/dev/fuse")
                    .typ(LinuxDeviceType::C)
                    .major(10)
                    .minor(229)
                    .build()?])
                .build()?,
        ));
        let bundle = bundle_with(&spec)?;

        let config = ContainerConfig::from_bundle(bundle.path())?;
        assert_eq!(config.mounts, vec![BindMount::new("/dev/fuse", "/dev/fuse")]);

        // the engine accepts the result
        let mut builder = EngineOptionsBuilder::new(ImagesDir::new(3, PathBuf::from("/ckpt")));
        builder.log_file("dump.log");
        declare_for_dump(&mut builder, &config.mounts, &[]);
        assert!(builder.build().is_ok());
        Ok(())
    }

    #[test]
    fn test_from_bundle_missing_rootfs() -> Result<()> {
        let bundle = tempfile::tempdir()?;
        Spec::default().save(bundle.path().join("config.json"))?;
        assert!(matches!(
            ContainerConfig::from_bundle(bundle.path()),
            Err(BundleError::RootfsNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_from_bundle_missing_config() -> Result<()> {
        let bundle = tempfile::tempdir()?;
        assert!(matches!(
            ContainerConfig::from_bundle(bundle.path()),
            Err(BundleError::LoadSpec { .. })
        ));
        Ok(())
    }
}
