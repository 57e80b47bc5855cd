use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::engine::baseline;
use crate::error::LibcheckpointError;
use crate::external::tty::{self, ConsoleMapping};
use crate::external::{BindMount, mounts};
use crate::image_dir;
use crate::orchestrator::CheckpointRestore;
use crate::root_mount::RootMount;

/// One restore of a checkpointed container. Descriptors stay owned by the
/// caller.
#[derive(Debug, Clone)]
pub struct RestoreRequest<'a> {
    pub container_name: String,
    /// The image directory, opened by the caller.
    pub image_dir: BorrowedFd<'a>,
    /// Replaces the console the container had at dump time.
    pub tty: Option<BorrowedFd<'a>>,
    pub rootfs: PathBuf,
    pub mounts: Vec<BindMount>,
}

/// Something the restore had to give up on without failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreWarning {
    ConsoleDegraded { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Root of the restored process tree.
    pub pid: Pid,
    pub warnings: Vec<RestoreWarning>,
}

impl CheckpointRestore {
    /// Restores the container. The restore root is always unmounted before
    /// returning, whatever the result.
    #[tracing::instrument(level = "debug", skip_all, fields(container = %request.container_name))]
    pub fn restore(
        &self,
        request: &RestoreRequest<'_>,
    ) -> Result<RestoreOutcome, LibcheckpointError> {
        self.ensure_available()?;

        let mut root = RootMount::prepare(
            self.mounter.as_ref(),
            &self.config.runtime_dir,
            &request.container_name,
            &request.rootfs,
        )?;
        tracing::debug!(root = ?root.path(), "root mounted");

        let result = self.restore_into(request, root.path());
        if let Err(err) = root.teardown() {
            tracing::warn!(?err, "failed to clean up restore root");
        }
        result
    }

    fn restore_into(
        &self,
        request: &RestoreRequest<'_>,
        root: &Path,
    ) -> Result<RestoreOutcome, LibcheckpointError> {
        let images_dir = image_dir::images_dir_from_fd(request.image_dir)?;
        tracing::debug!(path = ?images_dir.path(), "directory resolved");

        let mut builder = baseline::restore(&self.config, images_dir.clone(), root);
        tracing::debug!("options built");

        let mut warnings = Vec::new();
        match tty::map_for_restore(&mut builder, &images_dir, request.tty)? {
            ConsoleMapping::Inherited(tty) => tracing::debug!(%tty, "console mapped"),
            ConsoleMapping::Degraded { reason } => {
                tracing::warn!(%reason, "restoring without console");
                warnings.push(RestoreWarning::ConsoleDegraded { reason });
            }
        }
        mounts::declare_for_restore(&mut builder, &request.mounts, &self.config.skip_mounts);
        let options = builder.build()?;
        tracing::debug!(mounts = request.mounts.len(), "externals resolved");

        let pid = self.engine.restore(&options).map_err(|err| {
            tracing::error!(
                ?err,
                log_file = ?options.log_path(),
                "restore failed, see the engine log for details"
            );
            err
        })?;
        tracing::debug!(%pid, "engine invoked");

        Ok(RestoreOutcome { pid, warnings })
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};
    use std::os::fd::{AsFd, AsRawFd};

    use anyhow::Result;
    use nix::errno::Errno;

    use super::*;
    use crate::config::Config;
    use crate::engine::fake::{Call, FakeEngine};
    use crate::engine::{CgroupMode, Feature};
    use crate::error::ErrorKind;
    use crate::external::tty::{TTY_INFO_FILE, TtyIdentity};
    use crate::root_mount::fake::FakeMounter;
    use crate::root_mount::CRIU_ROOT_DIR;

    struct Fixture {
        runtime: tempfile::TempDir,
        rootfs: tempfile::TempDir,
        images: tempfile::TempDir,
        engine: FakeEngine,
        mounter: FakeMounter,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            Ok(Self {
                runtime: tempfile::tempdir()?,
                rootfs: tempfile::tempdir()?,
                images: tempfile::tempdir()?,
                engine: FakeEngine::new(),
                mounter: FakeMounter::default(),
            })
        }

        fn checkpoint_restore(&self) -> CheckpointRestore {
            CheckpointRestore::new(Config {
                runtime_dir: self.runtime.path().to_path_buf(),
                ..Default::default()
            })
            .with_engine(Box::new(self.engine.clone()))
            .with_mounter(Box::new(self.mounter.clone()))
        }

        fn request<'a>(&self, images: &'a File, tty: Option<BorrowedFd<'a>>) -> RestoreRequest<'a> {
            RestoreRequest {
                container_name: "demo".to_string(),
                image_dir: images.as_fd(),
                tty,
                rootfs: self.rootfs.path().to_path_buf(),
                mounts: vec![BindMount::new("/data", "/srv/volumes/data")],
            }
        }

        fn assert_cleaned_up(&self) {
            assert!(self.mounter.mounted().is_empty());
            assert!(!self.runtime.path().join("demo").exists());
        }
    }

    #[test]
    fn test_restore_without_sidecar_degrades_console() -> Result<()> {
        let fx = Fixture::new()?;
        let images = File::open(fx.images.path())?;

        let outcome = fx.checkpoint_restore().restore(&fx.request(&images, None))?;

        assert_eq!(outcome.pid, Pid::from_raw(4242));
        assert_eq!(outcome.warnings.len(), 1);
        assert!(matches!(
            outcome.warnings[0],
            RestoreWarning::ConsoleDegraded { .. }
        ));

        let calls = fx.engine.calls();
        assert_eq!(calls.len(), 1);
        let (call, options) = &calls[0];
        assert_eq!(*call, Call::Restore);
        assert!(options.inherit_fds().is_empty());
        assert!(options.has(Feature::ManageCgroups));
        assert_eq!(options.cgroup_mode(), Some(CgroupMode::None));
        let expected_root = fx.runtime.path().join("demo").join(CRIU_ROOT_DIR);
        assert_eq!(options.root(), expected_root.to_str());
        assert_eq!(
            options.ext_mounts().get("/data").map(String::as_str),
            Some("/srv/volumes/data")
        );
        assert_eq!(fx.mounter.mount_count(), 1);
        fx.assert_cleaned_up();
        Ok(())
    }

    #[test]
    fn test_restore_inherits_tty() -> Result<()> {
        let fx = Fixture::new()?;
        fs::write(fx.images.path().join(TTY_INFO_FILE), TtyIdentity::new(0x88, 3).to_string())?;
        let images = File::open(fx.images.path())?;
        let tty = tempfile::tempfile()?;

        let outcome = fx
            .checkpoint_restore()
            .restore(&fx.request(&images, Some(tty.as_fd())))?;

        assert!(outcome.warnings.is_empty());
        let calls = fx.engine.calls();
        assert_eq!(
            calls[0].1.inherit_fds().get("tty[88:3]"),
            Some(&tty.as_raw_fd())
        );
        fx.assert_cleaned_up();
        Ok(())
    }

    #[test]
    fn test_restore_unused_tty_is_a_warning() -> Result<()> {
        let fx = Fixture::new()?;
        let images = File::open(fx.images.path())?;
        let tty = tempfile::tempfile()?;

        let outcome = fx
            .checkpoint_restore()
            .restore(&fx.request(&images, Some(tty.as_fd())))?;
        assert_eq!(outcome.warnings.len(), 1);
        assert!(fx.engine.calls()[0].1.inherit_fds().is_empty());
        Ok(())
    }

    #[test]
    fn test_restore_malformed_sidecar() -> Result<()> {
        let fx = Fixture::new()?;
        fs::write(fx.images.path().join(TTY_INFO_FILE), "tty[zz:1]")?;
        let images = File::open(fx.images.path())?;
        let tty = tempfile::tempfile()?;

        let err = fx
            .checkpoint_restore()
            .restore(&fx.request(&images, Some(tty.as_fd())))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalResource);
        assert!(fx.engine.calls().is_empty());
        fx.assert_cleaned_up();
        Ok(())
    }

    #[test]
    fn test_restore_sidecar_without_tty() -> Result<()> {
        let fx = Fixture::new()?;
        fs::write(fx.images.path().join(TTY_INFO_FILE), TtyIdentity::new(0x88, 3).to_string())?;
        let images = File::open(fx.images.path())?;

        let err = fx
            .checkpoint_restore()
            .restore(&fx.request(&images, None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalResource);
        assert!(fx.engine.calls().is_empty());
        fx.assert_cleaned_up();
        Ok(())
    }

    #[test]
    fn test_restore_mount_failure() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.mounter = FakeMounter::failing(Errno::EPERM);
        let images = File::open(fx.images.path())?;

        let err = fx
            .checkpoint_restore()
            .restore(&fx.request(&images, None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAcquisition);
        assert!(fx.engine.calls().is_empty());
        fx.assert_cleaned_up();
        Ok(())
    }

    #[test]
    fn test_restore_missing_rootfs() -> Result<()> {
        let fx = Fixture::new()?;
        let images = File::open(fx.images.path())?;
        let mut request = fx.request(&images, None);
        request.rootfs = fx.rootfs.path().join("missing");

        let err = fx.checkpoint_restore().restore(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAcquisition);
        assert!(fx.engine.calls().is_empty());
        assert_eq!(fx.mounter.mount_count(), 0);
        assert!(!fx.runtime.path().join("demo").exists());
        Ok(())
    }

    #[test]
    fn test_restore_engine_failure_unmounts() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.engine = FakeEngine::new().failing("criu restore exited with 1");
        let images = File::open(fx.images.path())?;

        let err = fx
            .checkpoint_restore()
            .restore(&fx.request(&images, None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineInvocation);
        assert_eq!(fx.engine.calls().len(), 1);
        assert_eq!(fx.mounter.mount_count(), 1);
        fx.assert_cleaned_up();
        Ok(())
    }

    #[test]
    fn test_restore_unavailable_engine() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.engine = FakeEngine::new().unavailable();
        let images = File::open(fx.images.path())?;

        let err = fx
            .checkpoint_restore()
            .restore(&fx.request(&images, None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedCapability);
        assert_eq!(fx.mounter.mount_count(), 0);
        Ok(())
    }

    #[test]
    fn test_restore_image_dir_is_not_a_directory() -> Result<()> {
        let fx = Fixture::new()?;
        let not_a_dir = tempfile::tempfile()?;

        let err = fx
            .checkpoint_restore()
            .restore(&fx.request(&not_a_dir, None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAcquisition);
        fx.assert_cleaned_up();
        Ok(())
    }
}
