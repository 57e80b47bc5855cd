use std::path::PathBuf;

use crate::engine::baseline;
use crate::error::LibcheckpointError;
use crate::external::tty::{self, TtyIdentity};
use crate::external::{BindMount, mounts};
use crate::image_dir::ImageDir;
use crate::orchestrator::CheckpointRestore;

/// One dump of a running container.
#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub container_name: String,
    /// Root of the process tree to dump.
    pub pid: i32,
    /// Created if missing.
    pub image_path: PathBuf,
    pub rootfs: PathBuf,
    pub mounts: Vec<BindMount>,
    pub leave_running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointOutcome {
    /// Where the images ended up, as resolved from the open directory.
    pub image_path: PathBuf,
    /// Controlling terminal recorded next to the images, if there was one.
    pub tty: Option<TtyIdentity>,
    pub log_file: PathBuf,
}

impl CheckpointRestore {
    #[tracing::instrument(level = "debug", skip_all, fields(container = %request.container_name))]
    pub fn checkpoint(
        &self,
        request: &CheckpointRequest,
    ) -> Result<CheckpointOutcome, LibcheckpointError> {
        self.ensure_available()?;

        let image_dir = ImageDir::prepare_for_dump(&request.image_path)?;
        tracing::debug!(path = ?image_dir.path(), rootfs = ?request.rootfs, "directory ready");

        let images_dir = image_dir.images_dir();
        let mut builder = baseline::dump(
            &self.config,
            images_dir.clone(),
            request.pid,
            request.leave_running,
        );
        tracing::debug!("options built");

        let tty = tty::declare_for_dump(&mut builder, request.pid, &images_dir)?;
        mounts::declare_for_dump(&mut builder, &request.mounts, &self.config.skip_mounts);
        let options = builder.build()?;
        tracing::debug!(?tty, mounts = request.mounts.len(), "externals resolved");

        self.engine.dump(&options).map_err(|err| {
            tracing::error!(
                ?err,
                log_file = ?options.log_path(),
                "checkpoint failed, see the engine log for details"
            );
            err
        })?;
        tracing::debug!(pid = request.pid, "engine invoked");

        Ok(CheckpointOutcome {
            image_path: image_dir.path().to_path_buf(),
            tty,
            log_file: options.log_path(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::os::unix::process::CommandExt;
    use std::process::{Child, Command, Stdio};

    use anyhow::Result;
    use nix::pty::{Winsize, openpty};
    use nix::sys::termios::Termios;

    use super::*;
    use crate::config::Config;
    use crate::engine::fake::{Call, FakeEngine};
    use crate::engine::{CgroupMode, Feature};
    use crate::error::ErrorKind;
    use crate::external::tty::TTY_INFO_FILE;
    use crate::root_mount::fake::FakeMounter;

    /// A process in its own session.
    struct Sleeper(Child);

    impl Sleeper {
        /// Without a controlling terminal.
        fn spawn() -> Result<Self> {
            let mut cmd = Command::new("sleep");
            cmd.arg("30");
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setsid()?;
                    Ok(())
                });
            }
            Ok(Self(cmd.spawn()?))
        }

        /// With `slave` on stdio and as its controlling terminal.
        fn on_tty(slave: &OwnedFd) -> Result<Self> {
            let mut cmd = Command::new("sleep");
            cmd.arg("30")
                .stdin(Stdio::from(slave.try_clone()?))
                .stdout(Stdio::from(slave.try_clone()?))
                .stderr(Stdio::from(slave.try_clone()?));
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setsid()?;
                    if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            Ok(Self(cmd.spawn()?))
        }

        fn pid(&self) -> i32 {
            self.0.id() as i32
        }
    }

    impl Drop for Sleeper {
        fn drop(&mut self) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }

    fn request(image_path: PathBuf, pid: i32) -> CheckpointRequest {
        CheckpointRequest {
            container_name: "demo".to_string(),
            pid,
            image_path,
            rootfs: PathBuf::from("/var/lib/ctr/demo/rootfs"),
            mounts: vec![BindMount::new("/data", "/srv/data")],
            leave_running: false,
        }
    }

    fn checkpoint_restore(engine: &FakeEngine, mounter: &FakeMounter) -> CheckpointRestore {
        CheckpointRestore::new(Config::default())
            .with_engine(Box::new(engine.clone()))
            .with_mounter(Box::new(mounter.clone()))
    }

    #[test]
    fn test_checkpoint_creates_image_dir() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let image_path = tmp.path().join("var/lib/ctr/ckpt/demo");
        let sleeper = Sleeper::spawn()?;
        let engine = FakeEngine::new();
        let mounter = FakeMounter::default();

        let outcome = checkpoint_restore(&engine, &mounter)
            .checkpoint(&request(image_path.clone(), sleeper.pid()))?;

        assert!(image_path.is_dir());
        assert_eq!(outcome.image_path, fs::canonicalize(&image_path)?);
        assert_eq!(outcome.tty, None);
        assert_eq!(outcome.log_file, outcome.image_path.join("dump.log"));
        assert!(!image_path.join(TTY_INFO_FILE).exists());
        assert!(image_path.join("inventory.img").exists());

        let calls = engine.calls();
        assert_eq!(calls.len(), 1);
        let (call, options) = &calls[0];
        assert_eq!(*call, Call::Dump);
        assert_eq!(options.pid(), Some(sleeper.pid()));
        assert!(!options.has(Feature::ManageCgroups));
        assert_eq!(options.cgroup_mode(), None::<CgroupMode>);
        assert_eq!(
            options.enable_fs().iter().collect::<Vec<_>>(),
            vec!["hugetlbfs", "tracefs"]
        );
        assert_eq!(options.ext_mounts().get("/data").map(String::as_str), Some("/data"));
        assert!(options.external().is_empty());

        // dumps never mount anything
        assert_eq!(mounter.mount_count(), 0);
        Ok(())
    }

    #[test]
    fn test_checkpoint_records_controlling_tty() -> Result<()> {
        let pty = openpty(None::<&Winsize>, None::<&Termios>)?;
        let slave =
            TtyIdentity::from_device_node(format!("/proc/self/fd/{}", pty.slave.as_raw_fd()))?;
        let sleeper = Sleeper::on_tty(&pty.slave)?;
        let tmp = tempfile::tempdir()?;
        let image_path = tmp.path().join("ckpt");
        let engine = FakeEngine::new();
        let mounter = FakeMounter::default();

        let outcome = checkpoint_restore(&engine, &mounter)
            .checkpoint(&request(image_path.clone(), sleeper.pid()))?;

        assert_eq!(outcome.tty, Some(slave));
        assert_eq!(
            fs::read_to_string(image_path.join(TTY_INFO_FILE))?.parse::<TtyIdentity>()?,
            slave
        );
        let calls = engine.calls();
        assert!(calls[0].1.external().contains(&slave.key()));
        Ok(())
    }

    #[test]
    fn test_checkpoint_unavailable_engine_touches_nothing() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let image_path = tmp.path().join("ckpt");
        let engine = FakeEngine::new().unavailable();
        let mounter = FakeMounter::default();

        let err = checkpoint_restore(&engine, &mounter)
            .checkpoint(&request(image_path.clone(), 1))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnsupportedCapability);
        assert!(!image_path.exists());
        assert!(engine.calls().is_empty());
        Ok(())
    }

    #[test]
    fn test_checkpoint_engine_failure_reports_log() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let image_path = tmp.path().join("ckpt");
        let sleeper = Sleeper::spawn()?;
        let engine = FakeEngine::new().failing("criu dump exited with 1");
        let mounter = FakeMounter::default();

        let err = checkpoint_restore(&engine, &mounter)
            .checkpoint(&request(image_path.clone(), sleeper.pid()))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::EngineInvocation);
        match err {
            LibcheckpointError::EngineInvocation { log_file, .. } => {
                assert_eq!(log_file, Some(fs::canonicalize(&image_path)?.join("dump.log")))
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_checkpoint_missing_process() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let engine = FakeEngine::new();
        let mounter = FakeMounter::default();

        let err = checkpoint_restore(&engine, &mounter)
            .checkpoint(&request(tmp.path().join("ckpt"), i32::MAX))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalResource);
        assert!(engine.calls().is_empty());
        Ok(())
    }

    #[test]
    fn test_checkpoint_leave_running() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let sleeper = Sleeper::spawn()?;
        let engine = FakeEngine::new();
        let mounter = FakeMounter::default();

        let mut req = request(tmp.path().join("ckpt"), sleeper.pid());
        req.leave_running = true;
        checkpoint_restore(&engine, &mounter).checkpoint(&req)?;
        assert!(engine.calls()[0].1.has(Feature::LeaveRunning));
        Ok(())
    }
}
