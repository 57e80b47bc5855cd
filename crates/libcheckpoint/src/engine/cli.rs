//! Drives CRIU by spawning `criu dump` / `criu restore` with command line
//! flags.

use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::unistd::Pid;

use super::{Availability, Engine, EngineError, EngineOptions, Feature, Result, inherit_into_child};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct CriuCli {
    criu_path: PathBuf,
    timeout: Option<Duration>,
}

impl CriuCli {
    pub fn new<P: Into<PathBuf>>(criu_path: P) -> Self {
        Self {
            criu_path: criu_path.into(),
            timeout: None,
        }
    }

    /// Kill the engine if it has not finished after `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, args: Vec<OsString>, options: &EngineOptions) -> Result<()> {
        tracing::debug!(criu = ?self.criu_path, ?args, "running criu");
        let mut cmd = Command::new(&self.criu_path);
        cmd.args(&args).stdin(Stdio::null()).stdout(Stdio::null());
        inherit_into_child(&mut cmd, options.inherit_fds().values().copied().collect());
        let mut child = cmd
            .spawn()
            .map_err(|err| {
                tracing::error!(criu = ?self.criu_path, ?err, "failed to spawn criu");
                err
            })?;

        let status = match self.timeout {
            Some(timeout) => wait_with_deadline(&mut child, timeout, options)?,
            None => child.wait()?,
        };
        if !status.success() {
            return Err(EngineError::InvocationFailed {
                message: format!("criu exited with {status}"),
                log_file: Some(options.log_path()),
            });
        }
        Ok(())
    }
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    options: &EngineOptions,
) -> Result<ExitStatus> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if started.elapsed() >= timeout {
            tracing::error!(pid = child.id(), ?timeout, "criu did not finish in time, killing it");
            if let Err(err) = child.kill() {
                tracing::warn!(?err, "failed to kill criu");
            }
            let _ = child.wait();
            return Err(EngineError::Timeout {
                after: timeout,
                log_file: Some(options.log_path()),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn flag(feature: Feature) -> &'static [&'static str] {
    match feature {
        Feature::TcpEstablished => &["--tcp-established"],
        Feature::FileLocks => &["--file-locks"],
        Feature::LinkRemap => &["--link-remap"],
        Feature::ForceIrmap => &["--force-irmap"],
        Feature::AutoExternalMounts => &["--ext-mount-map", "auto"],
        Feature::ExternalSharing => &["--ext-sharing"],
        Feature::ExternalMasters => &["--ext-masters"],
        Feature::LeaveRunning => &["--leave-running"],
        Feature::ExtUnixSk => &["--ext-unix-sk"],
        Feature::ShellJob => &["--shell-job"],
        Feature::Detach => &["--restore-detached"],
        // rendered together with the mode
        Feature::ManageCgroups => &[],
    }
}

fn encode(action: &str, options: &EngineOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        action.into(),
        "--images-dir".into(),
        options.images_dir().path().into(),
        "--log-file".into(),
        options.log_file().into(),
        format!("-v{}", options.log_level()).into(),
    ];
    if let Some(pid) = options.pid() {
        args.push("--tree".into());
        args.push(pid.to_string().into());
    }

    for feature in options.features() {
        args.extend(flag(feature).iter().map(|f| OsString::from(*f)));
    }
    if options.has(Feature::ManageCgroups) {
        let mode = options.cgroup_mode().unwrap_or_default();
        args.push(format!("--manage-cgroups={}", mode.as_str()).into());
    }

    if !options.enable_fs().is_empty() {
        args.push("--enable-fs".into());
        args.push(
            options
                .enable_fs()
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(",")
                .into(),
        );
    }
    for key in options.external() {
        args.push("--external".into());
        args.push(key.into());
    }
    for (key, value) in options.ext_mounts() {
        args.push("--external".into());
        args.push(format!("mnt[{key}]:{value}").into());
    }
    for (key, fd) in options.inherit_fds() {
        args.push("--inherit-fd".into());
        args.push(format!("fd[{fd}]:{key}").into());
    }
    for path in options.skip_mounts() {
        args.push("--skip-mnt".into());
        args.push(path.into());
    }
    if let Some(root) = options.root() {
        args.push("--root".into());
        args.push(root.into());
    }
    if let Some(pid_file) = options.pid_file() {
        args.push("--pidfile".into());
        args.push(pid_file.into());
    }

    args
}

fn read_pid_file(options: &EngineOptions) -> Result<Pid> {
    let invalid = |message: String| EngineError::InvocationFailed {
        message,
        log_file: Some(options.log_path()),
    };
    let pid_file = options
        .pid_file()
        .ok_or_else(|| invalid("restore needs a pid file to report the restored pid".into()))?;
    let content = fs::read_to_string(pid_file)?;
    let pid: i32 = content
        .trim()
        .parse()
        .map_err(|_| invalid(format!("malformed pid file {pid_file:?}: {content:?}")))?;
    if pid <= 0 {
        return Err(invalid(format!("invalid restored pid {pid}")));
    }
    if let Err(err) = fs::remove_file(pid_file) {
        tracing::warn!(?pid_file, ?err, "failed to remove pid file");
    }
    Ok(Pid::from_raw(pid))
}

impl Engine for CriuCli {
    fn availability(&self) -> Availability {
        match Command::new(&self.criu_path)
            .arg("check")
            .stdin(Stdio::null())
            .output()
        {
            Ok(output) if output.status.success() => Availability::Available { version: None },
            Ok(output) => Availability::Unavailable {
                reason: format!(
                    "criu check failed with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            },
            Err(err) => Availability::Unavailable {
                reason: format!("failed to run {:?}: {}", self.criu_path, err),
            },
        }
    }

    fn dump(&self, options: &EngineOptions) -> Result<()> {
        self.run(encode("dump", options), options)
    }

    fn restore(&self, options: &EngineOptions) -> Result<Pid> {
        self.run(encode("restore", options), options)?;
        read_pid_file(options)
    }
}
