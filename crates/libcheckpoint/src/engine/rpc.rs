//! Drives CRIU through its RPC service (`criu swrk`).
//!
//! The request and response messages are the protobuf types shipped with
//! rust-criu. We build the request ourselves because the options a container
//! checkpoint needs (link remap, enabled file systems, skipped mounts, cgroup
//! mode, ...) go beyond the setters rust-criu exposes.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Command;
use std::sync::OnceLock;

use nix::sys::socket::{self, AddressFamily, MsgFlags, SockFlag, SockType};
use nix::unistd::Pid;
use protobuf::{Message, MessageField};
use rust_criu::rust_criu_protobuf::rpc;

use super::{
    Availability, CgroupMode, Engine, EngineError, EngineOptions, Feature, Result,
    inherit_into_child,
};

/// Minimum CRIU version required for checkpoint/restore functionality.
/// We are relying on the CRIU version RPC which was introduced with CRIU 3.0.0.
/// Version format: MAJOR * 10000 + MINOR * 100 + PATCH
pub const CRIU_VERSION_MINIMUM: u32 = 30000; // 3.0.0

// CRIU responses are a few hundred bytes at most.
const RESPONSE_BUFFER_SIZE: usize = 64 * 1024;

fn compare_criu_version(version: u32, min_version: u32) -> std::result::Result<(), String> {
    if version < min_version {
        return Err(format!(
            "CRIU version {} is below minimum required version {}.{}.{}",
            version,
            min_version / 10000,
            (min_version % 10000) / 100,
            min_version % 100,
        ));
    }
    Ok(())
}

pub struct CriuRpc {
    criu_path: String,
    version: OnceLock<u32>,
}

impl CriuRpc {
    pub fn new<S: Into<String>>(criu_path: S) -> Self {
        Self {
            criu_path: criu_path.into(),
            version: OnceLock::new(),
        }
    }

    /// If the version of CRIU has already been determined there is no need
    /// to ask CRIU for the version again.
    fn criu_version(&self) -> std::result::Result<u32, String> {
        if let Some(version) = self.version.get() {
            return Ok(*version);
        }

        let mut criu = rust_criu::Criu::new_with_criu_path(self.criu_path.clone())
            .map_err(|e| format!("failed to create CRIU instance: {}", e))?;
        let version = criu
            .get_criu_version()
            .map_err(|e| format!("CRIU version check failed: {}", e))?;

        Ok(*self.version.get_or_init(|| version))
    }

    fn call(&self, req: &rpc::Criu_req, options: &EngineOptions) -> Result<rpc::Criu_resp> {
        let (local, remote) = socket::socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;

        let mut cmd = Command::new(&self.criu_path);
        cmd.arg("swrk").arg(remote.as_raw_fd().to_string());
        let mut fds: Vec<_> = options.inherit_fds().values().copied().collect();
        fds.push(remote.as_raw_fd());
        inherit_into_child(&mut cmd, fds);
        let mut child = cmd
            .spawn()
            .map_err(|err| {
                tracing::error!(criu = ?self.criu_path, ?err, "failed to spawn criu swrk");
                err
            })?;
        drop(remote);

        let result = exchange(&local, req);
        // swrk serves requests until its end of the socket is closed
        drop(local);
        match child.wait() {
            Ok(status) => tracing::debug!(?status, "criu swrk exited"),
            Err(err) => tracing::warn!(?err, "failed to reap criu swrk"),
        }

        result
    }
}

fn exchange(sock: &OwnedFd, req: &rpc::Criu_req) -> Result<rpc::Criu_resp> {
    let request = req.write_to_bytes()?;
    socket::send(sock.as_raw_fd(), &request, MsgFlags::empty())?;

    let mut buffer = vec![0u8; RESPONSE_BUFFER_SIZE];
    let read = socket::recv(sock.as_raw_fd(), &mut buffer, MsgFlags::empty())?;
    if read == 0 {
        return Err(EngineError::InvocationFailed {
            message: "criu closed the connection without a response".to_string(),
            log_file: None,
        });
    }

    Ok(rpc::Criu_resp::parse_from_bytes(&buffer[..read])?)
}

fn cg_mode(mode: CgroupMode) -> rpc::Criu_cg_mode {
    match mode {
        CgroupMode::None => rpc::Criu_cg_mode::CG_NONE,
        CgroupMode::Soft => rpc::Criu_cg_mode::SOFT,
        CgroupMode::Full => rpc::Criu_cg_mode::FULL,
    }
}

fn encode(typ: rpc::Criu_req_type, options: &EngineOptions) -> rpc::Criu_req {
    let mut opts = rpc::Criu_opts::new();
    opts.set_images_dir_fd(options.images_dir().fd());
    opts.set_log_file(options.log_file().to_string());
    opts.set_log_level(options.log_level());
    if let Some(pid) = options.pid() {
        opts.set_pid(pid);
    }

    opts.set_tcp_established(options.has(Feature::TcpEstablished));
    opts.set_file_locks(options.has(Feature::FileLocks));
    opts.set_link_remap(options.has(Feature::LinkRemap));
    opts.set_force_irmap(options.has(Feature::ForceIrmap));
    opts.set_auto_ext_mnt(options.has(Feature::AutoExternalMounts));
    opts.set_ext_sharing(options.has(Feature::ExternalSharing));
    opts.set_ext_masters(options.has(Feature::ExternalMasters));
    opts.set_leave_running(options.has(Feature::LeaveRunning));
    opts.set_ext_unix_sk(options.has(Feature::ExtUnixSk));
    opts.set_shell_job(options.has(Feature::ShellJob));
    opts.set_manage_cgroups(options.has(Feature::ManageCgroups));
    if let Some(mode) = options.cgroup_mode() {
        opts.set_manage_cgroups_mode(cg_mode(mode));
    }
    // Over RPC the restored tree is otherwise a child of swrk and dies with it.
    if options.has(Feature::Detach) {
        opts.set_rst_sibling(true);
    }

    opts.enable_fs = options.enable_fs().iter().cloned().collect();
    opts.external = options.external().iter().cloned().collect();
    opts.skip_mnt = options.skip_mounts().iter().cloned().collect();
    for (key, value) in options.ext_mounts() {
        let mut ext_mnt = rpc::Ext_mount_map::new();
        ext_mnt.set_key(key.clone());
        ext_mnt.set_val(value.clone());
        opts.ext_mnt.push(ext_mnt);
    }
    for (key, fd) in options.inherit_fds() {
        let mut inherit = rpc::Inherit_fd::new();
        inherit.set_key(key.clone());
        inherit.set_fd(*fd);
        opts.inherit_fd.push(inherit);
    }
    if let Some(root) = options.root() {
        opts.set_root(root.to_string());
    }

    let mut req = rpc::Criu_req::new();
    req.set_type(typ);
    req.opts = MessageField::some(opts);
    req
}

fn check_response(resp: &rpc::Criu_resp, options: &EngineOptions) -> Result<()> {
    if resp.success() {
        return Ok(());
    }

    let message = if resp.has_cr_errmsg() {
        format!("{} (errno {})", resp.cr_errmsg(), resp.cr_errno())
    } else {
        format!("criu request failed (errno {})", resp.cr_errno())
    };
    Err(EngineError::InvocationFailed {
        message,
        log_file: Some(options.log_path()),
    })
}

impl Engine for CriuRpc {
    fn availability(&self) -> Availability {
        let version = match self.criu_version() {
            Ok(version) => version,
            Err(reason) => return Availability::Unavailable { reason },
        };
        match compare_criu_version(version, CRIU_VERSION_MINIMUM) {
            Ok(()) => Availability::Available {
                version: Some(version),
            },
            Err(reason) => Availability::Unavailable { reason },
        }
    }

    fn dump(&self, options: &EngineOptions) -> Result<()> {
        let req = encode(rpc::Criu_req_type::DUMP, options);
        let resp = self.call(&req, options)?;
        check_response(&resp, options)
    }

    fn restore(&self, options: &EngineOptions) -> Result<Pid> {
        let req = encode(rpc::Criu_req_type::RESTORE, options);
        let resp = self.call(&req, options)?;
        check_response(&resp, options)?;

        let pid = resp.restore.pid();
        if pid <= 0 {
            return Err(EngineError::InvocationFailed {
                message: "criu did not report the restored pid".to_string(),
                log_file: Some(options.log_path()),
            });
        }
        Ok(Pid::from_raw(pid))
    }
}
