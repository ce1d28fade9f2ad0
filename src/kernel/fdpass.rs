//! Fork requests over a Zygote's control socket.
//!
//! The request is one stream message whose ancillary data is an `SCM_RIGHTS`
//! block holding the child's root directory and its `cgroup.procs`. Linux
//! drops ancillary data sent with an empty payload on stream sockets, so one
//! zero byte is carried alongside it; the guest ignores the byte. The guest
//! answers with a little-endian `i32` status, 0 meaning the child is running.

use crate::config::types::{Result, SockError};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use std::fs::File;
use std::io::{IoSlice, Read};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// Longest path a `sockaddr_un` can hold.
pub const MAX_SOCKET_PATH: usize = 108;

pub fn check_socket_path(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len > MAX_SOCKET_PATH {
        return Err(SockError::Config(format!(
            "socket path {} is {} bytes, limit is {}",
            path.display(),
            len,
            MAX_SOCKET_PATH
        )));
    }
    Ok(())
}

/// Hand `root_dir` and `cgroup_procs` to the Zygote listening on `sock_path`
/// and wait for its status. `reply_timeout` bounds the wait, `None` waits as
/// long as the Zygote takes.
pub fn send_fork_request(
    sock_path: &Path,
    root_dir: &File,
    cgroup_procs: &File,
    reply_timeout: Option<Duration>,
) -> Result<i32> {
    check_socket_path(sock_path)?;
    let mut stream = UnixStream::connect(sock_path).map_err(|e| {
        SockError::ForkFailed(format!("connect {}: {}", sock_path.display(), e))
    })?;
    stream.set_read_timeout(reply_timeout)?;

    let fds = [root_dir.as_raw_fd(), cgroup_procs.as_raw_fd()];
    let carrier = [0u8];
    let iov = [IoSlice::new(&carrier)];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let sent = sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|e| SockError::ForkFailed(format!("sendmsg {}: {}", sock_path.display(), e)))?;
    if sent != carrier.len() {
        return Err(SockError::ForkFailed(format!(
            "short send to {}: {} bytes",
            sock_path.display(),
            sent
        )));
    }

    let mut status = [0u8; 4];
    stream.read_exact(&mut status).map_err(|e| {
        SockError::ForkFailed(format!("no status from {}: {}", sock_path.display(), e))
    })?;
    Ok(i32::from_le_bytes(status))
}
