/// Keep-alive connections to a guest's `ol.sock`
use crate::config::types::{Result, SockError};
use crate::kernel::fdpass::check_socket_path;
use log::debug;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const MAX_IDLE: usize = 8;

/// Connection source for requests into one sandbox. Idle connections are
/// kept for reuse and dropped when the sandbox pauses, since each one pins
/// socket buffers charged to the sandbox's cgroup.
#[derive(Debug)]
pub struct GuestClient {
    sock_path: PathBuf,
    idle: Mutex<Vec<UnixStream>>,
}

impl GuestClient {
    pub fn new(sock_path: PathBuf) -> Result<Self> {
        check_socket_path(&sock_path)?;
        Ok(Self {
            sock_path,
            idle: Mutex::new(Vec::new()),
        })
    }

    pub fn sock_path(&self) -> &Path {
        &self.sock_path
    }

    fn idle(&self) -> MutexGuard<'_, Vec<UnixStream>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// An idle connection if one is kept, else a new one.
    pub fn connect(&self) -> Result<UnixStream> {
        if let Some(stream) = self.idle().pop() {
            return Ok(stream);
        }
        UnixStream::connect(&self.sock_path).map_err(|e| {
            SockError::Process(format!("connect {}: {}", self.sock_path.display(), e))
        })
    }

    /// Return a connection whose response was fully read.
    pub fn put_back(&self, stream: UnixStream) {
        let mut idle = self.idle();
        if idle.len() < MAX_IDLE {
            idle.push(stream);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    pub fn close_idle(&self) -> usize {
        let closed: Vec<UnixStream> = self.idle().drain(..).collect();
        if !closed.is_empty() {
            debug!("{}: closed {} idle connections", self.sock_path.display(), closed.len());
        }
        closed.len()
    }
}
