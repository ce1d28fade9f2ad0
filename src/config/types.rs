/// Error types shared by every sockbox subsystem
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Tagged failure kinds surfaced by the sandbox engine.
#[derive(Error, Debug)]
pub enum SockError {
    /// Operation attempted on a sandbox that has already been destroyed.
    #[error("Sandbox is dead: {0}")]
    SandboxDead(String),

    /// A Zygote could not fork the requested child.
    #[error("Fork failed: {0}")]
    ForkFailed(String),

    #[error("Guest did not signal readiness on {pipe} within {waited:?}")]
    GuestInitTimeout { pipe: PathBuf, waited: Duration },

    /// freezer.state never reflected the written value.
    #[error("Cgroup {path} stuck: wrote {expected}, still {observed} after {waited:?}")]
    CgroupHung {
        path: PathBuf,
        expected: String,
        observed: String,
        waited: Duration,
    },

    #[error("Fork parent has {spare_mb} MB spare, needs {needed_mb} MB")]
    InsufficientParentMem { spare_mb: u64, needed_mb: u64 },

    #[error("Leaf sandbox requires a non-empty code directory")]
    InvalidLeaf,

    #[error("Mount failed: {0}")]
    MountFailed(String),

    #[error("Unmount failed: {0}")]
    UnmountFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Pool closed: {0}")]
    PoolClosed(String),
}

impl SockError {
    /// True for the failures after which a leaf may still be started from a
    /// fresh process instead of a fork.
    pub fn is_fork_fallback(&self) -> bool {
        matches!(
            self,
            SockError::ForkFailed(_) | SockError::InsufficientParentMem { .. }
        )
    }
}

/// Result type alias for sockbox operations
pub type Result<T> = std::result::Result<T, SockError>;

impl From<nix::errno::Errno> for SockError {
    fn from(err: nix::errno::Errno) -> Self {
        SockError::Process(err.to_string())
    }
}
