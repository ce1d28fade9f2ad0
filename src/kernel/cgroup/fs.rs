//! Access to the cgroup filesystem.
//!
//! Every cgroup read, write, directory operation and task signal goes through
//! [`CgroupFs`], so cgroup logic runs unchanged against the host hierarchy or
//! against an in-memory model in tests.

use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

pub trait CgroupFs: Send + Sync + Debug {
    fn create_dir(&self, path: &Path) -> io::Result<()>;
    fn remove_dir(&self, path: &Path) -> io::Result<()>;
    fn write(&self, path: &Path, contents: &str) -> io::Result<()>;
    fn read(&self, path: &Path) -> io::Result<String>;
    fn exists(&self, path: &Path) -> bool;

    /// Open a control file for writing, to hand its descriptor to a process.
    fn open_write(&self, path: &Path) -> io::Result<File>;

    /// Deliver SIGKILL to a task. A task that already exited is not an error.
    fn kill(&self, pid: i32) -> io::Result<()>;
}

/// The real hierarchy mounted under `/sys/fs/cgroup`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCgroupFs;

impl CgroupFs for HostCgroupFs {
    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        // One write(2), no O_CREAT or O_TRUNC.
        use std::io::Write;
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.write_all(contents.as_bytes())
    }

    fn read(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn open_write(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new().write(true).open(path)
    }

    fn kill(&self, pid: i32) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}
