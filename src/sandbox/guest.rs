//! Guest process launch and readiness handshake
//!
//! A fresh guest is the runtime server exec'd inside the sandbox root. The
//! host clears the environment and sends stdout/stderr to the scratch
//! directory. Between fork and exec the child joins the sandbox's cgroups and
//! chroots, so it is charged to the sandbox before it can run any guest code.
//! Readiness is the guest writing `ready` into the `server_pipe` FIFO.

use crate::config::types::{Result, SockError};
use crate::core::types::Runtime;
use log::{debug, info};
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

pub const READY_TIMEOUT: Duration = Duration::from_secs(20);
pub const SERVER_PIPE: &str = "server_pipe";
const READY_TOKEN: &[u8] = b"ready";
const POLL_SLICE: Duration = Duration::from_millis(10);

const PYTHON: &str = "/usr/local/bin/python3";
const PYTHON_SERVER: &str = "/runtimes/python/server.py";
const NATIVE_SERVER: &str = "/runtimes/native/server";

/// Program, arguments and environment for a runtime's server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl GuestCommand {
    pub fn for_runtime(runtime: Runtime, enable_seccomp: bool) -> Self {
        let seccomp = enable_seccomp.to_string();
        match runtime {
            Runtime::Python => Self {
                program: PYTHON.to_string(),
                args: vec![
                    "-u".to_string(),
                    PYTHON_SERVER.to_string(),
                    "/host/bootstrap.py".to_string(),
                    "1".to_string(),
                    seccomp,
                ],
                env: Vec::new(),
            },
            Runtime::Native => Self {
                program: NATIVE_SERVER.to_string(),
                args: vec!["1".to_string(), seccomp],
                env: vec![("RUST_BACKTRACE".to_string(), "full".to_string())],
            },
        }
    }
}

/// Create the readiness FIFO with mode 0777 regardless of umask.
pub fn create_server_pipe(scratch_dir: &Path) -> Result<PathBuf> {
    let pipe = scratch_dir.join(SERVER_PIPE);
    nix::unistd::mkfifo(&pipe, nix::sys::stat::Mode::from_bits_truncate(0o777)).map_err(|e| {
        SockError::Process(format!("mkfifo {}: {}", pipe.display(), e))
    })?;
    fs::set_permissions(&pipe, fs::Permissions::from_mode(0o777))?;
    Ok(pipe)
}

fn cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SockError::Config(format!("path contains NUL: {}", path.display())))
}

/// Start the guest server for a sandbox.
///
/// `cgroup_procs` are open `cgroup.procs` files of the sandbox's cgroup, one
/// per controller; the child writes itself into each before exec.
pub fn spawn_guest(
    command: &GuestCommand,
    root_dir: &Path,
    scratch_dir: &Path,
    cgroup_procs: &[File],
) -> Result<Child> {
    let stdout = File::create(scratch_dir.join("stdout"))?;
    let stderr = File::create(scratch_dir.join("stderr"))?;
    let root = cstring(root_dir)?;
    let slash = cstring(Path::new("/"))?;
    let procs_fds: Vec<RawFd> = cgroup_procs.iter().map(AsRawFd::as_raw_fd).collect();

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .env_clear()
        .envs(command.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);

    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            for fd in &procs_fds {
                if libc::write(*fd, b"0".as_ptr() as *const libc::c_void, 1) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if libc::chroot(root.as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::chdir(slash.as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| {
        SockError::Process(format!(
            "Failed to start {} in {}: {}",
            command.program,
            root_dir.display(),
            e
        ))
    })?;
    info!("guest {} started in {}", child.id(), root_dir.display());
    Ok(child)
}

/// Block until the guest writes `ready` into `pipe`.
///
/// The launcher may exit cleanly once it has forked the server; a non-zero
/// exit before readiness is an error.
pub fn wait_ready(pipe: &Path, timeout: Duration, mut child: Option<&mut Child>) -> Result<()> {
    let mut reader = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(pipe)?;
    let start = Instant::now();
    let mut seen = Vec::new();
    let mut chunk = [0u8; 64];

    loop {
        if seen.windows(READY_TOKEN.len()).any(|w| w == READY_TOKEN) {
            debug!("{}: ready after {:?}", pipe.display(), start.elapsed());
            return Ok(());
        }

        let waited = start.elapsed();
        if waited >= timeout {
            return Err(SockError::GuestInitTimeout {
                pipe: pipe.to_path_buf(),
                waited,
            });
        }

        if let Some(child) = child.as_deref_mut() {
            if let Some(status) = child.try_wait()? {
                if !status.success() {
                    return Err(SockError::Process(format!(
                        "guest {} exited before ready: {}",
                        child.id(),
                        status
                    )));
                }
            }
        }

        let slice = POLL_SLICE.min(timeout - waited);
        let mut pfd = libc::pollfd {
            fd: reader.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd that outlives the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, slice.as_millis() as libc::c_int) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }

        if pfd.revents & libc::POLLIN != 0 {
            match reader.read(&mut chunk) {
                Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                Ok(n) => seen.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        } else if pfd.revents & libc::POLLHUP != 0 {
            // Writer came and went without a token; wait for another.
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread;

    #[test]
    fn test_runtime_commands() {
        let py = GuestCommand::for_runtime(Runtime::Python, false);
        assert_eq!(py.program, PYTHON);
        assert_eq!(
            py.args,
            vec!["-u", PYTHON_SERVER, "/host/bootstrap.py", "1", "false"]
        );
        assert!(py.env.is_empty());

        let native = GuestCommand::for_runtime(Runtime::Native, true);
        assert_eq!(native.program, NATIVE_SERVER);
        assert_eq!(native.args, vec!["1", "true"]);
        assert_eq!(native.env, vec![("RUST_BACKTRACE".to_string(), "full".to_string())]);
    }

    #[test]
    fn test_server_pipe_mode() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = create_server_pipe(dir.path()).unwrap();
        let meta = fs::metadata(&pipe).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o777);
        use std::os::unix::fs::FileTypeExt;
        assert!(meta.file_type().is_fifo());
    }

    #[test]
    fn test_ready_token_across_writes() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = create_server_pipe(dir.path()).unwrap();
        let writer_path = pipe.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            let mut w = OpenOptions::new().write(true).open(&writer_path).unwrap();
            w.write_all(b"rea").unwrap();
            w.flush().unwrap();
            thread::sleep(Duration::from_millis(20));
            w.write_all(b"dy").unwrap();
        });

        wait_ready(&pipe, Duration::from_secs(5), None).unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn test_times_out_without_writer() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = create_server_pipe(dir.path()).unwrap();
        let err = wait_ready(&pipe, Duration::from_millis(50), None).unwrap_err();
        match err {
            SockError::GuestInitTimeout { pipe: p, waited } => {
                assert_eq!(p, pipe);
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failed_launcher_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = create_server_pipe(dir.path()).unwrap();
        let mut child = Command::new("false").spawn().unwrap();
        let err = wait_ready(&pipe, Duration::from_secs(5), Some(&mut child)).unwrap_err();
        assert!(matches!(err, SockError::Process(_)));
    }
}
