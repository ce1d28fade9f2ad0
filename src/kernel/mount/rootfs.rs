/// Sandbox root filesystem assembly via a private bind-mount stack
use crate::config::types::{Result, SockError};
use crate::kernel::mount::mountinfo;
use log::{debug, warn};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// An assembled chroot root:
///
/// ```text
/// root_dir/          <- base image, read-only, private
/// root_dir/handler   <- code_dir, read-only (leaves only)
/// root_dir/tmp       <- scratch_dir/tmp, read-write
/// root_dir/host      <- scratch_dir, read-write
/// ```
#[derive(Debug)]
pub struct RootFs {
    root_dir: PathBuf,
    mounted: bool,
}

fn bind(source: &Path, target: &Path, extra: MsFlags) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | extra,
        None::<&str>,
    )
    .map_err(|e| {
        SockError::MountFailed(format!(
            "bind {} -> {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })
}

fn remount(target: &Path, flags: MsFlags) -> Result<()> {
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>).map_err(|e| {
        SockError::MountFailed(format!("remount {} ({:?}): {}", target.display(), flags, e))
    })
}

/// Bind `dir` onto itself and mark it private so mounts created beneath it
/// never propagate back to the host namespace.
pub fn make_private_mountpoint(dir: &Path) -> Result<()> {
    bind(dir, dir, MsFlags::MS_REC)?;
    remount(dir, MsFlags::MS_PRIVATE | MsFlags::MS_REC)
}

/// Lazily detach the mount at `dir` along with everything stacked under it.
/// A directory that is not a mount point is left as is.
pub fn detach(dir: &Path) -> Result<()> {
    match umount2(dir, MntFlags::MNT_DETACH) {
        Ok(()) | Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(SockError::UnmountFailed(format!("{}: {}", dir.display(), e))),
    }
}

impl RootFs {
    /// Build the stack at `root_dir` (created if missing). On any failure the
    /// partial stack is detached and `root_dir` removed before returning.
    pub fn assemble(
        base_image: &Path,
        root_dir: &Path,
        code_dir: Option<&Path>,
        scratch_dir: &Path,
    ) -> Result<Self> {
        fs::create_dir_all(root_dir).map_err(|e| {
            SockError::MountFailed(format!("create {}: {}", root_dir.display(), e))
        })?;

        let mut rootfs = RootFs {
            root_dir: root_dir.to_path_buf(),
            mounted: false,
        };

        if let Err(e) = rootfs.stack(base_image, code_dir, scratch_dir) {
            if let Err(cleanup) = rootfs.teardown_in_place() {
                warn!(
                    "root {}: cleanup after failed assembly: {}",
                    root_dir.display(),
                    cleanup
                );
            }
            return Err(e);
        }

        debug!("root {}: assembled", root_dir.display());
        Ok(rootfs)
    }

    fn stack(&mut self, base_image: &Path, code_dir: Option<&Path>, scratch_dir: &Path) -> Result<()> {
        let root = self.root_dir.clone();

        bind(base_image, &root, MsFlags::empty())?;
        self.mounted = true;
        remount(
            &root,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        )?;
        remount(&root, MsFlags::MS_PRIVATE)?;

        if let Some(code) = code_dir {
            let handler = root.join("handler");
            bind(code, &handler, MsFlags::empty())?;
            remount(
                &handler,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            )?;
        }

        let scratch_tmp = scratch_dir.join("tmp");
        fs::create_dir_all(&scratch_tmp).map_err(|e| {
            SockError::MountFailed(format!("create {}: {}", scratch_tmp.display(), e))
        })?;
        bind(&scratch_tmp, &root.join("tmp"), MsFlags::empty())?;
        bind(scratch_dir, &root.join("host"), MsFlags::empty())?;
        Ok(())
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn teardown_in_place(&mut self) -> Result<()> {
        if self.mounted {
            detach(&self.root_dir)?;
            self.mounted = false;
        }

        let leftover = mountinfo::mounts_under(&self.root_dir)?;
        if !leftover.is_empty() {
            let points: Vec<_> = leftover.iter().map(|m| m.mount_point.clone()).collect();
            return Err(SockError::UnmountFailed(format!(
                "{} still has mounts {:?}",
                self.root_dir.display(),
                points
            )));
        }

        match fs::remove_dir(&self.root_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SockError::UnmountFailed(format!(
                "remove {}: {}",
                self.root_dir.display(),
                e
            ))),
        }
    }

    /// Detach the whole stack, confirm nothing is still mounted beneath the
    /// root, then remove the directory.
    pub fn teardown(mut self) -> Result<()> {
        self.teardown_in_place()?;
        debug!("root {}: removed", self.root_dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_root() -> bool {
        nix::unistd::geteuid().is_root()
    }

    #[test]
    fn test_failed_assembly_removes_root_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("sock").join("1");
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();

        let err = RootFs::assemble(&dir.path().join("no-such-base"), &root, None, &scratch)
            .unwrap_err();
        assert!(matches!(err, SockError::MountFailed(_)));
        assert!(!root.exists());
    }

    #[test]
    fn test_detach_of_plain_directory_is_ok() {
        if !is_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        detach(dir.path()).unwrap();
    }

    #[test]
    fn test_assemble_and_teardown_leave_no_mounts() {
        if !is_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("lambda");
        for sub in ["handler", "tmp", "host"] {
            std::fs::create_dir_all(base.join(sub)).unwrap();
        }
        let code = dir.path().join("code");
        std::fs::create_dir_all(&code).unwrap();
        std::fs::write(code.join("f.py"), "def f(event):\n    return {}\n").unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        let root = dir.path().join("sock").join("1");

        let rootfs = RootFs::assemble(&base, &root, Some(&code), &scratch).unwrap();
        assert!(root.join("handler").join("f.py").exists());
        assert!(root.join("host").join("tmp").exists());
        assert!(std::fs::write(root.join("handler").join("x"), "").is_err());
        assert!(!mountinfo::mounts_under(&root).unwrap().is_empty());

        rootfs.teardown().unwrap();
        assert!(mountinfo::mounts_under(&root).unwrap().is_empty());
        assert!(!root.exists());
    }
}
