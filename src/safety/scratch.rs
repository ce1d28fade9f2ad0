/// Per-sandbox scratch directories under `W/<pool>-scratch/`
use crate::config::types::{Result, SockError};
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Owner of one pool's scratch area. Each sandbox gets `<base>/<id>`, which
/// holds its control socket, readiness pipe, logs and `/tmp`.
#[derive(Debug)]
pub struct ScratchDirs {
    base: PathBuf,
}

impl ScratchDirs {
    pub fn new(base: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base).map_err(|e| {
            SockError::Io(io::Error::new(
                e.kind(),
                format!("Failed to create scratch root {}: {}", base.display(), e),
            ))
        })?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Create a fresh scratch directory. Leftovers from an earlier worker
    /// run under the same name are wiped first.
    pub fn make(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(SockError::Config(format!("Invalid scratch name {:?}", name)));
        }
        let dir = self.base.join(name);
        if dir.exists() {
            warn!("scratch {}: removing stale contents", dir.display());
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir(&dir).map_err(|e| {
            SockError::Io(io::Error::new(
                e.kind(),
                format!("Failed to create scratch dir {}: {}", dir.display(), e),
            ))
        })?;
        debug!("scratch {}: created", dir.display());
        Ok(dir)
    }

    /// Remove the whole scratch area. Only safe once no sandbox root still
    /// binds a scratch directory.
    pub fn cleanup(&self) -> Result<()> {
        match fs::remove_dir_all(&self.base) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_creates_named_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = ScratchDirs::new(tmp.path().join("sock-scratch")).unwrap();
        let a = scratch.make("1").unwrap();
        let b = scratch.make("2").unwrap();
        assert!(a.is_dir());
        assert!(b.is_dir());
        assert_eq!(a, tmp.path().join("sock-scratch").join("1"));
    }

    #[test]
    fn test_make_wipes_stale_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = ScratchDirs::new(tmp.path().join("s")).unwrap();
        let dir = scratch.make("7").unwrap();
        fs::write(dir.join("stdout"), "old run").unwrap();
        let dir = scratch.make("7").unwrap();
        assert!(!dir.join("stdout").exists());
    }

    #[test]
    fn test_rejects_path_like_names() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = ScratchDirs::new(tmp.path().join("s")).unwrap();
        assert!(scratch.make("../escape").is_err());
        assert!(scratch.make("").is_err());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = ScratchDirs::new(tmp.path().join("s")).unwrap();
        scratch.make("1").unwrap();
        scratch.cleanup().unwrap();
        assert!(!scratch.base().exists());
        scratch.cleanup().unwrap();
    }
}
