//! SOCK sandbox: a chroot over a bind-mount stack, confined by a cgroup
//!
//! A sandbox's guest is either started fresh (see [`crate::sandbox::guest`])
//! or forked from a Zygote over the Zygote's control socket. Forked children
//! share pages with their Zygote, so the Zygote's cgroup, memory charge and
//! root stay in place until every descendant is gone. That bookkeeping lives
//! in [`Registry`]; a sandbox hands its [`SockResources`] over on destroy and
//! the registry tears them down once the last reference drops.

use crate::config::types::{Result, SockError};
use crate::config::worker::Features;
use crate::core::memory::MemoryPool;
use crate::core::types::{Runtime, SandboxId, SandboxMeta, SandboxState};
use crate::kernel::cgroup::Cgroup;
use crate::kernel::fdpass;
use crate::kernel::mount::RootFs;
use crate::sandbox::bootstrap::bootstrap_code;
use crate::sandbox::guest::{self, GuestCommand, READY_TIMEOUT};
use crate::sandbox::registry::{Registry, Teardown};
use crate::sandbox::{ForkTarget, GuestClient, Sandbox};
use log::{debug, error, info, warn};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Arc;
use std::time::Instant;

/// Settings shared by every sandbox of one pool.
pub struct SockContext {
    pub pool: String,
    pub base_image: PathBuf,
    pub features: Features,
    pub fork_headroom_mb: u64,
    pub registry: Arc<Registry<SockResources>>,
}

/// Host-side state released when a sandbox and all its descendants are gone.
pub struct SockResources {
    cgroup: Cgroup,
    rootfs: Option<RootFs>,
    root_dir: PathBuf,
    mem: MemoryPool,
    guest: Option<Child>,
}

impl SockResources {
    /// `cgroup` already carries the sandbox's memory cap, which was charged
    /// to `mem`.
    pub fn new(cgroup: Cgroup, root_dir: PathBuf, mem: MemoryPool) -> Self {
        Self {
            cgroup,
            rootfs: None,
            root_dir,
            mem,
            guest: None,
        }
    }
}

impl Teardown for SockResources {
    fn teardown(self, id: SandboxId) {
        let SockResources {
            cgroup,
            rootfs,
            root_dir,
            mem,
            guest,
        } = self;
        let start = Instant::now();

        if let Err(e) = cgroup.kill_all_procs() {
            error!("sandbox {}: {}", id, e);
        }
        if let Some(mut child) = guest {
            let _ = child.kill();
            let _ = child.wait();
        }
        let charged = cgroup.mem_limit_mb();
        cgroup.release();
        if let Err(e) = mem.release(charged) {
            error!("sandbox {}: could not return {} MB: {}", id, charged, e);
        }

        let removed = match rootfs {
            Some(rootfs) => rootfs.teardown(),
            None => match fs::remove_dir(&root_dir) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
        };
        if let Err(e) = removed {
            warn!("sandbox {}: root {}: {}", id, root_dir.display(), e);
        }
        info!("sandbox {}: released in {:?}", id, start.elapsed());
    }
}

pub struct SockSandbox {
    id: SandboxId,
    meta: SandboxMeta,
    runtime: Runtime,
    is_leaf: bool,
    state: SandboxState,
    root_dir: PathBuf,
    scratch_dir: PathBuf,
    client: Arc<GuestClient>,
    ctx: Arc<SockContext>,
    resources: Option<SockResources>,
}

fn dead(id: SandboxId) -> SockError {
    SockError::SandboxDead(format!("sandbox {}", id))
}

impl SockSandbox {
    /// The id must already be registered with `ctx.registry`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SandboxId,
        meta: SandboxMeta,
        runtime: Runtime,
        is_leaf: bool,
        scratch_dir: PathBuf,
        client: Arc<GuestClient>,
        ctx: Arc<SockContext>,
        resources: SockResources,
    ) -> Self {
        Self {
            id,
            meta,
            runtime,
            is_leaf,
            state: SandboxState::Running,
            root_dir: resources.root_dir.clone(),
            scratch_dir,
            client,
            ctx,
            resources: Some(resources),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn fork_target(&self) -> Result<ForkTarget<'_>> {
        let res = self.resources.as_ref().ok_or_else(|| dead(self.id))?;
        Ok(ForkTarget {
            id: self.id,
            root_dir: &self.root_dir,
            cgroup: &res.cgroup,
        })
    }

    /// Bind the base image, code and scratch directories into the root.
    pub fn populate_root(&mut self, code_dir: Option<&Path>) -> Result<()> {
        let id = self.id;
        let res = self.resources.as_mut().ok_or_else(|| dead(id))?;
        let rootfs =
            RootFs::assemble(&self.ctx.base_image, &self.root_dir, code_dir, &self.scratch_dir)?;
        res.rootfs = Some(rootfs);
        Ok(())
    }

    /// Write `bootstrap.py` for the Python runtime; other runtimes need none.
    pub fn write_bootstrap(&self, parent_imports: &[String]) -> Result<()> {
        if self.runtime != Runtime::Python {
            return Ok(());
        }
        let code = bootstrap_code(&self.meta, parent_imports, self.is_leaf);
        fs::write(self.scratch_dir.join("bootstrap.py"), code)?;
        Ok(())
    }

    /// Start the guest as a new process and wait for it to report ready.
    pub fn fresh_proc(&mut self) -> Result<()> {
        let id = self.id;
        let res = self.resources.as_mut().ok_or_else(|| dead(id))?;
        let pipe = guest::create_server_pipe(&self.scratch_dir)?;
        let command = GuestCommand::for_runtime(self.runtime, self.ctx.features.enable_seccomp);

        let procs = res.cgroup.open_procs_all()?;
        let mut child = guest::spawn_guest(&command, &self.root_dir, &self.scratch_dir, &procs)?;
        drop(procs);

        let ready = guest::wait_ready(&pipe, READY_TIMEOUT, Some(&mut child));
        res.guest = Some(child);
        ready?;
        info!("sandbox {}: fresh {} guest ready", id, self.runtime_name());
        Ok(())
    }

    fn runtime_name(&self) -> &'static str {
        match self.runtime {
            Runtime::Python => "python",
            Runtime::Native => "native",
        }
    }
}

impl Sandbox for SockSandbox {
    fn id(&self) -> SandboxId {
        self.id
    }

    fn meta(&self) -> &SandboxMeta {
        &self.meta
    }

    fn runtime(&self) -> Runtime {
        self.runtime
    }

    fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    fn state(&self) -> SandboxState {
        self.state
    }

    fn mem_limit_mb(&self) -> u64 {
        self.resources
            .as_ref()
            .map(|r| r.cgroup.mem_limit_mb())
            .unwrap_or(0)
    }

    fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    fn client(&self) -> Arc<GuestClient> {
        self.client.clone()
    }

    fn pause(&mut self) -> Result<()> {
        let id = self.id;
        let res = self.resources.as_mut().ok_or_else(|| dead(id))?;
        res.cgroup.pause()?;

        if self.ctx.features.downsize_paused_mem {
            // A frozen guest cannot allocate, so usage is an upper bound
            // until unpause.
            let old = res.cgroup.mem_limit_mb();
            let new = res.cgroup.get_mem_usage_mb()? + 1;
            if new < old {
                res.cgroup.set_mem_limit_mb(new)?;
                res.mem.release(old - new)?;
                debug!("sandbox {}: downsized {} -> {} MB", id, old, new);
            }
        }

        self.client.close_idle();
        self.state = SandboxState::Paused;
        Ok(())
    }

    fn unpause(&mut self) -> Result<()> {
        let id = self.id;
        let full = self.meta.mem_limit_mb;
        let res = self.resources.as_mut().ok_or_else(|| dead(id))?;

        if self.ctx.features.downsize_paused_mem {
            let current = res.cgroup.mem_limit_mb();
            if current < full {
                res.mem.acquire(full - current)?;
                if let Err(e) = res.cgroup.set_mem_limit_mb(full) {
                    let _ = res.mem.release(full - current);
                    return Err(e);
                }
                debug!("sandbox {}: upsized {} -> {} MB", id, current, full);
            }
        }

        res.cgroup.unpause()?;
        self.state = SandboxState::Running;
        Ok(())
    }

    fn fork(&mut self, child: &ForkTarget<'_>) -> Result<()> {
        let id = self.id;
        match self.state {
            SandboxState::Running => {}
            SandboxState::Paused => {
                return Err(SockError::ForkFailed(format!("zygote {} is paused", id)))
            }
            SandboxState::Evicting | SandboxState::Dead => return Err(dead(id)),
        }
        let res = self.resources.as_ref().ok_or_else(|| dead(id))?;

        let limit = res.cgroup.mem_limit_mb();
        let spare = limit.saturating_sub(res.cgroup.get_mem_usage_mb()?);
        if spare < self.ctx.fork_headroom_mb {
            return Err(SockError::InsufficientParentMem {
                spare_mb: spare,
                needed_mb: self.ctx.fork_headroom_mb,
            });
        }

        self.ctx.registry.link(id, child.id)?;

        let start = Instant::now();
        let baseline = res.cgroup.pids()?;
        let root = File::open(child.root_dir)?;
        let procs = child.cgroup.open_procs("memory")?;

        let status = fdpass::send_fork_request(&self.scratch_dir.join("ol.sock"), &root, &procs, None)?;
        if status != 0 {
            return Err(SockError::ForkFailed(format!(
                "zygote {} answered fork of {} with status {}",
                id, child.id, status
            )));
        }

        let moved = res.cgroup.migrate_new_tasks(child.cgroup, &baseline)?;
        debug!(
            "sandbox {}: forked {} in {:?}, moved {} tasks",
            id,
            child.id,
            start.elapsed(),
            moved
        );
        Ok(())
    }

    fn destroy(&mut self, reason: &str) {
        let Some(res) = self.resources.take() else {
            return;
        };
        self.state = SandboxState::Evicting;
        debug!("sandbox {}: destroy ({})", self.id, reason);

        // Frozen, it can no longer fork children we would not know about.
        if res.cgroup.is_hung() {
            warn!("sandbox {}: freezer hung, destroying unfrozen", self.id);
        } else if let Err(e) = res.cgroup.pause() {
            warn!("sandbox {}: freeze before destroy: {}", self.id, e);
        }
        self.client.close_idle();

        if let Some(res) = self.ctx.registry.release(self.id, res) {
            error!("sandbox {}: not registered, releasing directly", self.id);
            res.teardown(self.id);
        }
        self.state = SandboxState::Dead;
    }

    fn debug_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "SOCK {} {} ({}, {})",
            if self.is_leaf { "LEAF" } else { "ZYGOTE" },
            self.id,
            self.ctx.pool,
            self.state
        );
        let _ = writeln!(out, "ROOT: {}", self.root_dir.display());
        let _ = writeln!(out, "SCRATCH: {}", self.scratch_dir.display());
        if !self.meta.imports.is_empty() {
            let _ = writeln!(out, "IMPORTS: {}", self.meta.imports.join(", "));
        }
        let children = self.ctx.registry.children(self.id);
        if !children.is_empty() {
            let ids: Vec<String> = children.iter().map(|c| c.to_string()).collect();
            let _ = writeln!(out, "CHILDREN: {}", ids.join(", "));
        }
        match &self.resources {
            Some(res) => out.push_str(&res.cgroup.debug_string()),
            None => out.push_str("CGROUP: released\n"),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::worker::Limits;
    use crate::kernel::cgroup::{CgroupFs, CgroupLayout};
    use crate::sandbox::{Listeners, SafeSandbox};
    use crate::testing::FakeCgroupFs;
    use std::time::Duration;

    struct Fixture {
        fake: Arc<FakeCgroupFs>,
        layout: Arc<CgroupLayout>,
        mem: MemoryPool,
        ctx: Arc<SockContext>,
        dir: tempfile::TempDir,
    }

    fn fixture(downsize: bool) -> Fixture {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let layout = Arc::new(CgroupLayout {
            root: "/cg".into(),
            group: "w-sock".to_string(),
            controllers: vec!["freezer".into(), "memory".into(), "pids".into()],
            procs_max: 10,
            swappiness: 0,
            freeze_timeout: Duration::from_millis(100),
            fs: fake.clone(),
        });
        for c in &layout.controllers {
            fake.create_dir(&layout.group_dir(c)).unwrap();
        }
        let features = Features {
            downsize_paused_mem: downsize,
            ..Features::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(SockContext {
            pool: "sock".to_string(),
            base_image: dir.path().join("lambda"),
            features,
            fork_headroom_mb: Limits::default().fork_headroom_mb,
            registry: Arc::new(Registry::new()),
        });
        Fixture {
            fake,
            layout,
            mem: MemoryPool::new("sock", 200).unwrap(),
            ctx,
            dir,
        }
    }

    fn sandbox(fx: &Fixture, n: u64) -> SockSandbox {
        let id = SandboxId(n);
        fx.mem.acquire(50).unwrap();
        let mut cg = Cgroup::new(fx.layout.clone(), &format!("cg-{}", n), None).unwrap();
        cg.set_mem_limit_mb(50).unwrap();
        let root = fx.dir.path().join("sock").join(n.to_string());
        fs::create_dir_all(&root).unwrap();
        let scratch = fx.dir.path().join("scratch").join(n.to_string());
        fs::create_dir_all(&scratch).unwrap();
        fx.ctx.registry.register(id);
        let meta = SandboxMeta {
            mem_limit_mb: 50,
            ..Default::default()
        };
        let res = SockResources::new(cg, root, fx.mem.clone());
        let client = Arc::new(GuestClient::new(scratch.join("ol.sock")).unwrap());
        SockSandbox::new(id, meta, Runtime::Python, false, scratch, client, fx.ctx.clone(), res)
    }

    #[test]
    fn test_pause_downsizes_and_unpause_restores() {
        let fx = fixture(true);
        let mut sb = sandbox(&fx, 1);
        fx.fake
            .set_usage_bytes(Path::new("/cg/memory/w-sock/cg-1"), 5 * 1024 * 1024);

        sb.pause().unwrap();
        assert_eq!(sb.state(), SandboxState::Paused);
        assert_eq!(sb.mem_limit_mb(), 6);
        assert_eq!(fx.mem.available_mb().unwrap(), 194);
        assert_eq!(
            fx.fake.file(Path::new("/cg/freezer/w-sock/cg-1/freezer.state")).as_deref(),
            Some("FROZEN")
        );

        sb.unpause().unwrap();
        assert_eq!(sb.mem_limit_mb(), 50);
        assert_eq!(fx.mem.available_mb().unwrap(), 150);
        assert_eq!(sb.state(), SandboxState::Running);
    }

    #[test]
    fn test_pause_without_downsize_keeps_limit() {
        let fx = fixture(false);
        let mut sb = sandbox(&fx, 1);
        sb.pause().unwrap();
        assert_eq!(sb.mem_limit_mb(), 50);
        assert_eq!(fx.mem.available_mb().unwrap(), 150);
    }

    #[test]
    fn test_hung_freezer_fails_pause() {
        let fx = fixture(true);
        let mut sb = sandbox(&fx, 1);
        fx.fake.hang_freezer(Path::new("/cg/freezer/w-sock/cg-1"));
        assert!(matches!(sb.pause(), Err(SockError::CgroupHung { .. })));
    }

    #[test]
    fn test_hung_pause_destroys_within_one_freeze_timeout() {
        let fx = fixture(true);
        let sb = sandbox(&fx, 1);
        fx.fake
            .write(Path::new("/cg/memory/w-sock/cg-1/tasks"), "4242")
            .unwrap();
        fx.fake.hang_freezer(Path::new("/cg/freezer/w-sock/cg-1"));
        let safe = SafeSandbox::new(Box::new(sb), Listeners::new());

        let start = Instant::now();
        let err = safe.pause().unwrap_err();
        let took = start.elapsed();

        assert!(matches!(err, SockError::CgroupHung { .. }));
        assert!(took >= Duration::from_millis(100));
        assert!(took < Duration::from_millis(180), "pause took {:?}", took);
        assert!(safe.is_dead());
        assert_eq!(fx.mem.available_mb().unwrap(), 200);
        assert!(fx.fake.dirs_under(Path::new("/cg/memory/w-sock/cg-1")).is_empty());
    }

    #[test]
    fn test_fork_rejected_without_headroom() {
        let fx = fixture(true);
        let mut zygote = sandbox(&fx, 1);
        let child = sandbox(&fx, 2);
        fx.fake
            .set_usage_bytes(Path::new("/cg/memory/w-sock/cg-1"), 48 * 1024 * 1024);

        let err = zygote.fork(&child.fork_target().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            SockError::InsufficientParentMem {
                spare_mb: 2,
                needed_mb: 3
            }
        ));
        assert_eq!(fx.ctx.registry.ref_count(SandboxId(1)), Some(1));
    }

    #[test]
    fn test_fork_without_zygote_socket_fails() {
        let fx = fixture(true);
        let mut zygote = sandbox(&fx, 1);
        let child = sandbox(&fx, 2);
        let err = zygote.fork(&child.fork_target().unwrap()).unwrap_err();
        assert!(matches!(err, SockError::ForkFailed(_)));
    }

    #[test]
    fn test_paused_zygote_refuses_fork() {
        let fx = fixture(false);
        let mut zygote = sandbox(&fx, 1);
        let child = sandbox(&fx, 2);
        zygote.pause().unwrap();
        let err = zygote.fork(&child.fork_target().unwrap()).unwrap_err();
        assert!(matches!(err, SockError::ForkFailed(_)));
    }

    #[test]
    fn test_destroy_releases_everything_once() {
        let fx = fixture(true);
        let mut sb = sandbox(&fx, 1);
        let root = sb.root_dir().to_path_buf();
        fx.fake
            .write(Path::new("/cg/memory/w-sock/cg-1/tasks"), "4242")
            .unwrap();

        sb.destroy("test");
        sb.destroy("again");
        assert_eq!(sb.state(), SandboxState::Dead);
        assert_eq!(fx.mem.available_mb().unwrap(), 200);
        assert!(!root.exists());
        assert!(fx.fake.dirs_under(Path::new("/cg/memory/w-sock/cg-1")).is_empty());
        assert!(matches!(sb.pause(), Err(SockError::SandboxDead(_))));
        assert!(sb.debug_string().contains("released"));
    }

    #[test]
    fn test_zygote_outlives_children() {
        let fx = fixture(true);
        let mut zygote = sandbox(&fx, 1);
        let mut child = sandbox(&fx, 2);
        fx.ctx.registry.link(SandboxId(1), SandboxId(2)).unwrap();
        assert!(zygote.debug_string().contains("CHILDREN: 2"));

        zygote.destroy("evicted");
        assert_eq!(fx.mem.available_mb().unwrap(), 100);
        assert!(!fx.fake.dirs_under(Path::new("/cg/memory/w-sock/cg-1")).is_empty());

        child.destroy("done");
        assert_eq!(fx.mem.available_mb().unwrap(), 200);
        assert!(fx.fake.dirs_under(Path::new("/cg/memory/w-sock/cg-1")).is_empty());
    }

    #[test]
    fn test_bootstrap_written_for_python_only() {
        let fx = fixture(true);
        let sb = sandbox(&fx, 1);
        sb.write_bootstrap(&[]).unwrap();
        let code = fs::read_to_string(sb.scratch_dir().join("bootstrap.py")).unwrap();
        assert!(code.contains("fork_server('/host/ol.sock')"));
    }
}
