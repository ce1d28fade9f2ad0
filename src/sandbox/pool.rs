//! Pool of SOCK sandboxes sharing one memory budget and cgroup group.

use crate::config::types::{Result, SockError};
use crate::config::worker::WorkerConfig;
use crate::core::memory::MemoryPool;
use crate::core::types::{IdGen, SandboxId};
use crate::kernel::cgroup::{CgroupFs, CgroupLayout, CgroupPool, FREEZE_TIMEOUT};
use crate::kernel::mount::rootfs::{detach, make_private_mountpoint};
use crate::safety::scratch::ScratchDirs;
use crate::sandbox::events::{EventKind, Listener, Listeners, SandboxEvent};
use crate::sandbox::registry::Registry;
use crate::sandbox::sock::{SockContext, SockResources, SockSandbox};
use crate::sandbox::{GuestClient, SafeSandbox, Sandbox, SandboxPool, SandboxSpec};
use log::{info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Longest `cleanup` waits for outstanding memory before giving up on it.
const DRAIN_WAIT: Duration = Duration::from_secs(30);

type LiveMap = Arc<Mutex<HashMap<SandboxId, SafeSandbox>>>;

pub struct SockPool {
    name: String,
    config: Arc<WorkerConfig>,
    mem: MemoryPool,
    cgroups: CgroupPool,
    ctx: Arc<SockContext>,
    ids: Arc<IdGen>,
    root_dir: PathBuf,
    scratch: ScratchDirs,
    listeners: Listeners,
    live: LiveMap,
    closed: AtomicBool,
}

impl SockPool {
    /// Set up `W/<name>` as a private mount point, `W/<name>-scratch`, the
    /// cgroup group and a `mem_mb` memory budget.
    ///
    /// Pools whose sandboxes fork from one another must share `registry`.
    pub fn new(
        config: Arc<WorkerConfig>,
        name: &str,
        mem_mb: u64,
        cgroup_fs: Arc<dyn CgroupFs>,
        registry: Arc<Registry<SockResources>>,
        ids: Arc<IdGen>,
    ) -> Result<Self> {
        let root_dir = config.pool_root(name);
        fs::create_dir_all(&root_dir).map_err(|e| {
            SockError::MountFailed(format!("create {}: {}", root_dir.display(), e))
        })?;
        make_private_mountpoint(&root_dir)?;

        let scratch = ScratchDirs::new(config.scratch_root(name))?;
        let layout = CgroupLayout {
            root: config.cgroup_root.clone(),
            group: config.cgroup_group(name),
            controllers: config.cgroup_controllers.clone(),
            procs_max: config.limits.procs,
            swappiness: config.limits.swappiness,
            freeze_timeout: FREEZE_TIMEOUT,
            fs: cgroup_fs,
        };
        let cgroups = CgroupPool::new(layout, config.features.reuse_cgroups)?;
        let mem = MemoryPool::new(name, mem_mb)?;

        let ctx = Arc::new(SockContext {
            pool: name.to_string(),
            base_image: config.base_image(),
            features: config.features.clone(),
            fork_headroom_mb: config.limits.fork_headroom_mb,
            registry,
        });

        let listeners = Listeners::new();
        let live: LiveMap = Arc::default();
        let tracked = live.clone();
        listeners.add(Arc::new(move |ev: &SandboxEvent| {
            if ev.kind == EventKind::Destroy {
                tracked
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&ev.id());
            }
        }));

        info!("sock pool {}: root {}, {} MB", name, root_dir.display(), mem_mb);
        Ok(Self {
            name: name.to_string(),
            config,
            mem,
            cgroups,
            ctx,
            ids,
            root_dir,
            scratch,
            listeners,
            live,
            closed: AtomicBool::new(false),
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn live_snapshot(&self) -> Vec<SafeSandbox> {
        let mut all: Vec<SafeSandbox> = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|sb| sb.id());
        all
    }

    /// Root assembly, bootstrap and guest start for a registered sandbox.
    fn start(
        &self,
        sandbox: &mut SockSandbox,
        parent: Option<&SafeSandbox>,
        code_dir: Option<&Path>,
    ) -> Result<()> {
        sandbox.populate_root(code_dir)?;
        let parent_imports = parent.map(|p| p.meta().imports).unwrap_or_default();
        sandbox.write_bootstrap(&parent_imports)?;

        match parent {
            Some(parent) => {
                let target = sandbox.fork_target()?;
                parent.fork(&target).map_err(|e| match e {
                    e @ (SockError::InsufficientParentMem { .. } | SockError::ForkFailed(_)) => e,
                    other => SockError::ForkFailed(format!("parent {}: {}", parent.id(), other)),
                })
            }
            None => sandbox.fresh_proc(),
        }
    }
}

impl SandboxPool for SockPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, parent: Option<&SafeSandbox>, spec: SandboxSpec) -> Result<SafeSandbox> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SockError::PoolClosed(format!("sock pool {}", self.name)));
        }
        if spec.is_leaf && !spec.has_code() {
            return Err(SockError::InvalidLeaf);
        }

        let id = self.ids.next_id();
        let mut meta = spec.meta;
        meta.fill_defaults(&self.config.limits);

        let owns_scratch = spec.scratch_dir.is_none();
        let scratch_dir = match spec.scratch_dir {
            Some(dir) => {
                fs::create_dir_all(&dir)?;
                dir
            }
            None => self.scratch.make(&id.to_string())?,
        };
        let discard_scratch = |e: SockError| {
            if owns_scratch {
                if let Err(rm) = fs::remove_dir_all(&scratch_dir) {
                    warn!("sock pool {}: remove {}: {}", self.name, scratch_dir.display(), rm);
                }
            }
            e
        };

        let client = match GuestClient::new(scratch_dir.join("ol.sock")) {
            Ok(client) => Arc::new(client),
            Err(e) => return Err(discard_scratch(e)),
        };
        if let Err(e) = self.mem.acquire(meta.mem_limit_mb) {
            return Err(discard_scratch(e));
        }
        let cgroup = match self.cgroups.get(meta.mem_limit_mb, meta.cpu_percent) {
            Ok(cg) => cg,
            Err(e) => {
                let _ = self.mem.release(meta.mem_limit_mb);
                return Err(discard_scratch(e));
            }
        };

        // From here on, destroy() unwinds everything acquired above.
        self.ctx.registry.register(id);
        let resources = SockResources::new(cgroup, self.root_dir.join(id.to_string()), self.mem.clone());
        let mut sandbox = SockSandbox::new(
            id,
            meta,
            spec.runtime,
            spec.is_leaf,
            scratch_dir,
            client,
            self.ctx.clone(),
            resources,
        );

        if let Err(e) = self.start(&mut sandbox, parent, spec.code_dir.as_deref()) {
            warn!("sock pool {}: sandbox {} failed to start: {}", self.name, id, e);
            sandbox.destroy(&format!("create failed: {}", e));
            return Err(e);
        }

        let safe = SafeSandbox::new(Box::new(sandbox), self.listeners.clone());
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, safe.clone());
        safe.announce();
        info!(
            "sock pool {}: created sandbox {}{}",
            self.name,
            id,
            parent.map(|p| format!(" from {}", p.id())).unwrap_or_default()
        );
        Ok(safe)
    }

    fn cleanup(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for sb in self.live_snapshot() {
            sb.destroy_with_reason("pool cleanup");
        }

        let total = self.mem.total_mb() as i64;
        match self.mem.submit(-total).map(|rx| rx.recv_timeout(DRAIN_WAIT)) {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => warn!(
                "sock pool {}: memory still charged after {:?}, cleaning up anyway",
                self.name, DRAIN_WAIT
            ),
            Err(e) => warn!("sock pool {}: {}", self.name, e),
        }

        self.cgroups.shutdown();

        if let Err(e) = detach(&self.root_dir) {
            warn!("sock pool {}: {}", self.name, e);
        }
        if let Err(e) = fs::remove_dir_all(&self.root_dir) {
            warn!("sock pool {}: remove {}: {}", self.name, self.root_dir.display(), e);
        }
        if let Err(e) = self.scratch.cleanup() {
            warn!("sock pool {}: scratch cleanup: {}", self.name, e);
        }
        info!("sock pool {}: cleaned up", self.name);
    }

    fn add_listener(&self, listener: Listener) {
        self.listeners.add(listener);
    }

    fn memory(&self) -> &MemoryPool {
        &self.mem
    }

    fn debug_string(&self) -> String {
        self.live_snapshot()
            .iter()
            .map(|sb| format!("{}--------\n", sb.debug_string()))
            .collect()
    }
}
