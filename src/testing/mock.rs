/// Process-free sandboxes for exercising pools, caches and policies
///
/// A [`MockSandbox`] charges a real [`MemoryPool`], owns a cgroup on an
/// in-memory hierarchy and goes through the same reference-counted teardown
/// as a real sandbox, but never mounts or spawns anything. Failures are
/// injected through its [`MockControl`].
use crate::config::types::{Result, SockError};
use crate::config::worker::Limits;
use crate::core::memory::MemoryPool;
use crate::core::types::{IdGen, Runtime, SandboxId, SandboxMeta, SandboxState};
use crate::kernel::cgroup::{Cgroup, CgroupFs, CgroupLayout};
use crate::sandbox::events::{EventKind, Listener, Listeners, SandboxEvent};
use crate::sandbox::registry::{Registry, Teardown};
use crate::sandbox::{ForkTarget, GuestClient, SafeSandbox, Sandbox, SandboxPool, SandboxSpec};
use crate::testing::fake_cgroupfs::FakeCgroupFs;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MockControl {
    fail_pause: AtomicBool,
    fail_unpause: AtomicBool,
    fail_fork: AtomicBool,
    usage_mb: AtomicU64,
    destroys: AtomicUsize,
    forks: AtomicUsize,
}

impl MockControl {
    pub fn fail_next_pause(&self) {
        self.fail_pause.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_unpause(&self) {
        self.fail_unpause.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_fork(&self) {
        self.fail_fork.store(true, Ordering::SeqCst);
    }

    pub fn set_usage_mb(&self, mb: u64) {
        self.usage_mb.store(mb, Ordering::SeqCst);
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn forks(&self) -> usize {
        self.forks.load(Ordering::SeqCst)
    }
}

pub struct MockResources {
    mem: MemoryPool,
    charged_mb: u64,
    cgroup: Cgroup,
    torn_down: Arc<Mutex<Vec<SandboxId>>>,
}

impl Teardown for MockResources {
    fn teardown(self, id: SandboxId) {
        let _ = self.mem.release(self.charged_mb);
        self.cgroup.release();
        self.torn_down
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id);
    }
}

pub struct MockSandbox {
    id: SandboxId,
    meta: SandboxMeta,
    runtime: Runtime,
    is_leaf: bool,
    state: SandboxState,
    scratch_dir: PathBuf,
    client: Arc<GuestClient>,
    downsize: bool,
    headroom_mb: u64,
    control: Arc<MockControl>,
    registry: Arc<Registry<MockResources>>,
    resources: Option<MockResources>,
}

impl MockSandbox {
    fn resources(&self) -> Result<&MockResources> {
        self.resources
            .as_ref()
            .ok_or_else(|| SockError::SandboxDead(format!("mock {}", self.id)))
    }

    pub fn fork_target(&self) -> Result<ForkTarget<'_>> {
        Ok(ForkTarget {
            id: self.id,
            root_dir: &self.scratch_dir,
            cgroup: &self.resources()?.cgroup,
        })
    }
}

impl Sandbox for MockSandbox {
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
        self.resources.as_ref().map(|r| r.charged_mb).unwrap_or(0)
    }

    fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    fn client(&self) -> Arc<GuestClient> {
        self.client.clone()
    }

    fn pause(&mut self) -> Result<()> {
        if self.control.fail_pause.swap(false, Ordering::SeqCst) {
            return Err(SockError::CgroupHung {
                path: self.scratch_dir.clone(),
                expected: "FROZEN".to_string(),
                observed: "FREEZING".to_string(),
                waited: Duration::from_secs(5),
            });
        }
        let usage = self.control.usage_mb.load(Ordering::SeqCst);
        let downsize = self.downsize;
        let res = self
            .resources
            .as_mut()
            .ok_or_else(|| SockError::SandboxDead(format!("mock {}", self.id)))?;
        if downsize {
            let target = usage + 1;
            if target < res.charged_mb {
                res.mem.release(res.charged_mb - target)?;
                res.charged_mb = target;
            }
        }
        self.client.close_idle();
        self.state = SandboxState::Paused;
        Ok(())
    }

    fn unpause(&mut self) -> Result<()> {
        if self.control.fail_unpause.swap(false, Ordering::SeqCst) {
            return Err(SockError::Cgroup("injected unpause failure".to_string()));
        }
        let full = self.meta.mem_limit_mb;
        let res = self
            .resources
            .as_mut()
            .ok_or_else(|| SockError::SandboxDead(format!("mock {}", self.id)))?;
        if res.charged_mb < full {
            res.mem.acquire(full - res.charged_mb)?;
            res.charged_mb = full;
        }
        self.state = SandboxState::Running;
        Ok(())
    }

    fn fork(&mut self, child: &ForkTarget<'_>) -> Result<()> {
        if self.control.fail_fork.swap(false, Ordering::SeqCst) {
            return Err(SockError::ForkFailed("injected fork failure".to_string()));
        }
        if self.state != SandboxState::Running {
            return Err(SockError::ForkFailed(format!("parent {} is {}", self.id, self.state)));
        }
        let charged = self.resources()?.charged_mb;
        let spare = charged.saturating_sub(self.control.usage_mb.load(Ordering::SeqCst));
        if spare < self.headroom_mb {
            return Err(SockError::InsufficientParentMem {
                spare_mb: spare,
                needed_mb: self.headroom_mb,
            });
        }
        self.registry.link(self.id, child.id)?;
        self.control.forks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&mut self, _reason: &str) {
        let Some(resources) = self.resources.take() else {
            return;
        };
        self.state = SandboxState::Evicting;
        self.control.destroys.fetch_add(1, Ordering::SeqCst);
        self.client.close_idle();
        self.registry.release(self.id, resources);
        self.state = SandboxState::Dead;
    }

    fn debug_string(&self) -> String {
        format!(
            "MOCK SANDBOX {} ({}, {} MB)\n",
            self.id,
            self.state,
            self.mem_limit_mb()
        )
    }
}

/// Sandbox pool whose sandboxes are [`MockSandbox`]es.
pub struct MockPool {
    name: String,
    mem: MemoryPool,
    limits: Limits,
    downsize: bool,
    ids: Arc<IdGen>,
    layout: Arc<CgroupLayout>,
    fake: Arc<FakeCgroupFs>,
    registry: Arc<Registry<MockResources>>,
    listeners: Listeners,
    controls: Mutex<HashMap<SandboxId, Arc<MockControl>>>,
    live: Arc<Mutex<HashMap<SandboxId, SafeSandbox>>>,
    torn_down: Arc<Mutex<Vec<SandboxId>>>,
}

impl MockPool {
    pub fn new(budget_mb: u64, sandbox_mem_mb: u64) -> Result<Self> {
        Self::with_options(
            "mock",
            budget_mb,
            sandbox_mem_mb,
            false,
            Arc::new(IdGen::new()),
            Arc::new(Registry::new()),
        )
    }

    /// Pools that fork from one another must share `ids` and `registry`.
    pub fn with_options(
        name: &str,
        budget_mb: u64,
        sandbox_mem_mb: u64,
        downsize: bool,
        ids: Arc<IdGen>,
        registry: Arc<Registry<MockResources>>,
    ) -> Result<Self> {
        let fake = Arc::new(FakeCgroupFs::new("/mock-cgroup"));
        let layout = Arc::new(CgroupLayout {
            root: fake.root().to_path_buf(),
            group: name.to_string(),
            controllers: vec!["freezer".to_string(), "memory".to_string()],
            procs_max: 10,
            swappiness: 0,
            freeze_timeout: Duration::from_millis(100),
            fs: fake.clone(),
        });
        for controller in &layout.controllers {
            fake.create_dir(&layout.group_dir(controller))?;
        }

        let listeners = Listeners::new();
        let live: Arc<Mutex<HashMap<SandboxId, SafeSandbox>>> = Arc::default();
        let tracked = live.clone();
        listeners.add(Arc::new(move |ev: &SandboxEvent| {
            if ev.kind == EventKind::Destroy {
                tracked
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&ev.id());
            }
        }));

        Ok(Self {
            name: name.to_string(),
            mem: MemoryPool::new(name, budget_mb)?,
            limits: Limits {
                mem_mb: sandbox_mem_mb,
                ..Limits::default()
            },
            downsize,
            ids,
            layout,
            fake,
            registry,
            listeners,
            controls: Mutex::new(HashMap::new()),
            live,
            torn_down: Arc::default(),
        })
    }

    pub fn control(&self, id: SandboxId) -> Option<Arc<MockControl>> {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Ids in the order their resources were released.
    pub fn torn_down(&self) -> Vec<SandboxId> {
        self.torn_down
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn registry(&self) -> &Registry<MockResources> {
        &self.registry
    }

    pub fn cgroup_fs(&self) -> &FakeCgroupFs {
        &self.fake
    }

    pub fn live_count(&self) -> usize {
        self.live_snapshot().len()
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

    fn controls(&self) -> MutexGuard<'_, HashMap<SandboxId, Arc<MockControl>>> {
        self.controls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SandboxPool for MockPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, parent: Option<&SafeSandbox>, spec: SandboxSpec) -> Result<SafeSandbox> {
        if spec.is_leaf && !spec.has_code() {
            return Err(SockError::InvalidLeaf);
        }
        let id = self.ids.next_id();
        let mut meta = spec.meta;
        meta.fill_defaults(&self.limits);

        self.mem.acquire(meta.mem_limit_mb)?;
        let cgroup = match Cgroup::new(self.layout.clone(), &format!("cg-{}", id), None) {
            Ok(cg) => cg,
            Err(e) => {
                let _ = self.mem.release(meta.mem_limit_mb);
                return Err(e);
            }
        };

        let control = Arc::new(MockControl::default());
        self.controls().insert(id, control.clone());
        self.registry.register(id);

        let scratch_dir = std::env::temp_dir().join("sockbox-mock").join(id.to_string());
        let client = Arc::new(GuestClient::new(scratch_dir.join("ol.sock"))?);
        let mut sandbox = MockSandbox {
            id,
            meta: meta.clone(),
            runtime: spec.runtime,
            is_leaf: spec.is_leaf,
            state: SandboxState::Running,
            scratch_dir,
            client,
            downsize: self.downsize,
            headroom_mb: self.limits.fork_headroom_mb,
            control,
            registry: self.registry.clone(),
            resources: Some(MockResources {
                mem: self.mem.clone(),
                charged_mb: meta.mem_limit_mb,
                cgroup,
                torn_down: self.torn_down.clone(),
            }),
        };

        if let Some(parent) = parent {
            let forked = sandbox.fork_target().and_then(|target| parent.fork(&target));
            if let Err(e) = forked {
                sandbox.destroy("fork failed");
                return Err(match e {
                    e @ SockError::InsufficientParentMem { .. } => e,
                    e @ SockError::ForkFailed(_) => e,
                    other => SockError::ForkFailed(other.to_string()),
                });
            }
        }

        let safe = SafeSandbox::new(Box::new(sandbox), self.listeners.clone());
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, safe.clone());
        safe.announce();
        Ok(safe)
    }

    fn cleanup(&self) {
        for sb in self.live_snapshot() {
            sb.destroy();
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_is_conserved_across_lifecycle() {
        let pool = MockPool::with_options(
            "m",
            200,
            50,
            true,
            Arc::new(IdGen::new()),
            Arc::new(Registry::new()),
        )
        .unwrap();
        let a = pool.create(None, SandboxSpec::leaf("/c", SandboxMeta::default())).unwrap();
        let b = pool.create(None, SandboxSpec::leaf("/c", SandboxMeta::default())).unwrap();
        assert_eq!(pool.memory().available_mb().unwrap(), 100);

        pool.control(a.id()).unwrap().set_usage_mb(5);
        a.pause().unwrap();
        let charged: u64 = [&a, &b].iter().map(|s| s.mem_limit_mb()).sum();
        assert_eq!(a.mem_limit_mb(), 6);
        assert_eq!(pool.memory().available_mb().unwrap() as u64 + charged, 200);

        a.unpause().unwrap();
        assert_eq!(a.mem_limit_mb(), 50);
        assert_eq!(pool.memory().available_mb().unwrap(), 100);

        a.destroy();
        b.destroy();
        assert_eq!(pool.memory().available_mb().unwrap(), 200);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_cgroup_lives_exactly_as_long_as_sandbox() {
        let pool = MockPool::new(100, 50).unwrap();
        let sb = pool.create(None, SandboxSpec::leaf("/c", SandboxMeta::default())).unwrap();
        let dir = Path::new("/mock-cgroup/memory/mock").join(format!("cg-{}", sb.id()));
        assert!(pool.cgroup_fs().exists(&dir));
        sb.destroy();
        assert!(!pool.cgroup_fs().exists(&dir));
    }

    #[test]
    fn test_leaf_without_code_is_rejected() {
        let pool = MockPool::new(100, 50).unwrap();
        let spec = SandboxSpec {
            is_leaf: true,
            ..Default::default()
        };
        assert!(matches!(pool.create(None, spec), Err(SockError::InvalidLeaf)));
        assert_eq!(pool.memory().available_mb().unwrap(), 100);
    }

    #[test]
    fn test_zygote_reclaimed_after_its_children() {
        let pool = MockPool::new(400, 50).unwrap();
        let zygote = pool
            .create(None, SandboxSpec::zygote(SandboxMeta::default()))
            .unwrap();
        let c1 = pool
            .create(Some(&zygote), SandboxSpec::leaf("/c", SandboxMeta::default()))
            .unwrap();
        let c2 = pool
            .create(Some(&zygote), SandboxSpec::leaf("/c", SandboxMeta::default()))
            .unwrap();
        assert_eq!(pool.registry().ref_count(zygote.id()), Some(3));

        zygote.destroy();
        assert!(pool.torn_down().is_empty());
        assert_eq!(pool.memory().available_mb().unwrap(), 250);

        c1.destroy();
        c2.destroy();
        assert_eq!(pool.torn_down(), vec![c1.id(), c2.id(), zygote.id()]);
        assert_eq!(pool.memory().available_mb().unwrap(), 400);
    }

    #[test]
    fn test_cleanup_destroys_everything() {
        let pool = MockPool::new(200, 50).unwrap();
        for _ in 0..3 {
            pool.create(None, SandboxSpec::leaf("/c", SandboxMeta::default()))
                .unwrap();
        }
        assert!(pool.debug_string().contains("MOCK SANDBOX"));
        pool.cleanup();
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.memory().available_mb().unwrap(), 200);
    }
}
