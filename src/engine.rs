//! Worker-wide engine
//!
//! An [`Engine`] is built once at worker startup and owns everything that
//! would otherwise be process-global: the configuration, the sandbox id
//! counter, both sandbox pools, their evictors, the import cache and the
//! debugger.

use crate::cache::ImportCache;
use crate::config::types::Result;
use crate::config::worker::WorkerConfig;
use crate::core::evictor::Evictor;
use crate::core::types::{IdGen, Runtime, SandboxMeta};
use crate::kernel::cgroup::{CgroupFs, HostCgroupFs};
use crate::observability::Debugger;
use crate::sandbox::{Registry, SafeSandbox, SandboxPool, SandboxSpec, SockPool};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

/// Pool that runs handler leaves.
pub const LEAF_POOL: &str = "sock";
/// Pool that holds the import cache's Zygotes.
pub const CACHE_POOL: &str = "import-cache";

pub struct Engine {
    config: Arc<WorkerConfig>,
    leaves: Arc<dyn SandboxPool>,
    cache: Option<ImportCache>,
    evictors: Vec<Evictor>,
    debugger: Debugger,
}

impl Engine {
    /// Validate `config` and bring up the SOCK pools on the host's cgroup
    /// hierarchy.
    pub fn start(config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let cgroup_fs: Arc<dyn CgroupFs> = Arc::new(HostCgroupFs);
        let registry = Arc::new(Registry::new());
        let ids = Arc::new(IdGen::new());

        let leaves: Arc<dyn SandboxPool> = Arc::new(SockPool::new(
            config.clone(),
            LEAF_POOL,
            config.mem_pool_mb,
            cgroup_fs.clone(),
            registry.clone(),
            ids.clone(),
        )?);

        let cache_pool: Option<Arc<dyn SandboxPool>> = if config.features.import_cache {
            match SockPool::new(
                config.clone(),
                CACHE_POOL,
                config.import_cache_mb,
                cgroup_fs,
                registry,
                ids,
            ) {
                Ok(pool) => Some(Arc::new(pool) as Arc<dyn SandboxPool>),
                Err(e) => {
                    leaves.cleanup();
                    return Err(e);
                }
            }
        } else {
            None
        };

        Self::from_pools(config, leaves, cache_pool)
    }

    /// Assemble an engine over already-built pools. Pools whose sandboxes
    /// fork from one another must share an id generator and registry.
    pub fn from_pools(
        config: Arc<WorkerConfig>,
        leaves: Arc<dyn SandboxPool>,
        cache_pool: Option<Arc<dyn SandboxPool>>,
    ) -> Result<Self> {
        let slot_mb = config.limits.mem_mb;
        let period = config.evictor_period();

        let mut pools: Vec<&dyn SandboxPool> = vec![&*leaves];
        if let Some(pool) = cache_pool.as_deref() {
            pools.push(pool);
        }
        let debugger = Debugger::start(&pools)?;

        let mut evictors = Vec::with_capacity(pools.len());
        for pool in &pools {
            evictors.push(Evictor::start(*pool, slot_mb, period)?);
        }

        let cache = match cache_pool {
            Some(pool) => match ImportCache::new(
                pool.clone(),
                config.features.import_cache_promote,
                config.import_cache_max_zygotes,
            ) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    for evictor in &evictors {
                        evictor.shutdown();
                    }
                    pool.cleanup();
                    leaves.cleanup();
                    return Err(e);
                }
            },
            None => None,
        };

        info!(
            "engine: started (worker {}, import cache {})",
            config.worker_dir.display(),
            if cache.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            config,
            leaves,
            cache,
            evictors,
            debugger,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn leaves(&self) -> &Arc<dyn SandboxPool> {
        &self.leaves
    }

    pub fn import_cache(&self) -> Option<&ImportCache> {
        self.cache.as_ref()
    }

    /// Start a handler sandbox for `code_dir`. Python handlers fork from the
    /// import cache when one is running; a leaf that cannot be forked starts
    /// from a fresh process instead.
    pub fn create_leaf(&self, code_dir: &Path, meta: SandboxMeta, runtime: Runtime) -> Result<SafeSandbox> {
        let spec = SandboxSpec {
            runtime,
            ..SandboxSpec::leaf(code_dir, meta)
        };

        let cache = match (&self.cache, runtime) {
            (Some(cache), Runtime::Python) => cache,
            _ => return self.leaves.create(None, spec),
        };

        let parent = match cache.get_parent(&spec.meta.imports) {
            Ok(parent) => parent,
            Err(e) => {
                warn!("engine: no zygote for {}: {}", code_dir.display(), e);
                return self.leaves.create(None, spec);
            }
        };

        match self.leaves.create(Some(&parent), spec.clone()) {
            Err(e) if e.is_fork_fallback() => {
                warn!(
                    "engine: fork from zygote {} failed ({}), starting {} fresh",
                    parent.id(),
                    e,
                    code_dir.display()
                );
                self.leaves.create(None, spec)
            }
            res => res,
        }
    }

    /// Every live sandbox in both pools, in id order.
    pub fn debug_string(&self) -> String {
        self.debugger.dump()
    }

    pub fn shutdown(&self) {
        for evictor in &self.evictors {
            evictor.shutdown();
        }
        self.leaves.cleanup();
        if let Some(cache) = &self.cache {
            cache.shutdown();
        }
        self.debugger.shutdown();
        info!("engine: shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
