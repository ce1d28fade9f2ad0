//! Import cache: a tree of Zygotes that leaves fork from
//!
//! The cache owns a dedicated sandbox pool. It starts with a root Zygote
//! that has imported nothing, and hands out the live Zygote whose imports
//! best cover a request. With promotion on, a request that no Zygote covers
//! exactly forks a new Zygote from the best match, importing the difference.

use crate::config::types::{Result, SockError};
use crate::core::types::{SandboxId, SandboxMeta};
use crate::sandbox::events::{EventKind, SandboxEvent};
use crate::sandbox::{SafeSandbox, SandboxPool, SandboxSpec};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
struct Zygote {
    sandbox: SafeSandbox,
    imports: Vec<String>,
}

impl Zygote {
    fn covers(&self, imports: &[String]) -> bool {
        self.imports.iter().all(|m| imports.contains(m))
    }
}

type Index = Arc<Mutex<HashMap<SandboxId, Zygote>>>;

pub struct ImportCache {
    pool: Arc<dyn SandboxPool>,
    root: Mutex<Option<SafeSandbox>>,
    index: Index,
    promote: bool,
    max_zygotes: usize,
    closed: AtomicBool,
}

fn lock_index(index: &Index) -> MutexGuard<'_, HashMap<SandboxId, Zygote>> {
    index.lock().unwrap_or_else(|e| e.into_inner())
}

impl ImportCache {
    /// Take over `pool` and start the root Zygote.
    pub fn new(pool: Arc<dyn SandboxPool>, promote: bool, max_zygotes: usize) -> Result<Self> {
        let index: Index = Arc::default();
        let tracked = index.clone();
        pool.add_listener(Arc::new(move |ev: &SandboxEvent| {
            if ev.kind == EventKind::Destroy && lock_index(&tracked).remove(&ev.id()).is_some() {
                debug!("import cache: zygote {} gone", ev.id());
            }
        }));

        let cache = Self {
            pool,
            root: Mutex::new(None),
            index,
            promote,
            max_zygotes: max_zygotes.max(1),
            closed: AtomicBool::new(false),
        };
        cache.root()?;
        info!(
            "import cache: started on pool {} (promote={}, max_zygotes={})",
            cache.pool.name(),
            promote,
            cache.max_zygotes
        );
        Ok(cache)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SockError::PoolClosed(format!("import cache on {}", self.pool.name())));
        }
        Ok(())
    }

    /// The live root Zygote, recreated if it has died.
    pub fn root(&self) -> Result<SafeSandbox> {
        self.check_open()?;
        let mut root = self.root.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sb) = root.as_ref() {
            if !sb.is_dead() {
                return Ok(sb.clone());
            }
            warn!("import cache: root zygote {} died, recreating", sb.id());
        }

        let sb = self
            .pool
            .create(None, SandboxSpec::zygote(SandboxMeta::default()))?;
        lock_index(&self.index).insert(
            sb.id(),
            Zygote {
                sandbox: sb.clone(),
                imports: Vec::new(),
            },
        );
        *root = Some(sb.clone());
        Ok(sb)
    }

    /// Live Zygote whose imports are the largest subset of `imports`; ties go
    /// to the oldest.
    fn best_match(&self, imports: &[String]) -> Option<Zygote> {
        let mut candidates: Vec<Zygote> = lock_index(&self.index).values().cloned().collect();
        candidates.sort_by_key(|z| z.sandbox.id());
        candidates
            .into_iter()
            .filter(|z| z.covers(imports) && !z.sandbox.is_dead())
            .fold(None, |best: Option<Zygote>, z| match best {
                Some(b) if b.imports.len() >= z.imports.len() => Some(b),
                _ => Some(z),
            })
    }

    /// A Zygote suitable as the fork parent of a leaf needing `imports`.
    pub fn get_parent(&self, imports: &[String]) -> Result<SafeSandbox> {
        self.check_open()?;
        let best = match self.best_match(imports) {
            Some(z) => z,
            None => {
                let sandbox = self.root()?;
                Zygote {
                    sandbox,
                    imports: Vec::new(),
                }
            }
        };

        let missing = imports.iter().any(|m| !best.imports.contains(m));
        if !self.promote || !missing || self.zygote_count() >= self.max_zygotes {
            return Ok(best.sandbox);
        }

        match self.promote_from(&best, imports) {
            Ok(sb) => Ok(sb),
            Err(e) => {
                warn!(
                    "import cache: could not fork zygote for {:?} from {}: {}",
                    imports,
                    best.sandbox.id(),
                    e
                );
                if best.sandbox.is_dead() {
                    self.root()
                } else {
                    Ok(best.sandbox)
                }
            }
        }
    }

    fn promote_from(&self, parent: &Zygote, imports: &[String]) -> Result<SafeSandbox> {
        let meta = SandboxMeta::with_imports(imports.iter().cloned());
        let sb = self
            .pool
            .create(Some(&parent.sandbox), SandboxSpec::zygote(meta))?;
        lock_index(&self.index).insert(
            sb.id(),
            Zygote {
                sandbox: sb.clone(),
                imports: imports.to_vec(),
            },
        );
        info!(
            "import cache: zygote {} forked from {} for {:?}",
            sb.id(),
            parent.sandbox.id(),
            imports
        );
        Ok(sb)
    }

    pub fn zygote_count(&self) -> usize {
        lock_index(&self.index).len()
    }

    pub fn pool(&self) -> &Arc<dyn SandboxPool> {
        &self.pool
    }

    pub fn debug_string(&self) -> String {
        self.pool.debug_string()
    }

    /// Destroy every Zygote, newest first, then clean up the pool.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut zygotes: Vec<SafeSandbox> = lock_index(&self.index)
            .values()
            .map(|z| z.sandbox.clone())
            .collect();
        zygotes.sort_by_key(|sb| std::cmp::Reverse(sb.id()));
        for sb in zygotes {
            sb.destroy_with_reason("import cache shutdown");
        }
        self.root.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.pool.cleanup();
        info!("import cache: shut down");
    }
}
