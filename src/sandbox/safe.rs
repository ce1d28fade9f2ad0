//! Serialized, self-destroying sandbox handle.
//!
//! Every call takes the sandbox's lock. The first error any call returns
//! destroys the sandbox before the error reaches the caller, and from then
//! on every call fails with [`SockError::SandboxDead`]. Lifecycle events are
//! published after the state change they describe, under the same lock, so a
//! sandbox's events form a single ordered stream beginning with Create and
//! ending with Destroy.

use crate::config::types::{Result, SockError};
use crate::core::types::{Runtime, SandboxId, SandboxMeta, SandboxState};
use crate::sandbox::events::{EventKind, Listeners, SandboxEvent};
use crate::sandbox::{ForkTarget, GuestClient, Sandbox};
use log::{info, warn};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

struct Guarded {
    sandbox: Box<dyn Sandbox>,
    paused: bool,
    dead: Option<String>,
}

struct SafeInner {
    id: SandboxId,
    listeners: Listeners,
    cell: Mutex<Guarded>,
}

#[derive(Clone)]
pub struct SafeSandbox {
    inner: Arc<SafeInner>,
}

impl fmt::Debug for SafeSandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SafeSandbox({})", self.inner.id)
    }
}

impl SafeSandbox {
    /// Wrap a freshly built sandbox. Nothing is published until
    /// [`SafeSandbox::announce`].
    pub fn new(sandbox: Box<dyn Sandbox>, listeners: Listeners) -> Self {
        let id = sandbox.id();
        Self {
            inner: Arc::new(SafeInner {
                id,
                listeners,
                cell: Mutex::new(Guarded {
                    sandbox,
                    paused: false,
                    dead: None,
                }),
            }),
        }
    }

    /// Publish the Create event; pools call this once the sandbox is usable.
    pub fn announce(&self) {
        let g = self.lock();
        if g.dead.is_none() {
            self.notify(EventKind::Create);
        }
    }

    pub fn id(&self) -> SandboxId {
        self.inner.id
    }

    pub fn same_as(&self, other: &SafeSandbox) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, Guarded> {
        self.inner.cell.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, kind: EventKind) {
        self.inner.listeners.notify(&SandboxEvent {
            kind,
            sandbox: self.clone(),
        });
    }

    fn check_alive(&self, g: &Guarded) -> Result<()> {
        match &g.dead {
            Some(reason) => Err(SockError::SandboxDead(format!(
                "sandbox {}: {}",
                self.inner.id, reason
            ))),
            None => Ok(()),
        }
    }

    fn destroy_locked(&self, g: &mut Guarded, reason: String) {
        g.sandbox.destroy(&reason);
        g.dead = Some(reason);
        self.notify(EventKind::Destroy);
    }

    fn fail(&self, g: &mut Guarded, op: &str, err: SockError) -> SockError {
        warn!("sandbox {}: {} failed, destroying: {}", self.inner.id, op, err);
        self.destroy_locked(g, format!("{} failed: {}", op, err));
        err
    }

    /// Freeze the guest. A second pause is a no-op.
    pub fn pause(&self) -> Result<()> {
        let mut g = self.lock();
        self.check_alive(&g)?;
        if g.paused {
            return Ok(());
        }
        match g.sandbox.pause() {
            Ok(()) => {
                g.paused = true;
                self.notify(EventKind::Pause);
                Ok(())
            }
            Err(e) => Err(self.fail(&mut g, "pause", e)),
        }
    }

    /// Thaw the guest. A second unpause is a no-op.
    pub fn unpause(&self) -> Result<()> {
        let mut g = self.lock();
        self.check_alive(&g)?;
        if !g.paused {
            return Ok(());
        }
        match g.sandbox.unpause() {
            Ok(()) => {
                g.paused = false;
                self.notify(EventKind::Unpause);
                Ok(())
            }
            Err(e) => Err(self.fail(&mut g, "unpause", e)),
        }
    }

    /// Fork `child` from this sandbox. A parent short on headroom is left
    /// alive since nothing reached its guest; any other failure destroys it.
    pub fn fork(&self, child: &ForkTarget<'_>) -> Result<()> {
        let mut g = self.lock();
        self.check_alive(&g)?;
        match g.sandbox.fork(child) {
            Ok(()) => {
                self.notify(EventKind::Fork);
                Ok(())
            }
            Err(e @ SockError::InsufficientParentMem { .. }) => Err(e),
            Err(e) => Err(self.fail(&mut g, "fork", e)),
        }
    }

    /// Idempotent.
    pub fn destroy(&self) {
        self.destroy_with_reason("destroyed");
    }

    pub fn destroy_with_reason(&self, reason: &str) {
        let mut g = self.lock();
        if g.dead.is_some() {
            return;
        }
        info!("sandbox {}: destroy ({})", self.inner.id, reason);
        self.destroy_locked(&mut g, reason.to_string());
    }

    /// Destroy only if paused; a running sandbox is left alone and a
    /// DestroyIgnored event is published instead.
    pub fn destroy_if_paused(&self, reason: &str) {
        let mut g = self.lock();
        if g.dead.is_some() {
            return;
        }
        if g.paused {
            self.destroy_locked(&mut g, reason.to_string());
        } else {
            self.notify(EventKind::DestroyIgnored);
        }
    }

    pub fn is_dead(&self) -> bool {
        self.lock().dead.is_some()
    }

    pub fn is_paused(&self) -> bool {
        let g = self.lock();
        g.dead.is_none() && g.paused
    }

    pub fn state(&self) -> SandboxState {
        let g = self.lock();
        if g.dead.is_some() {
            SandboxState::Dead
        } else {
            g.sandbox.state()
        }
    }

    pub fn meta(&self) -> SandboxMeta {
        self.lock().sandbox.meta().clone()
    }

    pub fn runtime(&self) -> Runtime {
        self.lock().sandbox.runtime()
    }

    pub fn is_leaf(&self) -> bool {
        self.lock().sandbox.is_leaf()
    }

    pub fn mem_limit_mb(&self) -> u64 {
        self.lock().sandbox.mem_limit_mb()
    }

    pub fn client(&self) -> Result<Arc<GuestClient>> {
        let g = self.lock();
        self.check_alive(&g)?;
        Ok(g.sandbox.client())
    }

    pub fn runtime_log(&self) -> String {
        self.lock().sandbox.runtime_log()
    }

    pub fn proxy_log(&self) -> String {
        self.lock().sandbox.proxy_log()
    }

    pub fn debug_string(&self) -> String {
        let g = self.lock();
        match &g.dead {
            Some(reason) => format!("SANDBOX {} DEAD: {}\n", self.inner.id, reason),
            None => g.sandbox.debug_string(),
        }
    }
}
