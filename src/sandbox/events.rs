//! Sandbox lifecycle events and the listeners that observe them.

use crate::core::types::SandboxId;
use crate::sandbox::safe::SafeSandbox;
use std::fmt;
use std::sync::{Arc, RwLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Destroy,
    /// A conditional destroy found the sandbox running and left it alone.
    DestroyIgnored,
    Pause,
    Unpause,
    /// Published by a parent after it forked a child.
    Fork,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone)]
pub struct SandboxEvent {
    pub kind: EventKind,
    pub sandbox: SafeSandbox,
}

impl SandboxEvent {
    pub fn id(&self) -> SandboxId {
        self.sandbox.id()
    }
}

impl fmt::Debug for SandboxEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sandbox {}", self.kind, self.sandbox.id())
    }
}

/// Read-only observer. Called synchronously while the sandbox's lock is held,
/// so it must not call back into that sandbox; hand the event to another
/// thread instead.
pub type Listener = Arc<dyn Fn(&SandboxEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<Listener>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Listener) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, event: &SandboxEvent) {
        let listeners = self.inner.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener(event);
        }
    }
}
