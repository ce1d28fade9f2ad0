//! Sandboxes and the pools that create them
//!
//! [`Sandbox`] is the raw, single-owner interface; [`SafeSandbox`] is the
//! shared handle everything outside a pool uses. [`SandboxPool`] creates
//! sandboxes and publishes their lifecycle events.

pub mod bootstrap;
pub mod client;
pub mod events;
pub mod guest;
pub mod pool;
pub mod registry;
pub mod safe;
pub mod sock;

use crate::config::types::Result;
use crate::core::memory::MemoryPool;
use crate::core::types::{Runtime, SandboxId, SandboxMeta, SandboxState};
use crate::kernel::cgroup::Cgroup;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use client::GuestClient;
pub use events::{EventKind, Listener, Listeners, SandboxEvent};
pub use pool::SockPool;
pub use registry::{Registry, Teardown};
pub use safe::SafeSandbox;
pub use sock::SockSandbox;

/// What a fork parent needs from the child it is about to start.
pub struct ForkTarget<'a> {
    pub id: SandboxId,
    pub root_dir: &'a Path,
    pub cgroup: &'a Cgroup,
}

pub trait Sandbox: Send {
    fn id(&self) -> SandboxId;
    fn meta(&self) -> &SandboxMeta;
    fn runtime(&self) -> Runtime;
    fn is_leaf(&self) -> bool;
    fn state(&self) -> SandboxState;

    /// Memory currently charged to the pool for this sandbox.
    fn mem_limit_mb(&self) -> u64;

    fn scratch_dir(&self) -> &Path;
    fn client(&self) -> Arc<GuestClient>;

    fn pause(&mut self) -> Result<()>;
    fn unpause(&mut self) -> Result<()>;

    /// Start `child` as a fork of this sandbox's guest.
    fn fork(&mut self, child: &ForkTarget<'_>) -> Result<()>;

    /// Best-effort and idempotent; failures are logged, never returned.
    fn destroy(&mut self, reason: &str);

    fn debug_string(&self) -> String;

    fn runtime_log(&self) -> String {
        std::fs::read_to_string(self.scratch_dir().join("ol-runtime.log")).unwrap_or_default()
    }

    fn proxy_log(&self) -> String {
        std::fs::read_to_string(self.scratch_dir().join("proxy.log")).unwrap_or_default()
    }
}

/// Arguments to [`SandboxPool::create`].
#[derive(Clone, Debug, Default)]
pub struct SandboxSpec {
    pub is_leaf: bool,
    pub code_dir: Option<PathBuf>,
    /// Allocated by the pool as `<pool>-scratch/<id>` when unset.
    pub scratch_dir: Option<PathBuf>,
    pub meta: SandboxMeta,
    pub runtime: Runtime,
}

impl SandboxSpec {
    pub fn leaf<P: Into<PathBuf>>(code_dir: P, meta: SandboxMeta) -> Self {
        Self {
            is_leaf: true,
            code_dir: Some(code_dir.into()),
            meta,
            ..Default::default()
        }
    }

    pub fn zygote(meta: SandboxMeta) -> Self {
        Self {
            is_leaf: false,
            meta,
            ..Default::default()
        }
    }

    /// Leaves must name a non-empty code directory.
    pub fn has_code(&self) -> bool {
        self.code_dir
            .as_ref()
            .is_some_and(|p| !p.as_os_str().is_empty())
    }
}

pub trait SandboxPool: Send + Sync {
    fn name(&self) -> &str;

    /// Create a sandbox, forked from `parent` when one is given. Every
    /// failure after memory was charged unwinds fully before returning.
    fn create(&self, parent: Option<&SafeSandbox>, spec: SandboxSpec) -> Result<SafeSandbox>;

    /// Destroy what remains, wait for the whole budget to come back, then
    /// release cgroups and directories.
    fn cleanup(&self);

    fn add_listener(&self, listener: Listener);

    fn memory(&self) -> &MemoryPool;

    fn debug_string(&self) -> String;
}
