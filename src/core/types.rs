use crate::config::worker::Limits;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque sandbox identifier, rendered as a decimal string in paths and logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SandboxId(pub u64);

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic id source owned by one engine.
#[derive(Debug, Default)]
pub struct IdGen {
    next: AtomicU64,
}

impl IdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SandboxId {
        SandboxId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Lifecycle state. Running and Paused alternate; Evicting leads only to Dead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SandboxState {
    Running,
    Paused,
    Evicting,
    Dead,
}

impl SandboxState {
    pub fn can_transition_to(self, next: SandboxState) -> bool {
        use SandboxState::*;
        match (self, next) {
            (Dead, _) => false,
            (Running, Paused) | (Paused, Running) => true,
            (Evicting, Dead) => true,
            (Evicting, _) => false,
            (_, Evicting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxState::Running => "running",
            SandboxState::Paused => "paused",
            SandboxState::Evicting => "evicting",
            SandboxState::Dead => "dead",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    #[default]
    Python,
    Native,
}

/// Static per-sandbox settings. Zero or empty fields are filled from the
/// worker limits when the sandbox is created.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxMeta {
    pub installs: Vec<String>,
    pub imports: Vec<String>,
    pub mem_limit_mb: u64,
    pub cpu_percent: u64,
}

impl SandboxMeta {
    pub fn with_imports<I, S>(imports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            imports: imports.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn fill_defaults(&mut self, limits: &Limits) {
        if self.mem_limit_mb == 0 {
            self.mem_limit_mb = limits.mem_mb;
        }
        if self.cpu_percent == 0 {
            self.cpu_percent = limits.cpu_percent;
        }
    }

    /// Imports this sandbox needs beyond what `parent` already loaded, in
    /// request order.
    pub fn import_delta(&self, parent: &[String]) -> Vec<String> {
        self.imports
            .iter()
            .filter(|m| !parent.contains(m))
            .cloned()
            .collect()
    }
}
