/// Worker configuration loaded from a JSON file
use crate::config::types::{Result, SockError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cgroup v1 controllers every sandbox cgroup is created under.
pub const DEFAULT_CONTROLLERS: [&str; 9] = [
    "blkio",
    "cpu",
    "devices",
    "freezer",
    "hugetlb",
    "memory",
    "perf_event",
    "systemd",
    "pids",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Written to `pids.max`.
    pub procs: u64,
    /// Default per-sandbox memory cap; also the evictor's slot size.
    pub mem_mb: u64,
    /// CFS quota as a percentage of one core.
    pub cpu_percent: u64,
    pub swappiness: u64,
    /// Spare memory a Zygote must have under its cap before it may fork.
    pub fork_headroom_mb: u64,
    /// Memory cap for package-installer sandboxes; 0 derives it from
    /// `mem_pool_mb` (see [`WorkerConfig::installer_mem_mb`]).
    pub installer_mem_mb: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            procs: 10,
            mem_mb: 50,
            cpu_percent: 100,
            swappiness: 0,
            fork_headroom_mb: 3,
            installer_mem_mb: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub reuse_cgroups: bool,
    pub downsize_paused_mem: bool,
    pub import_cache: bool,
    /// Fork new Zygotes for import sets that no live Zygote covers.
    pub import_cache_promote: bool,
    pub enable_seccomp: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            reuse_cgroups: false,
            downsize_paused_mem: true,
            import_cache: true,
            import_cache_promote: false,
            enable_seccomp: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_dir: PathBuf,
    /// Base image; empty means `<worker_dir>/lambda`.
    pub sock_base_path: PathBuf,
    pub cgroup_root: PathBuf,
    pub cgroup_controllers: Vec<String>,
    pub mem_pool_mb: u64,
    pub import_cache_mb: u64,
    pub import_cache_max_zygotes: usize,
    pub evictor_period_ms: u64,
    pub limits: Limits,
    pub features: Features,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_dir: PathBuf::from("/var/lib/sockbox/worker"),
            sock_base_path: PathBuf::new(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_controllers: DEFAULT_CONTROLLERS.iter().map(|c| c.to_string()).collect(),
            mem_pool_mb: 1024,
            import_cache_mb: 256,
            import_cache_max_zygotes: 8,
            evictor_period_ms: 100,
            limits: Limits::default(),
            features: Features::default(),
        }
    }
}

impl WorkerConfig {
    /// Load and validate a configuration file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SockError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: WorkerConfig = serde_json::from_str(content)
            .map_err(|e| SockError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.worker_dir.is_absolute() {
            return Err(SockError::Config(format!(
                "worker_dir must be absolute: {}",
                self.worker_dir.display()
            )));
        }
        if !self.sock_base_path.as_os_str().is_empty() && !self.sock_base_path.is_absolute() {
            return Err(SockError::Config(format!(
                "sock_base_path must be absolute: {}",
                self.sock_base_path.display()
            )));
        }
        if !self.cgroup_root.is_absolute() {
            return Err(SockError::Config(format!(
                "cgroup_root must be absolute: {}",
                self.cgroup_root.display()
            )));
        }
        if self.cgroup_controllers.is_empty() {
            return Err(SockError::Config("No cgroup controllers configured".to_string()));
        }
        if self.mem_pool_mb == 0 || self.limits.mem_mb == 0 {
            return Err(SockError::Config(
                "mem_pool_mb and limits.mem_mb must be non-zero".to_string(),
            ));
        }
        if self.limits.mem_mb > self.mem_pool_mb {
            return Err(SockError::Config(format!(
                "limits.mem_mb ({}) exceeds mem_pool_mb ({})",
                self.limits.mem_mb, self.mem_pool_mb
            )));
        }
        if self.limits.installer_mem_mb > self.mem_pool_mb {
            return Err(SockError::Config(format!(
                "limits.installer_mem_mb ({}) exceeds mem_pool_mb ({})",
                self.limits.installer_mem_mb, self.mem_pool_mb
            )));
        }
        if self.features.import_cache && self.import_cache_mb < self.limits.mem_mb {
            return Err(SockError::Config(format!(
                "import_cache_mb ({}) cannot hold one Zygote of {} MB",
                self.import_cache_mb, self.limits.mem_mb
            )));
        }
        if self.limits.procs == 0 || self.limits.cpu_percent == 0 {
            return Err(SockError::Config(
                "limits.procs and limits.cpu_percent must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn base_image(&self) -> PathBuf {
        if self.sock_base_path.as_os_str().is_empty() {
            self.worker_dir.join("lambda")
        } else {
            self.sock_base_path.clone()
        }
    }

    /// `W/<pool>`: parent of every assembled root in the pool.
    pub fn pool_root(&self, pool: &str) -> PathBuf {
        self.worker_dir.join(pool)
    }

    /// `W/<pool>-scratch`
    pub fn scratch_root(&self, pool: &str) -> PathBuf {
        self.worker_dir.join(format!("{}-scratch", pool))
    }

    /// Cgroup group name, prefixed with the worker directory's basename so
    /// several workers can share one host.
    pub fn cgroup_group(&self, pool: &str) -> String {
        let base = self
            .worker_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "worker".to_string());
        format!("{}-{}", base, pool)
    }

    /// Half the pool, kept within 250..=500 MB and never above the pool,
    /// unless `limits.installer_mem_mb` is set.
    pub fn installer_mem_mb(&self) -> u64 {
        if self.limits.installer_mem_mb > 0 {
            return self.limits.installer_mem_mb;
        }
        (self.mem_pool_mb / 2).clamp(250, 500).min(self.mem_pool_mb)
    }

    pub fn evictor_period(&self) -> Duration {
        Duration::from_millis(self.evictor_period_ms.max(1))
    }
}
