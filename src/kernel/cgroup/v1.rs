//! Cgroup v1 sandbox nodes.
//!
//! A [`Cgroup`] is one directory `cg-<n>` created under the pool's group in
//! every configured controller: `<root>/<controller>/<group>/cg-<n>`.

use crate::config::types::{Result, SockError};
use crate::kernel::cgroup::fs::CgroupFs;
use crossbeam_channel::{Sender, TrySendError};
use log::{debug, error, warn};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MIB: u64 = 1024 * 1024;
const CFS_PERIOD_US: u64 = 100_000;

pub const FREEZE_TIMEOUT: Duration = Duration::from_secs(5);
const FREEZE_POLL: Duration = Duration::from_millis(1);

const RMDIR_ATTEMPTS: usize = 100;
const RMDIR_BACKOFF: Duration = Duration::from_millis(5);

/// Where a pool's cgroups live and the attributes each is created with.
#[derive(Debug)]
pub struct CgroupLayout {
    pub root: PathBuf,
    /// `<worker-basename>-<pool>`
    pub group: String,
    pub controllers: Vec<String>,
    pub procs_max: u64,
    pub swappiness: u64,
    pub freeze_timeout: Duration,
    pub fs: Arc<dyn CgroupFs>,
}

impl CgroupLayout {
    pub fn group_dir(&self, controller: &str) -> PathBuf {
        self.root.join(controller).join(&self.group)
    }

    pub fn has(&self, controller: &str) -> bool {
        self.controllers.iter().any(|c| c == controller)
    }
}

pub struct Cgroup {
    name: String,
    layout: Arc<CgroupLayout>,
    recycle: Option<Sender<Cgroup>>,
    mem_limit_mb: u64,
    /// Set once the freezer missed a deadline; later waits on it are skipped.
    hung: AtomicBool,
}

impl std::fmt::Debug for Cgroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cgroup")
            .field("group", &self.layout.group)
            .field("name", &self.name)
            .field("mem_limit_mb", &self.mem_limit_mb)
            .finish()
    }
}

impl Cgroup {
    /// Create the node in every controller and apply the once-per-lifetime
    /// attributes. `recycle`, when set, is where [`Cgroup::release`] returns
    /// the node for reuse.
    pub fn new(
        layout: Arc<CgroupLayout>,
        name: &str,
        recycle: Option<Sender<Cgroup>>,
    ) -> Result<Self> {
        let mut created: Vec<PathBuf> = Vec::new();
        for controller in &layout.controllers {
            let dir = layout.group_dir(controller).join(name);
            if let Err(e) = layout.fs.create_dir(&dir) {
                for dir in created.iter().rev() {
                    let _ = layout.fs.remove_dir(dir);
                }
                return Err(SockError::Cgroup(format!(
                    "Failed to create {}: {}",
                    dir.display(),
                    e
                )));
            }
            created.push(dir);
        }

        let cg = Self {
            name: name.to_string(),
            layout,
            recycle,
            mem_limit_mb: 0,
            hung: AtomicBool::new(false),
        };

        if let Err(e) = cg.apply_static_limits() {
            cg.destroy();
            return Err(e);
        }

        debug!("cgroup {}/{}: created", cg.layout.group, cg.name);
        Ok(cg)
    }

    fn apply_static_limits(&self) -> Result<()> {
        if self.layout.has("pids") {
            self.write("pids", "pids.max", &self.layout.procs_max.to_string())?;
        }
        if self.layout.has("memory") {
            self.write("memory", "memory.swappiness", &self.layout.swappiness.to_string())?;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self, controller: &str) -> PathBuf {
        self.layout.group_dir(controller).join(&self.name)
    }

    fn write(&self, controller: &str, file: &str, value: &str) -> Result<()> {
        let path = self.path(controller).join(file);
        self.layout.fs.write(&path, value).map_err(|e| {
            SockError::Cgroup(format!("Failed to write {} to {}: {}", value, path.display(), e))
        })
    }

    fn read(&self, controller: &str, file: &str) -> Result<String> {
        let path = self.path(controller).join(file);
        self.layout
            .fs
            .read(&path)
            .map_err(|e| SockError::Cgroup(format!("Failed to read {}: {}", path.display(), e)))
    }

    fn read_u64(&self, controller: &str, file: &str) -> Result<u64> {
        let raw = self.read(controller, file)?;
        raw.trim().parse().map_err(|e| {
            SockError::Cgroup(format!("Failed to parse {}/{} ({:?}): {}", controller, file, raw, e))
        })
    }

    /// Move `pid` into this node in every controller.
    pub fn add_pid(&self, pid: i32) -> Result<()> {
        for controller in &self.layout.controllers {
            let path = self.path(controller).join("tasks");
            if let Err(e) = self.layout.fs.write(&path, &pid.to_string()) {
                if e.raw_os_error() == Some(libc::ESRCH) {
                    debug!("cgroup {}: pid {} exited before move", self.name, pid);
                    return Ok(());
                }
                return Err(SockError::Cgroup(format!(
                    "Failed to add pid {} to {}: {}",
                    pid,
                    path.display(),
                    e
                )));
            }
        }
        Ok(())
    }

    /// Union of the `tasks` lists across controllers.
    pub fn pids(&self) -> Result<BTreeSet<i32>> {
        let mut pids = BTreeSet::new();
        for controller in &self.layout.controllers {
            for line in self.read(controller, "tasks")?.lines() {
                if let Ok(pid) = line.trim().parse::<i32>() {
                    pids.insert(pid);
                }
            }
        }
        Ok(pids)
    }

    /// Migrate every task that appeared here since `baseline` into `dest`,
    /// repeating until a full pass finds nothing new. Returns how many tasks
    /// were moved.
    pub fn migrate_new_tasks(&self, dest: &Cgroup, baseline: &BTreeSet<i32>) -> Result<usize> {
        let mut moved = 0;
        loop {
            let fresh: Vec<i32> = self
                .pids()?
                .into_iter()
                .filter(|pid| !baseline.contains(pid))
                .collect();
            if fresh.is_empty() {
                return Ok(moved);
            }
            for pid in fresh {
                dest.add_pid(pid)?;
                moved += 1;
            }
        }
    }

    pub fn freezer_state(&self) -> Result<String> {
        Ok(self.read("freezer", "freezer.state")?.trim().to_string())
    }

    fn set_freeze_state(&self, state: &str) -> Result<()> {
        self.write("freezer", "freezer.state", state)?;

        let start = Instant::now();
        loop {
            let observed = self.freezer_state()?;
            if observed == state {
                debug!("cgroup {}: {} after {:?}", self.name, state, start.elapsed());
                return Ok(());
            }
            if start.elapsed() >= self.layout.freeze_timeout {
                self.hung.store(true, Ordering::Relaxed);
                return Err(SockError::CgroupHung {
                    path: self.path("freezer"),
                    expected: state.to_string(),
                    observed,
                    waited: start.elapsed(),
                });
            }
            thread::sleep(FREEZE_POLL);
        }
    }

    pub fn pause(&self) -> Result<()> {
        self.set_freeze_state("FROZEN")
    }

    pub fn unpause(&self) -> Result<()> {
        self.set_freeze_state("THAWED")
    }

    /// Whether a freeze or thaw on this node has timed out.
    pub fn is_hung(&self) -> bool {
        self.hung.load(Ordering::Relaxed)
    }

    /// Current usage in MB, rounded up.
    pub fn get_mem_usage_mb(&self) -> Result<u64> {
        let bytes = self.read_u64("memory", "memory.usage_in_bytes")?;
        Ok(bytes.div_ceil(MIB))
    }

    /// Last limit set through [`Cgroup::set_mem_limit_mb`].
    pub fn mem_limit_mb(&self) -> u64 {
        self.mem_limit_mb
    }

    /// # Panics
    ///
    /// If the kernel stores a limit more than 1 MB away from the one written;
    /// memory accounting assumes the cap it charged is the cap in force.
    pub fn set_mem_limit_mb(&mut self, mb: u64) -> Result<()> {
        let bytes = mb * MIB;
        self.write("memory", "memory.limit_in_bytes", &bytes.to_string())?;

        let stored = self.read_u64("memory", "memory.limit_in_bytes")?;
        if stored.abs_diff(bytes) > MIB {
            panic!(
                "cgroup {}: wrote memory limit {} but kernel stored {}",
                self.name, bytes, stored
            );
        }

        self.mem_limit_mb = mb;
        Ok(())
    }

    pub fn set_cpu_percent(&self, percent: u64) -> Result<()> {
        if !self.layout.has("cpu") {
            return Ok(());
        }
        let quota = CFS_PERIOD_US * percent / 100;
        self.write("cpu", "cpu.cfs_period_us", &CFS_PERIOD_US.to_string())?;
        self.write("cpu", "cpu.cfs_quota_us", &quota.to_string())
    }

    pub fn oom_kill_count(&self) -> Result<u64> {
        let raw = self.read("memory", "memory.oom_control")?;
        Ok(raw
            .lines()
            .filter_map(|line| line.strip_prefix("oom_kill "))
            .find_map(|n| n.trim().parse().ok())
            .unwrap_or(0))
    }

    /// Open `cgroup.procs` in `controller` so another process can enter this
    /// node by writing to the descriptor.
    pub fn open_procs(&self, controller: &str) -> Result<File> {
        let path = self.path(controller).join("cgroup.procs");
        self.layout
            .fs
            .open_write(&path)
            .map_err(|e| SockError::Cgroup(format!("Failed to open {}: {}", path.display(), e)))
    }

    pub fn open_procs_all(&self) -> Result<Vec<File>> {
        self.layout
            .controllers
            .iter()
            .map(|c| self.open_procs(c))
            .collect()
    }

    /// SIGKILL every task until the node is empty. Frozen tasks only die once
    /// thawed, so each pass unpauses after signalling. A hung freezer gets a
    /// single round of signals and no thaw.
    pub fn kill_all_procs(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            let pids = self.pids()?;
            if pids.is_empty() {
                return Ok(());
            }
            for pid in &pids {
                if let Err(e) = self.layout.fs.kill(*pid) {
                    warn!("cgroup {}: failed to kill {}: {}", self.name, pid, e);
                }
            }
            if self.is_hung() {
                let left = self.pids()?;
                if left.is_empty() {
                    return Ok(());
                }
                return Err(SockError::Cgroup(format!(
                    "cgroup {}: freezer hung, tasks {:?} left after SIGKILL",
                    self.name, left
                )));
            }
            self.unpause()?;

            if start.elapsed() >= self.layout.freeze_timeout {
                return Err(SockError::Cgroup(format!(
                    "cgroup {}: tasks {:?} survived SIGKILL for {:?}",
                    self.name,
                    pids,
                    start.elapsed()
                )));
            }
            thread::sleep(FREEZE_POLL);
        }
    }

    /// Prepare a recycled node for its next sandbox.
    pub fn reset(&mut self) -> Result<()> {
        if self.layout.has("memory") {
            self.write("memory", "memory.failcnt", "0")?;
        }
        self.unpause()
    }

    /// Return the node to its pool when reuse is on and the pool has room;
    /// otherwise remove it. Must only be called once no tasks remain.
    pub fn release(self) {
        let Some(recycle) = self.recycle.clone() else {
            self.destroy();
            return;
        };
        if self.is_hung() {
            self.destroy();
            return;
        }

        match recycle.try_send(self) {
            Ok(()) => {}
            Err(TrySendError::Full(cg)) | Err(TrySendError::Disconnected(cg)) => cg.destroy(),
        }
    }

    /// Remove the node from every controller. `rmdir` briefly reports EBUSY
    /// after the last task exits, so each directory is retried.
    pub fn destroy(self) {
        for controller in &self.layout.controllers {
            let dir = self.path(controller);
            if !self.layout.fs.exists(&dir) {
                continue;
            }
            let mut last_err = None;
            for _ in 0..RMDIR_ATTEMPTS {
                match self.layout.fs.remove_dir(&dir) {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        last_err = Some(e);
                        thread::sleep(RMDIR_BACKOFF);
                    }
                }
            }
            if let Some(e) = last_err {
                error!("cgroup {}: failed to remove {}: {}", self.name, dir.display(), e);
            }
        }
        debug!("cgroup {}/{}: destroyed", self.layout.group, self.name);
    }

    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        match self.pids() {
            Ok(pids) => {
                let _ = writeln!(out, "PIDS: {:?}", pids);
            }
            Err(e) => {
                let _ = writeln!(out, "PIDS: <{}>", e);
            }
        }
        let _ = writeln!(out, "CGROUPS:");
        for controller in &self.layout.controllers {
            let _ = writeln!(out, "  {}", self.path(controller).display());
        }
        let freeze = self.freezer_state().unwrap_or_else(|e| format!("<{}>", e));
        let _ = writeln!(out, "FREEZE STATE: {}", freeze);
        let used = self
            .get_mem_usage_mb()
            .map(|mb| mb.to_string())
            .unwrap_or_else(|_| "?".to_string());
        let _ = writeln!(out, "MEMORY USED: {} of {} MB", used, self.mem_limit_mb);
        let ooms = self
            .oom_kill_count()
            .map(|n| n.to_string())
            .unwrap_or_else(|_| "?".to_string());
        let _ = writeln!(out, "OOM KILLS: {}", ooms);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_cgroupfs::FakeCgroupFs;

    fn layout(fake: &Arc<FakeCgroupFs>) -> Arc<CgroupLayout> {
        let layout = Arc::new(CgroupLayout {
            root: fake.root().to_path_buf(),
            group: "w-test".to_string(),
            controllers: vec![
                "cpu".to_string(),
                "freezer".to_string(),
                "memory".to_string(),
                "pids".to_string(),
            ],
            procs_max: 10,
            swappiness: 0,
            freeze_timeout: Duration::from_millis(200),
            fs: fake.clone(),
        });
        for c in &layout.controllers {
            fake.create_dir(&layout.group_dir(c)).unwrap();
        }
        layout
    }

    #[test]
    fn test_new_creates_node_in_every_controller() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let layout = layout(&fake);
        let cg = Cgroup::new(layout.clone(), "cg-1", None).unwrap();

        for c in &layout.controllers {
            assert!(fake.exists(&cg.path(c)));
        }
        assert_eq!(fake.file(&cg.path("pids").join("pids.max")).unwrap(), "10");
        assert_eq!(fake.file(&cg.path("memory").join("memory.swappiness")).unwrap(), "0");

        cg.destroy();
        for c in &layout.controllers {
            assert!(!fake.exists(&layout.group_dir(c).join("cg-1")));
        }
    }

    #[test]
    fn test_mem_limit_tolerates_page_rounding() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let mut cg = Cgroup::new(layout(&fake), "cg-1", None).unwrap();
        cg.set_mem_limit_mb(50).unwrap();
        assert_eq!(cg.mem_limit_mb(), 50);
        assert_eq!(
            fake.file(&cg.path("memory").join("memory.limit_in_bytes")).unwrap(),
            (50 * MIB).to_string()
        );
    }

    #[test]
    fn test_usage_rounds_up_to_whole_mb() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let cg = Cgroup::new(layout(&fake), "cg-1", None).unwrap();
        fake.set_usage_bytes(&cg.path("memory"), 5 * MIB + 1);
        assert_eq!(cg.get_mem_usage_mb().unwrap(), 6);
    }

    #[test]
    fn test_cpu_percent_sets_quota() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let cg = Cgroup::new(layout(&fake), "cg-1", None).unwrap();
        cg.set_cpu_percent(50).unwrap();
        assert_eq!(fake.file(&cg.path("cpu").join("cpu.cfs_quota_us")).unwrap(), "50000");
        assert_eq!(fake.file(&cg.path("cpu").join("cpu.cfs_period_us")).unwrap(), "100000");
    }

    #[test]
    fn test_pause_unpause() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let cg = Cgroup::new(layout(&fake), "cg-1", None).unwrap();
        cg.pause().unwrap();
        assert_eq!(cg.freezer_state().unwrap(), "FROZEN");
        cg.unpause().unwrap();
        assert_eq!(cg.freezer_state().unwrap(), "THAWED");
    }

    #[test]
    fn test_hung_freezer_times_out() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let cg = Cgroup::new(layout(&fake), "cg-1", None).unwrap();
        fake.hang_freezer(&cg.path("freezer"));

        let start = Instant::now();
        let err = cg.pause().unwrap_err();
        let waited = start.elapsed();
        assert!(matches!(err, SockError::CgroupHung { .. }));
        assert!(waited >= Duration::from_millis(200));
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn test_add_pid_moves_between_nodes() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let layout = layout(&fake);
        let a = Cgroup::new(layout.clone(), "cg-1", None).unwrap();
        let b = Cgroup::new(layout, "cg-2", None).unwrap();

        a.add_pid(100).unwrap();
        assert_eq!(a.pids().unwrap().into_iter().collect::<Vec<_>>(), vec![100]);
        b.add_pid(100).unwrap();
        assert!(a.pids().unwrap().is_empty());
        assert!(b.pids().unwrap().contains(&100));
    }

    #[test]
    fn test_migrate_new_tasks_catches_late_helpers() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let layout = layout(&fake);
        let parent = Cgroup::new(layout.clone(), "cg-1", None).unwrap();
        let child = Cgroup::new(layout, "cg-2", None).unwrap();

        parent.add_pid(10).unwrap();
        parent.add_pid(11).unwrap();
        let baseline = parent.pids().unwrap();

        // The forked child plus a helper thread that only shows up on a later
        // scan of the parent.
        parent.add_pid(20).unwrap();
        fake.spawn_on_read(&parent.path("memory"), 21);

        let moved = parent.migrate_new_tasks(&child, &baseline).unwrap();
        assert_eq!(moved, 2);
        assert_eq!(parent.pids().unwrap(), baseline);
        let in_child = child.pids().unwrap();
        assert!(in_child.contains(&20));
        assert!(in_child.contains(&21));
    }

    #[test]
    fn test_kill_all_procs_empties_node() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let cg = Cgroup::new(layout(&fake), "cg-1", None).unwrap();
        cg.add_pid(7).unwrap();
        cg.add_pid(8).unwrap();
        cg.pause().unwrap();

        cg.kill_all_procs().unwrap();
        assert!(cg.pids().unwrap().is_empty());
        assert_eq!(cg.freezer_state().unwrap(), "THAWED");
    }

    #[test]
    fn test_new_rolls_back_partial_creation() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let layout = layout(&fake);
        fake.create_dir(&layout.group_dir("pids").join("cg-1")).unwrap();

        let err = Cgroup::new(layout.clone(), "cg-1", None).unwrap_err();
        assert!(matches!(err, SockError::Cgroup(_)));
        for c in ["cpu", "freezer", "memory"] {
            assert!(!fake.exists(&layout.group_dir(c).join("cg-1")));
        }
    }

    #[test]
    fn test_hung_node_is_killed_without_waiting_and_never_recycled() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let layout = layout(&fake);
        let (tx, rx) = crossbeam_channel::bounded(1);
        let cg = Cgroup::new(layout.clone(), "cg-1", Some(tx)).unwrap();
        cg.add_pid(7).unwrap();
        fake.hang_freezer(&cg.path("freezer"));
        assert!(cg.pause().is_err());
        assert!(cg.is_hung());

        let start = Instant::now();
        cg.kill_all_procs().unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(cg.pids().unwrap().is_empty());

        cg.release();
        assert!(rx.try_recv().is_err());
        assert!(!fake.exists(&layout.group_dir("memory").join("cg-1")));
    }

    #[test]
    fn test_release_recycles_when_room() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let layout = layout(&fake);
        let (tx, rx) = crossbeam_channel::bounded(1);

        let a = Cgroup::new(layout.clone(), "cg-1", Some(tx.clone())).unwrap();
        let b = Cgroup::new(layout.clone(), "cg-2", Some(tx)).unwrap();
        a.release();
        b.release();

        let recycled = rx.try_recv().unwrap();
        assert_eq!(recycled.name(), "cg-1");
        assert!(fake.exists(&layout.group_dir("memory").join("cg-1")));
        assert!(!fake.exists(&layout.group_dir("memory").join("cg-2")));
    }

    #[test]
    fn test_reset_clears_failcnt_and_thaws() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let mut cg = Cgroup::new(layout(&fake), "cg-1", None).unwrap();
        fake.write(&cg.path("memory").join("memory.failcnt"), "3").unwrap();
        cg.pause().unwrap();
        cg.reset().unwrap();
        assert_eq!(fake.file(&cg.path("memory").join("memory.failcnt")).unwrap(), "0");
        assert_eq!(cg.freezer_state().unwrap(), "THAWED");
    }

    #[test]
    fn test_oom_kill_count_and_debug_string() {
        let fake = Arc::new(FakeCgroupFs::new("/cg"));
        let mut cg = Cgroup::new(layout(&fake), "cg-1", None).unwrap();
        cg.set_mem_limit_mb(50).unwrap();
        fake.write(
            &cg.path("memory").join("memory.oom_control"),
            "oom_kill_disable 0\nunder_oom 0\noom_kill 2\n",
        )
        .unwrap();
        assert_eq!(cg.oom_kill_count().unwrap(), 2);

        let dump = cg.debug_string();
        assert!(dump.contains("OOM KILLS: 2"));
        assert!(dump.contains("of 50 MB"));
        assert!(dump.contains("FREEZE STATE: THAWED"));
    }
}
