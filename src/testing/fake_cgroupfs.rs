/// In-memory cgroup v1 hierarchy
///
/// Models the parts of the kernel's cgroupfs the engine relies on: control
/// files seeded on mkdir, page-rounded memory limits, a task living in exactly
/// one node per controller, and rmdir refusing non-empty nodes.
use crate::kernel::cgroup::fs::CgroupFs;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const PAGE: u64 = 4096;

const SEEDED_FILES: [(&str, &str); 12] = [
    ("tasks", ""),
    ("cgroup.procs", ""),
    ("freezer.state", "THAWED"),
    ("memory.limit_in_bytes", "9223372036854771712"),
    ("memory.usage_in_bytes", "0"),
    ("memory.failcnt", "0"),
    ("memory.swappiness", "60"),
    ("memory.oom_control", "oom_kill_disable 0\nunder_oom 0\noom_kill 0\n"),
    ("pids.max", "max"),
    ("cpu.cfs_period_us", "100000"),
    ("cpu.cfs_quota_us", "-1"),
    ("notify_on_release", "0"),
];

#[derive(Debug, Default)]
struct FakeState {
    dirs: BTreeSet<PathBuf>,
    files: HashMap<PathBuf, String>,
    hung_freezers: HashSet<PathBuf>,
    /// tasks file -> (pid, reads to let pass before it appears)
    late_tasks: HashMap<PathBuf, Vec<(i32, usize)>>,
}

impl FakeState {
    fn tasks(&self, dir: &Path) -> Vec<i32> {
        self.files
            .get(&dir.join("tasks"))
            .map(|s| s.lines().filter_map(|l| l.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    fn set_tasks(&mut self, dir: &Path, pids: &[i32]) {
        let body: String = pids.iter().map(|p| format!("{}\n", p)).collect();
        self.files.insert(dir.join("tasks"), body);
    }

    fn remove_task_where<F: Fn(&Path) -> bool>(&mut self, pid: i32, scope: F) {
        let dirs: Vec<PathBuf> = self.dirs.iter().filter(|d| scope(d)).cloned().collect();
        for dir in dirs {
            let mut pids = self.tasks(&dir);
            if let Some(pos) = pids.iter().position(|p| *p == pid) {
                pids.remove(pos);
                self.set_tasks(&dir, &pids);
            }
        }
    }
}

#[derive(Debug)]
pub struct FakeCgroupFs {
    root: PathBuf,
    state: Mutex<FakeState>,
}

impl FakeCgroupFs {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn controller_dir(&self, path: &Path) -> Option<PathBuf> {
        let rel = path.strip_prefix(&self.root).ok()?;
        rel.components().next().map(|c| self.root.join(c))
    }

    /// Raw contents of a control file.
    pub fn file(&self, path: &Path) -> Option<String> {
        self.lock().files.get(path).map(|s| s.trim().to_string())
    }

    pub fn tasks(&self, dir: &Path) -> Vec<i32> {
        self.lock().tasks(dir)
    }

    /// Every directory at or below `path`.
    pub fn dirs_under(&self, path: &Path) -> Vec<PathBuf> {
        self.lock()
            .dirs
            .iter()
            .filter(|d| d.starts_with(path))
            .cloned()
            .collect()
    }

    pub fn set_usage_bytes(&self, memory_dir: &Path, bytes: u64) {
        self.lock()
            .files
            .insert(memory_dir.join("memory.usage_in_bytes"), bytes.to_string());
    }

    /// Writes to this node's freezer.state are accepted but never take effect.
    pub fn hang_freezer(&self, freezer_dir: &Path) {
        self.lock().hung_freezers.insert(freezer_dir.to_path_buf());
    }

    /// Make `pid` join `dir` on the second read of its tasks file after this
    /// call, like a helper thread started shortly after a fork.
    pub fn spawn_on_read(&self, dir: &Path, pid: i32) {
        self.lock()
            .late_tasks
            .entry(dir.join("tasks"))
            .or_default()
            .push((pid, 1));
    }

    fn attach(&self, state: &mut FakeState, dir: &Path, pid: i32) {
        if let Some(controller) = self.controller_dir(dir) {
            state.remove_task_where(pid, |d| d.starts_with(&controller));
        }
        let mut pids = state.tasks(dir);
        pids.push(pid);
        state.set_tasks(dir, &pids);
    }
}

impl CgroupFs for FakeCgroupFs {
    fn create_dir(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        if state.dirs.contains(path) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        state.dirs.insert(path.to_path_buf());
        for (name, value) in SEEDED_FILES {
            state.files.insert(path.join(name), value.to_string());
        }
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        if !state.dirs.contains(path) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        let has_children = state
            .dirs
            .iter()
            .any(|d| d != path && d.starts_with(path));
        if has_children || !state.tasks(path).is_empty() {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        state.dirs.remove(path);
        state.files.retain(|f, _| f.parent() != Some(path));
        state.hung_freezers.remove(path);
        Ok(())
    }

    fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        let mut state = self.lock();
        let dir = path
            .parent()
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?
            .to_path_buf();
        if !state.files.contains_key(path) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        let value = contents.trim();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        match name {
            "tasks" | "cgroup.procs" => {
                let pid: i32 = value
                    .parse()
                    .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
                self.attach(&mut state, &dir, pid);
            }
            "freezer.state" => {
                if !state.hung_freezers.contains(&dir) {
                    state.files.insert(path.to_path_buf(), value.to_string());
                }
            }
            "memory.limit_in_bytes" => {
                let bytes: u64 = value
                    .parse()
                    .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
                let rounded = bytes.div_ceil(PAGE) * PAGE;
                state.files.insert(path.to_path_buf(), rounded.to_string());
            }
            _ => {
                state.files.insert(path.to_path_buf(), value.to_string());
            }
        }
        Ok(())
    }

    fn read(&self, path: &Path) -> io::Result<String> {
        let mut state = self.lock();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        if name == "tasks" || name == "cgroup.procs" {
            let tasks_file = dir.join("tasks");
            let mut due = Vec::new();
            if let Some(pending) = state.late_tasks.get_mut(&tasks_file) {
                pending.retain_mut(|(pid, skip)| {
                    if *skip == 0 {
                        due.push(*pid);
                        false
                    } else {
                        *skip -= 1;
                        true
                    }
                });
            }
            for pid in due {
                self.attach(&mut state, &dir, pid);
            }
            return state
                .files
                .get(&tasks_file)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound));
        }

        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.lock();
        state.dirs.contains(path) || state.files.contains_key(path)
    }

    /// Writes through the returned descriptor go nowhere; only its
    /// existence is modelled.
    fn open_write(&self, path: &Path) -> io::Result<File> {
        if !self.lock().files.contains_key(path) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        OpenOptions::new().write(true).open("/dev/null")
    }

    fn kill(&self, pid: i32) -> io::Result<()> {
        self.lock().remove_task_where(pid, |_| true);
        Ok(())
    }
}
