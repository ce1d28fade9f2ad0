//! Background producer of ready-to-use cgroups.

use crate::config::types::{Result, SockError};
use crate::kernel::cgroup::v1::{Cgroup, CgroupLayout};
use crossbeam_channel::{bounded, Receiver, Select, Sender};
use log::{debug, error, info, warn};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Capacity of both the ready and the recycled queue.
pub const CGROUP_RESERVE: usize = 16;

pub struct CgroupPool {
    layout: Arc<CgroupLayout>,
    ready: Receiver<Result<Cgroup>>,
    quit: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CgroupPool {
    /// Create the pool's group directory in every controller and start the
    /// producer thread. Recycling is enabled by `reuse`.
    pub fn new(layout: CgroupLayout, reuse: bool) -> Result<Self> {
        let layout = Arc::new(layout);
        for controller in &layout.controllers {
            let dir = layout.group_dir(controller);
            match layout.fs.create_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    warn!("cgroup pool {}: reusing existing {}", layout.group, dir.display());
                }
                Err(e) => {
                    return Err(SockError::Cgroup(format!(
                        "Failed to create {}: {}",
                        dir.display(),
                        e
                    )))
                }
            }
        }

        let (ready_tx, ready_rx) = bounded(CGROUP_RESERVE);
        let (recycled_tx, recycled_rx) = bounded(CGROUP_RESERVE);
        let (quit_tx, quit_rx) = bounded(1);

        let task_layout = layout.clone();
        let recycle = reuse.then_some(recycled_tx);
        let worker = thread::Builder::new()
            .name(format!("cg-{}", layout.group))
            .spawn(move || produce(task_layout, ready_tx, recycle, recycled_rx, quit_rx))?;

        info!(
            "cgroup pool {}: started (reuse={}, controllers={:?})",
            layout.group, reuse, layout.controllers
        );

        Ok(Self {
            layout,
            ready: ready_rx,
            quit: Mutex::new(Some(quit_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn layout(&self) -> &Arc<CgroupLayout> {
        &self.layout
    }

    /// Take a cgroup and apply the per-sandbox memory and CPU caps.
    pub fn get(&self, mem_limit_mb: u64, cpu_percent: u64) -> Result<Cgroup> {
        let mut cg = self
            .ready
            .recv()
            .map_err(|_| SockError::PoolClosed(format!("cgroup pool {}", self.layout.group)))??;

        let configured = cg
            .set_mem_limit_mb(mem_limit_mb)
            .and_then(|_| cg.set_cpu_percent(cpu_percent));
        if let Err(e) = configured {
            cg.destroy();
            return Err(e);
        }
        Ok(cg)
    }

    /// Stop the producer, destroy every queued cgroup and remove the group
    /// directories. Idempotent.
    pub fn shutdown(&self) {
        let quit = self.quit.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(quit) = quit else {
            return;
        };
        let _ = quit.send(());

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("cgroup pool {}: producer panicked", self.layout.group);
            }
        }

        for cg in self.ready.try_iter() {
            if let Ok(cg) = cg {
                cg.destroy();
            }
        }

        for controller in &self.layout.controllers {
            let dir = self.layout.group_dir(controller);
            let mut removed = false;
            for _ in 0..100 {
                if self.layout.fs.remove_dir(&dir).is_ok() || !self.layout.fs.exists(&dir) {
                    removed = true;
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
            if !removed {
                error!("cgroup pool {}: could not remove {}", self.layout.group, dir.display());
            }
        }
        info!("cgroup pool {}: shut down", self.layout.group);
    }
}

impl Drop for CgroupPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn produce(
    layout: Arc<CgroupLayout>,
    ready: Sender<Result<Cgroup>>,
    recycle: Option<Sender<Cgroup>>,
    recycled: Receiver<Cgroup>,
    quit: Receiver<()>,
) {
    let mut next_id: u64 = 0;

    loop {
        let item = match recycled.try_recv() {
            Ok(mut cg) => match cg.reset() {
                Ok(()) => {
                    debug!("cgroup pool {}: recycled {}", layout.group, cg.name());
                    Ok(cg)
                }
                Err(e) => {
                    warn!("cgroup pool {}: dropping {}: {}", layout.group, cg.name(), e);
                    cg.destroy();
                    continue;
                }
            },
            Err(_) => {
                next_id += 1;
                Cgroup::new(layout.clone(), &format!("cg-{}", next_id), recycle.clone())
            }
        };

        // Select rather than select! so the cgroup is still in hand if quit
        // wins the race.
        let mut sel = Select::new();
        let send_idx = sel.send(&ready);
        let quit_idx = sel.recv(&quit);
        let oper = sel.select();
        match oper.index() {
            i if i == send_idx => {
                if let Err(e) = oper.send(&ready, item) {
                    if let Ok(cg) = e.into_inner() {
                        cg.destroy();
                    }
                    break;
                }
            }
            i if i == quit_idx => {
                let _ = oper.recv(&quit);
                if let Ok(cg) = item {
                    cg.destroy();
                }
                break;
            }
            _ => unreachable!(),
        }
    }

    drop(recycle);
    for cg in recycled.try_iter() {
        cg.destroy();
    }
    debug!("cgroup pool {}: producer exited", layout.group);
}
