//! Memory-pressure evictor for one sandbox pool
//!
//! The evictor only watches lifecycle events and the pool's free memory; it
//! never looks inside a sandbox. Each sandbox it has heard of sits in exactly
//! one of three queues (running, paused, evicting), in event order. After
//! every batch of events, and at least once per period, it tries to keep
//! [`FREE_SANDBOXES_GOAL`] sandbox slots free by destroying paused sandboxes,
//! oldest first, and as a last resort the oldest running one.

use crate::config::types::Result;
use crate::core::memory::MemoryPool;
use crate::core::types::SandboxId;
use crate::sandbox::events::{EventKind, SandboxEvent};
use crate::sandbox::{SafeSandbox, SandboxPool};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Sandboxes the pool should be able to start at any moment.
pub const FREE_SANDBOXES_GOAL: i64 = 8;
pub const CONCURRENT_EVICTIONS: i64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Queue {
    Running,
    Paused,
    Evicting,
}

/// What one policy run decided.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    pub from_paused: usize,
    pub running_victim: bool,
}

/// Pure eviction policy.
pub fn plan_evictions(free_slots: i64, paused: usize, running: usize, evicting: usize) -> EvictionPlan {
    let need = (FREE_SANDBOXES_GOAL - free_slots).min(CONCURRENT_EVICTIONS - evicting as i64);
    let from_paused = need.max(0).min(paused as i64) as usize;
    let running_victim = free_slots <= 0 && evicting == 0 && from_paused == 0 && running > 0;
    EvictionPlan {
        from_paused,
        running_victim,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvictorStats {
    pub running: usize,
    pub paused: usize,
    pub evicting: usize,
    pub evicted: u64,
}

#[derive(Default)]
struct Queues {
    running: VecDeque<SafeSandbox>,
    paused: VecDeque<SafeSandbox>,
    evicting: VecDeque<SafeSandbox>,
    location: HashMap<SandboxId, Queue>,
    evicted: u64,
}

impl Queues {
    fn queue(&mut self, q: Queue) -> &mut VecDeque<SafeSandbox> {
        match q {
            Queue::Running => &mut self.running,
            Queue::Paused => &mut self.paused,
            Queue::Evicting => &mut self.evicting,
        }
    }

    /// Move to `target`, or forget the sandbox when `target` is `None`.
    /// Nothing leaves the evicting queue except by being forgotten.
    fn move_to(&mut self, sb: SafeSandbox, target: Option<Queue>) {
        let id = sb.id();
        if let Some(prev) = self.location.get(&id).copied() {
            if prev == Queue::Evicting && target.is_some() {
                return;
            }
            self.queue(prev).retain(|s| s.id() != id);
            self.location.remove(&id);
        }
        if let Some(target) = target {
            self.queue(target).push_back(sb);
            self.location.insert(id, target);
        }
    }

    fn apply(&mut self, ev: SandboxEvent) {
        let target = match ev.kind {
            EventKind::Create | EventKind::Unpause => Some(Queue::Running),
            EventKind::Pause => Some(Queue::Paused),
            EventKind::Destroy => None,
            EventKind::DestroyIgnored | EventKind::Fork => return,
        };
        self.move_to(ev.sandbox, target);
    }

    fn evict_front(&mut self, from: Queue) {
        let Some(sb) = self.queue(from).pop_front() else {
            return;
        };
        self.location.remove(&sb.id());
        info!("evictor: evicting {:?} sandbox {}", from, sb.id());

        let victim = sb.clone();
        let spawned = thread::Builder::new()
            .name(format!("evict-{}", sb.id()))
            .spawn(move || victim.destroy_with_reason("evicted"));
        if let Err(e) = spawned {
            warn!("evictor: no thread for sandbox {} ({}), destroying inline", sb.id(), e);
            sb.destroy_with_reason("evicted");
        }
        self.evicted += 1;
        self.move_to(sb, Some(Queue::Evicting));
    }

    fn run_policy(&mut self, mem: &MemoryPool, slot_mb: u64) {
        let available = match mem.available_mb() {
            Ok(mb) => mb,
            Err(e) => {
                error!("evictor: {}", e);
                return;
            }
        };
        let free_slots = available / slot_mb.max(1) as i64;
        let plan = plan_evictions(
            free_slots,
            self.paused.len(),
            self.running.len(),
            self.evicting.len(),
        );
        for _ in 0..plan.from_paused {
            self.evict_front(Queue::Paused);
        }
        if plan.running_victim {
            self.evict_front(Queue::Running);
        }
    }

    fn stats(&self) -> EvictorStats {
        EvictorStats {
            running: self.running.len(),
            paused: self.paused.len(),
            evicting: self.evicting.len(),
            evicted: self.evicted,
        }
    }
}

pub struct Evictor {
    quit: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Mutex<EvictorStats>>,
}

impl Evictor {
    /// Subscribe to `pool` and start the policy thread. `slot_mb` is the
    /// default sandbox memory size; `period` bounds the time between policy
    /// runs when no events arrive.
    pub fn start(pool: &dyn SandboxPool, slot_mb: u64, period: Duration) -> Result<Self> {
        let (events_tx, events_rx) = unbounded::<SandboxEvent>();
        pool.add_listener(Arc::new(move |ev: &SandboxEvent| {
            let _ = events_tx.send(ev.clone());
        }));

        let (quit_tx, quit_rx) = bounded(1);
        let stats = Arc::new(Mutex::new(EvictorStats::default()));
        let mem = pool.memory().clone();
        let task_stats = stats.clone();
        let worker = thread::Builder::new()
            .name(format!("evictor-{}", pool.name()))
            .spawn(move || run(events_rx, quit_rx, mem, slot_mb, period, task_stats))?;

        info!("evictor: watching pool {} (slot {} MB)", pool.name(), slot_mb);
        Ok(Self {
            quit: Mutex::new(Some(quit_tx)),
            worker: Mutex::new(Some(worker)),
            stats,
        })
    }

    pub fn stats(&self) -> EvictorStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop the policy thread. Evictions already started run to completion.
    pub fn shutdown(&self) {
        let quit = self.quit.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(quit) = quit {
            let _ = quit.send(());
        }
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("evictor: policy thread panicked");
            }
        }
    }
}

impl Drop for Evictor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    events: Receiver<SandboxEvent>,
    quit: Receiver<()>,
    mem: MemoryPool,
    slot_mb: u64,
    period: Duration,
    stats: Arc<Mutex<EvictorStats>>,
) {
    let mut queues = Queues::default();
    loop {
        select! {
            recv(events) -> ev => match ev {
                Ok(ev) => {
                    queues.apply(ev);
                    while let Ok(ev) = events.try_recv() {
                        queues.apply(ev);
                    }
                }
                Err(_) => return,
            },
            recv(quit) -> _ => {
                debug!("evictor: stopping with {:?}", queues.stats());
                return;
            }
            default(period) => {}
        }
        queues.run_policy(&mem, slot_mb);
        *stats.lock().unwrap_or_else(|e| e.into_inner()) = queues.stats();
    }
}
