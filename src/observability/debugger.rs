//! Cross-pool sandbox dump.
//!
//! One thread owns the set of live sandboxes, fed by lifecycle events from
//! every registered pool. Dumps snapshot that set and render it on the
//! caller's thread, so a sandbox stuck behind its own lock cannot wedge the
//! event loop. Pools that do not share an id generator may reuse ids, so
//! entries are keyed by id and pool.

use crate::config::types::{Result, SockError};
use crate::core::types::SandboxId;
use crate::sandbox::events::{EventKind, SandboxEvent};
use crate::sandbox::{SafeSandbox, SandboxPool};
use crossbeam_channel::{bounded, unbounded, Sender};
use log::{debug, error};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const DUMP_WAIT: Duration = Duration::from_secs(5);

/// Index of the pool in the list passed to [`Debugger::start`].
type PoolIndex = usize;

enum Message {
    Event(PoolIndex, SandboxEvent),
    Dump(Sender<Vec<SafeSandbox>>),
    Quit,
}

pub struct Debugger {
    tx: Sender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Debugger {
    pub fn start(pools: &[&dyn SandboxPool]) -> Result<Self> {
        let (tx, rx) = unbounded::<Message>();
        for (index, pool) in pools.iter().enumerate() {
            let events = tx.clone();
            pool.add_listener(Arc::new(move |ev: &SandboxEvent| {
                let _ = events.send(Message::Event(index, ev.clone()));
            }));
        }

        let worker = thread::Builder::new()
            .name("sandbox-debugger".into())
            .spawn(move || {
                let mut live: BTreeMap<(SandboxId, PoolIndex), SafeSandbox> = BTreeMap::new();
                while let Ok(msg) = rx.recv() {
                    match msg {
                        Message::Event(pool, ev) => match ev.kind {
                            EventKind::Create => {
                                live.insert((ev.id(), pool), ev.sandbox);
                            }
                            EventKind::Destroy => {
                                live.remove(&(ev.id(), pool));
                            }
                            _ => {}
                        },
                        Message::Dump(reply) => {
                            let _ = reply.send(live.values().cloned().collect());
                        }
                        Message::Quit => break,
                    }
                }
                debug!("debugger: stopped with {} sandboxes tracked", live.len());
            })?;

        Ok(Self {
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Live sandboxes in id order.
    pub fn sandboxes(&self) -> Result<Vec<SafeSandbox>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Message::Dump(reply_tx))
            .map_err(|_| SockError::PoolClosed("debugger".into()))?;
        reply_rx
            .recv_timeout(DUMP_WAIT)
            .map_err(|_| SockError::PoolClosed("debugger".into()))
    }

    pub fn dump(&self) -> String {
        match self.sandboxes() {
            Ok(all) => all
                .iter()
                .map(|sb| format!("{}--------\n", sb.debug_string()))
                .collect(),
            Err(e) => format!("debugger unavailable: {}\n", e),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Message::Quit);
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("debugger: thread panicked");
            }
        }
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{IdGen, SandboxMeta};
    use crate::sandbox::{Registry, SandboxSpec};
    use crate::testing::{MockPool, MockResources};

    #[test]
    fn test_tracks_sandboxes_across_pools() {
        let ids = Arc::new(IdGen::new());
        let registry: Arc<Registry<MockResources>> = Arc::new(Registry::new());
        let a = MockPool::with_options("a", 200, 50, false, ids.clone(), registry.clone()).unwrap();
        let b = MockPool::with_options("b", 200, 50, false, ids, registry).unwrap();
        let debugger = Debugger::start(&[&a, &b]).unwrap();

        let x = a.create(None, SandboxSpec::zygote(SandboxMeta::default())).unwrap();
        let y = b.create(None, SandboxSpec::leaf("/c", SandboxMeta::default())).unwrap();
        let z = a.create(None, SandboxSpec::leaf("/c", SandboxMeta::default())).unwrap();
        let ids: Vec<_> = debugger.sandboxes().unwrap().iter().map(|sb| sb.id()).collect();
        let mut expected = vec![x.id(), y.id(), z.id()];
        expected.sort();
        assert_eq!(ids, expected);

        y.destroy();
        let ids: Vec<_> = debugger.sandboxes().unwrap().iter().map(|sb| sb.id()).collect();
        assert!(!ids.contains(&y.id()));
        assert_eq!(ids.len(), 2);

        let dump = debugger.dump();
        assert_eq!(dump.matches("--------\n").count(), 2);
        debugger.shutdown();
        debugger.shutdown();
    }

    #[test]
    fn test_pools_with_overlapping_ids_are_kept_apart() {
        let a = MockPool::new(200, 50).unwrap();
        let b = MockPool::new(200, 50).unwrap();
        let debugger = Debugger::start(&[&a, &b]).unwrap();

        let x = a.create(None, SandboxSpec::leaf("/c", SandboxMeta::default())).unwrap();
        let y = b.create(None, SandboxSpec::leaf("/c", SandboxMeta::default())).unwrap();
        assert_eq!(x.id(), y.id());
        assert_eq!(debugger.sandboxes().unwrap().len(), 2);

        x.destroy();
        let left = debugger.sandboxes().unwrap();
        assert_eq!(left.len(), 1);
        assert!(left[0].same_as(&y));
        debugger.shutdown();
    }

    #[test]
    fn test_dump_after_shutdown() {
        let pool = MockPool::new(100, 50).unwrap();
        let debugger = Debugger::start(&[&pool]).unwrap();
        debugger.shutdown();
        assert!(debugger.sandboxes().is_err());
        assert!(debugger.dump().starts_with("debugger unavailable"));
    }
}
