//! Arena of live sandboxes for reference-counted teardown.
//!
//! Each slot counts one reference for the sandbox itself plus one per child
//! forked from it. A sandbox's resources are torn down only when its count
//! reaches zero, after which its parent loses one reference in turn. Parent
//! and child links are ids, so no ownership cycles exist.

use crate::config::types::{Result, SockError};
use crate::core::types::SandboxId;
use log::{debug, error};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Whatever a sandbox must give back once nothing references it.
pub trait Teardown: Send {
    fn teardown(self, id: SandboxId);
}

struct Slot<R> {
    ref_count: u32,
    parent: Option<SandboxId>,
    children: BTreeSet<SandboxId>,
    released: bool,
    parked: Option<R>,
}

pub struct Registry<R: Teardown> {
    slots: Mutex<HashMap<SandboxId, Slot<R>>>,
}

impl<R: Teardown> Default for Registry<R> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<R: Teardown> Registry<R> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SandboxId, Slot<R>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, id: SandboxId) {
        self.lock().insert(
            id,
            Slot {
                ref_count: 1,
                parent: None,
                children: BTreeSet::new(),
                released: false,
                parked: None,
            },
        );
    }

    /// Record that `child` was forked from `parent`; the parent now outlives
    /// the child.
    pub fn link(&self, parent: SandboxId, child: SandboxId) -> Result<()> {
        let mut slots = self.lock();
        match slots.get(&parent) {
            Some(slot) if !slot.released => {}
            _ => return Err(SockError::SandboxDead(format!("fork parent {} released", parent))),
        }
        let Some(child_slot) = slots.get_mut(&child) else {
            return Err(SockError::Process(format!("fork child {} not registered", child)));
        };
        if child_slot.parent.is_some() {
            return Err(SockError::Process(format!("sandbox {} already has a parent", child)));
        }
        child_slot.parent = Some(parent);

        if let Some(parent_slot) = slots.get_mut(&parent) {
            parent_slot.ref_count += 1;
            parent_slot.children.insert(child);
        }
        Ok(())
    }

    pub fn ref_count(&self, id: SandboxId) -> Option<u32> {
        self.lock().get(&id).map(|s| s.ref_count)
    }

    pub fn children(&self, id: SandboxId) -> Vec<SandboxId> {
        self.lock()
            .get(&id)
            .map(|s| s.children.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: SandboxId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Drop the sandbox's own reference, parking `resources` until the
    /// last child is gone. A second release of the same id is ignored and
    /// hands `resources` back.
    pub fn release(&self, id: SandboxId, resources: R) -> Option<R> {
        {
            let mut slots = self.lock();
            let Some(slot) = slots.get_mut(&id) else {
                return Some(resources);
            };
            if slot.released {
                return Some(resources);
            }
            slot.released = true;
            slot.parked = Some(resources);
        }
        self.drop_ref(id);
        None
    }

    /// Remove one reference from `id`, tearing down and walking up to the
    /// parent every time a count hits zero. Teardown runs without the lock.
    fn drop_ref(&self, id: SandboxId) {
        let mut next = Some(id);
        while let Some(id) = next.take() {
            let finished = {
                let mut slots = self.lock();
                let Some(slot) = slots.get_mut(&id) else {
                    error!("registry: reference dropped on unknown sandbox {}", id);
                    return;
                };
                slot.ref_count = slot.ref_count.saturating_sub(1);
                if slot.ref_count > 0 {
                    debug!("registry: sandbox {} waits on {} refs", id, slot.ref_count);
                    return;
                }
                slots.remove(&id)
            };

            let Some(slot) = finished else {
                return;
            };
            match slot.parked {
                Some(resources) => resources.teardown(id),
                None => error!("registry: sandbox {} reached zero refs unreleased", id),
            }

            if let Some(parent) = slot.parent {
                if let Some(p) = self.lock().get_mut(&parent) {
                    p.children.remove(&id);
                }
                debug!("registry: sandbox {} exited, notifying parent {}", id, parent);
                next = Some(parent);
            }
        }
    }
}
