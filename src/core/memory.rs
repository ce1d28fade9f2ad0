//! Memory accounting gate.
//!
//! One thread owns the pool's arithmetic. Callers send signed deltas over a
//! bounded channel: releases (and zero-sized probes) are answered at once,
//! acquisitions wait in strict FIFO order until the head of the queue fits.

use crate::config::types::{Result, SockError};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

const REQUEST_QUEUE: usize = 32;

struct MemRequest {
    delta_mb: i64,
    reply: Sender<i64>,
}

/// Cloneable handle onto a memory pool thread. The thread exits once every
/// handle is dropped.
#[derive(Clone)]
pub struct MemoryPool {
    name: Arc<str>,
    total_mb: u64,
    requests: Sender<MemRequest>,
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("total_mb", &self.total_mb)
            .finish()
    }
}

impl MemoryPool {
    pub fn new(name: &str, total_mb: u64) -> Result<Self> {
        let (tx, rx) = bounded(REQUEST_QUEUE);
        let thread_name = format!("mem-{}", name);
        let owner = name.to_string();
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || serve(owner, total_mb as i64, rx))?;
        info!("mem pool {}: {} MB", name, total_mb);
        Ok(Self {
            name: Arc::from(name),
            total_mb,
            requests: tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_mb(&self) -> u64 {
        self.total_mb
    }

    /// Queue a signed adjustment and return the channel its answer arrives
    /// on. The answer is the pool's free memory right after the adjustment.
    pub fn submit(&self, delta_mb: i64) -> Result<Receiver<i64>> {
        let (reply, rx) = bounded(1);
        self.requests
            .send(MemRequest { delta_mb, reply })
            .map_err(|_| SockError::PoolClosed(format!("mem pool {} stopped", self.name)))?;
        Ok(rx)
    }

    fn adjust(&self, delta_mb: i64) -> Result<i64> {
        self.submit(delta_mb)?
            .recv()
            .map_err(|_| SockError::PoolClosed(format!("mem pool {} stopped", self.name)))
    }

    /// Block until `mb` fits in the budget, then charge it.
    ///
    /// # Panics
    ///
    /// If `mb` exceeds the whole budget, since such a request could never be
    /// granted and would stall every acquirer queued behind it.
    pub fn acquire(&self, mb: u64) -> Result<()> {
        if mb > self.total_mb {
            panic!(
                "mem pool {}: request for {} MB exceeds total budget of {} MB",
                self.name, mb, self.total_mb
            );
        }
        let left = self.adjust(-(mb as i64))?;
        debug!("mem pool {}: acquired {} MB, {} MB left", self.name, mb, left);
        Ok(())
    }

    pub fn release(&self, mb: u64) -> Result<()> {
        let left = self.adjust(mb as i64)?;
        debug!("mem pool {}: released {} MB, {} MB free", self.name, mb, left);
        Ok(())
    }

    /// Zero-delta probe; never blocks behind waiting acquirers.
    pub fn available_mb(&self) -> Result<i64> {
        self.adjust(0)
    }
}

fn serve(name: String, mut available: i64, requests: Receiver<MemRequest>) {
    let mut waiting: VecDeque<MemRequest> = VecDeque::new();

    for req in requests.iter() {
        if req.delta_mb >= 0 {
            available += req.delta_mb;
            let _ = req.reply.send(available);
        } else {
            waiting.push_back(req);
        }

        while let Some(head) = waiting.front() {
            if available + head.delta_mb < 0 {
                break;
            }
            if let Some(head) = waiting.pop_front() {
                available += head.delta_mb;
                // A dropped receiver means the acquirer gave up; the charge
                // still stands and is returned by whoever owns it.
                let _ = head.reply.send(available);
            }
        }
    }

    debug!("mem pool {}: stopped with {} MB free", name, available);
}
