use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::RpcError;

/// Allocator for outbound RPC ids: a monotonically increasing u64, seeded
///  randomly at startup so that a restarted process does not collide with ids
///  a peer may still hold in its buffers.
pub struct RpcIdSequence {
    next: AtomicU64,
}

impl RpcIdSequence {
    pub fn new() -> RpcIdSequence {
        RpcIdSequence {
            next: AtomicU64::new(rand::thread_rng().gen()),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RpcIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Table matching inbound response payloads to suspended callers. The lock is
///  held only around map mutation, never across I/O.
pub struct ResponseWaiters {
    waiters: Mutex<FxHashMap<u64, oneshot::Sender<Result<Vec<u8>, RpcError>>>>,
}

impl ResponseWaiters {
    pub fn new() -> ResponseWaiters {
        ResponseWaiters {
            waiters: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn register(&self, rpc_id: u64) -> oneshot::Receiver<Result<Vec<u8>, RpcError>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(rpc_id, tx);
        rx
    }

    /// Wake the caller registered for this id with the response payload.
    ///  Returns false if no caller is (still) waiting.
    pub fn fulfill(&self, rpc_id: u64, payload: Vec<u8>) -> bool {
        match self.waiters.lock().unwrap().remove(&rpc_id) {
            Some(tx) => tx.send(Ok(payload)).is_ok(),
            None => false,
        }
    }

    pub fn fail(&self, rpc_id: u64, error: RpcError) -> bool {
        match self.waiters.lock().unwrap().remove(&rpc_id) {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, rpc_id: u64) {
        self.waiters.lock().unwrap().remove(&rpc_id);
    }
}

impl Default for ResponseWaiters {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded record of RPC ids already delivered upward in one direction. Once
///  an id is recorded, re-arriving fragments for it must not cause a second
///  delivery; entries are forgotten by age and by capacity, oldest first.
///
/// Owned exclusively by the receive task, so no lock is needed.
pub struct SeenIds {
    capacity: usize,
    max_age: Duration,
    entries: FxHashMap<u64, Instant>,
    insertion_order: VecDeque<u64>,
}

impl SeenIds {
    pub fn new(capacity: usize, max_age: Duration) -> SeenIds {
        SeenIds {
            capacity,
            max_age,
            entries: FxHashMap::default(),
            insertion_order: VecDeque::new(),
        }
    }

    /// Record an id, returning true if it was not present before (i.e. the
    ///  delivery should go through).
    pub fn insert(&mut self, rpc_id: u64, now: Instant) -> bool {
        self.prune(now);

        if self.entries.contains_key(&rpc_id) {
            return false;
        }

        while self.entries.len() >= self.capacity {
            match self.insertion_order.pop_front() {
                Some(oldest) => {
                    debug!("seen-id set at capacity, forgetting id {}", oldest);
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        self.entries.insert(rpc_id, now);
        self.insertion_order.push_back(rpc_id);
        true
    }

    pub fn contains(&self, rpc_id: u64) -> bool {
        self.entries.contains_key(&rpc_id)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.insertion_order.front() {
            match self.entries.get(&oldest) {
                Some(&inserted_at) if now.duration_since(inserted_at) > self.max_age => {
                    self.insertion_order.pop_front();
                    self.entries.remove(&oldest);
                }
                Some(_) => break,
                None => {
                    // id was evicted by capacity while deeper in the queue
                    self.insertion_order.pop_front();
                }
            }
        }
    }
}
