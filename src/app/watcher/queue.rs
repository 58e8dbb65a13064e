use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::app::models::DumpSnapshot;

/// Bounded handoff between dump producers and analyzers. A full queue blocks
/// the producer (backpressure) instead of dropping snapshots; the only way a
/// snapshot is abandoned is the producer observing `cancelled` while waiting.
pub struct SnapshotQueue {
    capacity: usize,
    inner: Mutex<VecDeque<DumpSnapshot>>,
    space: Condvar,
    items: Condvar,
}

impl SnapshotQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::new()),
            space: Condvar::new(),
            items: Condvar::new(),
        }
    }

    /// Blocks while the queue is full. Returns false if `cancelled` flipped
    /// before space opened up; the snapshot is dropped in that case. The
    /// wait re-checks the flag on a short period since cancellation does not
    /// signal the condvar.
    pub fn offer(&self, snapshot: DumpSnapshot, cancelled: &AtomicBool) -> bool {
        let mut guard = self.inner.lock().expect("snapshot queue poisoned");
        while guard.len() >= self.capacity {
            if cancelled.load(Ordering::Acquire) {
                return false;
            }
            let (next, _) = self
                .space
                .wait_timeout(guard, Duration::from_millis(50))
                .expect("snapshot queue poisoned");
            guard = next;
        }
        guard.push_back(snapshot);
        self.items.notify_one();
        true
    }

    /// Waits up to `timeout` for a snapshot.
    pub fn poll(&self, timeout: Duration) -> Option<DumpSnapshot> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().expect("snapshot queue poisoned");
        loop {
            if let Some(snapshot) = guard.pop_front() {
                self.space.notify_one();
                return Some(snapshot);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .items
                .wait_timeout(guard, deadline - now)
                .expect("snapshot queue poisoned");
            guard = next;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("snapshot queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
