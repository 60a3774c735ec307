//! Single-slot, overwrite-on-put handoff between two threads.
//!
//! Control data is only useful while fresh, so the slot never queues: a
//! `put` replaces whatever the consumer has not taken yet.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
    overwritten: AtomicU64,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
            overwritten: AtomicU64::new(0),
        }
    }

    /// Stores `value` and wakes a waiting consumer. Returns the unconsumed
    /// value it replaced, if any.
    pub fn put(&self, value: T) -> Option<T> {
        let prev = {
            let mut slot = self.slot.lock();
            slot.replace(value)
        };
        if prev.is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        prev
    }

    /// Blocks until a value is present or `timeout` elapses. A timeout too
    /// large to express as a deadline waits without one.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = self.slot.lock();
        while slot.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
                None => self.ready.wait(&mut slot),
            }
        }
        slot.take()
    }

    pub fn pop_nowait(&self) -> Option<T> {
        self.slot.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Values discarded by a `put` before anyone consumed them.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
