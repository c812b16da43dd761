//! Counting semaphore with FIFO wakeup order.
//!
//! `decrease` uses a lock-free CAS loop while the count is positive, and
//! falls back to the wait-list only when it observes zero. The recheck
//! after taking the wait-list lock closes the window where `increase`
//! bumps the count between the failed CAS and the block — without it a
//! wakeup could be lost and the blocking task would sleep forever.

use core::sync::atomic::{AtomicI32, Ordering};

use crate::sync::SpinLock;
use crate::task::list::TaskQueue;
use crate::task::manager;

pub struct Semaphore {
    count: AtomicI32,
    waiting: SpinLock<TaskQueue>,
}

impl Semaphore {
    pub const fn new(initial: i32) -> Self {
        Self {
            count: AtomicI32::new(initial),
            waiting: SpinLock::new(TaskQueue::new()),
        }
    }

    /// Increments the count and wakes the longest-waiting blocked task, if any.
    pub fn increase(&self) {
        self.count.fetch_add(1, Ordering::Release);

        let mut waiters = self.waiting.lock();
        if let Some(id) = waiters.pop_front() {
            drop(waiters);
            manager::unblock(id);
        }
    }

    /// Decrements the count, blocking the calling task while it is zero.
    pub fn decrease(&self) {
        loop {
            let old = self.count.load(Ordering::Acquire);
            if old > 0 {
                if self
                    .count
                    .compare_exchange_weak(old, old - 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            let mut waiters = self.waiting.lock();
            if self.count.load(Ordering::Acquire) > 0 {
                continue;
            }
            manager::block_current(&mut waiters);
            drop(waiters);
            manager::reschedule();
        }
    }

    /// Current count. Racy unless the caller holds external synchronization;
    /// useful for diagnostics and queue-depth checks.
    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }
}
