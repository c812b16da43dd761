//! Task-aware mutex.
//!
//! Must work both before and after the scheduler is running. Before a
//! task manager exists on any core, there is exactly one execution
//! context plus ISRs that never contend for a mutex across a blocking
//! wait, so acquiring one is trivially free. After the schedulers come
//! up, contended acquires block the caller and hand the mutex to the
//! next waiter in FIFO order on release.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::sync::SpinLock;
use crate::task::list::TaskQueue;
use crate::task::{manager, TaskId};

const NO_OWNER: u32 = u32::MAX;

pub struct Mutex {
    owner: AtomicU32,
    waiting: SpinLock<TaskQueue>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(NO_OWNER),
            waiting: SpinLock::new(TaskQueue::new()),
        }
    }

    /// Acquires the mutex, blocking the calling task if it is held.
    ///
    /// Panics if the calling task already owns the mutex — this kernel's
    /// mutex is not re-entrant.
    pub fn acquire(&self) {
        let caller: TaskId = match manager::current_task_id() {
            Some(id) => id,
            None => return, // pre-scheduler: single context, always free
        };

        if self.owner.load(Ordering::Relaxed) == caller {
            panic!("mutex: task {caller} re-acquired a mutex it already holds");
        }

        if self
            .owner
            .compare_exchange(NO_OWNER, caller, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            manager::with_task(caller, |t| t.num_owned_mutexes += 1);
            return;
        }

        let mut waiters = self.waiting.lock();

        // The owner may have released between the fast-path failure above
        // and taking the wait-list lock; holding the lock here guarantees
        // the previous owner has returned from `release`.
        if self
            .owner
            .compare_exchange(NO_OWNER, caller, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            manager::with_task(caller, |t| t.num_owned_mutexes += 1);
            return;
        }

        waiters.push_back(caller);
        manager::block_current(&mut waiters);
        drop(waiters);
        manager::reschedule();
    }

    /// Releases the mutex, handing it to the longest-waiting task if any.
    pub fn release(&self) {
        let mut waiters = self.waiting.lock();
        let caller = manager::current_task_id();

        if let Some(caller_id) = caller {
            manager::lock_scheduler();
            if self.owner.load(Ordering::Relaxed) != caller_id {
                panic!("mutex: task {caller_id} released a mutex it does not own");
            }
            manager::with_task(caller_id, |t| t.num_owned_mutexes -= 1);
        }

        match waiters.pop_front() {
            Some(next) => {
                if caller.is_none() {
                    panic!("mutex: waiter present with no calling task (pre-scheduler state)");
                }
                self.owner.store(next, Ordering::Release);
                manager::with_task(next, |t| t.num_owned_mutexes += 1);
                manager::unblock(next);
            }
            None => self.owner.store(NO_OWNER, Ordering::Release),
        }

        if caller.is_some() {
            manager::unlock_scheduler();
        }
    }

    /// Returns whether the calling task currently holds the mutex.
    pub fn caller_owns(&self) -> bool {
        match manager::current_task_id() {
            Some(id) => self.owner.load(Ordering::Relaxed) == id,
            None => true,
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}
