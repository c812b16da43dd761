// =============================================================================
// Kernel Synchronization Primitives
// =============================================================================
//
// Bare-metal primitives for a multi-core, interrupt-driven kernel — no
// std::sync here. Three layers, each built on the one below:
//
//   spinlock.rs  — Spinlock: a single atomic flag, IRQ-safe, non-fair.
//   mutex.rs     — Mutex: CAS fast path, wait-list slow path, FIFO hand-off.
//   semaphore.rs — Semaphore: counting, FIFO wake order, double-check decrease.
//
// Lock ordering: spinlocks protecting a single data structure (free list,
// wait-list, all-tasks list) are always the innermost lock held. Never
// acquire a spinlock while holding a Mutex's wait-list lock across a
// reschedule — the slow paths below release the spinlock before yielding
// for exactly this reason.
// =============================================================================

pub mod mutex;
pub mod semaphore;
pub mod spinlock;

pub use mutex::Mutex;
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
