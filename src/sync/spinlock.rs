// =============================================================================
// Spinlock
// =============================================================================
//
// A single atomic flag. To lock: spin on `compare_exchange` until we flip
// the flag from free to held. To unlock: clear the flag. No ticket, no
// queue — whichever core notices the flag go free first gets it next.
//
// This kernel has no workload where lock-acquire fairness matters more
// than the cost of tracking it, so the extra bookkeeping a ticket lock
// needs is not worth carrying.
//
// IRQ SAFETY:
//   Acquiring a spinlock must disable interrupts on the current core first.
//   Otherwise a handler that fires while we hold the lock and then tries to
//   take the same lock spins forever waiting for code that can't run until
//   the handler returns. We save the prior interrupt-enabled state and
//   restore it exactly on unlock, so nested lock/unlock pairs compose.
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A test-and-set spinlock that disables interrupts while held.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, disabling interrupts on the current core.
    ///
    /// Spins with a `pause` hint while contended. Interrupts are disabled
    /// before the first acquire attempt and restored to their prior state
    /// when the returned guard is dropped.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irq_was_enabled = interrupts_enabled();
        disable_interrupts();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinLockGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Useful in interrupt handlers, where spinning on a lock the
    /// interrupted code might hold would deadlock.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irq_was_enabled = interrupts_enabled();
        disable_interrupts();

        match self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Some(SpinLockGuard {
                lock: self,
                irq_was_enabled,
            }),
            Err(_) => {
                if irq_was_enabled {
                    enable_interrupts();
                }
                None
            }
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Safe because `&mut self` already guarantees exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for a held spinlock. Dropping releases the flag and restores
/// the interrupt state captured at acquire time.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    irq_was_enabled: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if self.irq_was_enabled {
            enable_interrupts();
        }
    }
}

/// Reads EFLAGS.IF to determine whether interrupts are currently enabled
/// on this core.
#[inline(always)]
fn interrupts_enabled() -> bool {
    let eflags: u32;
    unsafe {
        core::arch::asm!(
            "pushfd",
            "pop {}",
            out(reg) eflags,
            options(nomem, preserves_flags)
        );
    }
    eflags & (1 << 9) != 0
}

#[inline(always)]
fn disable_interrupts() {
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

#[inline(always)]
fn enable_interrupts() {
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}
