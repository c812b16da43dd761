//! Physical Memory Manager — stack-based free-frame allocator.
//!
//! Free physical page addresses live on a stack of `u32`s, not a bitmap:
//! `push_page` drops a newly-freed frame's address on top, `pop_page`
//! takes the top one back off. No scanning is ever needed because the
//! stack only ever holds addresses that are actually free.
//!
//! The stack itself lives in a fixed-size region reserved by the linker
//! script (`ld_pmm_stack_bottom`..`ld_pmm_stack_top`), not on the heap —
//! the PMM has to work before any heap exists, since the heap is built
//! out of pages the PMM hands out.

use spin::Once;

use crate::kprintln;
use crate::memory::address::{PhysAddr, PAGE_SIZE};
use crate::sync::SpinLock;

extern "C" {
    static ld_pmm_stack_bottom: u8;
    static ld_pmm_stack_top: u8;
}

/// One region of physical memory reported by the boot loader.
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    pub base: u32,
    pub length: u32,
    pub usable: bool,
}

struct Stack {
    /// Base of the reserved stack region.
    bottom: *mut u32,
    /// One past the highest usable slot.
    capacity: usize,
    /// Number of addresses currently stored, starting from `bottom`.
    len: usize,
}

// SAFETY: all accesses to the stack go through the PMM spinlock.
unsafe impl Send for Stack {}

impl Stack {
    /// Pushes `addr` onto the stack. A full stack means there is more
    /// free physical memory than the reserved region can track; rather
    /// than panic (this can legitimately happen transiently while
    /// freeing a large contiguous run), the excess page is silently
    /// leaked back to nowhere — it simply never becomes available again.
    fn push(&mut self, addr: PhysAddr) {
        assert!(addr.is_page_aligned(), "pmm: pushed unaligned address {addr}");
        if self.len >= self.capacity {
            return;
        }
        unsafe {
            self.bottom.add(self.len).write(addr.as_u32());
        }
        self.len += 1;
    }

    /// Pops the most recently freed frame. Unlike `push`, an empty stack
    /// is a fatal condition: the kernel promised callers memory it no
    /// longer has, and there is no sane way to continue.
    fn pop(&mut self) -> PhysAddr {
        if self.len == 0 {
            panic!("pmm: out of physical memory");
        }
        self.len -= 1;
        let addr = unsafe { self.bottom.add(self.len).read() };
        PhysAddr::new(addr)
    }

    fn free_count(&self) -> usize {
        self.len
    }
}

static PMM: Once<SpinLock<Stack>> = Once::new();

/// Snapshot of physical memory usage for boot-time reporting.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub free_frames: usize,
    pub stack_capacity_frames: usize,
}

/// Initializes the PMM from the boot loader's memory map.
///
/// `reserved` lists page ranges that must never be handed out even
/// though they fall inside a `usable` region — the kernel image itself
/// and the PMM's own stack region, at minimum. Frame 0 is always
/// reserved regardless, as a null-pointer guard.
///
/// Must be called exactly once, on the bootstrap processor, before any
/// other core starts and before any allocation is requested.
pub fn init(regions: &[MemRegion], reserved: &[(PhysAddr, PhysAddr)]) {
    let bottom = unsafe { core::ptr::addr_of!(ld_pmm_stack_bottom) as *mut u32 };
    let top = unsafe { core::ptr::addr_of!(ld_pmm_stack_top) as usize };
    let capacity = (top - bottom as usize) / core::mem::size_of::<u32>();

    assert!(PMM.get().is_none(), "pmm: init called more than once");

    let mut stack = Stack { bottom, capacity, len: 0 };

    for region in regions {
        if !region.usable {
            continue;
        }
        let start_frame = region.base.div_ceil(PAGE_SIZE);
        let end_frame = (region.base + region.length) / PAGE_SIZE;

        for frame in start_frame..end_frame {
            let addr = PhysAddr::new(frame * PAGE_SIZE);
            if addr.is_zero() {
                continue;
            }
            if reserved.iter().any(|&(lo, hi)| addr >= lo && addr < hi) {
                continue;
            }
            stack.push(addr);
        }
    }

    kprintln!(
        "[pmm] {} free frames tracked ({} MiB), stack capacity {} frames",
        stack.free_count(),
        stack.free_count() as u64 * PAGE_SIZE as u64 / 1024 / 1024,
        stack.capacity,
    );

    PMM.call_once(|| SpinLock::new(stack));
}

/// Pops one free physical page off the stack.
///
/// # Panics
/// If the PMM is uninitialized, or if physical memory is exhausted.
pub fn pop_page() -> PhysAddr {
    PMM.get().expect("pmm: not initialized").lock().pop()
}

/// Pushes a physical page back onto the free stack.
///
/// # Panics
/// If the PMM is uninitialized, or if `addr` is not page-aligned.
pub fn push_page(addr: PhysAddr) {
    PMM.get().expect("pmm: not initialized").lock().push(addr);
}

/// Pops a single page and zeroes it, identity-mapped view assumed.
pub fn pop_page_zeroed() -> PhysAddr {
    let addr = pop_page();
    unsafe {
        core::ptr::write_bytes(addr.to_virt().as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
    }
    addr
}

/// Returns a snapshot of current physical memory usage.
pub fn stats() -> MemoryStats {
    let stack = PMM.get().expect("pmm: not initialized").lock();
    MemoryStats {
        free_frames: stack.free_count(),
        stack_capacity_frames: stack.capacity,
    }
}
