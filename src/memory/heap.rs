//! Kernel heap allocator.
//!
//! First-fit, address-sorted free-list allocator over a fixed-size
//! virtual region. The region is built by popping individual pages off
//! the PMM's free stack and mapping each one into KVAS at a consecutive
//! virtual address starting at [`config::HEAP_VIRT_START`] — the
//! backing physical pages need not themselves be contiguous, only their
//! virtual mapping is.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::config::{HEAP_PAGES, HEAP_VIRT_START};
use crate::kprintln;
use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::{pmm, vmm};
use crate::sync::SpinLock;

/// Minimum block size: must be at least `size_of::<FreeBlock>()` so that
/// every free region can hold the linked-list node header.
const MIN_BLOCK_SIZE: usize = core::mem::size_of::<FreeBlock>();

/// Header stored at the beginning of each free block in the heap.
#[repr(C)]
struct FreeBlock {
    /// Total size of this free block in bytes (including the header).
    size: usize,
    /// Pointer to the next free block, or null if this is the last one.
    next: *mut FreeBlock,
}

/// The internal heap state: a sorted linked list of free blocks.
struct Heap {
    free_list: *mut FreeBlock,
    heap_start: usize,
    heap_end: usize,
    allocated_bytes: usize,
    total_bytes: usize,
}

// SAFETY: the heap's pointers are only accessed while holding the SpinLock.
unsafe impl Send for Heap {}

impl Heap {
    const fn new() -> Self {
        Self {
            free_list: ptr::null_mut(),
            heap_start: 0,
            heap_end: 0,
            allocated_bytes: 0,
            total_bytes: 0,
        }
    }

    fn init(&mut self, start: usize, size: usize) {
        assert!(size >= MIN_BLOCK_SIZE, "heap: region too small");
        assert!(
            start % core::mem::align_of::<FreeBlock>() == 0,
            "heap: start must be aligned to FreeBlock alignment"
        );

        self.heap_start = start;
        self.heap_end = start + size;
        self.total_bytes = size;
        self.allocated_bytes = 0;

        let block = start as *mut FreeBlock;
        unsafe {
            (*block).size = size;
            (*block).next = ptr::null_mut();
        }
        self.free_list = block;
    }

    fn alloc(&mut self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(MIN_BLOCK_SIZE);
        let align = layout.align().max(core::mem::align_of::<FreeBlock>());

        let mut prev: *mut FreeBlock = ptr::null_mut();
        let mut current = self.free_list;

        while !current.is_null() {
            let block_start = current as usize;
            let block_size = unsafe { (*current).size };
            let block_end = block_start + block_size;

            let alloc_start = align_up(block_start, align);
            let alloc_end = alloc_start + size;

            if alloc_end <= block_end {
                let next = unsafe { (*current).next };
                if prev.is_null() {
                    self.free_list = next;
                } else {
                    unsafe {
                        (*prev).next = next;
                    }
                }

                let front_gap = alloc_start - block_start;
                if front_gap >= MIN_BLOCK_SIZE {
                    self.insert_free_block(block_start, front_gap);
                }

                let back_gap = block_end - alloc_end;
                if back_gap >= MIN_BLOCK_SIZE {
                    self.insert_free_block(alloc_end, back_gap);
                }

                self.allocated_bytes += size;
                return alloc_start as *mut u8;
            }

            prev = current;
            current = unsafe { (*current).next };
        }

        ptr::null_mut()
    }

    fn dealloc(&mut self, ptr: *mut u8, layout: Layout) {
        let addr = ptr as usize;
        let size = layout.size().max(MIN_BLOCK_SIZE);

        debug_assert!(
            addr >= self.heap_start && addr + size <= self.heap_end,
            "heap: dealloc address outside heap bounds"
        );

        self.allocated_bytes -= size;
        self.insert_free_block(addr, size);
    }

    fn insert_free_block(&mut self, addr: usize, size: usize) {
        debug_assert!(size >= MIN_BLOCK_SIZE);

        let new_block = addr as *mut FreeBlock;

        let mut prev: *mut FreeBlock = ptr::null_mut();
        let mut current = self.free_list;

        while !current.is_null() && (current as usize) < addr {
            prev = current;
            current = unsafe { (*current).next };
        }

        unsafe {
            (*new_block).size = size;
            (*new_block).next = current;
        }

        if prev.is_null() {
            self.free_list = new_block;
        } else {
            unsafe {
                (*prev).next = new_block;
            }
        }

        if !current.is_null() {
            let new_end = addr + unsafe { (*new_block).size };
            if new_end == current as usize {
                unsafe {
                    (*new_block).size += (*current).size;
                    (*new_block).next = (*current).next;
                }
            }
        }

        if !prev.is_null() {
            let prev_end = prev as usize + unsafe { (*prev).size };
            if prev_end == addr {
                unsafe {
                    (*prev).size += (*new_block).size;
                    (*prev).next = (*new_block).next;
                }
            }
        }
    }
}

/// The kernel's global heap allocator, behind a `SpinLock` to satisfy
/// `GlobalAlloc`'s `Sync` requirement.
pub struct KernelAllocator {
    inner: SpinLock<Heap>,
}

impl KernelAllocator {
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(Heap::new()),
        }
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner.lock().alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.lock().dealloc(ptr, layout)
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator::new();

/// Builds the kernel heap: pops `HEAP_PAGES` pages off the PMM and maps
/// each into KVAS at a consecutive virtual address starting at
/// `HEAP_VIRT_START`.
///
/// # Panics
/// If the PMM is not initialized, or runs out of physical memory before
/// `HEAP_PAGES` pages are mapped.
pub fn init() {
    let heap_size = HEAP_PAGES * PAGE_SIZE as usize;

    for i in 0..HEAP_PAGES {
        let virt = VirtAddr::new(HEAP_VIRT_START + (i as u32) * PAGE_SIZE);
        let phys: PhysAddr = pmm::pop_page();
        vmm::map_kernel_page(virt, phys);
    }

    kprintln!(
        "[heap] Mapped {} KiB at virt {:#010X}",
        heap_size / 1024,
        HEAP_VIRT_START,
    );

    ALLOCATOR.inner.lock().init(HEAP_VIRT_START as usize, heap_size);

    kprintln!("[heap] Kernel heap initialized ({} KiB)", heap_size / 1024);
}

pub fn allocated_bytes() -> usize {
    ALLOCATOR.inner.lock().allocated_bytes
}

pub fn total_bytes() -> usize {
    ALLOCATOR.inner.lock().total_bytes
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!(
        "kernel heap allocation failed: size={}, align={}",
        layout.size(),
        layout.align()
    );
}
