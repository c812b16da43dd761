//! Virtual Memory Manager — 2-level IA-32 paging.
//!
//! A page directory has 1024 4-byte entries, each pointing at a page
//! table of 1024 4-byte entries, each mapping one 4 KiB page. KVAS (the
//! kernel virtual address space) identity-maps physical memory from the
//! first page through the end of the kernel heap; every other address
//! space clones KVAS's directory entries below [`USER_SPACE_START`] and
//! builds its own page tables above it.
//!
//! Cloning shares the kernel-half page tables *by reference* — a cloned
//! directory's entries for kernel addresses point at the exact same
//! page-table pages KVAS uses, not copies of their contents. A write to
//! kernel memory through one address space is immediately visible
//! through every other, which is what a shared kernel half means; a
//! design that instead copies each kernel page table's entries into a
//! freshly allocated table per clone would leave clones unable to see
//! kernel mappings created after the clone. Sharing by reference also
//! means cloning is O(directory entries), not O(directory entries ×
//! 1024).

use bitflags::bitflags;
use spin::Once;

use crate::kprintln;
use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::pmm;

/// First virtual address available to user-mode mappings. Below this,
/// every address space shares KVAS's page tables.
pub const USER_SPACE_START: u32 = 0x4000_0000;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

/// Kernel-half mapping flags: present, writable, supervisor-only.
const KERNEL_FLAGS: PageFlags = PageFlags::from_bits_truncate(
    PageFlags::PRESENT.bits() | PageFlags::WRITABLE.bits(),
);
/// User-half mapping flags: present, writable, user-accessible.
const USER_FLAGS: PageFlags = PageFlags::from_bits_truncate(
    PageFlags::PRESENT.bits() | PageFlags::WRITABLE.bits() | PageFlags::USER.bits(),
);

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct Entry(u32);

impl Entry {
    const fn empty() -> Self {
        Self(0)
    }

    fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & !0xFFF)
    }

    fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & 0xFFF)
    }

    fn new(frame: PhysAddr, flags: PageFlags) -> Self {
        Self(frame.as_u32() | flags.bits())
    }
}

/// A 4 KiB, 1024-entry page directory or page table. Both levels share
/// this layout on IA-32.
#[repr(C, align(4096))]
struct Table([Entry; 1024]);

impl Table {
    fn as_virt(phys: PhysAddr) -> *mut Table {
        phys.to_virt().as_mut_ptr::<Table>()
    }
}

static KVAS_DIR: Once<PhysAddr> = Once::new();

fn kvas_dir_phys() -> PhysAddr {
    *KVAS_DIR.get().expect("vmm: not initialized")
}

/// Returns the physical address of the shared kernel page directory.
pub fn kvas_dir() -> PhysAddr {
    kvas_dir_phys()
}

/// Builds KVAS and identity-maps physical memory from the first page
/// through `identity_map_end` (normally the end of the kernel heap).
/// Enables paging before returning.
pub fn init(identity_map_end: PhysAddr) {
    let dir_phys = pmm::pop_page_zeroed();
    assert!(KVAS_DIR.get().is_none(), "vmm: init called more than once");
    KVAS_DIR.call_once(|| dir_phys);

    let mut addr = PAGE_SIZE;
    while addr < identity_map_end.as_u32() {
        map_kernel_page(VirtAddr::new(addr), PhysAddr::new(addr));
        addr += PAGE_SIZE;
    }

    unsafe {
        load(dir_phys);
    }

    kprintln!(
        "[vmm] kernel directory at {}, identity-mapped 0x1000..{:#010X}",
        dir_phys,
        identity_map_end.as_u32()
    );
}

/// Clones KVAS into a new address space for a user task.
///
/// Directory entries below [`USER_SPACE_START`] point at KVAS's own
/// page tables — see the module docs. Entries at or above
/// `USER_SPACE_START` start absent; the caller maps user pages into
/// them with [`map_user_page`].
pub fn clone_kvas() -> PhysAddr {
    let new_dir_phys = pmm::pop_page_zeroed();
    let kvas_dir_phys = kvas_dir_phys();

    let kvas_dir = unsafe { &*Table::as_virt(kvas_dir_phys) };
    let new_dir = unsafe { &mut *Table::as_virt(new_dir_phys) };

    let user_dir_idx = dir_index(USER_SPACE_START);
    for idx in 0..user_dir_idx {
        new_dir.0[idx] = kvas_dir.0[idx];
    }

    new_dir_phys
}

/// Frees a user address space's page tables and pages above
/// `USER_SPACE_START`, then frees the directory itself. Kernel-half page
/// tables are shared with KVAS and are never freed here.
pub fn free_address_space(dir_phys: PhysAddr) {
    assert_ne!(dir_phys, kvas_dir_phys(), "vmm: refusing to free KVAS");

    let dir = unsafe { &mut *Table::as_virt(dir_phys) };
    let user_dir_idx = dir_index(USER_SPACE_START);

    for entry in dir.0[user_dir_idx..].iter_mut() {
        if !entry.is_present() {
            continue;
        }
        let table_phys = entry.frame();
        let table = unsafe { &mut *Table::as_virt(table_phys) };
        for page_entry in table.0.iter_mut() {
            if page_entry.is_present() {
                pmm::push_page(page_entry.frame());
                *page_entry = Entry::empty();
            }
        }
        pmm::push_page(table_phys);
        *entry = Entry::empty();
    }

    pmm::push_page(dir_phys);
}

/// Maps a single page in a user address space.
///
/// # Panics
/// If `virt`/`phys` are not page-aligned, or the mapping already exists.
pub fn map_user_page(dir_phys: PhysAddr, virt: VirtAddr, phys: PhysAddr) {
    map_page(dir_phys, virt, phys, USER_FLAGS);
}

/// Maps a single page into the shared kernel address space and
/// shoots down any stale TLB entry for it on every CPU.
pub fn map_kernel_page(virt: VirtAddr, phys: PhysAddr) {
    map_page(kvas_dir_phys(), virt, phys, KERNEL_FLAGS);
    invalidate_and_shootdown(virt);
}

/// Unmaps a single kernel page and shoots down its TLB entry everywhere.
pub fn unmap_kernel_page(virt: VirtAddr) {
    unmap_page(kvas_dir_phys(), virt);
    invalidate_and_shootdown(virt);
}

fn dir_index(virt: u32) -> usize {
    VirtAddr::new(virt).page_table_indices().0 as usize
}

fn map_page(dir_phys: PhysAddr, virt: VirtAddr, phys: PhysAddr, flags: PageFlags) {
    assert!(virt.is_page_aligned(), "vmm: map_page: virt is not page-aligned");
    assert!(phys.is_page_aligned(), "vmm: map_page: phys is not page-aligned");

    let (dir_idx, tbl_idx, _) = virt.page_table_indices();
    let dir = unsafe { &mut *Table::as_virt(dir_phys) };

    let table_phys = if dir.0[dir_idx as usize].is_present() {
        let existing_flags = dir.0[dir_idx as usize].flags();
        assert_eq!(
            existing_flags, flags,
            "vmm: map_page: existing page table for {virt} has flags {:#x}, expected {:#x}",
            existing_flags.bits(),
            flags.bits()
        );
        dir.0[dir_idx as usize].frame()
    } else {
        let new_table = pmm::pop_page_zeroed();
        dir.0[dir_idx as usize] = Entry::new(new_table, flags);
        new_table
    };

    let table = unsafe { &mut *Table::as_virt(table_phys) };
    assert!(
        !table.0[tbl_idx as usize].is_present(),
        "vmm: map_page: {virt} is already mapped"
    );
    table.0[tbl_idx as usize] = Entry::new(phys, flags);
}

fn unmap_page(dir_phys: PhysAddr, virt: VirtAddr) {
    assert!(virt.is_page_aligned(), "vmm: unmap_page: virt is not page-aligned");

    let (dir_idx, tbl_idx, _) = virt.page_table_indices();
    let dir = unsafe { &mut *Table::as_virt(dir_phys) };
    assert!(
        dir.0[dir_idx as usize].is_present(),
        "vmm: unmap_page: no page table mapped for {virt}"
    );

    let table = unsafe { &mut *Table::as_virt(dir.0[dir_idx as usize].frame()) };
    assert!(
        table.0[tbl_idx as usize].is_present(),
        "vmm: unmap_page: {virt} is not mapped"
    );
    table.0[tbl_idx as usize] = Entry::empty();
}

fn invalidate_and_shootdown(virt: VirtAddr) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_u32(), options(nostack));
    }
    crate::arch::smp::broadcast_tlb_shootdown(virt);
}

/// Loads `dir_phys` into CR3 and ensures paging is enabled.
///
/// # Safety
/// `dir_phys` must point at a valid, fully-formed page directory whose
/// kernel-half entries cover all code and data the caller will touch
/// immediately after the load.
pub unsafe fn load(dir_phys: PhysAddr) {
    core::arch::asm!(
        "mov cr3, {dir}",
        "mov {tmp}, cr0",
        "or {tmp}, 0x80000000",
        "mov cr0, {tmp}",
        dir = in(reg) dir_phys.as_u32(),
        tmp = out(reg) _,
        options(nostack),
    );
}
