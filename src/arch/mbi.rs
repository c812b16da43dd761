//! Multiboot Information structure.
//!
//! Grounded on the reference kernel's `mbi.c`: the loader hands us a
//! pointer into low memory that is only valid until we start reusing
//! that memory (it usually overlaps the boot-time identity map we are
//! about to repurpose), so the struct and anything it points at — the
//! memory map, in particular — are deep-copied onto the heap once the
//! allocator is up, and every later query goes through that copy.

use alloc::vec::Vec;
use core::mem::size_of;

use crate::memory::address::PhysAddr;

const FLAG_MMAP: u32 = 1 << 6;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RawMbi {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
    syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
    drives_length: u32,
    drives_addr: u32,
    config_table: u32,
    boot_loader_name: u32,
    apm_table: u32,
    vbe_control_info: u32,
    vbe_mode_info: u32,
    vbe_mode: u16,
    vbe_interface_seg: u16,
    vbe_interface_off: u16,
    vbe_interface_len: u16,
    framebuffer_addr: u64,
    framebuffer_pitch: u32,
    framebuffer_width: u32,
    framebuffer_height: u32,
    framebuffer_bpp: u8,
    framebuffer_type: u8,
    color_info: [u8; 6],
}

/// One entry of the Multiboot memory map. `type_ == 1` means usable RAM.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct MmapEntry {
    pub size: u32,
    pub base_addr: u64,
    pub length: u64,
    pub type_: u32,
}

/// Deep-copied, heap-owned view of the boot-time Multiboot info. Safe to
/// keep around past the point where the identity-mapped low memory the
/// loader originally gave us gets reused.
pub struct MultibootInfo {
    raw: RawMbi,
    mmap: Vec<MmapEntry>,
}

/// Reads the Multiboot Information structure at `addr` and deep-copies
/// everything it references onto the heap.
///
/// # Safety
/// `addr` must be the physical address the loader passed in `EBX`, and
/// the heap must already be initialized. Must be called before the
/// memory that address points into is repurposed.
pub unsafe fn read(addr: PhysAddr) -> MultibootInfo {
    let raw = unsafe { core::ptr::read_unaligned(addr.as_u32() as *const RawMbi) };

    let mut mmap = Vec::new();
    if raw.flags & FLAG_MMAP != 0 {
        let mut cursor = raw.mmap_addr as usize;
        let end = raw.mmap_addr as usize + raw.mmap_length as usize;
        while cursor < end {
            let entry = unsafe { core::ptr::read_unaligned(cursor as *const MmapEntry) };
            mmap.push(entry);
            // The `size` field doesn't include itself.
            cursor += entry.size as usize + size_of::<u32>();
        }
    }

    MultibootInfo { raw, mmap }
}

impl MultibootInfo {
    pub fn mem_lower_kb(&self) -> u32 {
        self.raw.mem_lower
    }

    pub fn mem_upper_kb(&self) -> u32 {
        self.raw.mem_upper
    }

    pub fn mmap(&self) -> &[MmapEntry] {
        &self.mmap
    }

    /// Physical end of the last usable RAM region reported, or `None` if
    /// no memory map was supplied.
    pub fn highest_usable_addr(&self) -> Option<u64> {
        self.mmap
            .iter()
            .filter(|e| e.type_ == 1)
            .map(|e| e.base_addr + e.length)
            .max()
    }

    pub fn has_framebuffer(&self) -> bool {
        self.raw.framebuffer_addr != 0
    }

    pub fn framebuffer_addr(&self) -> u64 {
        self.raw.framebuffer_addr
    }

    pub fn framebuffer_pitch(&self) -> u32 {
        self.raw.framebuffer_pitch
    }

    pub fn framebuffer_width(&self) -> u32 {
        self.raw.framebuffer_width
    }

    pub fn framebuffer_height(&self) -> u32 {
        self.raw.framebuffer_height
    }
}
