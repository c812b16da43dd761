//! I/O APIC driver — routes external IRQs to a target LAPIC vector.
//!
//! Grounded on the reference kernel's `acpi/ioapic.c`. The IOAPIC exposes
//! only two directly-addressable registers (`REGSEL`, `WIN`); every other
//! register, including the 64-bit-wide redirection table entries, is
//! accessed indirectly by writing an index to `REGSEL` then reading/
//! writing `WIN`. There is no ACPI MADT parser in this core, so the
//! IOAPIC's MMIO base is the fixed address QEMU and most firmware place
//! it at.

use crate::kprintln;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::vmm;

/// Fallback IOAPIC MMIO base used when no ACPI table is consulted.
const IOAPIC_FALLBACK_ADDR: u32 = 0xFEC0_0000;

const REG_ID: u32 = 0x00;
const REG_VERSION: u32 = 0x01;
const REG_REDIR_BASE: u32 = 0x10;

const DELMOD_FIXED: u32 = 0;
const DESTMOD_PHYSICAL: u32 = 0;
const INTPOL_ACTIVE_HIGH: u32 = 0;
const TRIGMOD_EDGE: u32 = 0;

static mut BASE: u32 = 0;
static mut MAX_REDIRS: u32 = 0;

struct Regs;

impl Regs {
    unsafe fn regsel() -> *mut u32 {
        unsafe { core::ptr::addr_of!(BASE).read() as *mut u32 }
    }

    unsafe fn win() -> *mut u32 {
        unsafe { (core::ptr::addr_of!(BASE).read() + 0x10) as *mut u32 }
    }

    unsafe fn read32(regsel: u32) -> u32 {
        unsafe {
            Self::regsel().write_volatile(regsel);
            Self::win().read_volatile()
        }
    }

    unsafe fn write32(regsel: u32, value: u32) {
        unsafe {
            Self::regsel().write_volatile(regsel);
            Self::win().write_volatile(value);
        }
    }

    unsafe fn read64(regsel: u32) -> u64 {
        unsafe {
            let lo = Self::read32(regsel) as u64;
            let hi = Self::read32(regsel + 1) as u64;
            (hi << 32) | lo
        }
    }

    unsafe fn write64(regsel: u32, value: u64) {
        unsafe {
            Self::write32(regsel, value as u32);
            Self::write32(regsel + 1, (value >> 32) as u32);
        }
    }
}

/// Maps the IOAPIC's register page and reads its ID/version.
///
/// # Safety
/// Must be called once, after KVAS is up, before any `map_irq` call.
pub unsafe fn init() {
    unsafe {
        core::ptr::addr_of_mut!(BASE).write(IOAPIC_FALLBACK_ADDR);
        vmm::map_kernel_page(VirtAddr::new(IOAPIC_FALLBACK_ADDR), PhysAddr::new(IOAPIC_FALLBACK_ADDR));

        let id = (Regs::read32(REG_ID) >> 24) & 0xF;
        let ver = Regs::read32(REG_VERSION);
        let max_redirs = ((ver >> 16) & 0xFF) + 1;
        core::ptr::addr_of_mut!(MAX_REDIRS).write(max_redirs);

        kprintln!("[ioapic] id={:#x} version={:#x} redirs={} at {:#010x}", id, ver & 0xFF, max_redirs, IOAPIC_FALLBACK_ADDR);
    }
}

/// Routes external IRQ `gsi` to `vector` on the LAPIC identified by
/// `lapic_id`. Returns `false` if `gsi` is out of the IOAPIC's range or
/// already mapped to a nonzero vector.
pub fn map_irq(gsi: u32, vector: u8, lapic_id: u8) -> bool {
    let max = unsafe { core::ptr::addr_of!(MAX_REDIRS).read() };
    if gsi >= max {
        kprintln!("[ioapic] cannot map gsi {}: max gsi is {}", gsi, max - 1);
        return false;
    }

    let regsel = REG_REDIR_BASE + gsi * 2;
    let prev = unsafe { Regs::read64(regsel) };
    if (prev & 0xFF) != 0 {
        kprintln!("[ioapic] gsi {} already mapped to vector {}", gsi, prev & 0xFF);
        return false;
    }

    let mut entry: u64 = vector as u64;
    entry |= (DELMOD_FIXED as u64) << 8;
    entry |= (DESTMOD_PHYSICAL as u64) << 11;
    entry |= (INTPOL_ACTIVE_HIGH as u64) << 13;
    entry |= (TRIGMOD_EDGE as u64) << 15;
    entry |= (lapic_id as u64) << 56;

    unsafe {
        Regs::write64(regsel, entry);
    }
    kprintln!("[ioapic] routed gsi {} -> vector {} (lapic {})", gsi, vector, lapic_id);
    true
}
