//! Local APIC driver — per-CPU interrupt controller.
//!
//! Grounded on the reference kernel's `acpi/lapic.c`: enable the LAPIC
//! through the `IA32_APIC_BASE` MSR, program the spurious-interrupt
//! vector, mask the LINTx pins, and expose EOI/IPI/timer programming.
//! Registers are a page of 32-bit-wide, 16-byte-spaced MMIO cells;
//! modeled as raw offsets rather than a packed struct since most of the
//! page is reserved padding between the handful of registers we touch.

use crate::arch::cpu::{self, lapic_id, read_msr, write_msr};
use crate::kprintln;
use crate::memory::address::VirtAddr;
use crate::memory::vmm;

const MSR_APIC_BASE: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;
const APIC_BASE_ADDR_MASK: u64 = 0xFFFF_F000;

const REG_ID: usize = 0x020;
const REG_VERSION: usize = 0x030;
const REG_EOI: usize = 0x0B0;
const REG_SVR: usize = 0x0F0;
const REG_ESR: usize = 0x280;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_LVT_LINT0: usize = 0x350;
const REG_LVT_LINT1: usize = 0x360;
const REG_TIMER_INIT_COUNT: usize = 0x380;
const REG_TIMER_CUR_COUNT: usize = 0x390;
const REG_TIMER_DIVIDE: usize = 0x3E0;

const SVR_APIC_ENABLE: u32 = 1 << 8;
const LVT_MASKED: u32 = 1 << 16;
const ICR_DELIVS_PENDING: u32 = 1 << 12;

/// Delivery modes for [`send_ipi`] (bits 8..11 of the low ICR dword).
#[derive(Clone, Copy)]
pub enum DeliveryMode {
    Fixed = 0,
    Init = 5,
    StartUp = 6,
}

/// Trigger/level fields needed to build an INIT/startup IPI.
#[derive(Clone, Copy)]
pub struct Ipi {
    pub vector: u8,
    pub delivery_mode: DeliveryMode,
    pub assert: bool,
    pub level_triggered: bool,
    pub dest: u8,
}

static mut BASE: u32 = 0;

fn reg(offset: usize) -> *mut u32 {
    unsafe { (core::ptr::addr_of!(BASE).read() as usize + offset) as *mut u32 }
}

unsafe fn read(offset: usize) -> u32 {
    unsafe { reg(offset).read_volatile() }
}

unsafe fn write(offset: usize, value: u32) {
    unsafe { reg(offset).write_volatile(value) }
}

/// Enables the LAPIC, masks LINT0/LINT1, and sets the spurious vector.
///
/// # Safety
/// Must run once per CPU, after the page at the APIC base has been
/// identity-mapped into KVAS (done here via `vmm::map_kernel_page`).
pub unsafe fn init() {
    let msr = unsafe { read_msr(MSR_APIC_BASE) };
    let base = (msr & APIC_BASE_ADDR_MASK) as u32;
    assert!(base != 0, "lapic: APIC base MSR reported address 0");

    unsafe {
        core::ptr::addr_of_mut!(BASE).write(base);
        write_msr(MSR_APIC_BASE, msr | APIC_BASE_ENABLE);

        vmm::map_kernel_page(VirtAddr::new(base), crate::memory::address::PhysAddr::new(base));

        write(REG_LVT_LINT0, LVT_MASKED);
        write(REG_LVT_LINT1, LVT_MASKED);
        write(REG_SVR, 0xFF | SVR_APIC_ENABLE);

        let id = (read(REG_ID) >> 24) & 0xFF;
        let version = read(REG_VERSION) & 0xFF;
        kprintln!("[lapic] id={:#04x} version={:#x} base={:#010x}", id, version, base);
    }
}

/// Programs the LAPIC timer to fire vector `vector` periodically.
///
/// # Safety
/// Must be called after [`init`] on the same CPU.
pub unsafe fn init_timer(vector: u8, initial_count: u32) {
    unsafe {
        write(REG_TIMER_DIVIDE, 0b1011); // divide by 1
        write(REG_LVT_TIMER, vector as u32 | (1 << 17)); // periodic mode
        write(REG_TIMER_INIT_COUNT, initial_count);
    }
}

/// Signals end-of-interrupt for the currently serviced vector.
pub fn send_eoi() {
    unsafe {
        write(REG_EOI, 0);
    }
}

/// Clears the LAPIC error-status register (must be done twice per the
/// SDM before its value is meaningful, but one clear is enough before an
/// IPI sequence that doesn't read it back).
pub fn clear_esr() {
    unsafe {
        write(REG_ESR, 0);
    }
}

/// Returns this CPU's Local APIC ID via CPUID (cheaper than an MMIO read
/// and valid before the LAPIC MMIO page is mapped).
pub fn id() -> u8 {
    lapic_id()
}

/// Issues an Interrupt Command (IPI) and returns immediately; the caller
/// decides whether to wait via [`wait_ipi_delivered`].
pub fn send_ipi(ipi: Ipi) {
    let mut low: u32 = ipi.vector as u32;
    low |= (ipi.delivery_mode as u32) << 8;
    if ipi.assert {
        low |= 1 << 14;
    }
    if ipi.level_triggered {
        low |= 1 << 15;
    }
    unsafe {
        write(REG_ICR_HIGH, (ipi.dest as u32) << 24);
        write(REG_ICR_LOW, low);
    }
}

/// Spins until the most recent [`send_ipi`] has been accepted by the bus.
pub fn wait_ipi_delivered() {
    while unsafe { read(REG_ICR_LOW) } & ICR_DELIVS_PENDING != 0 {
        core::hint::spin_loop();
    }
}

/// Sends a fixed-vector IPI to a specific LAPIC ID (used for TLB
/// shootdown and the panic halt broadcast).
pub fn send_fixed_ipi(vector: u8, dest: u8) {
    send_ipi(Ipi {
        vector,
        delivery_mode: DeliveryMode::Fixed,
        assert: true,
        level_triggered: false,
        dest,
    });
    wait_ipi_delivered();
}

/// Briefly yields the CPU without touching the scheduler — used by the
/// halt-IPI handler, which must stop responding to further interrupts.
pub fn park_forever() -> ! {
    cpu::halt_forever()
}
