//! 256-entry Interrupt Descriptor Table.
//!
//! Grounded on the reference kernel's `idt.c`: a flat array of 32-bit
//! interrupt gates, all pointing at `handlers::isr_dummy` until
//! [`init`] overwrites the ones this kernel actually services. The
//! syscall gate is the only one with DPL 3 — everything else is only
//! reachable from ring 0 or hardware.

use core::mem::size_of;

use crate::config::vectors;
use crate::interrupts::handlers;

const NUM_ENTRIES: usize = 256;

const ENTRY_PRESENT: u8 = 1 << 7;
const ENTRY_DPL_KERNEL: u8 = 0 << 5;
const ENTRY_DPL_USER: u8 = 3 << 5;
const ENTRY_TYPE_INT_32BIT: u8 = 0xE;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Entry {
    offset_low: u16,
    selector: u16,
    reserved: u8,
    present_dpl_type: u8,
    offset_high: u16,
}

impl Entry {
    const fn missing() -> Self {
        Entry {
            offset_low: 0,
            selector: 0,
            reserved: 0,
            present_dpl_type: 0,
            offset_high: 0,
        }
    }

    fn set(&mut self, handler: unsafe extern "C" fn(), dpl: u8) {
        let offset = handler as usize as u32;
        self.offset_low = (offset & 0xFFFF) as u16;
        self.offset_high = ((offset >> 16) & 0xFFFF) as u16;
        self.selector = crate::arch::gdt::SEL_KERNEL_CODE;
        self.present_dpl_type = ENTRY_PRESENT | dpl | ENTRY_TYPE_INT_32BIT;
    }
}

#[repr(C, packed)]
struct Descriptor {
    limit: u16,
    base: u32,
}

static mut IDT: [Entry; NUM_ENTRIES] = [Entry::missing(); NUM_ENTRIES];

/// Builds the table and loads it via `lidt`. Must run once, after the
/// GDT is loaded, before interrupts are enabled.
pub fn init() {
    unsafe {
        let idt = &mut *core::ptr::addr_of_mut!(IDT);

        for entry in idt.iter_mut() {
            entry.set(handlers::isr_dummy, ENTRY_DPL_KERNEL);
        }

        macro_rules! exc {
            ($num:expr, $stub:ident) => {
                idt[$num].set(handlers::$stub, ENTRY_DPL_KERNEL);
            };
        }
        exc!(0, isr_0);
        exc!(1, isr_1);
        exc!(2, isr_2);
        exc!(3, isr_3);
        exc!(4, isr_4);
        exc!(5, isr_5);
        exc!(6, isr_6);
        exc!(7, isr_7);
        exc!(8, isr_8);
        exc!(9, isr_9);
        exc!(10, isr_10);
        exc!(11, isr_11);
        exc!(12, isr_12);
        exc!(13, isr_13);
        exc!(14, isr_14);
        exc!(15, isr_15);
        exc!(16, isr_16);
        exc!(17, isr_17);
        exc!(18, isr_18);
        exc!(19, isr_19);
        exc!(20, isr_20);
        exc!(21, isr_21);
        exc!(22, isr_22);
        exc!(23, isr_23);
        exc!(24, isr_24);
        exc!(25, isr_25);
        exc!(26, isr_26);
        exc!(27, isr_27);
        exc!(28, isr_28);
        exc!(29, isr_29);
        exc!(30, isr_30);
        exc!(31, isr_31);

        idt[vectors::TIMER as usize].set(handlers::isr_timer, ENTRY_DPL_KERNEL);
        idt[vectors::KEYBOARD as usize].set(handlers::isr_keyboard, ENTRY_DPL_KERNEL);
        idt[vectors::AHCI_GLOBAL as usize].set(handlers::isr_ahci, ENTRY_DPL_KERNEL);
        idt[vectors::HALT_IPI as usize].set(handlers::isr_ipi_halt, ENTRY_DPL_KERNEL);
        idt[vectors::TLB_SHOOTDOWN_IPI as usize]
            .set(handlers::isr_ipi_tlb_shootdown, ENTRY_DPL_KERNEL);
        idt[vectors::SYSCALL as usize].set(crate::arch::syscall::isr_syscall, ENTRY_DPL_USER);

        let desc = Descriptor {
            limit: (size_of::<[Entry; NUM_ENTRIES]>() - 1) as u16,
            base: idt.as_ptr() as u32,
        };
        load(&desc as *const Descriptor as *const u8);
    }
}

unsafe fn load(desc: *const u8) {
    unsafe {
        core::arch::asm!("lidt [{}]", in(reg) desc, options(nostack));
    }
}
