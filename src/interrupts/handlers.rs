//! ISR entry stubs and the Rust-side handlers they call into.
//!
//! Grounded on the reference kernel's `idt.c`/`isrs.s` split: every
//! vector gets a tiny assembly stub that normalizes the stack (pushing
//! a dummy error code for the vectors the CPU doesn't supply one for)
//! and the vector number, saves general-purpose registers, then calls
//! a single Rust dispatcher with the vector, error code, and a pointer
//! to the CPU-pushed `eip`/`cs`/`eflags` frame.

use core::arch::global_asm;

use crate::arch::smp;
use crate::config::vectors;
use crate::drivers::lapic;
use crate::kprintln;
use crate::task::manager;

/// `eip`/`cs`/`eflags` as the CPU leaves them on a same-privilege
/// interrupt — no `esp`/`ss` since there is no ring transition here.
#[repr(C)]
pub struct StackFrame {
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

macro_rules! isr_stub_no_err {
    ($name:ident, $num:expr) => {
        global_asm!(
            concat!(
                ".global ", stringify!($name), "\n",
                stringify!($name), ":\n",
                "push dword ptr 0\n",
                "push dword ptr ", stringify!($num), "\n",
                "jmp isr_common\n",
            )
        );
    };
}

macro_rules! isr_stub_err {
    ($name:ident, $num:expr) => {
        global_asm!(
            concat!(
                ".global ", stringify!($name), "\n",
                stringify!($name), ":\n",
                "push dword ptr ", stringify!($num), "\n",
                "jmp isr_common\n",
            )
        );
    };
}

isr_stub_no_err!(isr_0, 0);
isr_stub_no_err!(isr_1, 1);
isr_stub_no_err!(isr_2, 2);
isr_stub_no_err!(isr_3, 3);
isr_stub_no_err!(isr_4, 4);
isr_stub_no_err!(isr_5, 5);
isr_stub_no_err!(isr_6, 6);
isr_stub_no_err!(isr_7, 7);
isr_stub_err!(isr_8, 8);
isr_stub_no_err!(isr_9, 9);
isr_stub_err!(isr_10, 10);
isr_stub_err!(isr_11, 11);
isr_stub_err!(isr_12, 12);
isr_stub_err!(isr_13, 13);
isr_stub_err!(isr_14, 14);
isr_stub_no_err!(isr_15, 15);
isr_stub_no_err!(isr_16, 16);
isr_stub_err!(isr_17, 17);
isr_stub_no_err!(isr_18, 18);
isr_stub_no_err!(isr_19, 19);
isr_stub_no_err!(isr_20, 20);
isr_stub_no_err!(isr_21, 21);
isr_stub_no_err!(isr_22, 22);
isr_stub_no_err!(isr_23, 23);
isr_stub_no_err!(isr_24, 24);
isr_stub_no_err!(isr_25, 25);
isr_stub_no_err!(isr_26, 26);
isr_stub_no_err!(isr_27, 27);
isr_stub_no_err!(isr_28, 28);
isr_stub_no_err!(isr_29, 29);
isr_stub_no_err!(isr_30, 30);
isr_stub_no_err!(isr_31, 31);

isr_stub_no_err!(isr_dummy, 0xFFFFFFFF);
isr_stub_no_err!(isr_timer, 0x20);
isr_stub_no_err!(isr_keyboard, 0x21);
isr_stub_no_err!(isr_ahci, 0xA0);
isr_stub_no_err!(isr_ipi_halt, 0xF1);
isr_stub_no_err!(isr_ipi_tlb_shootdown, 0xF2);

global_asm!(
    r#"
isr_common:
    pusha
    ; fixed offsets from esp, valid only before the next push below:
    ; [esp+32] = vector, [esp+36] = error code, [esp+40..] = eip/cs/eflags
    mov ecx, [esp + 32]
    mov edx, [esp + 36]
    lea eax, [esp + 40]
    push eax
    push edx
    push ecx
    call {dispatch}
    add esp, 12
    popa
    add esp, 8         ; discard vector + error code
    iretd
"#,
    dispatch = sym dispatch,
);

extern "C" {
    pub fn isr_0();
    pub fn isr_1();
    pub fn isr_2();
    pub fn isr_3();
    pub fn isr_4();
    pub fn isr_5();
    pub fn isr_6();
    pub fn isr_7();
    pub fn isr_8();
    pub fn isr_9();
    pub fn isr_10();
    pub fn isr_11();
    pub fn isr_12();
    pub fn isr_13();
    pub fn isr_14();
    pub fn isr_15();
    pub fn isr_16();
    pub fn isr_17();
    pub fn isr_18();
    pub fn isr_19();
    pub fn isr_20();
    pub fn isr_21();
    pub fn isr_22();
    pub fn isr_23();
    pub fn isr_24();
    pub fn isr_25();
    pub fn isr_26();
    pub fn isr_27();
    pub fn isr_28();
    pub fn isr_29();
    pub fn isr_30();
    pub fn isr_31();
    pub fn isr_dummy();
    pub fn isr_timer();
    pub fn isr_keyboard();
    pub fn isr_ahci();
    pub fn isr_ipi_halt();
    pub fn isr_ipi_tlb_shootdown();
}

const EXCEPTION_NAMES: [&str; 22] = [
    "divide error",
    "debug exception",
    "nonmaskable interrupt",
    "breakpoint",
    "overflow",
    "BOUND range exceeded",
    "invalid opcode",
    "no math coprocessor",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "FPU floating-point error",
    "alignment check",
    "machine check",
    "SIMD floating-point exception",
    "virtualization exception",
    "control protection exception",
];

extern "C" fn dispatch(vector: u32, error_code: u32, frame: *const StackFrame) {
    match vector {
        0..=31 => exception(vector, error_code, frame),
        v if v == vectors::TIMER as u32 => {
            lapic::send_eoi();
            crate::arch::pit::on_tick();
            manager::schedule();
        }
        v if v == vectors::KEYBOARD as u32 => {
            lapic::send_eoi();
            // No keyboard driver above the ISR layer; just acknowledge it.
        }
        v if v == vectors::AHCI_GLOBAL as u32 => {
            lapic::send_eoi();
            crate::ahci::ctrl::handle_irq();
        }
        v if v == vectors::HALT_IPI as u32 => {
            smp::handle_halt_ipi();
        }
        v if v == vectors::TLB_SHOOTDOWN_IPI as u32 => {
            smp::handle_tlb_shootdown_ipi();
        }
        _ => {
            kprintln!("[interrupts] spurious vector {:#x}", vector);
            lapic::send_eoi();
        }
    }
}

fn exception(vector: u32, error_code: u32, frame: *const StackFrame) {
    let name = EXCEPTION_NAMES
        .get(vector as usize)
        .copied()
        .unwrap_or("reserved");
    let running = manager::current_task_id();
    let frame = unsafe { &*frame };

    kprintln!("Exception: {} ({})", vector, name);
    match running {
        Some(id) => kprintln!("Running task ID: {}", id),
        None => kprintln!("Running task ID: none"),
    }
    kprintln!("Error code: {}", error_code);
    kprintln!("eip = {:#010x}", frame.eip);
    kprintln!("cs  = {:#06x}", frame.cs);
    kprintln!("eflags = {:#010x}", frame.eflags);
    panic!("unhandled CPU exception");
}
