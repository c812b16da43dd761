//! Software-interrupt syscall ABI.
//!
//! Grounded on the reference kernel's `syscall.c`: user tasks invoke
//! `int 0x64` with the syscall number in `eax` and its single argument in
//! `ecx`. There is no SysV-style multi-argument convention here — every
//! syscall this core exposes takes at most one word-sized argument.

use core::arch::global_asm;

use crate::config::{syscall, vectors};
use crate::task::manager;

global_asm!(
    r#"
.global isr_syscall
isr_syscall:
    pusha
    push eax
    push ecx
    call {dispatch}
    add esp, 8
    mov [esp + 28], eax
    popa
    iretd
"#,
    dispatch = sym syscall_dispatch_asm,
);

extern "C" {
    /// Defined by the `global_asm!` block above. Installed at
    /// [`crate::config::vectors::SYSCALL`] by the IDT.
    pub fn isr_syscall();
}

/// Called from the asm stub with the two pushed dwords still on the
/// stack (`ecx` on top, `eax` below it) — read back via `cdecl` args.
#[no_mangle]
extern "C" fn syscall_dispatch_asm(arg1: u32, nr: u32) -> u32 {
    dispatch(nr, arg1)
}

fn dispatch(nr: u32, arg1: u32) -> u32 {
    match nr {
        syscall::SLEEP_MS => {
            manager::sleep_ms(arg1);
            0
        }
        syscall::EXIT => {
            if let Some(id) = manager::current_task_id() {
                manager::terminate(id);
            }
            0
        }
        _ => u32::MAX,
    }
}

/// Returns the vector this ABI is installed at.
pub const fn vector() -> u8 {
    vectors::SYSCALL
}
