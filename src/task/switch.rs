//! Context-switch assembly and initial-stack setup.
//!
//! `switch_to` saves the four callee-saved GPRs (EBP, EBX, ESI, EDI) onto
//! the outgoing task's stack, swaps ESP, optionally reloads CR3 for an
//! address-space change, then restores the same four registers from the
//! incoming task's stack before `ret`-ing into it. A freshly created
//! task's stack is primed to look exactly like a task that is about to
//! be switched back into for the first time, with its entry point as the
//! `ret` target — diverging from the sentinel register values (1..7)
//! the original seeds new stacks with, since there is no reason a fresh
//! task should see non-zero garbage in registers it never initialized.

use core::arch::global_asm;

use crate::memory::address::VirtAddr;

global_asm!(
    r#"
.global task_switch_to
task_switch_to:
    # eax = &mut old_sp (store point, 0 if none)
    # edx = new_sp
    # ecx = new_cr3 (0 = no address-space change)
    push ebp
    push ebx
    push esi
    push edi

    test eax, eax
    jz 2f
    mov [eax], esp
2:
    test ecx, ecx
    jz 3f
    mov cr3, ecx
3:
    mov esp, edx

    pop edi
    pop esi
    pop ebx
    pop ebp
    ret
"#
);

extern "C" {
    /// Raw switch primitive. `old_sp_slot` may be null (used for the very
    /// first switch into the init task, which has no outgoing context to
    /// save). `new_cr3` is `0` to keep the current address space.
    fn task_switch_to(old_sp_slot: *mut u32, new_sp: u32, new_cr3: u32);
}

/// Switches execution from the calling task's context to `to`'s, saving
/// the caller's stack pointer into `*from_sp_slot` first.
///
/// # Safety
/// `from_sp_slot` must point at the outgoing task's `stack_pointer`
/// field (or be null), and `to_sp`/`to_cr3` must describe a stack
/// previously prepared by [`prepare_initial_stack`] or by a prior call
/// to this function.
pub unsafe fn switch_to(from_sp_slot: *mut VirtAddr, to_sp: VirtAddr, to_cr3: u32) {
    task_switch_to(from_sp_slot as *mut u32, to_sp.as_u32(), to_cr3);
}

/// Builds the initial stack frame for a brand-new task so that switching
/// into it for the first time behaves exactly like resuming a task that
/// previously called `task_switch_to` and is about to `ret` into `entry`.
///
/// Returns the initial stack pointer to store in the new task's
/// `stack_pointer` field.
pub fn prepare_initial_stack(stack: &mut [u8], entry: u32) -> VirtAddr {
    let base = stack.as_mut_ptr() as u32;
    let top = base + stack.len() as u32;

    // Five words: entry (ret target), ebp, ebx, esi, edi — in descending
    // address order so popping edi,esi,ebx,ebp then ret lands on entry.
    let mut sp = top & !0x3;
    let words = [entry, 0u32, 0u32, 0u32, 0u32];
    for &w in words.iter().rev() {
        sp -= 4;
        unsafe {
            (sp as *mut u32).write(w);
        }
    }

    VirtAddr::new(sp)
}
