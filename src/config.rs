//! Compile-time configuration constants shared across subsystems.
//!
//! Collected here because several modules need the same numbers (e.g.
//! `MAX_CPUS` is read by both `arch::smp` and the per-CPU task manager).

/// Maximum number of CPUs this kernel will bring up.
pub const MAX_CPUS: usize = 8;

/// Size of a kernel task's stack, in bytes. One page is enough for the
/// cooperative, shallow call trees kernel tasks run here.
pub const KERNEL_STACK_SIZE: usize = 4096;

/// Number of physical pages given to the initial kernel heap.
pub const HEAP_PAGES: usize = 256;

/// Virtual address the kernel heap starts at. Chosen below
/// `memory::vmm::USER_SPACE_START` and above the identity-mapped image,
/// so heap pages don't need to sit at the same address as the physical
/// frames backing them.
pub const HEAP_VIRT_START: u32 = 0x3000_0000;

/// Maximum AHCI ports probed per controller. QEMU maps two controllers
/// 4096 bytes apart, so not all 32 architecturally possible ports are
/// reachable; 30 is the practical ceiling.
pub const AHCI_PORTS_PER_CTRL: usize = 30;

/// Command slots per AHCI port (architectural maximum).
pub const AHCI_CMD_SLOTS: usize = 32;

/// PRD entries per command table; each PRD covers at most 4 MiB.
pub const AHCI_PRDS_PER_CMD_TABLE: usize = 8;

/// Bytes covered by a single PRD at most.
pub const AHCI_PRD_MAX_BYTES: u32 = 4 * 1024 * 1024;

/// Depth of the blkdev worker's bounded request queue.
pub const BLKDEV_QUEUE_DEPTH: usize = 32;

/// Physical base address of the AHCI HBA's MMIO register window.
///
/// PCI bus enumeration is out of scope for this core (a disk controller
/// is consumed only as a fixed device, not discovered), so the
/// controller's ABAR is not read from a PCI BAR — it is fixed at the
/// address QEMU's `ich9-ahci` device maps it to with no other PCI MMIO
/// BARs in the way, the same simplification `drivers::ioapic` makes for
/// its base.
pub const AHCI_HBA_BASE: u32 = 0xFEBF_1000;

/// Legacy IRQ line the AHCI controller's interrupt pin is wired to,
/// routed through the IOAPIC to [`vectors::AHCI_GLOBAL`]. Another
/// consequence of skipping PCI enumeration: this would otherwise come
/// from the PCI header's `int_line` field.
pub const AHCI_IRQ_LINE: u32 = 11;

/// Physical address of the low-memory AP trampoline code page.
pub const SMP_TRAMPOLINE_ADDR: u32 = 0x8000;

/// Physical address of the AP trampoline argument block.
pub const SMP_TRAMPOLINE_ARGS_ADDR: u32 = 0x8800;

/// Temporary stack top used by an AP before it switches to its real
/// kernel stack.
pub const SMP_AP_INIT_STACK_TOP: u32 = 0xA000;

/// Local APIC IDs of every CPU to bring up, BSP included. There is no
/// ACPI MADT parser in this core, so the topology firmware would
/// normally report is fixed here instead, matching QEMU's default
/// sequential APIC ID assignment for `-smp N`.
pub const SMP_APIC_IDS: [u8; MAX_CPUS] = [0, 1, 2, 3, 4, 5, 6, 7];

/// Interrupt vectors reserved by the core.
pub mod vectors {
    pub const TIMER: u8 = 0x20;
    pub const KEYBOARD: u8 = 0x21;
    pub const SYSCALL: u8 = 0x64;
    pub const AHCI_GLOBAL: u8 = 0xA0;
    pub const HALT_IPI: u8 = 0xF1;
    pub const TLB_SHOOTDOWN_IPI: u8 = 0xF2;
}

/// Syscall numbers for software interrupt `0x64`.
pub mod syscall {
    pub const SLEEP_MS: u32 = 0;
    pub const EXIT: u32 = 1;
}
