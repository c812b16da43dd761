//! Kernel entry point: boot-time bring-up of every subsystem, in
//! dependency order, ending in the BSP's own first task.

#![no_std]
#![no_main]

extern crate alloc;

mod ahci;
mod arch;
mod blkdev;
mod config;
mod devmgr;
mod drivers;
mod interrupts;
mod memory;
mod sync;
mod task;
mod util;

use arch::gdt::{Gdt, Tss};
use arch::mbi::MultibootInfo;
use memory::address::PhysAddr;
use memory::pmm::MemRegion;

const MULTIBOOT_MAGIC: u32 = 0x2BADB002;

extern "C" {
    static ld_vmm_kernel_end: u8;
    static ld_pmm_stack_bottom: u8;
    static ld_pmm_stack_top: u8;
}

static mut BSP_TSS: Tss = Tss::zeroed();
static mut BSP_GDT: Option<Gdt> = None;

/// Builds and loads the BSP's own GDT/TSS. The Multiboot loader leaves
/// whatever GDT it used in place; the IDT's gate descriptors hard-code
/// [`arch::gdt::SEL_KERNEL_CODE`], so this must run before
/// [`interrupts::init`].
fn init_bsp_gdt() {
    unsafe {
        let tss_ref = &*core::ptr::addr_of!(BSP_TSS);
        BSP_GDT = Some(Gdt::new(tss_ref));
        (*core::ptr::addr_of!(BSP_GDT)).as_ref().unwrap().load();
    }
}

/// Turns the deep-copied Multiboot memory map into the `MemRegion` list
/// [`memory::pmm::init`] expects, dropping anything above the 32-bit
/// physical address space this core runs in.
fn build_mem_regions(mbi: &MultibootInfo) -> alloc::vec::Vec<MemRegion> {
    mbi.mmap()
        .iter()
        .filter_map(|e| {
            let base = e.base_addr;
            let length = e.length;
            if base > u32::MAX as u64 {
                return None;
            }
            let end = base.saturating_add(length).min(u32::MAX as u64);
            Some(MemRegion {
                base: base as u32,
                length: (end - base) as u32,
                usable: e.type_ == 1,
            })
        })
        .collect()
}

#[no_mangle]
pub extern "C" fn kernel_main(magic: u32, mbi_addr: u32) -> ! {
    arch::serial::SERIAL.lock().init();
    kprintln!();
    kprintln!("[boot] MinimalOS NextGen kernel starting");

    assert_eq!(magic, MULTIBOOT_MAGIC, "boot: not loaded by a Multiboot loader");

    // Reading the MBI straight out of loader-owned memory; deep-copying
    // it onto the heap has to wait until the allocator exists.
    let raw_mbi = unsafe { arch::mbi::read(PhysAddr::new(mbi_addr)) };
    kprintln!(
        "[boot] mem_lower={}KiB mem_upper={}KiB",
        raw_mbi.mem_lower_kb(),
        raw_mbi.mem_upper_kb()
    );

    let kernel_end = unsafe { core::ptr::addr_of!(ld_vmm_kernel_end) as u32 };
    let pmm_stack_bottom = unsafe { core::ptr::addr_of!(ld_pmm_stack_bottom) as u32 };
    let pmm_stack_top = unsafe { core::ptr::addr_of!(ld_pmm_stack_top) as u32 };
    let regions = build_mem_regions(&raw_mbi);
    memory::pmm::init(
        &regions,
        &[
            (PhysAddr::new(0), PhysAddr::new(kernel_end)),
            (PhysAddr::new(pmm_stack_bottom), PhysAddr::new(pmm_stack_top)),
        ],
    );

    let identity_map_end = PhysAddr::new(config::HEAP_VIRT_START)
        + (config::HEAP_PAGES as u32) * memory::address::PAGE_SIZE;
    memory::vmm::init(identity_map_end);
    memory::heap::init();

    // Re-read into a heap-owned copy now that the allocator is up; the
    // loader's low memory is fair game to reuse from here on.
    let _mbi = unsafe { arch::mbi::read(PhysAddr::new(mbi_addr)) };

    init_bsp_gdt();
    interrupts::init();

    unsafe {
        drivers::lapic::init();
        drivers::ioapic::init();
    }
    arch::smp::init_bsp();
    arch::pit::init(arch::pit::PERIOD_MS);

    arch::cpu::enable_interrupts();

    let disks = ahci::ctrl::init();
    kprintln!("[boot] {} AHCI disk(s) online", disks.len());
    probe_partitions(&disks);

    blkdev::spawn_worker();

    arch::smp::bring_up_aps(&config::SMP_APIC_IDS);

    kprintln!("[boot] handing off to the task manager");
    task::manager::init(0, init_task_entry as u32);
}

/// Reads LBA 1 off each disk and logs whatever GUID partition table it
/// finds. Best-effort: a disk with no GPT signature, or one too small
/// to answer, is logged and skipped, not treated as fatal.
fn probe_partitions(disks: &[devmgr::DeviceHandle]) {
    let mut sector = [0u8; 512];
    for &disk in disks {
        if !blkdev::sync_read(disk, 1, 1, sector.as_mut_ptr()) {
            kprintln!("[boot] disk: failed to read GPT header sector");
            continue;
        }
        if !blkdev::gpt::probe_signature(&sector) {
            kprintln!("[boot] disk: no GPT signature");
            continue;
        }
        kprintln!("[boot] disk: GPT signature present");
    }
}

extern "C" fn init_task_entry() {
    arch::cpu::enable_interrupts();
    kprintln!("[boot] init task running");
    loop {
        task::manager::sleep_ms(1000);
    }
}
