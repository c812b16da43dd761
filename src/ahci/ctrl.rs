//! AHCI controller context.
//!
//! Grounded on the reference kernel's `ahci_ctrl_new`/
//! `prv_ahci_enter_ahci_mode`/`prv_ahci_enumerate_ports` and
//! `ahci_ctrl_irq_handler`. PCI bus enumeration is out of scope here
//! (see [`crate::config::AHCI_HBA_BASE`]), so there is exactly one
//! controller, brought up once at boot.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::ahci::port::Port;
use crate::ahci::regs;
use crate::config::{AHCI_HBA_BASE, AHCI_IRQ_LINE, AHCI_PORTS_PER_CTRL};
use crate::devmgr::{self, DeviceClass, DeviceHandle, DriverId};
use crate::drivers::{ioapic, lapic};
use crate::kprintln;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::vmm;

/// Maps the HBA's MMIO window, enables AHCI mode, brings up every
/// online port, and registers each one in the device registry. Routes
/// the controller's interrupt line through the IOAPIC to
/// [`crate::config::vectors::AHCI_GLOBAL`] and enables the controller's
/// global interrupt.
///
/// Returns the handles of the ports that came up, in port order.
pub fn init() -> Vec<DeviceHandle> {
    let base = AHCI_HBA_BASE;
    let mut addr = base;
    while addr < base + regs::HBA_MAP_SIZE {
        vmm::map_kernel_page(VirtAddr::new(addr), PhysAddr::new(addr));
        addr += 4096;
    }

    if !enter_ahci_mode(base) {
        kprintln!("[ahci] controller does not support AHCI mode, skipping");
        return Vec::new();
    }

    let pi = read_reg(base, regs::REG_PI);
    kprintln!("[ahci] implemented ports bitmap: {:#010x}", pi);

    let mut handles = Vec::new();
    for port_num in 0..AHCI_PORTS_PER_CTRL {
        if pi & (1 << port_num) == 0 {
            continue;
        }
        let mut port = Port::probe(base, 0, port_num);
        if !port.is_online() {
            continue;
        }
        port.setup();
        port.identify();

        let leaked: &'static mut Port = Box::leak(Box::new(port));
        let handle = devmgr::register(DeviceClass::Disk, DriverId::AhciPort, leaked);
        handles.push(handle);
    }

    ioapic::map_irq(AHCI_IRQ_LINE, crate::config::vectors::AHCI_GLOBAL, lapic::id());
    set_global_interrupt(base, true);

    handles
}

fn enter_ahci_mode(base: u32) -> bool {
    let ghc = read_reg(base, regs::REG_GHC);
    if ghc & regs::GHC_AE != 0 {
        return true;
    }
    let cap = read_reg(base, regs::REG_CAP);
    if cap & regs::CAP_SAM == 0 {
        kprintln!("[ahci] CAP.SAM clear and GHC.AE clear: no AHCI support");
        return false;
    }
    write_reg(base, regs::REG_GHC, ghc | regs::GHC_AE);
    read_reg(base, regs::REG_GHC) & regs::GHC_AE != 0
}

fn set_global_interrupt(base: u32, on: bool) {
    let ghc = read_reg(base, regs::REG_GHC);
    const GHC_IE: u32 = 1 << 1;
    if on {
        write_reg(base, regs::REG_GHC, ghc | GHC_IE);
    } else {
        write_reg(base, regs::REG_GHC, ghc & !GHC_IE);
    }
}

fn read_reg(base: u32, offset: usize) -> u32 {
    unsafe { ((base as usize + offset) as *const u32).read_volatile() }
}

fn write_reg(base: u32, offset: usize, value: u32) {
    unsafe { ((base as usize + offset) as *mut u32).write_volatile(value) }
}

/// Dispatches a global AHCI interrupt to every registered port driver.
/// In this single-controller core every disk-class, AHCI-port driver
/// is this controller's, so there is no per-controller interrupt
/// status register walk — each port simply checks its own `IS`.
pub fn handle_irq() {
    devmgr::for_each(DeviceClass::Disk, DriverId::AhciPort, |driver| {
        driver.handle_irq();
    });
}
