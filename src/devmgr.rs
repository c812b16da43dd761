//! Device registry.
//!
//! Grounded on the reference kernel's `devmgr.c`/`devmgr.h`: a flat
//! table of `(class, driver id) -> driver context` that lets the
//! interrupt layer and the blkdev worker reach a driver without
//! knowing which concrete bus or controller owns it. Not AHCI-specific
//! — any future device class registers through the same table.

use alloc::vec::Vec;

use crate::sync::SpinLock;

pub const MAX_DEVICES: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceClass {
    Disk,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DriverId {
    AhciPort,
}

/// Operations a block-device driver context exposes to the worker task
/// and the registry.
pub trait BlockDriver: Send + Sync {
    fn is_busy(&self) -> bool;
    fn submit(&self, req: &crate::blkdev::Request);

    /// Services whatever share of a controller-level interrupt belongs
    /// to this driver. A no-op for drivers that are never interrupted
    /// except through their own dedicated vector.
    fn handle_irq(&self) {}
}

struct Entry {
    id: u32,
    class: DeviceClass,
    driver_id: DriverId,
    driver: &'static dyn BlockDriver,
}

struct Registry {
    devices: Vec<Entry>,
    next_id: u32,
}

impl Registry {
    const fn new() -> Self {
        Self {
            devices: Vec::new(),
            next_id: 1,
        }
    }
}

static REGISTRY: SpinLock<Registry> = SpinLock::new(Registry::new());

/// A lightweight handle into the registry; cheap to copy and pass
/// around in a [`crate::blkdev::Request`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceHandle(u32);

/// Registers a driver context and returns its handle. The context must
/// be `'static` — drivers live for the lifetime of the kernel, never
/// torn down.
pub fn register(
    class: DeviceClass,
    driver_id: DriverId,
    driver: &'static dyn BlockDriver,
) -> DeviceHandle {
    let mut reg = REGISTRY.lock();
    let id = reg.next_id;
    reg.next_id += 1;
    reg.devices.push(Entry {
        id,
        class,
        driver_id,
        driver,
    });
    DeviceHandle(id)
}

pub fn get(handle: DeviceHandle) -> Option<&'static dyn BlockDriver> {
    REGISTRY
        .lock()
        .devices
        .iter()
        .find(|e| e.id == handle.0)
        .map(|e| e.driver)
}

/// Calls `f` for every registered driver of the given class and
/// driver id. Used by the AHCI controller IRQ handler to dispatch a
/// global interrupt to each port driver it owns.
pub fn for_each(class: DeviceClass, driver_id: DriverId, mut f: impl FnMut(&'static dyn BlockDriver)) {
    let devices: Vec<&'static dyn BlockDriver> = REGISTRY
        .lock()
        .devices
        .iter()
        .filter(|e| e.class == class && e.driver_id == driver_id)
        .map(|e| e.driver)
        .collect();
    for driver in devices {
        f(driver);
    }
}
