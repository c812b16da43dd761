//! Block-device request pipeline.
//!
//! Grounded on the reference kernel's `blkdev.c`/`blkdev.h`: a single
//! worker task owns a bounded queue of request pointers and hands each
//! one to whichever driver context [`crate::devmgr`] resolves the
//! request's device handle to. The driver signals completion itself,
//! asynchronously, via the request's semaphore — the worker moves on
//! to the next request as soon as `submit` returns.
//!
//! Requests are expected to live on the submitting task's stack (see
//! [`sync_read`]): the kernel's low physical memory, including every
//! task's stack, sits inside the identity-mapped range `memory::vmm`
//! guarantees, so a driver can hand a request's buffer pointer straight
//! to a DMA-capable controller without a translation step.

pub mod gpt;

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::BLKDEV_QUEUE_DEPTH;
use crate::devmgr::{self, DeviceHandle};
use crate::sync::{Semaphore, SpinLock};
use crate::task::manager;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op {
    Read,
    Write,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum ReqState {
    Inactive = 0,
    Active = 1,
    Success = 2,
    Error = 3,
}

impl ReqState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => ReqState::Active,
            2 => ReqState::Success,
            3 => ReqState::Error,
            _ => ReqState::Inactive,
        }
    }
}

/// A single block I/O request. The driver that owns `device` reads
/// `op`/`start_sector`/`sector_count`/`buf` and writes `state`, exactly
/// once signalling `sem_done` when it does.
pub struct Request {
    pub op: Op,
    pub start_sector: u64,
    pub sector_count: u32,
    pub buf: *mut u8,
    pub device: DeviceHandle,
    state: AtomicU32,
    pub sem_done: Semaphore,
}

unsafe impl Send for Request {}
unsafe impl Sync for Request {}

impl Request {
    pub fn state(&self) -> ReqState {
        ReqState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ReqState) {
        self.state.store(state as u32, Ordering::Release);
    }
}

struct Queue {
    slots: [*const Request; BLKDEV_QUEUE_DEPTH],
    head: usize,
    len: usize,
}

unsafe impl Send for Queue {}

impl Queue {
    const fn new() -> Self {
        Self {
            slots: [core::ptr::null(); BLKDEV_QUEUE_DEPTH],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, req: *const Request) {
        let tail = (self.head + self.len) % BLKDEV_QUEUE_DEPTH;
        self.slots[tail] = req;
        self.len += 1;
    }

    fn pop(&mut self) -> *const Request {
        let req = self.slots[self.head];
        self.head = (self.head + 1) % BLKDEV_QUEUE_DEPTH;
        self.len -= 1;
        req
    }
}

static QUEUE: SpinLock<Queue> = SpinLock::new(Queue::new());
static SLOTS_FREE: Semaphore = Semaphore::new(BLKDEV_QUEUE_DEPTH as i32);
static SLOTS_FILLED: Semaphore = Semaphore::new(0);

/// Queues `req` for the worker task. Blocks the caller if the queue is
/// momentarily full.
fn enqueue(req: *const Request) {
    SLOTS_FREE.decrease();
    QUEUE.lock().push(req);
    SLOTS_FILLED.increase();
}

/// Entry point for the kernel's single blkdev worker task.
pub extern "C" fn worker_entry() -> ! {
    loop {
        SLOTS_FILLED.decrease();
        let req_ptr = QUEUE.lock().pop();
        SLOTS_FREE.increase();

        // SAFETY: the submitter keeps the pointed-to `Request` alive
        // until `sem_done` is signalled, which happens no earlier than
        // `submit` below returns control to the driver.
        let req = unsafe { &*req_ptr };

        let Some(driver) = devmgr::get(req.device) else {
            req.set_state(ReqState::Error);
            req.sem_done.increase();
            continue;
        };

        while driver.is_busy() {
            manager::schedule();
        }
        driver.submit(req);
    }
}

/// Spawns the blkdev worker task on the calling CPU.
pub fn spawn_worker() {
    manager::new_kernel_task(worker_entry as u32);
}

/// Synchronous convenience API: reads `sector_count` sectors starting
/// at `start_sector` from `device` into `buf`, blocking the caller
/// until the request completes. `buf` must be at least
/// `512 * sector_count` bytes and must live in identity-mapped memory.
pub fn sync_read(device: DeviceHandle, start_sector: u64, sector_count: u32, buf: *mut u8) -> bool {
    let req = Request {
        op: Op::Read,
        start_sector,
        sector_count,
        buf,
        device,
        state: AtomicU32::new(ReqState::Active as u32),
        sem_done: Semaphore::new(0),
    };
    enqueue(&req as *const Request);
    req.sem_done.decrease();
    req.state() == ReqState::Success
}

/// Synchronous convenience API for writes; see [`sync_read`].
pub fn sync_write(device: DeviceHandle, start_sector: u64, sector_count: u32, buf: *mut u8) -> bool {
    let req = Request {
        op: Op::Write,
        start_sector,
        sector_count,
        buf,
        device,
        state: AtomicU32::new(ReqState::Active as u32),
        sem_done: Semaphore::new(0),
    };
    enqueue(&req as *const Request);
    req.sem_done.decrease();
    req.state() == ReqState::Success
}
