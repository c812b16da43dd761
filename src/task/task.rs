//! Task control block.

use alloc::boxed::Box;

use crate::config::KERNEL_STACK_SIZE;
use crate::memory::address::{PhysAddr, VirtAddr};

/// Stable, process-wide-unique task handle. Cheap to copy and store in
/// wait-lists; looking a task up by ID goes through
/// [`manager::with_task`](super::manager::with_task).
pub type TaskId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// On a runnable queue, eligible to be switched to.
    Runnable,
    /// Currently executing on its owning CPU.
    Running,
    /// On a wait-list (mutex, semaphore, or other blocking resource).
    Blocked,
    /// On the sleeping queue until `wake_tick` is reached.
    Sleeping { wake_tick: u64 },
    /// Marked for teardown; the deleter task will reclaim it once it is
    /// neither blocked nor holding any mutex.
    Terminating,
}

/// A single schedulable unit of execution.
///
/// Every task owns a kernel stack. User tasks additionally carry the
/// physical address of their page directory; kernel tasks share the
/// kernel address space's page directory (see `memory::vmm::kvas_dir`).
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    pub cpu: usize,

    /// Saved stack pointer, valid only while this task is not running.
    pub stack_pointer: VirtAddr,
    /// Backing storage for the kernel stack; never touched once the task
    /// is runnable except by the deleter task reclaiming it.
    pub kernel_stack: Box<[u8]>,

    /// Page directory this task runs under. `None` means the shared
    /// kernel address space (KVAS).
    pub page_directory: Option<PhysAddr>,

    pub num_owned_mutexes: u32,
}

impl Task {
    /// Builds a new task whose kernel stack is primed so that the first
    /// context switch into it lands on `entry` with zeroed
    /// callee-saved registers (EDI, ESI, EBX, EBP) per
    /// [`switch::switch_to`](super::switch::switch_to)'s calling
    /// convention.
    pub fn new(id: TaskId, cpu: usize, entry: u32, page_directory: Option<PhysAddr>) -> Self {
        let mut kernel_stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let stack_pointer = super::switch::prepare_initial_stack(&mut kernel_stack, entry);

        Self {
            id,
            state: TaskState::Runnable,
            cpu,
            stack_pointer,
            kernel_stack,
            page_directory,
            num_owned_mutexes: 0,
        }
    }
}
