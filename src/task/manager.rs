//! Per-CPU task manager: scheduling, sleep, block/unblock, teardown.
//!
//! Each CPU owns one [`TaskManagerState`] behind its own lock. A task is
//! scheduled only on the CPU it was created on; `unblock` reaches across
//! CPUs by locking the target task's owning manager directly rather than
//! sending an IPI — the woken task simply waits for that CPU's next
//! timer tick to be switched in, matching this kernel's tolerance for
//! a few milliseconds of wakeup latency.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Once;

use crate::config::MAX_CPUS;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::sync::SpinLock;
use crate::task::list::TaskQueue;
use crate::task::switch;
use crate::task::task::{Task, TaskId, TaskState};

const _: () = assert!(MAX_CPUS == 8, "PER_CPU literal below must match config::MAX_CPUS");

struct TaskManagerState {
    running: TaskId,
    runnable: TaskQueue,
    sleeping: Vec<(u64, TaskId)>,
    idle_task: TaskId,
    deleter_task: TaskId,
    task_to_delete: Option<TaskId>,
    scheduler_lock: i32,
}

static ALL_TASKS: SpinLock<Vec<Option<Task>>> = SpinLock::new(Vec::new());
static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(0);

static PER_CPU: [Once<SpinLock<TaskManagerState>>; 8] = [
    Once::new(),
    Once::new(),
    Once::new(),
    Once::new(),
    Once::new(),
    Once::new(),
    Once::new(),
    Once::new(),
];

fn alloc_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

fn register_task(task: Task) -> TaskId {
    let id = task.id;
    let mut tasks = ALL_TASKS.lock();
    let idx = id as usize;
    if tasks.len() <= idx {
        tasks.resize_with(idx + 1, || None);
    }
    tasks[idx] = Some(task);
    id
}

fn spawn_on(cpu: usize, entry: u32, page_directory: Option<PhysAddr>) -> TaskId {
    let id = alloc_task_id();
    register_task(Task::new(id, cpu, entry, page_directory))
}

/// Runs `f` with mutable access to the task identified by `id`.
///
/// Panics if `id` does not name a live task — every ID handed out by
/// this module stays valid until the deleter task reclaims it, and
/// callers only ever hold IDs of tasks they know are still alive.
pub fn with_task<R>(id: TaskId, f: impl FnOnce(&mut Task) -> R) -> R {
    let mut tasks = ALL_TASKS.lock();
    let task = tasks
        .get_mut(id as usize)
        .and_then(|slot| slot.as_mut())
        .unwrap_or_else(|| panic!("task manager: unknown task id {id}"));
    f(task)
}

/// The currently running task on this CPU, or `None` before this CPU's
/// task manager has been initialized (the pre-scheduler boot state).
pub fn current_task_id() -> Option<TaskId> {
    let cpu = crate::arch::smp::current_cpu_id();
    PER_CPU[cpu].get().map(|s| s.lock().running)
}

fn lock_scheduler_for(cpu: usize) {
    if let Some(s) = PER_CPU[cpu].get() {
        s.lock().scheduler_lock += 1;
    }
}

fn unlock_scheduler_for(cpu: usize) {
    if let Some(s) = PER_CPU[cpu].get() {
        s.lock().scheduler_lock -= 1;
    }
}

/// Locks the scheduler on the calling CPU, preventing `schedule` from
/// switching away from the running task until a matching `unlock_scheduler`.
/// Nests: the lock is a count, not a flag.
pub fn lock_scheduler() {
    lock_scheduler_for(crate::arch::smp::current_cpu_id());
}

pub fn unlock_scheduler() {
    unlock_scheduler_for(crate::arch::smp::current_cpu_id());
}

/// Appends the calling task to `queue` and marks it blocked. Must be
/// called by the task blocking itself, with `queue`'s own lock already
/// held by the caller so no other CPU can pop it off before the state
/// change is visible.
pub fn block_current(queue: &mut TaskQueue) {
    let cpu = crate::arch::smp::current_cpu_id();
    lock_scheduler_for(cpu);
    let id = PER_CPU[cpu].get().unwrap().lock().running;
    with_task(id, |t| t.state = TaskState::Blocked);
    queue.push_back(id);
    unlock_scheduler_for(cpu);
}

/// Moves `id` from wherever it was blocked back onto its owning CPU's
/// runnable queue.
pub fn unblock(id: TaskId) {
    let cpu = with_task(id, |t| t.cpu);
    lock_scheduler_for(cpu);
    with_task(id, |t| t.state = TaskState::Runnable);
    PER_CPU[cpu].get().unwrap().lock().runnable.push_back(id);
    unlock_scheduler_for(cpu);
}

/// Forces an immediate scheduling step, for use outside the timer ISR
/// (e.g. after blocking on a resource). Interrupts are disabled for the
/// duration if they were enabled, and restored afterward.
pub fn reschedule() {
    let was_enabled = crate::arch::cpu::interrupts_enabled();
    if was_enabled {
        crate::arch::cpu::disable_interrupts();
    }
    schedule();
    if was_enabled {
        crate::arch::cpu::enable_interrupts();
    }
}

/// Scheduling step. Intended to be called from the timer IRQ handler or
/// the syscall ISR, but safe to call from any context.
pub fn schedule() {
    let cpu = crate::arch::smp::current_cpu_id();
    wake_sleeping_tasks(cpu);

    let (sched_locked, caller_id) = match PER_CPU[cpu].get() {
        Some(slot) => {
            let s = slot.lock();
            (s.scheduler_lock > 0, s.running)
        }
        None => return,
    };
    if sched_locked {
        return;
    }

    let (caller_terminating, caller_blocked, caller_sleeping, caller_mutexes) =
        with_task(caller_id, |t| {
            (
                t.state == TaskState::Terminating,
                t.state == TaskState::Blocked,
                matches!(t.state, TaskState::Sleeping { .. }),
                t.num_owned_mutexes,
            )
        });

    let next_id;
    {
        let slot = PER_CPU[cpu].get().unwrap();
        let mut state = slot.lock();

        if caller_terminating && !caller_blocked && caller_mutexes == 0 {
            next_id = state.deleter_task;
            state.task_to_delete = Some(caller_id);
            // The deleter task unlocks once it has reclaimed caller_id.
            state.scheduler_lock += 1;
        } else {
            match state.runnable.pop_front() {
                Some(id) => {
                    if !caller_blocked && !caller_sleeping {
                        state.runnable.push_back(caller_id);
                    }
                    next_id = id;
                }
                None => {
                    if caller_blocked {
                        panic!("task manager: no task available to preempt a blocked running task");
                    }
                    return;
                }
            }
        }

        state.running = next_id;
    }

    with_task(next_id, |t| t.state = TaskState::Running);
    with_task(caller_id, |t| {
        if t.state == TaskState::Running {
            t.state = TaskState::Runnable;
        }
    });

    let (from_slot, to_sp, to_cr3): (*mut VirtAddr, VirtAddr, u32) = {
        let mut tasks = ALL_TASKS.lock();
        let from_ptr = tasks[caller_id as usize].as_mut().unwrap() as *mut Task;
        let to = tasks[next_id as usize].as_ref().unwrap();
        let to_sp = to.stack_pointer;
        let to_cr3 = to.page_directory.map(PhysAddr::as_u32).unwrap_or(0);
        (unsafe { &mut (*from_ptr).stack_pointer as *mut VirtAddr }, to_sp, to_cr3)
    };

    unsafe {
        switch::switch_to(from_slot, to_sp, to_cr3);
    }
}

fn wake_sleeping_tasks(cpu: usize) {
    let now = crate::arch::pit::counter_ms();
    let due: Vec<TaskId> = {
        let slot = match PER_CPU[cpu].get() {
            Some(s) => s,
            None => return,
        };
        let mut state = slot.lock();
        let (due, still_sleeping): (Vec<_>, Vec<_>) =
            state.sleeping.drain(..).partition(|&(wake_tick, _)| wake_tick <= now);
        state.sleeping = still_sleeping;
        due.into_iter().map(|(_, id)| id).collect()
    };
    for id in due {
        unblock(id);
    }
}

/// Blocks the calling task for at least `duration_ms` milliseconds.
pub fn sleep_ms(duration_ms: u32) {
    let cpu = crate::arch::smp::current_cpu_id();
    let id = match current_task_id() {
        Some(id) => id,
        None => panic!("task manager: sleep_ms called with no running task"),
    };

    let already_terminating = with_task(id, |t| t.state == TaskState::Terminating);
    if !already_terminating {
        let wake_tick = crate::arch::pit::counter_ms() + duration_ms as u64;
        lock_scheduler_for(cpu);
        with_task(id, |t| t.state = TaskState::Sleeping { wake_tick });
        PER_CPU[cpu].get().unwrap().lock().sleeping.push((wake_tick, id));
        unlock_scheduler_for(cpu);
    }

    schedule();
}

/// Marks `id` for teardown. It is reclaimed by its owning CPU's deleter
/// task the next time it is switched away from while unblocked and
/// holding no mutexes.
pub fn terminate(id: TaskId) {
    let is_deleter = PER_CPU
        .iter()
        .any(|slot| slot.get().is_some_and(|s| s.lock().deleter_task == id));
    if is_deleter {
        panic!("task manager: deleter task cannot terminate itself");
    }
    with_task(id, |t| t.state = TaskState::Terminating);
}

/// Spawns a new kernel-mode task on the calling CPU, runnable immediately.
pub fn new_kernel_task(entry: u32) -> TaskId {
    let cpu = crate::arch::smp::current_cpu_id();
    let id = spawn_on(cpu, entry, None);
    lock_scheduler_for(cpu);
    PER_CPU[cpu].get().unwrap().lock().runnable.push_back(id);
    unlock_scheduler_for(cpu);
    id
}

/// Spawns a new task under its own address space, reached in kernel mode
/// at `entry`. The caller is responsible for mapping that address space's
/// user stack before the task runs; transitioning to ring 3 is the
/// task's own first action (see `arch::cpu::enter_usermode`).
pub fn new_user_task(page_directory: PhysAddr, entry: u32) -> TaskId {
    let cpu = crate::arch::smp::current_cpu_id();
    let id = spawn_on(cpu, entry, Some(page_directory));
    lock_scheduler_for(cpu);
    PER_CPU[cpu].get().unwrap().lock().runnable.push_back(id);
    unlock_scheduler_for(cpu);
    id
}

/// Initializes this CPU's task manager (idle task, deleter task, and the
/// given initial task) and switches into it. Never returns. `init_entry`
/// must enable interrupts once running, or no further preemption happens
/// on this CPU.
pub fn init(cpu: usize, init_entry: u32) -> ! {
    let idle_id = spawn_on(cpu, idle_task_entry as u32, None);
    let deleter_id = spawn_on(cpu, deleter_task_entry as u32, None);
    with_task(deleter_id, |t| t.state = TaskState::Blocked);
    let init_id = spawn_on(cpu, init_entry, None);

    {
        let mut state = TaskManagerState {
            running: init_id,
            runnable: TaskQueue::new(),
            sleeping: Vec::new(),
            idle_task: idle_id,
            deleter_task: deleter_id,
            task_to_delete: None,
            scheduler_lock: 1,
        };
        state.runnable.push_back(idle_id);
        assert!(PER_CPU[cpu].get().is_none(), "task manager: init called more than once for this cpu");
        PER_CPU[cpu].call_once(|| SpinLock::new(state));
    }

    with_task(init_id, |t| t.state = TaskState::Running);

    unlock_scheduler_for(cpu);

    let init_sp = with_task(init_id, |t| t.stack_pointer);
    unsafe {
        switch::switch_to(core::ptr::null_mut(), init_sp, 0);
    }
    unreachable!("task manager: initial task entry returned");
}

extern "C" fn idle_task_entry() -> ! {
    crate::arch::cpu::enable_interrupts();
    loop {
        crate::arch::cpu::halt();
    }
}

/// Initial task entry for an AP: it has nothing useful to do beyond
/// becoming this CPU's first runnable task, so it behaves exactly like
/// the idle task until the scheduler hands it real work.
pub extern "C" fn ap_init_entry() -> ! {
    idle_task_entry()
}

extern "C" fn deleter_task_entry() -> ! {
    loop {
        let cpu = crate::arch::smp::current_cpu_id();
        let to_delete = PER_CPU[cpu]
            .get()
            .unwrap()
            .lock()
            .task_to_delete
            .take()
            .expect("deleter task woken with nothing to delete");

        with_task(to_delete, |t| {
            assert_eq!(t.state, TaskState::Terminating);
            assert_eq!(t.num_owned_mutexes, 0);
        });

        if let Some(dir) = with_task(to_delete, |t| t.page_directory) {
            crate::memory::vmm::free_address_space(dir);
        }

        {
            let mut tasks = ALL_TASKS.lock();
            tasks[to_delete as usize] = None;
        }

        with_task(
            PER_CPU[cpu].get().unwrap().lock().deleter_task,
            |t| t.state = TaskState::Blocked,
        );

        unlock_scheduler();
        schedule();
    }
}
