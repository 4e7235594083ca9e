//! Round-robin preemptive scheduler (C9): a ready queue, a sleep queue, a
//! postpone-switch critical section, timer-driven preemption and sleep
//! wakeup, and a dedicated cleanup task that frees terminated TCBs once
//! their ref count drops to zero.
//!
//! Grounded on `original_source/kernel/tasks/scheduler.c`. The termination
//! list is deliberately a bare [`IntrusiveList`], not a ref-counting
//! [`TaskQueue`]: a task parked there while its ref count settles must
//! never itself hold a reference, or the cleanup task would wait forever
//! for a count that can never reach zero — the same reasoning the original
//! gives for keeping its termination queue unwrapped.
//!
//! All scheduler state is a handful of atomics rather than a struct behind
//! a lock: every public entry point disables interrupts for its whole
//! duration, which on this single-CPU core is already mutual exclusion,
//! matching `scheduler_lock`/`scheduler_unlock` in the source this module
//! is grounded on.

use crate::arch::{ActiveHal, Hal};
use crate::boot_config::TIME_SLICE_NS;
use crate::data_structures::intrusive_list::{IntrusiveList, ListLink};
use crate::interrupts;
use crate::kerrno::Errno;
use crate::memory::frame_allocator::FrameAllocator;
use crate::task::queue::{self, TaskQueue};
use crate::task::{self, BlockReason, StatusFlags, TaskState, Tcb};
use crate::timer;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

static READY_QUEUE: TaskQueue = TaskQueue::new();
static SLEEP_QUEUE: TaskQueue = TaskQueue::new();
static TERMINATION_LIST: Mutex<IntrusiveList> = Mutex::new(IntrusiveList::new());

static CURRENT_TASK: AtomicPtr<Tcb> = AtomicPtr::new(core::ptr::null_mut());
static CLEANUP_TASK: AtomicPtr<Tcb> = AtomicPtr::new(core::ptr::null_mut());

static LAST_ACCOUNTING_NS: AtomicU64 = AtomicU64::new(0);
static IDLE_TIME_NS: AtomicU64 = AtomicU64::new(0);
static PREEMPTION_DEADLINE_NS: AtomicU64 = AtomicU64::new(0);
static EARLIEST_WAKEUP_NS: AtomicU64 = AtomicU64::new(u64::MAX);

static POSTPONE_COUNT: AtomicU32 = AtomicU32::new(0);
static POSTPONED: AtomicBool = AtomicBool::new(false);
static INITIALISED: AtomicBool = AtomicBool::new(false);

fn current_task_ptr() -> Option<NonNull<Tcb>> {
    NonNull::new(CURRENT_TASK.load(Ordering::SeqCst))
}

fn set_current_task(task: Option<NonNull<Tcb>>) {
    CURRENT_TASK.store(task.map_or(core::ptr::null_mut(), NonNull::as_ptr), Ordering::SeqCst);
}

fn cleanup_task_ptr() -> Option<NonNull<Tcb>> {
    NonNull::new(CLEANUP_TASK.load(Ordering::SeqCst))
}

fn preemption_deadline() -> u64 {
    PREEMPTION_DEADLINE_NS.load(Ordering::SeqCst)
}

fn set_preemption_deadline(deadline: u64) {
    PREEMPTION_DEADLINE_NS.store(deadline, Ordering::SeqCst);
}

fn earliest_wakeup() -> Option<u64> {
    match EARLIEST_WAKEUP_NS.load(Ordering::SeqCst) {
        u64::MAX => None,
        deadline => Some(deadline),
    }
}

fn set_earliest_wakeup(deadline: Option<u64>) {
    EARLIEST_WAKEUP_NS.store(deadline.unwrap_or(u64::MAX), Ordering::SeqCst);
}

/// The currently running task, or `None` if the CPU is idle.
pub fn current_task() -> Option<NonNull<Tcb>> {
    current_task_ptr()
}

pub fn is_initialised() -> bool {
    INITIALISED.load(Ordering::SeqCst)
}

/// Total time spent with no task running, since boot.
pub fn idle_time_ns() -> u64 {
    IDLE_TIME_NS.load(Ordering::SeqCst)
}

/// Sets up the scheduler around the already-running boot thread and spawns
/// the cleanup task. `frames` must outlive the kernel: the cleanup task
/// holds onto it for the rest of its life to free terminated tasks' kernel
/// stacks.
pub fn init(frames: &'static FrameAllocator) -> Result<(), Errno> {
    crate::assert_called_once!("sched::init() must not be called more than once");
    let root = task::create_root_task();
    set_current_task(Some(root));

    let now = timer::time_since_boot();
    LAST_ACCOUNTING_NS.store(now, Ordering::SeqCst);
    let deadline = now + TIME_SLICE_NS;
    set_preemption_deadline(deadline);
    INITIALISED.store(true, Ordering::SeqCst);

    if !timer::register_timed_event(deadline, preemption_callback) {
        crate::kpanic!("sched: failed to arm the initial preemption event");
    }

    interrupts::set_scheduler_hooks(on_interrupt_start, on_interrupt_end);

    let cleanup = task::create_task(frames, cleanup_thread, frames as *const FrameAllocator as usize)?;
    CLEANUP_TASK.store(cleanup.as_ptr(), Ordering::SeqCst);
    unblock(cleanup);

    Ok(())
}

/// Creates a task and makes it ready to run, returning its `tid`. This is
/// the entry point callers use — `task::create_task` only builds the TCB;
/// scheduling it is this module's job.
pub fn spawn(frames: &FrameAllocator, entry: extern "C" fn(usize) -> !, arg: usize) -> Result<u32, Errno> {
    let task = task::create_task(frames, entry, arg)?;
    let tid = unsafe { task.as_ref() }.tid();
    unblock(task);
    Ok(tid)
}

fn account_time() {
    let now = timer::time_since_boot();
    let last = LAST_ACCOUNTING_NS.swap(now, Ordering::SeqCst);
    let elapsed = now.saturating_sub(last);

    match current_task_ptr() {
        Some(task) => unsafe { task.as_ref() }.add_cpu_time_ns(elapsed),
        None => {
            IDLE_TIME_NS.fetch_add(elapsed, Ordering::SeqCst);
        }
    }
}

/// Voluntarily gives up the CPU.
pub fn yield_now() {
    let flags = ActiveHal::get_and_disable_interrupts();
    schedule_locked();
    ActiveHal::restore_interrupts(flags);
}

/// Marks the current task blocked for `reason` and reschedules.
pub fn block(reason: BlockReason) {
    let flags = ActiveHal::get_and_disable_interrupts();
    let current = current_task_ptr().expect("sched: block with no current task");
    let tcb = unsafe { current.as_ref() };
    tcb.set_block_reason(reason);
    tcb.set_state(TaskState::Blocked);
    schedule_locked();
    ActiveHal::restore_interrupts(flags);
}

/// Makes `task` ready to run if it isn't already, and arms preemption if
/// the running task currently has none scheduled.
pub fn unblock(task: NonNull<Tcb>) {
    let flags = ActiveHal::get_and_disable_interrupts();
    unblock_locked(task);
    ActiveHal::restore_interrupts(flags);
}

fn unblock_locked(task: NonNull<Tcb>) {
    let tcb = unsafe { task.as_ref() };
    if tcb.state() != TaskState::ReadyToRun {
        tcb.set_state(TaskState::ReadyToRun);
        unsafe { READY_QUEUE.push_back(task) };
    }

    if current_task_ptr().is_some() && preemption_deadline() == 0 {
        set_preemption_deadline(timer::time_since_boot() + TIME_SLICE_NS);
    }
}

/// Blocks the current task until at least `deadline_ns`. Returns
/// immediately if that time has already passed.
pub fn sleep_until(deadline_ns: u64) {
    let flags = critical_section_start();

    if deadline_ns <= timer::time_since_boot() {
        critical_section_end(flags);
        return;
    }

    let current = current_task_ptr().expect("sched: sleep_until with no current task");
    unsafe { current.as_ref() }.set_wake_deadline_ns(deadline_ns);
    unsafe { SLEEP_QUEUE.push_back(current) };

    if deadline_ns < earliest_wakeup().unwrap_or(u64::MAX) {
        set_earliest_wakeup(Some(deadline_ns));
        if !timer::register_timed_event(deadline_ns, sleep_expiry_callback) {
            crate::kpanic!("sched: failed to arm a sleep expiry event");
        }
    }

    critical_section_end(flags);
    block(BlockReason::Sleep);
}

fn terminate_locked() {
    let current = current_task_ptr().expect("sched: terminate with no current task");
    unsafe {
        let link = queue::queue_link_ptr(current);
        TERMINATION_LIST.lock().push_back(link);
    }

    let tcb = unsafe { current.as_ref() };
    tcb.set_block_reason(BlockReason::Terminated);
    tcb.set_state(TaskState::Terminated);
    schedule_locked();

    if let Some(cleanup) = cleanup_task_ptr() {
        unblock_locked(cleanup);
    }
}

/// Terminates the current task: parks it on the termination list, wakes
/// the cleanup task, and switches away for good. Never returns — nothing
/// ever context-switches back into a terminated task.
pub fn terminate() -> ! {
    let flags = critical_section_start();
    terminate_locked();
    critical_section_end(flags);
    crate::kpanic!("sched: a terminated task resumed after its final context switch")
}

/// Disables interrupts and defers the next reschedule until a matching
/// [`critical_section_end`], so a sequence of unblocks can't be preempted
/// partway through by the first task it wakes.
pub fn critical_section_start() -> usize {
    let flags = ActiveHal::get_and_disable_interrupts();
    POSTPONE_COUNT.fetch_add(1, Ordering::SeqCst);
    flags
}

pub fn critical_section_end(flags: usize) {
    let remaining = POSTPONE_COUNT.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 && POSTPONED.load(Ordering::SeqCst) {
        POSTPONED.store(false, Ordering::SeqCst);
        schedule_locked();
    }
    ActiveHal::restore_interrupts(flags);
}

fn schedule_locked() {
    account_time();

    if POSTPONE_COUNT.load(Ordering::SeqCst) > 0 {
        POSTPONED.store(true, Ordering::SeqCst);
        return;
    }

    if let Some(next) = READY_QUEUE.pop_front() {
        switch_task(next);
        return;
    }

    match current_task_ptr() {
        Some(current) if unsafe { current.as_ref() }.state() == TaskState::Running => {
            // Nothing else is runnable; let it keep going.
        }
        _ => idle_until_ready(),
    }
}

/// Parks with no current task, halting until the ready queue has
/// something in it — the only thing that can refill it with interrupts
/// disabled is a timer interrupt's bottom half.
fn idle_until_ready() {
    let parked = current_task_ptr();
    set_current_task(None);
    set_preemption_deadline(0);

    while READY_QUEUE.is_empty() {
        ActiveHal::enable_interrupts();
        ActiveHal::wait_for_interrupt();
        ActiveHal::disable_interrupts();
    }

    set_current_task(parked);
    let next = READY_QUEUE.pop_front().expect("sched: ready queue emptied between check and pop");

    if Some(next) == parked {
        unsafe { next.as_ref() }.set_state(TaskState::Running);
    } else {
        switch_task(next);
    }
}

fn switch_task(new_task: NonNull<Tcb>) {
    if POSTPONE_COUNT.load(Ordering::SeqCst) > 0 {
        POSTPONED.store(true, Ordering::SeqCst);
        // Exempted from the postponement: goes to the ready-queue head so
        // it's the one actually dispatched once postponement ends.
        unsafe { READY_QUEUE.push_front(new_task) };
        return;
    }

    let old = current_task_ptr().expect("sched: switch attempted with no current task");

    if unsafe { old.as_ref() }.state() == TaskState::Running {
        unsafe { old.as_ref() }.set_state(TaskState::ReadyToRun);
        unsafe { READY_QUEUE.push_back(old) };
    }

    if READY_QUEUE.is_empty() && unsafe { old.as_ref() }.state() != TaskState::Running {
        set_preemption_deadline(0);
    } else {
        set_preemption_deadline(timer::time_since_boot() + TIME_SLICE_NS);
    }

    unsafe { new_task.as_ref() }.set_state(TaskState::Running);
    set_current_task(Some(new_task));

    unsafe { ActiveHal::context_switch(new_task.as_ref().regs_ptr(), old.as_ref().regs_ptr()) };
}

fn on_interrupt_start() {
    if let Some(task) = current_task_ptr() {
        unsafe { task.as_ref() }.set_interrupt_context(true);
    }
}

fn on_interrupt_end() {
    if let Some(task) = current_task_ptr() {
        let tcb = unsafe { task.as_ref() };
        if tcb.status().contains(StatusFlags::PREEMPT) {
            tcb.set_preempt(false);
            debug_assert_eq!(tcb.state(), TaskState::Running, "sched: preempting a non-running task");
            schedule_locked();
        }
    }

    // Re-read: schedule_locked() above may have changed who's current.
    if let Some(task) = current_task_ptr() {
        unsafe { task.as_ref() }.set_interrupt_context(false);
    }
}

fn preemption_callback(now: u64, _deadline: u64) {
    let mut next = now + TIME_SLICE_NS;
    let deadline = preemption_deadline();

    if deadline != 0 {
        debug_assert!(deadline >= now, "sched: preemption callback fired late");
        if deadline == now {
            if let Some(task) = current_task_ptr() {
                unsafe { task.as_ref() }.set_preempt(true);
            }
        } else {
            next = deadline;
        }
    }

    if !timer::register_timed_event(next, preemption_callback) {
        crate::kpanic!("sched: failed to re-arm the preemption event");
    }
}

fn sleep_expiry_callback(now: u64, _deadline: u64) {
    let mut earliest: Option<u64> = None;

    for task in SLEEP_QUEUE.iter() {
        let tcb = unsafe { task.as_ref() };
        let wake_at = tcb.wake_deadline_ns();
        if wake_at <= now {
            queue::remove_from_current_task_queue(task);
            unblock(task);
        } else if earliest.is_none_or(|e| wake_at < e) {
            earliest = Some(wake_at);
        }
    }

    set_earliest_wakeup(earliest);
    if let Some(deadline) = earliest {
        if !timer::register_timed_event(deadline, sleep_expiry_callback) {
            crate::kpanic!("sched: failed to re-arm the sleep expiry event");
        }
    }
}

fn termination_list_is_empty() -> bool {
    TERMINATION_LIST.lock().is_empty()
}

fn drain_termination_list(frames: &FrameAllocator) {
    let snapshot: Vec<NonNull<Tcb>> = TERMINATION_LIST
        .lock()
        .iter()
        .map(|link| unsafe { ListLink::container_of::<Tcb>(link, queue::QUEUE_LINK_OFFSET) })
        .collect();

    for task in snapshot {
        if unsafe { task.as_ref() }.ref_count() == 0 {
            let link = queue::queue_link_ptr(task);
            unsafe { TERMINATION_LIST.lock().unlink(link) };
            unsafe { task::free_terminated_task(frames, task) };
        }
    }
}

extern "C" fn cleanup_thread(frames_ptr: usize) -> ! {
    let frames = unsafe { &*(frames_ptr as *const FrameAllocator) };

    loop {
        let flags = critical_section_start();
        drain_termination_list(frames);

        if termination_list_is_empty() {
            if let Some(current) = current_task_ptr() {
                let tcb = unsafe { current.as_ref() };
                tcb.set_block_reason(BlockReason::Paused);
                tcb.set_state(TaskState::Blocked);
            }
        }

        // Always reschedules: while still inside the critical section this
        // only records that a switch is owed, which `critical_section_end`
        // then actually performs — so the task stays `Blocked` only when
        // the list really was empty, and otherwise just yields its turn.
        schedule_locked();
        critical_section_end(flags);
    }
}

#[cfg(test)]
pub(crate) fn set_current_task_for_test(task: Option<NonNull<Tcb>>) {
    set_current_task(task);
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    while READY_QUEUE.pop_front().is_some() {}
    while SLEEP_QUEUE.pop_front().is_some() {}
    {
        let mut list = TERMINATION_LIST.lock();
        while list.pop_front().is_some() {}
    }

    set_current_task(None);
    CLEANUP_TASK.store(core::ptr::null_mut(), Ordering::SeqCst);
    LAST_ACCOUNTING_NS.store(0, Ordering::SeqCst);
    IDLE_TIME_NS.store(0, Ordering::SeqCst);
    set_preemption_deadline(0);
    set_earliest_wakeup(None);
    POSTPONE_COUNT.store(0, Ordering::SeqCst);
    POSTPONED.store(false, Ordering::SeqCst);
    INITIALISED.store(false, Ordering::SeqCst);

    timer::reset_for_test();
    crate::arch::fake::reset();
}
