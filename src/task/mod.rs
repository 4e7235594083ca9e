//! Task model (C7): the task control block, a single per-task kernel
//! stack, ref-counting, and the global task list.
//!
//! Grounded on `original_source/kernel/tasks/tasks.c` for the factory
//! (allocate a TCB and a stack, assign a `tid`, start `Blocked`, let the
//! scheduler unblock it) and `original_source/kernel/include/tasks/task.h`
//! for the TCB field layout. The architecture register block is field 0
//! so [`crate::arch::Hal::context_switch`] can treat a `*mut Tcb` as a
//! `*mut ThreadRegs` — asserted below rather than merely documented, per
//! the Design Notes' call for this invariant to be explicit.

pub mod queue;

use crate::arch::{ActiveHal, Hal, ThreadRegs};
use crate::boot_config::PAGE_SIZE;
use crate::data_structures::intrusive_list::{IntrusiveList, ListLink};
use crate::kerrno::Errno;
use crate::memory::frame_allocator::FrameAllocator;
use crate::memory::page_alloc::{self, PageOpts};
use alloc::boxed::Box;
use bitflags::bitflags;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use queue::TaskQueue;
use spin::Mutex;

/// `tid` 0 is reserved and never assigned to a real task; it means "no
/// task" wherever a `tid` is carried as an optional reference.
pub const NO_TASK: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskState {
    ReadyToRun = 0,
    Running = 1,
    Blocked = 2,
    Terminated = 3,
}

impl TaskState {
    fn from_u32(v: u32) -> TaskState {
        match v {
            0 => TaskState::ReadyToRun,
            1 => TaskState::Running,
            2 => TaskState::Blocked,
            3 => TaskState::Terminated,
            _ => unreachable!("corrupt task state {v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockReason {
    None = 0,
    Sleep = 1,
    Paused = 2,
    LockWait = 3,
    IoWait = 4,
    Terminated = 5,
}

impl BlockReason {
    fn from_u32(v: u32) -> BlockReason {
        match v {
            0 => BlockReason::None,
            1 => BlockReason::Sleep,
            2 => BlockReason::Paused,
            3 => BlockReason::LockWait,
            4 => BlockReason::IoWait,
            5 => BlockReason::Terminated,
            _ => unreachable!("corrupt block reason {v}"),
        }
    }
}

bitflags! {
    /// `PREEMPT` is set by the preemption timer's callback and consumed at
    /// interrupt epilogue; `INTERRUPT` marks a task as currently running
    /// interrupt-context code (top or bottom half) so the blocking
    /// primitives (C10) can enforce "never block from interrupt context".
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StatusFlags: u32 {
        const PREEMPT   = 1 << 0;
        const INTERRUPT = 1 << 1;
    }
}

/// The task control block. `regs` must remain field 0: the context-switch
/// assembly addresses a task by treating a `*mut Tcb` as a `*mut
/// ThreadRegs`.
#[repr(C)]
pub struct Tcb {
    pub(crate) regs: ThreadRegs,
    tid: u32,
    state: AtomicU32,
    block_reason: AtomicU32,
    wake_deadline_ns: AtomicU64,
    status: AtomicU32,
    ref_count: AtomicU32,
    cpu_time_ns: AtomicU64,
    current_task_queue: Mutex<Option<NonNull<TaskQueue>>>,
    stack_base: usize,
    stack_size: usize,
    global_link: ListLink,
    pub(crate) queue_link: ListLink,
}

const _: () = assert!(core::mem::offset_of!(Tcb, regs) == 0);

// `Tcb` is only ever reached through `NonNull`/`TaskRef` handles that are
// themselves moved across task/interrupt contexts under the scheduler's
// and task queues' own locks; every field that isn't already `Sync` is
// guarded by one of those locks or is atomic.
unsafe impl Send for Tcb {}
unsafe impl Sync for Tcb {}

impl Tcb {
    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u32(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u32, Ordering::SeqCst);
    }

    pub fn block_reason(&self) -> BlockReason {
        BlockReason::from_u32(self.block_reason.load(Ordering::SeqCst))
    }

    pub fn set_block_reason(&self, reason: BlockReason) {
        self.block_reason.store(reason as u32, Ordering::SeqCst);
    }

    pub fn wake_deadline_ns(&self) -> u64 {
        self.wake_deadline_ns.load(Ordering::SeqCst)
    }

    pub fn set_wake_deadline_ns(&self, deadline: u64) {
        self.wake_deadline_ns.store(deadline, Ordering::SeqCst);
    }

    pub fn status(&self) -> StatusFlags {
        StatusFlags::from_bits_truncate(self.status.load(Ordering::SeqCst))
    }

    pub fn set_preempt(&self, value: bool) {
        if value {
            self.status.fetch_or(StatusFlags::PREEMPT.bits(), Ordering::SeqCst);
        } else {
            self.status.fetch_and(!StatusFlags::PREEMPT.bits(), Ordering::SeqCst);
        }
    }

    pub fn set_interrupt_context(&self, value: bool) {
        if value {
            self.status.fetch_or(StatusFlags::INTERRUPT.bits(), Ordering::SeqCst);
        } else {
            self.status.fetch_and(!StatusFlags::INTERRUPT.bits(), Ordering::SeqCst);
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the ref count and returns the value *after* decrementing.
    pub(crate) fn dec_ref(&self) -> u32 {
        self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn add_cpu_time_ns(&self, elapsed: u64) {
        self.cpu_time_ns.fetch_add(elapsed, Ordering::SeqCst);
    }

    pub fn cpu_time_ns(&self) -> u64 {
        self.cpu_time_ns.load(Ordering::SeqCst)
    }

    pub(crate) fn current_queue(&self) -> Option<NonNull<TaskQueue>> {
        *self.current_task_queue.lock()
    }

    pub(crate) fn set_current_queue(&self, queue: Option<NonNull<TaskQueue>>) {
        *self.current_task_queue.lock() = queue;
    }

    /// Stack base (lowest address) and size in bytes; the cleanup task
    /// frees this region once a terminated task's ref count reaches zero.
    pub fn stack_region(&self) -> (usize, usize) {
        (self.stack_base, self.stack_size)
    }

    /// Raw pointer to the register block — the address the context-switch
    /// assembly actually operates on.
    pub fn regs_ptr(&self) -> *mut ThreadRegs {
        &self.regs as *const ThreadRegs as *mut ThreadRegs
    }
}

const GLOBAL_LINK_OFFSET: usize = core::mem::offset_of!(Tcb, global_link);

static GLOBAL_TASK_LIST: Mutex<IntrusiveList> = Mutex::new(IntrusiveList::new());
static NEXT_TID: AtomicU32 = AtomicU32::new(1);

fn next_tid() -> u32 {
    let tid = NEXT_TID.fetch_add(1, Ordering::SeqCst);
    if tid == 0 {
        crate::kpanic!("task: tid counter wrapped past u32::MAX, cannot create another task");
    }
    tid
}

fn link_into_global_list(mut ptr: NonNull<Tcb>) {
    let link = unsafe { NonNull::new_unchecked(ptr.as_ptr().byte_add(GLOBAL_LINK_OFFSET) as *mut ListLink) };
    unsafe {
        let _ = ptr.as_mut();
        GLOBAL_TASK_LIST.lock().push_back(link);
    }
}

/// Creates a task: allocates its TCB and a single-page kernel stack,
/// assigns it a `tid`, arranges for its first dispatch to resume into
/// `entry(arg)`, and places it on the global task list in the `Blocked`
/// state. The caller (the scheduler) is responsible for unblocking it —
/// creation and scheduling are kept as two separate steps.
pub fn create_task(frames: &FrameAllocator, entry: extern "C" fn(usize) -> !, arg: usize) -> Result<NonNull<Tcb>, Errno> {
    let stack_base = page_alloc::request_free_page(frames, PageOpts::CLEAR)?;
    let stack_top = stack_base + PAGE_SIZE;
    let tid = next_tid();

    let tcb = Box::new(Tcb {
        regs: ActiveHal::new_task_regs(tid, stack_top, entry, arg),
        tid,
        state: AtomicU32::new(TaskState::Blocked as u32),
        block_reason: AtomicU32::new(BlockReason::None as u32),
        wake_deadline_ns: AtomicU64::new(0),
        status: AtomicU32::new(0),
        ref_count: AtomicU32::new(0),
        cpu_time_ns: AtomicU64::new(0),
        current_task_queue: Mutex::new(None),
        stack_base,
        stack_size: PAGE_SIZE,
        global_link: ListLink::new(),
        queue_link: ListLink::new(),
    });

    let ptr = NonNull::from(Box::leak(tcb));
    link_into_global_list(ptr);
    Ok(ptr)
}

/// Synthesizes the root task for the already-running boot thread: its
/// register block is only captured the first time the scheduler switches
/// away from it, so it needs no stack of its own.
pub fn create_root_task() -> NonNull<Tcb> {
    let tid = next_tid();
    let tcb = Box::new(Tcb {
        regs: ActiveHal::new_root_task_regs(tid),
        tid,
        state: AtomicU32::new(TaskState::Running as u32),
        block_reason: AtomicU32::new(BlockReason::None as u32),
        wake_deadline_ns: AtomicU64::new(0),
        status: AtomicU32::new(0),
        ref_count: AtomicU32::new(0),
        cpu_time_ns: AtomicU64::new(0),
        current_task_queue: Mutex::new(None),
        stack_base: 0,
        stack_size: 0,
        global_link: ListLink::new(),
        queue_link: ListLink::new(),
    });

    let ptr = NonNull::from(Box::leak(tcb));
    link_into_global_list(ptr);
    ptr
}

/// An owning handle to a live task: incrementing its ref count on
/// construction and decrementing it on drop, so a live `get_task`/`put_task`
/// handle always counts against the task's ref count.
pub struct TaskRef(NonNull<Tcb>);

impl TaskRef {
    pub fn tcb(&self) -> &Tcb {
        unsafe { self.0.as_ref() }
    }

    pub fn as_ptr(&self) -> NonNull<Tcb> {
        self.0
    }
}

impl Clone for TaskRef {
    fn clone(&self) -> Self {
        self.tcb().inc_ref();
        TaskRef(self.0)
    }
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        self.tcb().dec_ref();
    }
}

/// Looks up a task by `tid` in the global task list, returning an owning
/// handle if found. `tid == 0` ([`NO_TASK`]) always misses.
pub fn get_task(tid: u32) -> Option<TaskRef> {
    if tid == NO_TASK {
        return None;
    }

    let list = GLOBAL_TASK_LIST.lock();
    for link in list.iter() {
        let ptr = unsafe { ListLink::container_of::<Tcb>(link, GLOBAL_LINK_OFFSET) };
        let tcb = unsafe { ptr.as_ref() };
        if tcb.tid() == tid {
            tcb.inc_ref();
            return Some(TaskRef(ptr));
        }
    }
    None
}

/// Releases a handle obtained from [`get_task`]. Equivalent to dropping it.
pub fn put_task(task: TaskRef) {
    drop(task);
}

/// Removes `task` from the global task list and frees its TCB and kernel
/// stack. Only the cleanup task calls this, and only once `task`'s ref
/// count has reached zero and it is `Terminated`.
///
/// # Safety
///
/// `task` must not be linked into any task queue, must have a ref count of
/// zero, and must have no other live references anywhere in the kernel.
pub unsafe fn free_terminated_task(frames: &FrameAllocator, task: NonNull<Tcb>) {
    let tcb = unsafe { task.as_ref() };
    debug_assert_eq!(tcb.ref_count(), 0, "freeing a task with outstanding references");
    debug_assert_eq!(tcb.state(), TaskState::Terminated, "freeing a task that never terminated");

    let link = unsafe { NonNull::new_unchecked(task.as_ptr().byte_add(GLOBAL_LINK_OFFSET) as *mut ListLink) };
    unsafe { GLOBAL_TASK_LIST.lock().unlink(link) };

    let (stack_base, stack_size) = tcb.stack_region();
    if stack_size > 0 {
        page_alloc::free_page(frames, stack_base, 0);
    }

    drop(unsafe { Box::from_raw(task.as_ptr()) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::fake_backing_region;

    fn frames_with(pages: usize) -> FrameAllocator {
        let frames = FrameAllocator::new();
        frames.mark_region(fake_backing_region(pages), pages * PAGE_SIZE, true);
        frames
    }

    extern "C" fn dummy_entry(_arg: usize) -> ! {
        loop {}
    }

    #[test]
    fn created_tasks_start_blocked_with_increasing_tids() {
        let frames = frames_with(4);
        let a = create_task(&frames, dummy_entry, 0).unwrap();
        let b = create_task(&frames, dummy_entry, 0).unwrap();

        let a = unsafe { a.as_ref() };
        let b = unsafe { b.as_ref() };
        assert_eq!(a.state(), TaskState::Blocked);
        assert!(b.tid() > a.tid());
        assert_ne!(a.tid(), NO_TASK);
    }

    #[test]
    fn get_task_increments_ref_count_put_task_decrements() {
        let frames = frames_with(4);
        let ptr = create_task(&frames, dummy_entry, 0).unwrap();
        let tid = unsafe { ptr.as_ref() }.tid();

        let handle = get_task(tid).unwrap();
        assert_eq!(handle.tcb().ref_count(), 1);
        let handle2 = handle.clone();
        assert_eq!(handle.tcb().ref_count(), 2);
        put_task(handle);
        assert_eq!(handle2.tcb().ref_count(), 1);
        put_task(handle2);
        assert_eq!(unsafe { ptr.as_ref() }.ref_count(), 0);
    }

    #[test]
    fn get_task_of_reserved_tid_zero_always_misses() {
        assert!(get_task(NO_TASK).is_none());
    }

    #[test]
    fn free_terminated_task_removes_it_from_the_global_list() {
        let frames = frames_with(4);
        let ptr = create_task(&frames, dummy_entry, 0).unwrap();
        let tid = unsafe { ptr.as_ref() }.tid();
        unsafe { ptr.as_ref() }.set_state(TaskState::Terminated);

        unsafe { free_terminated_task(&frames, ptr) };
        assert!(get_task(tid).is_none());
    }
}
