//! Counting semaphore (C10), per spec.md §4.9.
//!
//! `acquire` grants immediately while `current_count < max_count`;
//! otherwise the caller is parked on `waiters` with [`BlockReason::LockWait`].
//! `release` hands the slot straight to the next waiter rather than
//! decrementing-then-incrementing, which is what keeps the invariant
//! "waiters nonempty ⇒ current_count == max_count" true at every observable
//! point: a released slot is either still occupied by the waiter that just
//! took it, or, with no waiters, genuinely freed. Because the hand-off never
//! touches `current_count`, a waiter resuming past its `block` call in
//! `acquire` must not re-check the count — it already owns the unit it was
//! woken for.
//!
//! Before the scheduler is initialised there is only ever one thread of
//! control (the boot thread), so `acquire`/`release` degenerate to
//! disabling/enabling interrupts — spec.md §4.9's explicit early-boot rule.

use crate::arch::{ActiveHal, Hal};
use crate::sched;
use crate::task::{BlockReason, StatusFlags};
use crate::task::queue::TaskQueue;
use core::sync::atomic::{AtomicU32, Ordering};

/// A task must never acquire or release a semaphore from interrupt
/// context — there is nowhere for it to block, and a top or bottom half
/// holding up another task's critical section would deadlock the core.
fn assert_not_interrupt_context(what: &str) {
    if let Some(task) = sched::current_task() {
        if unsafe { task.as_ref() }.status().contains(StatusFlags::INTERRUPT) {
            crate::kpanic!("sync: {what} called from interrupt context");
        }
    }
}

pub struct Semaphore {
    max_count: u32,
    current_count: AtomicU32,
    waiters: TaskQueue,
}

impl Semaphore {
    pub const fn new(max_count: u32, initial_count: u32) -> Self {
        Semaphore {
            max_count,
            current_count: AtomicU32::new(initial_count),
            waiters: TaskQueue::new(),
        }
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn current_count(&self) -> u32 {
        self.current_count.load(Ordering::SeqCst)
    }

    pub fn waiters_len(&self) -> usize {
        self.waiters.len()
    }

    /// Blocks until a unit is available, then takes it.
    pub fn acquire(&self) {
        if !sched::is_initialised() {
            ActiveHal::disable_interrupts();
            return;
        }

        assert_not_interrupt_context("acquire");

        let flags = sched::critical_section_start();

        if self.current_count.load(Ordering::SeqCst) < self.max_count {
            self.current_count.fetch_add(1, Ordering::SeqCst);
            sched::critical_section_end(flags);
            return;
        }

        let current = sched::current_task().expect("sync: acquire with no current task");
        unsafe { self.waiters.push_back(current) };
        sched::critical_section_end(flags);
        sched::block(BlockReason::LockWait);
        // The only thing that ever unblocks a task parked here is
        // `release`'s hand-off below, which transfers the unit straight to
        // us without touching `current_count` — so resuming past `block`
        // means the unit is already ours. No re-check, no loop: looping
        // back to re-test `current_count` would find it unchanged and park
        // us again forever.
    }

    /// Releases a unit: hands it directly to the longest-waiting blocked
    /// task if one exists, otherwise returns it to the pool.
    pub fn release(&self) {
        if !sched::is_initialised() {
            ActiveHal::enable_interrupts();
            return;
        }

        assert_not_interrupt_context("release");

        let flags = sched::critical_section_start();
        match self.waiters.pop_front() {
            Some(waiter) => sched::unblock(waiter),
            None => {
                self.current_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
        sched::critical_section_end(flags);
    }
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}
