//! Software-only architecture backend used by `#[cfg(test)]` unit tests,
//! modeled on Hubris's `sys/kern/src/arch/fake.rs`: the scheduler, timer and
//! interrupt-dispatch logic are architecture-agnostic by construction, so
//! exercising them doesn't need a real CPU's register file or page tables —
//! it needs something that tracks the same *events* (a context switch
//! happened between these two tasks, interrupts got disabled and later
//! restored) so tests can assert on them.
//!
//! [`FakeThreadRegs`] carries no real machine state at all, just the id the
//! test gave the task when it built the task's register block; a "context
//! switch" here is recording which id took over from which, not
//! transferring control flow the way [`super::i386::context_switch`] does.

use crate::arch::Hal;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// A no-op register block: just the id a test constructed it with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FakeThreadRegs {
    pub id: u32,
}

impl FakeThreadRegs {
    pub const fn new(id: u32) -> Self {
        FakeThreadRegs { id }
    }
}

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);

lazy_static::lazy_static! {
    static ref SWITCH_LOG: Mutex<Vec<(u32, u32)>> = Mutex::new(Vec::new());
}

/// Every `(from, to)` pair recorded by [`FakeHal::context_switch`] since the
/// last [`reset`].
pub fn switch_log() -> Vec<(u32, u32)> {
    SWITCH_LOG.lock().clone()
}

/// Clears the switch log and re-enables interrupts. Call between tests that
/// share the global fake backend.
pub fn reset() {
    SWITCH_LOG.lock().clear();
    INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
}

pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.load(Ordering::SeqCst)
}

/// Zero rather than a real higher-half base: under the fake backend,
/// "physical" addresses handed to the frame/page allocators are real host
/// pointers obtained from the host allocator (see
/// `memory::test_support::fake_backing_region`), so `P2L`/`L2P` must be the
/// identity function to keep them dereferenceable.
pub fn higher_half_addr() -> usize {
    0
}

pub struct FakeHal;

impl Hal for FakeHal {
    fn get_and_disable_interrupts() -> usize {
        let was_enabled = INTERRUPTS_ENABLED.swap(false, Ordering::SeqCst);
        was_enabled as usize
    }

    fn restore_interrupts(flags: usize) {
        if flags != 0 {
            INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
        }
    }

    fn enable_interrupts() {
        INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
    }

    fn disable_interrupts() {
        INTERRUPTS_ENABLED.store(false, Ordering::SeqCst);
    }

    fn wait_for_interrupt() {
        // Nothing to wait on; tests drive time and events directly.
    }

    fn tlb_invalidate(_virt: usize) {}

    unsafe fn context_switch(new: *mut FakeThreadRegs, old: *mut FakeThreadRegs) {
        let (new_id, old_id) = unsafe { ((*new).id, (*old).id) };
        SWITCH_LOG.lock().push((old_id, new_id));
    }

    fn new_task_regs(tid: u32, _stack_top: usize, _entry: extern "C" fn(usize) -> !, _arg: usize) -> FakeThreadRegs {
        FakeThreadRegs::new(tid)
    }

    fn new_root_task_regs(tid: u32) -> FakeThreadRegs {
        FakeThreadRegs::new(tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_switch_is_logged() {
        reset();
        let mut a = FakeThreadRegs::new(1);
        let mut b = FakeThreadRegs::new(2);
        unsafe { FakeHal::context_switch(&mut b, &mut a) };
        assert_eq!(switch_log(), alloc::vec![(1, 2)]);
    }

    #[test]
    fn disable_then_restore_reenables() {
        reset();
        let flags = FakeHal::get_and_disable_interrupts();
        assert!(!interrupts_enabled());
        FakeHal::restore_interrupts(flags);
        assert!(interrupts_enabled());
    }
}
