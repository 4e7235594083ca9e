//! Interrupt dispatcher (C5): routes architecture vectors to registered
//! handlers, enforcing top-half atomicity and queued bottom-half
//! reentrancy.
//!
//! Grounded on `original_source/kernel/tasks/interrupts.c`
//! (`generic_interrupt_handler`/`register_interrupt_handler`) for the
//! dispatch algorithm, and `original_source/kernel/arch/i386/interrupts/pic.c`
//! for the legacy PIC wrapper.
//!
//! # Two-level model
//!
//! A **top half** runs with interrupts disabled; it must be fast and
//! non-blocking. A **bottom half** runs with interrupts enabled and is
//! serialised with respect to other bottom halves on the same CPU: while one
//! bottom half is running, a second interrupt for a different vector still
//! gets its top half run immediately, but its bottom half is appended to a
//! pending queue instead of running concurrently.
//!
//! `interrupt_level` tracks how deep we are: 1 is "ordinary interrupt", 2 is
//! "interrupt that fired while a level-1 bottom half is running". Level 3
//! would mean an interrupt fired during an already-nested top half, which
//! this core never allows — [`dispatch`] panics if it ever sees one.

use crate::arch::{ActiveHal, Hal};
use crate::boot_config::N_INTERRUPT_VECTORS;
use crate::kerrno::Errno;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, RwLock};

#[cfg(not(test))]
use crate::arch::i386::pic;

/// Whatever the architecture stub can cheaply hand the dispatcher about the
/// interrupted context. Kept deliberately thin — GDT/IDT/trap-frame layout
/// is architecture setup, out of scope here; top halves that need more read
/// it from the real frame the stub built, this is just what the dispatcher
/// itself looks at.
#[derive(Clone, Copy, Debug, Default)]
pub struct InterruptStackState {
    pub error_code: u32,
}

pub type TopHalf = fn(&InterruptStackState, u32);
pub type BottomHalf = fn(u32);

const ENABLED: u32 = 1 << 0;
const QUEUED: u32 = 1 << 1;

struct InterruptEntry {
    vector: u32,
    top: UnsafeCell<Option<TopHalf>>,
    bottom: UnsafeCell<Option<BottomHalf>>,
    flags: AtomicU32,
    next: UnsafeCell<Option<NonNull<InterruptEntry>>>,
}

unsafe impl Sync for InterruptEntry {}

impl InterruptEntry {
    fn new(vector: u32) -> Self {
        InterruptEntry {
            vector,
            top: UnsafeCell::new(None),
            bottom: UnsafeCell::new(None),
            flags: AtomicU32::new(0),
            next: UnsafeCell::new(None),
        }
    }

    fn is_enabled(&self) -> bool {
        self.flags.load(Ordering::Acquire) & ENABLED != 0
    }

    fn is_queued(&self) -> bool {
        self.flags.load(Ordering::Acquire) & QUEUED != 0
    }

    /// # Safety
    /// Only valid once [`is_enabled`](Self::is_enabled) is observed true —
    /// the `Acquire` load pairs with the `Release` store in [`register`]
    /// that published these fields.
    unsafe fn top(&self) -> Option<TopHalf> {
        unsafe { *self.top.get() }
    }

    unsafe fn bottom(&self) -> Option<BottomHalf> {
        unsafe { *self.bottom.get() }
    }
}

lazy_static::lazy_static! {
    static ref TABLE: [InterruptEntry; N_INTERRUPT_VECTORS] =
        core::array::from_fn(|i| InterruptEntry::new(i as u32));
}

/// Singly-linked pending-bottom-half queue, serialised by one lock (the
/// original C implementation protects it by disabling interrupts around
/// every access instead; a spinlock is equivalent on a single core and
/// composes better with the fake architecture backend used by tests).
struct PendingQueue {
    head: Option<NonNull<InterruptEntry>>,
    tail: Option<NonNull<InterruptEntry>>,
}

unsafe impl Send for PendingQueue {}

static PENDING: Mutex<PendingQueue> = Mutex::new(PendingQueue { head: None, tail: None });

impl PendingQueue {
    fn push(&mut self, entry: NonNull<InterruptEntry>) {
        unsafe { *entry.as_ref().next.get() = None };
        match self.tail {
            Some(tail) => unsafe { *tail.as_ref().next.get() = Some(entry) },
            None => self.head = Some(entry),
        }
        self.tail = Some(entry);
    }

    fn pop(&mut self) -> Option<NonNull<InterruptEntry>> {
        let entry = self.head?;
        self.head = unsafe { *entry.as_ref().next.get() };
        if self.head.is_none() {
            self.tail = None;
        }
        Some(entry)
    }
}

static INTERRUPT_LEVEL: AtomicU32 = AtomicU32::new(0);

#[derive(Clone, Copy)]
struct SchedulerHooks {
    start_of_interrupt: fn(),
    end_of_interrupt: fn(),
}

static SCHEDULER_HOOKS: RwLock<Option<SchedulerHooks>> = RwLock::new(None);

/// Lets the scheduler (C9) observe interrupt entry/exit without the
/// dispatcher depending on the scheduler crate-wide. Absent a registration
/// (e.g. before the scheduler has been set up) the notifications are no-ops.
pub fn set_scheduler_hooks(start_of_interrupt: fn(), end_of_interrupt: fn()) {
    *SCHEDULER_HOOKS.write() = Some(SchedulerHooks { start_of_interrupt, end_of_interrupt });
}

#[cfg(test)]
pub fn clear_scheduler_hooks() {
    *SCHEDULER_HOOKS.write() = None;
}

fn notify_start_of_interrupt() {
    if let Some(hooks) = *SCHEDULER_HOOKS.read() {
        (hooks.start_of_interrupt)();
    }
}

fn notify_end_of_interrupt() {
    if let Some(hooks) = *SCHEDULER_HOOKS.read() {
        (hooks.end_of_interrupt)();
    }
}

/// Registers `vector`'s handlers. At least one of `top`/`bottom` must be
/// given. Fails with [`Errno::Inval`] for an out-of-range vector or if both
/// handlers are absent, and [`Errno::Already`] if the vector is already
/// enabled.
pub fn register(vector: u32, top: Option<TopHalf>, bottom: Option<BottomHalf>) -> Result<(), Errno> {
    if vector as usize >= N_INTERRUPT_VECTORS {
        return Err(Errno::Inval);
    }
    if top.is_none() && bottom.is_none() {
        return Err(Errno::Inval);
    }

    let entry = &TABLE[vector as usize];
    if entry.is_enabled() {
        return Err(Errno::Already);
    }

    unsafe {
        *entry.top.get() = top;
        *entry.bottom.get() = bottom;
    }
    // Release: publishes the fields written above to whichever CPU next
    // observes ENABLED via the Acquire loads in is_enabled/top/bottom.
    entry.flags.store(ENABLED, Ordering::Release);
    Ok(())
}

/// Dispatches interrupt `vector`. Called by the architecture stub with
/// interrupts already disabled (the CPU does this automatically on
/// interrupt entry); returns with interrupts disabled again.
pub fn dispatch(vector: u32, state: &InterruptStackState) {
    let level = INTERRUPT_LEVEL.fetch_add(1, Ordering::SeqCst) + 1;
    if level > 2 {
        crate::kpanic!("interrupts: nesting level {level} on vector {vector}, bug in a top half");
    }

    notify_start_of_interrupt();

    let entry = &TABLE[vector as usize];
    if !entry.is_enabled() {
        #[cfg(not(test))]
        crate::log!(warn, "unregistered interrupt {vector} fired");
        finish(level);
        return;
    }

    if let Some(top) = unsafe { entry.top() } {
        top(state, vector);
    }

    if level == 2 {
        // Safety: entry.is_enabled() was already observed true above, which
        // is the same Acquire-paired publication top()/bottom() rely on.
        let bottom_present = unsafe { entry.bottom() }.is_some();
        if bottom_present && !entry.is_queued() {
            entry.flags.fetch_or(QUEUED, Ordering::AcqRel);
            PENDING.lock().push(NonNull::from(entry));
        }
        finish(level);
        return;
    }

    if let Some(bottom) = unsafe { entry.bottom() } {
        ActiveHal::enable_interrupts();
        bottom(vector);
    }

    drain_pending_queue();

    finish(level);
}

fn drain_pending_queue() {
    loop {
        ActiveHal::disable_interrupts();
        let Some(next) = PENDING.lock().pop() else { break };

        let entry = unsafe { next.as_ref() };
        let vector = entry.vector;
        let bottom = unsafe { entry.bottom() };

        ActiveHal::enable_interrupts();
        if let Some(bottom) = bottom {
            bottom(vector);
        }
        entry.flags.fetch_and(!QUEUED, Ordering::AcqRel);
    }
    // Loop always exits right after disable_interrupts(), so interrupts are
    // left disabled here, matching dispatch's contract.
}

fn finish(level: u32) {
    if level == 1 {
        notify_end_of_interrupt();
    }
    INTERRUPT_LEVEL.fetch_sub(1, Ordering::SeqCst);
}

// The legacy-PIC-specific wrapper below touches real I/O ports, so it has
// no fake-architecture counterpart and is excluded from host unit tests —
// same boundary as `arch::i386` itself.
#[cfg(not(test))]
pub use pic_wrapper::register_pic_irq;

#[cfg(not(test))]
mod pic_wrapper {
    use super::{pic, register, BottomHalf, InterruptStackState, Ordering, TopHalf};
    use crate::kerrno::Errno;
    use core::sync::atomic::AtomicUsize;

    /// Installs a generic top half for a legacy-PIC-remapped vector: filters
    /// spurious IRQ7/IRQ15, runs the caller's own top half, then issues EOI.
    /// `irq` is the 0-15 IRQ line, not the remapped vector number.
    pub fn register_pic_irq(irq: u8, top: Option<TopHalf>, bottom: Option<BottomHalf>) -> Result<(), Errno> {
        debug_assert!(irq < 16);
        let vector =
            if irq < 8 { pic::PIC1_OFFSET as u32 + irq as u32 } else { pic::PIC2_OFFSET as u32 + (irq - 8) as u32 };

        IRQ_TOP_HALVES[irq as usize].store(top, Ordering::Relaxed);
        register(vector, Some(pic_wrapper_for(irq)), bottom)
    }

    // One generic wrapper per IRQ line so `register_pic_irq` can still hand
    // the dispatcher a plain `fn` pointer (no closures captured) while
    // knowing which IRQ it is filtering/acknowledging — the caller's own top
    // half is looked up by IRQ line from this table at call time.
    lazy_static::lazy_static! {
        static ref IRQ_TOP_HALVES: [AtomicTopHalf; 16] = core::array::from_fn(|_| AtomicTopHalf::new());
    }

    struct AtomicTopHalf(AtomicUsize);

    impl AtomicTopHalf {
        fn new() -> Self {
            AtomicTopHalf(AtomicUsize::new(0))
        }

        fn store(&self, f: Option<TopHalf>, order: Ordering) {
            let bits = f.map(|f| f as usize).unwrap_or(0);
            self.0.store(bits, order);
        }

        fn load(&self, order: Ordering) -> Option<TopHalf> {
            let bits = self.0.load(order);
            if bits == 0 {
                None
            } else {
                // Safety: only ever stored from a `TopHalf` via `store` above.
                Some(unsafe { core::mem::transmute::<usize, TopHalf>(bits) })
            }
        }
    }

    fn pic_wrapper_for(irq: u8) -> TopHalf {
        macro_rules! wrapper {
            ($irq:expr, $name:ident) => {
                fn $name(state: &InterruptStackState, vector: u32) {
                    pic_top_half($irq, state, vector)
                }
            };
        }

        wrapper!(0, irq0);
        wrapper!(1, irq1);
        wrapper!(2, irq2);
        wrapper!(3, irq3);
        wrapper!(4, irq4);
        wrapper!(5, irq5);
        wrapper!(6, irq6);
        wrapper!(7, irq7);
        wrapper!(8, irq8);
        wrapper!(9, irq9);
        wrapper!(10, irq10);
        wrapper!(11, irq11);
        wrapper!(12, irq12);
        wrapper!(13, irq13);
        wrapper!(14, irq14);
        wrapper!(15, irq15);

        match irq {
            0 => irq0,
            1 => irq1,
            2 => irq2,
            3 => irq3,
            4 => irq4,
            5 => irq5,
            6 => irq6,
            7 => irq7,
            8 => irq8,
            9 => irq9,
            10 => irq10,
            11 => irq11,
            12 => irq12,
            13 => irq13,
            14 => irq14,
            15 => irq15,
            _ => unreachable!(),
        }
    }

    fn pic_top_half(irq: u8, state: &InterruptStackState, vector: u32) {
        if pic::irq_is_spurious(irq) {
            return;
        }
        if let Some(top) = IRQ_TOP_HALVES[irq as usize].load(Ordering::Relaxed) {
            top(state, vector);
        }
        pic::send_eoi(irq);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{clear_trace, record, trace};
    use super::*;

    fn reset() {
        clear_trace();
        clear_scheduler_hooks();
        for entry in TABLE.iter() {
            entry.flags.store(0, Ordering::SeqCst);
            unsafe {
                *entry.top.get() = None;
                *entry.bottom.get() = None;
            }
        }
        *PENDING.lock() = PendingQueue { head: None, tail: None };
        INTERRUPT_LEVEL.store(0, Ordering::SeqCst);
        crate::arch::fake::reset();
    }

    #[test]
    fn register_rejects_invalid_vector() {
        reset();
        assert_eq!(register(999_999, Some(|_, _| {}), None), Err(Errno::Inval));
    }

    #[test]
    fn register_rejects_no_handlers() {
        reset();
        assert_eq!(register(50, None, None), Err(Errno::Inval));
    }

    #[test]
    fn register_rejects_double_registration() {
        reset();
        register(50, Some(|_, _| {}), None).unwrap();
        assert_eq!(register(50, Some(|_, _| {}), None), Err(Errno::Already));
    }

    #[test]
    fn unregistered_vector_is_a_noop() {
        reset();
        dispatch(51, &InterruptStackState::default());
        assert_eq!(trace(), Vec::<&str>::new());
    }

    #[test]
    fn top_and_bottom_half_run_in_order_at_level_one() {
        reset();
        fn top(_s: &InterruptStackState, _v: u32) {
            record("T1");
        }
        fn bottom(_v: u32) {
            record("B1");
        }
        register(60, Some(top), Some(bottom)).unwrap();

        dispatch(60, &InterruptStackState::default());
        assert_eq!(trace(), alloc::vec!["T1", "B1"]);
    }

    #[test]
    fn nested_interrupt_during_a_bottom_half_runs_its_top_half_immediately_and_queues_its_bottom_half() {
        // Scenario: V1's bottom half synchronously dispatches V2 before
        // returning. Expected order: T1, T2 (runs to completion at level
        // 2), T1's own dispatch finishes its bottom half B1, then B2 runs
        // once drained.
        reset();
        fn top1(_s: &InterruptStackState, _v: u32) {
            record("T1");
        }
        fn bottom1(_v: u32) {
            record("B1-start");
            dispatch(71, &InterruptStackState::default());
            record("B1-end");
        }
        fn top2(_s: &InterruptStackState, _v: u32) {
            record("T2");
        }
        fn bottom2(_v: u32) {
            record("B2");
        }

        register(70, Some(top1), Some(bottom1)).unwrap();
        register(71, Some(top2), Some(bottom2)).unwrap();

        dispatch(70, &InterruptStackState::default());

        assert_eq!(trace(), alloc::vec!["T1", "B1-start", "T2", "B1-end", "B2"]);
    }

    #[test]
    fn retriggering_a_queued_vector_coalesces_into_one_bottom_half_run() {
        reset();
        fn top1(_s: &InterruptStackState, _v: u32) {
            record("T1");
        }
        fn bottom1(_v: u32) {
            record("B1-start");
            // Both of these see QUEUED already set by the first one, so
            // only a single B2 ever runs.
            dispatch(81, &InterruptStackState::default());
            dispatch(81, &InterruptStackState::default());
            record("B1-end");
        }
        fn top2(_s: &InterruptStackState, _v: u32) {
            record("T2");
        }
        fn bottom2(_v: u32) {
            record("B2");
        }

        register(80, Some(top1), Some(bottom1)).unwrap();
        register(81, Some(top2), Some(bottom2)).unwrap();

        dispatch(80, &InterruptStackState::default());

        assert_eq!(trace(), alloc::vec!["T1", "B1-start", "T2", "T2", "B1-end", "B2"]);
    }

    #[test]
    #[should_panic(expected = "nesting level")]
    fn triple_nested_dispatch_panics() {
        reset();
        fn top_outer(_s: &InterruptStackState, _v: u32) {
            // A top half must never itself be interrupted by a bottom-half
            // dispatch for the same or another vector while still at level
            // 2 — forcing it here is what the panic guards against.
            dispatch(91, &InterruptStackState::default());
        }
        fn top_middle(_s: &InterruptStackState, _v: u32) {
            dispatch(92, &InterruptStackState::default());
        }
        fn top_inner(_s: &InterruptStackState, _v: u32) {}

        register(90, Some(top_outer), None).unwrap();
        register(91, Some(top_middle), None).unwrap();
        register(92, Some(top_inner), None).unwrap();

        dispatch(90, &InterruptStackState::default());
    }
}
