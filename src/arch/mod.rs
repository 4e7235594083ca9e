//! The architecture boundary.
//!
//! Everything the core needs from the CPU — raw port I/O, the interrupt
//! enable flag, `hlt`, TLB invalidation, and the two-register-block context
//! switch — is named here as the [`Hal`] trait, the architecture interface
//! the rest of the core is built against. GDT/IDT table construction and the
//! asm stubs that funnel into the interrupt dispatcher are out of scope
//! (boot handoff / table setup), so this module stops at the primitives the
//! core's own memory/interrupt/scheduler logic is built on top of.
//!
//! Two implementations exist: [`i386`], the real hardware backend used by
//! the kernel binary, and [`fake`], a software-only backend used by
//! `#[cfg(test)]` unit tests so the scheduler, timer and interrupt-dispatch
//! logic can run as ordinary host tests instead of needing QEMU.

#[cfg(not(test))]
pub mod i386;
#[cfg(test)]
pub mod fake;

#[cfg(not(test))]
pub use i386::I386Hal as ActiveHal;
#[cfg(test)]
pub use fake::FakeHal as ActiveHal;

/// Raw architecture registers saved across a context switch.
///
/// This is deliberately opaque to the rest of the core: the scheduler only
/// ever swaps two `*mut ThreadRegs` pointers, it never reads individual
/// fields. The concrete layout is architecture-specific.
#[cfg(not(test))]
pub type ThreadRegs = i386::I386ThreadRegs;
#[cfg(test)]
pub type ThreadRegs = fake::FakeThreadRegs;

/// The architecture interface consumed by the core.
///
/// All methods are free of any notion of "current task" or "current
/// segment" — those are task/scheduler concepts layered on top.
pub trait Hal {
    /// Returns the saved interrupt-enable flag and disables interrupts.
    fn get_and_disable_interrupts() -> usize;

    /// Restores a previously saved interrupt-enable flag.
    fn restore_interrupts(flags: usize);

    fn enable_interrupts();
    fn disable_interrupts();

    /// Halts the CPU until the next interrupt arrives. Must be called with
    /// interrupts enabled or the CPU would never wake up.
    fn wait_for_interrupt();

    /// Invalidates any TLB entry for `virt`. A no-op on the fake backend.
    fn tlb_invalidate(virt: usize);

    /// Switches the running thread from `old` to `new`: swaps the stack
    /// pointer, the active page directory, and the kernel-stack-pointer
    /// used for privilege-level transitions, then resumes execution with
    /// `new`'s saved registers.
    ///
    /// # Safety
    ///
    /// `new` and `old` must both point at valid, correctly laid out
    /// [`ThreadRegs`] — `old` is written to, `new` is read from and then
    /// control transfers into it. Must only be called by the scheduler with
    /// interrupts disabled.
    unsafe fn context_switch(new: *mut ThreadRegs, old: *mut ThreadRegs);

    /// Builds the initial register block for a task that has never run:
    /// resuming into it must start execution at `entry(arg)` on the stack
    /// topped at `stack_top`. `tid` is carried through only so the fake
    /// backend's switch log can identify the task; the real backend ignores
    /// it.
    fn new_task_regs(tid: u32, stack_top: usize, entry: extern "C" fn(usize) -> !, arg: usize) -> ThreadRegs;

    /// Builds the register block for the task that is already running when
    /// the scheduler initializes (the boot thread) — its stack is whatever
    /// came before, not something the core constructs.
    fn new_root_task_regs(tid: u32) -> ThreadRegs;
}

/// The address at which the higher half of the address space begins.
/// Populated from the `_higher_half_addr` linker symbol in the real
/// kernel; a fixed constant under the fake backend.
pub fn higher_half_addr() -> usize {
    #[cfg(not(test))]
    {
        i386::higher_half_addr()
    }
    #[cfg(test)]
    {
        fake::higher_half_addr()
    }
}

/// Physical-to-linear address conversion: `L = P + HIGHER_HALF_ADDR`.
pub fn p2l(phys: usize) -> usize {
    phys + higher_half_addr()
}

/// Linear-to-physical address conversion, the inverse of [`p2l`].
pub fn l2p(linear: usize) -> usize {
    linear - higher_half_addr()
}
