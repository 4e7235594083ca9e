#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rsos::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

//! Kernel binary entry point. The boot stub (out of scope — asm/linker
//! territory, per spec.md §1) has already loaded a GDT/IDT, left paging
//! enabled, and built a [`rsos::BootData`] describing installed memory; it
//! jumps here with that record's address in the one argument it knows this
//! function takes.

use core::arch::asm;
use core::panic::PanicInfo;
use rsos::arch::i386::{pic, pit};
use rsos::arch::{ActiveHal, Hal};
use rsos::interrupts::{self, InterruptStackState};
use rsos::{log, timer, BootData};

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rsos::panic::kpanic_fmt(format_args!("{}", info))
}

/// IRQ0's top half: reports the clock pulse and sends EOI. Runs with
/// interrupts disabled, so it must stay fast — all the actual scheduling
/// decisions happen in bottom halves and bottom-half-equivalent callbacks
/// registered with [`rsos::timer::register_timed_event`].
fn timer_top_half(_state: &InterruptStackState, _vector: u32) {
    timer::report_clock_pulse(pit::period_ns());
    pic::send_eoi(0);
}

/// # Safety
///
/// The caller (the boot stub) must ensure `boot_data` points at a fully
/// populated, `'static`-lived [`BootData`] and that this function is
/// entered exactly once, with interrupts disabled and paging already
/// active.
#[no_mangle]
pub unsafe extern "C" fn main(boot_data: &'static BootData) -> ! {
    log!(ok, "kernel core starting");

    unsafe { rsos::core_init(boot_data) }.expect("core_init failed");

    pic::remap();
    pic::mask_all();
    interrupts::register(pic::PIC1_OFFSET as u32, Some(timer_top_half), None)
        .expect("failed to register the timer interrupt");
    pit::init();
    pic::unmask(0);

    log!(ok, "timer armed, enabling interrupts");
    unsafe { asm!("sti", options(nomem, nostack, preserves_flags)) };

    #[cfg(test)]
    test_main();

    // Root task's idle loop, per `original_source/kernel/main.c`'s
    // `kernel_main`: once nothing is left to set up, just wait for the
    // next interrupt. The scheduler preempts out of here the same as any
    // other running task.
    loop {
        ActiveHal::wait_for_interrupt();
    }
}
