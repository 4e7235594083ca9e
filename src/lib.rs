#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), feature(custom_test_frameworks))]
#![cfg_attr(not(test), test_runner(crate::testing::test_runner))]
#![cfg_attr(not(test), reexport_test_harness_main = "test_main")]

//! Crate root: declares the module tree, wires up the global heap
//! allocator over the frame allocator (C1) and heap allocator (C4), and
//! exposes [`core_init`] — the function a boot stub calls once it has
//! built a [`boot_config::BootData`] record and unmapped any identity
//! mapping it needed to get there, per
//! `original_source/kernel/boot/init.c`'s `kernel_init`.
//!
//! Under `#[cfg(test)]` this crate is compiled against `std` instead of
//! freestanding: every module's own unit tests run as ordinary host
//! `cargo test` binaries against the fake architecture backend
//! ([`arch::fake`]), with no QEMU involved. The freestanding kernel binary
//! (`main.rs`) and the `tests/` integration tests are the only things that
//! ever see the real `no_std`/`no_main`, custom-test-framework build of
//! this crate.

extern crate alloc;

pub mod arch;
pub mod boot_config;
pub mod data_structures;
pub mod interrupts;
pub mod io_port;
pub mod kerrno;
pub mod logger;
pub mod macros;
pub mod memory;
pub mod panic;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod task;
pub mod testing;
pub mod timer;

pub use boot_config::BootData;
pub use kerrno::{Errno, KResult};
pub use testing::test_panic_handler;

use core::alloc::{GlobalAlloc, Layout};
use memory::frame_allocator::FrameAllocator;
use memory::heap::HeapAllocator;

/// The one physical frame allocator for the whole kernel: handed out by
/// reference to the page allocator, the heap's segment growth, and every
/// task's kernel stack.
pub static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator::new();

struct KernelAllocator(HeapAllocator);

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0.alloc(&FRAME_ALLOCATOR, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.0.free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        self.0.realloc(&FRAME_ALLOCATOR, ptr, new_size)
    }
}

#[cfg_attr(not(test), global_allocator)]
static HEAP_ALLOCATOR: KernelAllocator = KernelAllocator(HeapAllocator::new());

/// Performs the one-time core initialisation a boot stub hands off to once
/// it has built `boot_data` and left any identity mapping it needed to get
/// there: seeds the frame allocator from the memory map, then brings up
/// the scheduler (which spawns the cleanup task in turn). Returns with
/// interrupts still disabled — the caller registers its own interrupt
/// sources (PIC remap, timer, ...) and enables them before falling into
/// its idle loop.
///
/// # Safety
///
/// Must be called at most once, and only after `boot_data` has been fully
/// populated by the boot stub.
pub unsafe fn core_init(boot_data: &BootData) -> KResult<()> {
    let memmap: alloc::vec::Vec<(usize, usize)> = boot_data.memory_map().collect();
    FRAME_ALLOCATOR.init(&memmap, boot_data.kernel_start, boot_data.kernel_end);
    crate::log!(ok, "frame allocator initialised: {} frames available", FRAME_ALLOCATOR.available_frames());

    sched::init(&FRAME_ALLOCATOR)?;
    crate::log!(ok, "scheduler initialised");

    Ok(())
}
