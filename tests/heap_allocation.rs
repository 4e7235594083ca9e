#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rsos::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

//! Exercises the real global allocator (the heap allocator, C4, wired
//! through `core_init`'s frame allocator) under QEMU instead of the host
//! fake backend the unit tests in `src/memory/heap.rs` use.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::panic::PanicInfo;
use rsos::arch::{ActiveHal, Hal};
use rsos::boot_config::{MemorySegment, MEMMAP_SEGMENT_MAX};
use rsos::BootData;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rsos::test_panic_handler(info)
}

#[derive(Debug)]
#[repr(align(16))]
struct Aligned16(u64);

fn synthetic_boot_data() -> BootData {
    let mut mmap = [MemorySegment::default(); MEMMAP_SEGMENT_MAX];
    mmap[0] = MemorySegment { base: 0x10_0000, length: 16 * 1024 * 1024 };

    BootData {
        initrd_base: 0,
        initrd_size: 0,
        mem_size: 16 * 1024 * 1024,
        mmap_len: 1,
        mmap,
        kernel_start: 0x10_0000,
        kernel_end: 0x10_0000 + 0x8000,
    }
}

#[no_mangle]
pub unsafe extern "C" fn main(_boot_data: &'static BootData) -> ! {
    let boot_data = synthetic_boot_data();
    unsafe { rsos::core_init(&boot_data) }.expect("core_init failed");

    test_main();
    loop {
        ActiveHal::wait_for_interrupt();
    }
}

#[test_case]
fn simple_allocation() {
    let a = Box::new(42);
    let b = String::from("Hello, World!");
    assert_eq!(*a, 42);
    assert_eq!(b, "Hello, World!");
}

#[test_case]
fn large_vector() {
    let n = 1000;
    let mut vec = Vec::new();
    for i in 0..n {
        vec.push(i);
    }

    assert_eq!(vec.len(), n);
    for (i, &item) in vec.iter().enumerate() {
        assert_eq!(item, i);
    }

    assert_eq!(vec.iter().sum::<usize>(), (n - 1) * n / 2);
}

#[test_case]
fn bigger_alignment() {
    let a = Box::new(Aligned16(13));
    assert_eq!((*a).0, 13);
}

#[test_case]
fn deallocation() {
    let addr: *const i32;
    {
        let a = Box::new(42);
        addr = &*a;
    }

    // allocate another Box with a different size — should reuse the freed block
    let b: Box<u64> = Box::new(13);
    assert_eq!(addr, &*b as *const u64 as *const i32);
}

#[test_case]
fn many_small_allocations_then_free_all() {
    let mut boxes = Vec::new();
    for i in 0..200u32 {
        boxes.push(Box::new(i));
    }
    for (i, b) in boxes.iter().enumerate() {
        assert_eq!(**b, i as u32);
    }
    drop(boxes);

    // the heap should be fully reusable after the whole batch is freed
    let after = Box::new(String::from("still alive"));
    assert_eq!(*after, "still alive");
}
