//! Custom test framework plumbing (`#![feature(custom_test_frameworks)]`).
//!
//! Integration tests under `tests/` exercise the real global allocator,
//! the real frame/page allocators and the real architecture boundary, so
//! they run inside QEMU rather than on the host; this module is the glue
//! that lets `cargo test` drive that. Exit happens through the
//! `isa-debug-exit` device at port `0xf4`, which QEMU is configured
//! (`-device isa-debug-exit,iobase=0xf4,iosize=0x04`) to turn into a
//! process exit code of `(value << 1) | 1`.

use crate::io_port::IoPort;
use core::panic::PanicInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    IoPort::write_u32(0xf4, exit_code as u32);
    crate::panic::halt_forever()
}

pub trait Testable {
    fn run(&self) -> ();
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        crate::serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        crate::serial_println!("[ok]");
    }
}

pub fn test_runner(tests: &[&dyn Testable]) {
    crate::serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

pub fn test_panic_handler(info: &PanicInfo) -> ! {
    crate::serial_println!("[failed]\n");
    crate::serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failed);
}
