//! Test that should panic.

#![no_std]
#![no_main]

use core::panic::PanicInfo;
use triterm_os::{exit_qemu, serial_print, serial_println, QemuExitCode};

/// Entry point for the test.
#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    should_fail();
    serial_println!("[test did not panic]");
    exit_qemu(QemuExitCode::Failure);

    triterm_os::hlt_loop();
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success);

    triterm_os::hlt_loop();
}

/// Test that should panic.
/// # Panics
/// Fail if the test does not panic.
fn should_fail() {
    serial_print!("should_panic::should_fail...\t");
    assert_eq!(0, 1, "This test should panic.");
}
