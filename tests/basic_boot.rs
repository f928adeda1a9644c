//! Simple boot test for the kernel.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(triterm_os::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use triterm_os::println;

/// Entry point for the test.
#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    test_main();

    triterm_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    triterm_os::test_panic_handler(info)
}

/// Test that we can print a line.
#[test_case]
fn test_println() {
    println!("test_println output");
}

/// Test that printing does not disturb the scheduler selectors.
#[test_case]
fn test_printing_goes_to_the_boot_terminal() {
    println!("routing check");
    assert_eq!(
        triterm_os::terminal::printing(),
        0,
        "Terminal 0 is the print target at boot.",
    );
    assert_eq!(
        triterm_os::terminal::viewing(),
        0,
        "Terminal 0 is on screen at boot.",
    );
}
