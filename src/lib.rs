//! Educational x86 kernel written in Rust.
//! Three text-mode terminals are multiplexed over a single VGA framebuffer,
//! and up to six user programs run concurrently under a fixed time-slice
//! round-robin scheduler. User programs talk to the kernel through a small
//! POSIX-like system-call interface (`int 0x80`) and read files from a flat
//! read-only image kept in RAM.
//! Refer to the README.md file for more information about the features supported.

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

pub mod fs;
pub mod gdt;
pub mod interrupts;
pub mod keyboard;
pub mod memory;
pub mod paging;
pub mod pit;
pub mod process;
pub mod rtc;
pub mod serial;
pub mod syscall;
pub mod terminal;
pub mod user_programs;
pub mod vga_buffer;

const QEMU_EXIT_PORT: u16 = 0xf4;

/// Initialize the descriptor tables and the interrupt controller.
///
/// Device drivers (keyboard, RTC, PIT) unmask their own lines afterwards;
/// nothing is delivered until the caller enables interrupts.
pub fn init() {
    gdt::init();
    interrupts::init_idt();

    // SAFETY:
    // The PIC offsets do not overlap the CPU exception vectors.
    unsafe { interrupts::PICS.lock().initialize() };
}

/// Halt the CPU until the next interrupt, forever.
pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Test entry point for cargo test.
#[cfg(test)]
#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    test_main();

    hlt_loop();
}

/// Define possible exit code for qemu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    /// Define a successfull exit status
    Success = 0x10,
    /// Define a failure exit status
    Failure = 0x11,
}

/// Exit qemu with a specific exit code.
/// Connect to an IO Port to exit qemu.
/// Configuration for the exit port is in the config.toml file.
pub fn exit_qemu(exit_code: QemuExitCode) {
    use x86_64::instructions::port::Port;

    // SAFETY:
    // Create a `Port` to write exit_code for qemu.
    unsafe {
        let mut port = Port::new(QEMU_EXIT_PORT);
        port.write(exit_code as u32);
    }
}

/// Panic handler for external (functional) tests.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failure);

    hlt_loop();
}

/// Custom test runner for `no_std` testing.
pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }

    exit_qemu(QemuExitCode::Success);
}

/// Panic handler for unit tests.
#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info);
}

/// Trait to generalize tests cases.
/// Encapsulate the prints
pub trait Testable {
    /// Function that encapsulate the test run function.
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        use core::any::type_name;

        serial_print!("{}...\t", type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}
