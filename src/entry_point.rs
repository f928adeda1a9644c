//! Kernel entry point: bring the machine up, mount the file image and hand
//! the CPU to the first shell.

#![feature(custom_test_frameworks)]
#![test_runner(triterm_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![no_std]
#![no_main]

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use triterm_os::{
    fs, keyboard,
    memory::{self, BootInfoFrameAllocator},
    paging, pit, println, process, rtc, serial_println,
};
use x86_64::VirtAddr;

entry_point!(kernel_main);

////////////////////////
//     Entry point    //
////////////////////////

fn kernel_main(boot_info: &'static BootInfo) -> ! {
    triterm_os::init();

    let phys_mem_offset = VirtAddr::new(boot_info.physical_memory_offset);

    // SAFETY:
    // Physical memory offset is valid as guaranteed by the bootloader.
    let mapper = unsafe { memory::init(phys_mem_offset) };

    // SAFETY:
    // The memory map is valid as guaranteed by the bootloader.
    let frame_allocator = unsafe { BootInfoFrameAllocator::new(&boot_info.memory_map) };

    paging::init(mapper, frame_allocator);
    fs::init(fs::demo::build_demo_image());

    keyboard::init();
    rtc::init();
    pit::init();
    x86_64::instructions::interrupts::enable();

    #[cfg(test)]
    {
        test_main();
        triterm_os::hlt_loop();
    }

    #[cfg(not(test))]
    {
        println!("triterm_os: three terminals, six process slots");
        process::launch()
    }
}

////////////////////////
//    Panic handler   //
////////////////////////

/// This function is called on panic.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("KERNEL PANIC: {}", info);
    serial_println!("KERNEL PANIC: {}", info);
    triterm_os::hlt_loop();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    triterm_os::test_panic_handler(info);
}
