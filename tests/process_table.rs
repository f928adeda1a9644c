//! Integration test for command parsing and the per-process descriptor
//! table, run against a stand-in PCB so no user program has to be loaded.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(triterm_os::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use triterm_os::fs;
use triterm_os::process::{self, parse_command, Pcb, ARGS_LEN, MAX_FD};
use triterm_os::syscall::sys_open;

static mut TEST_PCB: Pcb = Pcb::new(5, 1, [0; ARGS_LEN]);

#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    fs::init(fs::demo::build_demo_image());

    // SAFETY:
    // Single-threaded test kernel; the PCB outlives every test.
    process::set_pcb_override(unsafe { &raw mut TEST_PCB });

    test_main();

    triterm_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    triterm_os::test_panic_handler(info)
}

fn reset_pcb() {
    // SAFETY:
    // Single-threaded test kernel; nothing holds a reference across tests.
    unsafe {
        TEST_PCB = Pcb::new(5, 1, [0; ARGS_LEN]);
    }
}

#[test_case]
fn test_executed_arguments_land_in_the_pcb() {
    reset_pcb();
    let parsed = parse_command(b"foo arg1 arg2");
    let pcb = Pcb::new(4, 1, parsed.args);

    assert_eq!(
        &pcb.args[..10],
        b"arg1 arg2\0",
        "getargs hands back exactly the parsed tail.",
    );
}

#[test_case]
fn test_fresh_pcb_reserves_stdin_and_stdout() {
    reset_pcb();
    let pcb = Pcb::new(4, 1, [0; ARGS_LEN]);

    assert!(pcb.fdt[0].in_use, "fd 0 is stdin.");
    assert!(pcb.fdt[1].in_use, "fd 1 is stdout.");
    assert!(
        pcb.fdt[2..].iter().all(|entry| !entry.in_use),
        "fds 2..7 start free.",
    );
}

#[test_case]
fn test_descriptors_exhaust_and_recycle() {
    reset_pcb();

    let mut fds = [0_isize; MAX_FD - 2];
    for slot in &mut fds {
        *slot = sys_open(b"frame0.txt");
        assert!(*slot >= 2, "Each open takes a general-purpose fd.");
    }
    assert_eq!(sys_open(b"frame0.txt"), -1, "The table is exhausted.");

    assert_eq!(
        triterm_os::syscall::sys_close(fds[3] as u64),
        0,
        "A middle descriptor closes.",
    );
    assert_eq!(
        sys_open(b"frame0.txt"),
        fds[3],
        "The freed descriptor is the next one handed out.",
    );
}

#[test_case]
fn test_directory_listing_matches_image_order() {
    reset_pcb();

    let fd = sys_open(b".") as u64;
    assert_eq!(fd, 2, "The directory opens on fd 2.");

    let image = fs::image().expect("image is mounted.");
    let mut name = [0_u8; 32];
    for index in 0..image.dentry_count() {
        let read = triterm_os::syscall::sys_read(fd, name.as_mut_ptr() as u64, 32);
        assert_eq!(read, 32, "Directory reads return the stored name width.");
        let expected = image.dentry_by_index(index).expect("index in range.");
        assert_eq!(name, expected.name, "Entries arrive in directory order.");
    }

    let done = triterm_os::syscall::sys_read(fd, name.as_mut_ptr() as u64, 32);
    assert_eq!(done, 0, "The listing ends with a zero-byte read.");
}
