//! Integration test for the mounted file image.
//!
//! Mounts the demo image the way the boot path does and checks the reader's
//! laws against it: lookups, bounded indexing, and reads that reconstruct
//! file contents byte for byte.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(triterm_os::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use triterm_os::fs::{self, FileType};

#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    fs::init(fs::demo::build_demo_image());

    test_main();

    triterm_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    triterm_os::test_panic_handler(info)
}

#[test_case]
fn test_image_is_mounted() {
    let image = fs::image().expect("demo image should be mounted.");
    assert!(image.dentry_count() >= 3, "Demo image has several entries.");
}

#[test_case]
fn test_every_dentry_is_reachable_by_index_and_name() {
    let image = fs::image().expect("demo image should be mounted.");

    for index in 0..image.dentry_count() {
        let dentry = image.dentry_by_index(index).expect("index is in range.");
        let name_len = dentry
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(dentry.name.len());

        let found = image
            .dentry_by_name(&dentry.name[..name_len])
            .expect("every stored name should be found again.");
        assert_eq!(
            found.inode, dentry.inode,
            "Lookup by name agrees with lookup by index.",
        );
    }
}

#[test_case]
fn test_every_program_is_loadable() {
    let image = fs::image().expect("demo image should be mounted.");

    let programs: [&[u8]; 5] = [b"shell", b"ls", b"cat", b"counter", b"pingpong"];
    for name in programs {
        let dentry = image
            .dentry_by_name(name)
            .expect("every program must exist.");
        assert_eq!(
            FileType::from_raw(dentry.file_type),
            Some(FileType::Regular),
            "Programs are regular files.",
        );

        let mut header = [0_u8; 32];
        let read = image
            .read_data(dentry.inode, 0, &mut header)
            .expect("inode is valid.");
        assert_eq!(read, 32, "The header read fills its buffer.");
        assert_eq!(
            &header[..4],
            &[0x7F, b'E', b'L', b'F'],
            "Every program carries the loadable magic.",
        );
    }
}

#[test_case]
fn test_chunked_reads_reconstruct_the_file() {
    let image = fs::image().expect("demo image should be mounted.");
    let dentry = image
        .dentry_by_name(b"frame0.txt")
        .expect("frame0.txt must exist.");
    let size = image.file_size(dentry.inode).expect("inode is valid.");

    let mut whole = [0_u8; 512];
    let read = image
        .read_data(dentry.inode, 0, &mut whole[..size])
        .expect("inode is valid.");
    assert_eq!(read, size, "A full-size read drains the file.");

    // Reassemble in 7-byte pieces and compare.
    let mut offset = 0;
    while offset < size {
        let mut piece = [0_u8; 7];
        let got = image
            .read_data(dentry.inode, offset as u32, &mut piece)
            .expect("inode is valid.");
        assert!(got > 0, "Reads before the end make progress.");
        assert_eq!(
            &piece[..got],
            &whole[offset..offset + got],
            "Chunked reads agree with the full read.",
        );
        offset += got;
    }
}

#[test_case]
fn test_rtc_node_has_device_type() {
    let image = fs::image().expect("demo image should be mounted.");
    let dentry = image.dentry_by_name(b"rtc").expect("rtc node must exist.");
    assert_eq!(
        FileType::from_raw(dentry.file_type),
        Some(FileType::Rtc),
        "rtc is the character device stub.",
    );
}
