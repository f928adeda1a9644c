//! System call dispatch.
//!
//! User programs invoke syscalls via `int 0x80` with the following register
//! convention:
//!
//! - `rax`: syscall number
//! - `rdi`: first argument
//! - `rsi`: second argument
//! - `rdx`: third argument
//!
//! The return value is placed in `rax`; every failure is −1.

use core::arch::naked_asm;

use x86_64::{structures::idt::InterruptStackFrame, VirtAddr};

use crate::fs::{self, FileType};
use crate::process::{self, current_pcb, FdEntry, MAX_FD};
use crate::{paging, pit, rtc, terminal};

/// Interrupt vector number used for syscalls (`int 0x80`).
pub const SYSCALL_INTERRUPT_INDEX: u8 = 0x80;

/// Syscall number of `halt`.
pub const SYS_HALT: u64 = 1;
/// Syscall number of `execute`.
pub const SYS_EXECUTE: u64 = 2;
/// Syscall number of `read`.
pub const SYS_READ: u64 = 3;
/// Syscall number of `write`.
pub const SYS_WRITE: u64 = 4;
/// Syscall number of `open`.
pub const SYS_OPEN: u64 = 5;
/// Syscall number of `close`.
pub const SYS_CLOSE: u64 = 6;
/// Syscall number of `getargs`.
pub const SYS_GETARGS: u64 = 7;
/// Syscall number of `vidmap`.
pub const SYS_VIDMAP: u64 = 8;
/// Syscall number of the failing `set_handler` stub.
pub const SYS_SET_HANDLER: u64 = 9;
/// Syscall number of the failing `sigreturn` stub.
pub const SYS_SIGRETURN: u64 = 10;

/// Longest command or filename accepted from user memory.
const MAX_CSTR_LEN: usize = 256;

/// Driver behind a file descriptor.
///
/// Dispatch is a match per operation, so a missing case is a compile error
/// rather than a stray function pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOps {
    Rtc,
    Directory,
    Regular,
    Stdin,
    Stdout,
}

impl FileOps {
    /// Read through this driver. Stdout refuses reads.
    pub fn read(self, fd: usize, buf: &mut [u8]) -> isize {
        match self {
            Self::Rtc => rtc::rtc_read(),
            Self::Directory => dir_read(fd, buf),
            Self::Regular => file_read(fd, buf),
            Self::Stdin => terminal::terminal_read(buf),
            Self::Stdout => -1,
        }
    }

    /// Write through this driver. Everything except the RTC and stdout is
    /// read-only.
    pub fn write(self, buf: &[u8]) -> isize {
        match self {
            Self::Rtc => rtc::rtc_write(buf),
            Self::Stdout => terminal::terminal_write(buf),
            Self::Directory | Self::Regular | Self::Stdin => -1,
        }
    }

    /// Per-type open hook, run after the descriptor is recorded.
    pub fn open(self) -> isize {
        match self {
            Self::Rtc => rtc::rtc_open(),
            Self::Stdin | Self::Stdout => terminal::terminal_open(),
            Self::Directory | Self::Regular => 0,
        }
    }

    /// Per-type close hook.
    pub fn close(self) -> isize {
        match self {
            Self::Rtc => rtc::rtc_close(),
            Self::Stdin | Self::Stdout => terminal::terminal_close(),
            Self::Directory | Self::Regular => 0,
        }
    }
}

/// Read from a regular file at its descriptor's position.
fn file_read(fd: usize, buf: &mut [u8]) -> isize {
    let pcb = current_pcb();
    let entry = &mut pcb.fdt[fd];

    match fs::image().and_then(|image| {
        image
            .read_data(entry.inode, entry.file_position as u32, buf)
            .ok()
    }) {
        Some(read) => {
            entry.file_position += read as i32;
            read as isize
        }
        None => -1,
    }
}

/// Read the next directory entry name, 32 bytes per call.
fn dir_read(fd: usize, buf: &mut [u8]) -> isize {
    let pcb = current_pcb();
    let position = pcb.fdt[fd].file_position;

    // A descriptor can never reach −1 here; kept as a refusal anyway.
    if position == -1 {
        return -1;
    }

    let Some(image) = fs::image() else {
        return -1;
    };
    if position as u32 >= image.dentry_count() {
        return 0;
    }
    let Some(dentry) = image.dentry_by_index(position as u32) else {
        return -1;
    };

    let count = core::cmp::min(buf.len(), fs::NAME_LENGTH);
    buf[..count].copy_from_slice(&dentry.name[..count]);
    pcb.fdt[fd].file_position += 1;

    fs::NAME_LENGTH as isize
}

/// Naked entry point for the `int 0x80` syscall interrupt.
///
/// # Register layout on the stack after all pushes
///
/// ```text
/// rsp + 0x00 : r15
/// rsp + 0x08 : r14
/// rsp + 0x10 : r13
/// rsp + 0x18 : r12
/// rsp + 0x20 : r11
/// rsp + 0x28 : r10
/// rsp + 0x30 : r9
/// rsp + 0x38 : r8
/// rsp + 0x40 : rbp
/// rsp + 0x48 : rdi  (arg1)
/// rsp + 0x50 : rsi  (arg2)
/// rsp + 0x58 : rdx  (arg3)
/// rsp + 0x60 : rcx
/// rsp + 0x68 : rbx
/// rsp + 0x70 : rax  (syscall number)
/// rsp + 0x78 : RIP  (pushed by CPU)
/// rsp + 0x80 : CS
/// rsp + 0x88 : RFLAGS
/// rsp + 0x90 : RSP
/// rsp + 0x98 : SS
/// ```
#[unsafe(naked)]
pub(crate) extern "x86-interrupt" fn syscall_entry(_frame: InterruptStackFrame) {
    // This naked function manually manages the entire register save/restore
    // and stack layout. The CPU has already pushed SS, RSP, RFLAGS, CS, RIP
    // before entering this handler.
    naked_asm!(
        // Save all general-purpose registers.
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",

        // Set up arguments for the Rust syscall dispatcher:
        //   rdi = syscall number (was in rax)
        //   rsi = arg1 (was in rdi)
        //   rdx = arg2 (was in rsi)
        //   rcx = arg3 (was in rdx)
        "mov rdi, [rsp + 0x70]",
        "mov rsi, [rsp + 0x48]",
        "mov rdx, [rsp + 0x50]",
        "mov rcx, [rsp + 0x58]",

        "call {dispatch}",

        // Store the result in the saved rax slot.
        "mov [rsp + 0x70], rax",

        // Restore all general-purpose registers.
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",

        dispatch = sym syscall_dispatch,
    );
}

/// Dispatches a syscall to the appropriate handler based on the syscall number.
///
/// Called from the naked [`syscall_entry`] with the System V AMD64 calling
/// convention. `halt` and a successful `execute` do not return here: `halt`
/// unwinds into the parent's suspended frame, and `execute` comes back only
/// through a child's `halt` doing that unwinding.
extern "C" fn syscall_dispatch(num: u64, arg1: u64, arg2: u64, arg3: u64) -> i64 {
    match num {
        SYS_HALT => process::halt(arg1 as u8) as i64,
        SYS_EXECUTE => match user_cstr(arg1) {
            Some(command) => process::execute(command) as i64,
            None => -1,
        },
        SYS_READ => sys_read(arg1, arg2, arg3),
        SYS_WRITE => sys_write(arg1, arg2, arg3),
        SYS_OPEN => match user_cstr(arg1) {
            Some(name) => sys_open(name) as i64,
            None => -1,
        },
        SYS_CLOSE => sys_close(arg1),
        SYS_GETARGS => sys_getargs(arg1, arg2),
        SYS_VIDMAP => sys_vidmap(arg1),
        SYS_SET_HANDLER | SYS_SIGRETURN => -1,
        _ => -1,
    }
}

pub fn sys_read(fd: u64, buf: u64, nbytes: u64) -> i64 {
    if fd >= MAX_FD as u64 || buf == 0 {
        return -1;
    }

    let entry = current_pcb().fdt[fd as usize];
    if !entry.in_use {
        return -1;
    }

    // SAFETY:
    // The destination is user memory of the calling process; the image is
    // trusted not to fault on its own buffers.
    let slice = unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, nbytes as usize) };
    entry.ops.read(fd as usize, slice) as i64
}

pub fn sys_write(fd: u64, buf: u64, nbytes: u64) -> i64 {
    if fd >= MAX_FD as u64 || buf == 0 {
        return -1;
    }

    let entry = current_pcb().fdt[fd as usize];
    if !entry.in_use {
        return -1;
    }

    // SAFETY:
    // The source is user memory of the calling process.
    let slice = unsafe { core::slice::from_raw_parts(buf as *const u8, nbytes as usize) };
    entry.ops.write(slice) as i64
}

/// Open a file by name, allocating the lowest free descriptor in [2,7].
///
/// "stdin" and "stdout" resolve to descriptors 0 and 1 without consuming a
/// slot.
pub fn sys_open(name: &[u8]) -> isize {
    if name.is_empty() {
        return -1;
    }
    if name == b"stdin" {
        let _ = terminal::terminal_open();
        return 0;
    }
    if name == b"stdout" {
        let _ = terminal::terminal_open();
        return 1;
    }

    let Some(image) = fs::image() else {
        return -1;
    };
    let Some(dentry) = image.dentry_by_name(name) else {
        return -1;
    };
    let Some(file_type) = FileType::from_raw(dentry.file_type) else {
        return -1;
    };

    let pcb = current_pcb();
    for fd in 2..MAX_FD {
        if pcb.fdt[fd].in_use {
            continue;
        }

        let (ops, inode) = match file_type {
            FileType::Rtc => (FileOps::Rtc, 0),
            FileType::Directory => (FileOps::Directory, 0),
            FileType::Regular => (FileOps::Regular, dentry.inode),
        };
        pcb.fdt[fd] = FdEntry {
            ops,
            inode,
            file_position: 0,
            in_use: true,
        };
        let _ = ops.open();

        return fd as isize;
    }

    -1
}

pub fn sys_close(fd: u64) -> i64 {
    // Descriptors 0 and 1 belong to the process for life.
    if !(2..MAX_FD as u64).contains(&fd) {
        return -1;
    }

    let pcb = current_pcb();
    if !pcb.fdt[fd as usize].in_use {
        return -1;
    }

    let _ = pcb.fdt[fd as usize].ops.close();
    pcb.fdt[fd as usize].in_use = false;
    0
}

pub fn sys_getargs(buf: u64, nbytes: u64) -> i64 {
    let pcb = current_pcb();
    let len = strlen(&pcb.args);

    if buf == 0 || len == 0 || (len + 1) as u64 > nbytes || !in_user_window(buf) {
        return -1;
    }

    // SAFETY:
    // The destination was range-checked against the user program window,
    // and `len + 1` stays within the PCB's argument field.
    unsafe {
        core::ptr::copy_nonoverlapping(pcb.args.as_ptr(), buf as *mut u8, len + 1);
    }
    0
}

pub fn sys_vidmap(screen_start: u64) -> i64 {
    if !in_user_window(screen_start) {
        return -1;
    }

    current_pcb().vidmem = true;
    pit::set_current_vid_map(true);
    paging::map_user_video(paging::VIDEO_MEM_ADDR);

    // SAFETY:
    // The pointer cell was range-checked against the user program window.
    unsafe {
        core::ptr::write(screen_start as *mut u64, paging::USER_VIDEO_MEM);
    }
    0
}

/// Whether an address lies inside the user program window.
fn in_user_window(addr: u64) -> bool {
    (paging::USER_PROG..paging::USER_PROG + paging::FOUR_MB).contains(&addr)
}

fn strlen(bytes: &[u8]) -> usize {
    bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len())
}

/// Borrow a null-terminated string out of user memory, capped at
/// [`MAX_CSTR_LEN`] bytes.
fn user_cstr(ptr: u64) -> Option<&'static [u8]> {
    if ptr == 0 {
        return None;
    }

    let base = ptr as *const u8;
    let mut len = 0;
    // SAFETY:
    // The scan stays within the cap; the calling process vouches for its
    // own pointer the same way it does for read/write buffers.
    while len < MAX_CSTR_LEN && unsafe { base.add(len).read() } != 0 {
        len += 1;
    }

    // SAFETY:
    // `len` bytes were just read successfully.
    Some(unsafe { core::slice::from_raw_parts(base, len) })
}

/// Registers the syscall interrupt handler in the IDT.
///
/// The entry at index `0x80` is configured with DPL Ring 3 so that user-mode
/// code can trigger it via `int 0x80`, and as a trap gate: IF is left
/// unchanged across the boundary, so syscalls stay interruptible unless
/// they mask interrupts themselves.
pub fn register_syscall_handler(idt: &mut x86_64::structures::idt::InterruptDescriptorTable) {
    let entry = &mut idt[SYSCALL_INTERRUPT_INDEX as usize];

    // SAFETY:
    // The naked handler preserves the full register state and returns with
    // `iretq`.
    unsafe {
        let handler_addr = VirtAddr::new(syscall_entry as *const () as u64);
        entry
            .set_handler_addr(handler_addr)
            .set_privilege_level(x86_64::PrivilegeLevel::Ring3)
            .disable_interrupts(false);
    }
}

#[cfg(test)]
mod tests {
    use super::{sys_close, sys_getargs, sys_open, sys_read, sys_vidmap, FileOps};
    use crate::fs;
    use crate::process::{self, Pcb, ARGS_LEN};

    static mut TEST_PCB: Pcb = Pcb::new(4, 1, [0; ARGS_LEN]);

    fn with_test_pcb(test: impl FnOnce(&mut Pcb)) {
        // SAFETY:
        // Tests run single-threaded; the override is cleared before leaving.
        unsafe {
            TEST_PCB = Pcb::new(4, 1, [0; ARGS_LEN]);
            process::set_pcb_override(&raw mut TEST_PCB);
            test(&mut *(&raw mut TEST_PCB));
        }
        process::set_pcb_override(core::ptr::null_mut());
    }

    fn mount_demo_image() {
        fs::init(fs::demo::build_demo_image());
    }

    #[test_case]
    fn test_open_stdin_and_stdout_use_reserved_descriptors() {
        mount_demo_image();
        with_test_pcb(|pcb| {
            assert_eq!(sys_open(b"stdin"), 0, "stdin is descriptor 0.");
            assert_eq!(sys_open(b"stdout"), 1, "stdout is descriptor 1.");
            assert!(
                pcb.fdt[2..].iter().all(|entry| !entry.in_use),
                "Neither consumes a general-purpose descriptor.",
            );
        });
    }

    #[test_case]
    fn test_open_allocates_lowest_free_descriptor() {
        mount_demo_image();
        with_test_pcb(|_| {
            assert_eq!(sys_open(b"frame0.txt"), 2, "First open takes fd 2.");
            assert_eq!(sys_open(b"frame1.txt"), 3, "Second open takes fd 3.");
            assert_eq!(sys_close(2), 0, "fd 2 closes.");
            assert_eq!(sys_open(b"frame0.txt"), 2, "A freed descriptor is reused.");
        });
    }

    #[test_case]
    fn test_open_fails_when_descriptors_run_out() {
        mount_demo_image();
        with_test_pcb(|_| {
            for _ in 0..6 {
                assert!(sys_open(b"shell") >= 2, "Six opens succeed.");
            }
            assert_eq!(sys_open(b"shell"), -1, "The seventh open fails.");
        });
    }

    #[test_case]
    fn test_open_unknown_name_fails() {
        mount_demo_image();
        with_test_pcb(|_| {
            assert_eq!(sys_open(b"no-such-file"), -1, "Unknown names fail.");
            assert_eq!(sys_open(b""), -1, "Empty names fail.");
        });
    }

    #[test_case]
    fn test_close_validates_descriptor_range() {
        mount_demo_image();
        with_test_pcb(|_| {
            assert_eq!(sys_close(0), -1, "stdin cannot be closed.");
            assert_eq!(sys_close(1), -1, "stdout cannot be closed.");
            assert_eq!(sys_close(9), -1, "Out-of-range descriptors fail.");
            assert_eq!(sys_close(5), -1, "Free descriptors fail.");
        });
    }

    #[test_case]
    fn test_file_reads_advance_the_descriptor_position() {
        mount_demo_image();
        with_test_pcb(|pcb| {
            let fd = sys_open(b"frame0.txt");
            assert_eq!(fd, 2, "File opens on fd 2.");

            let mut first = [0_u8; 8];
            let mut rest = [0_u8; 512];
            let n1 = sys_read(2, first.as_mut_ptr() as u64, 8);
            let n2 = sys_read(2, rest.as_mut_ptr() as u64, 512);

            assert_eq!(n1, 8, "First read fills its buffer.");
            assert!(n2 > 0, "Second read continues from position 8.");
            assert_eq!(
                pcb.fdt[2].file_position as i64,
                n1 + n2,
                "Position advances by the bytes read.",
            );

            let size = fs::image()
                .expect("image mounted.")
                .file_size(pcb.fdt[2].inode)
                .expect("inode is valid.");
            assert_eq!(n1 + n2, size as i64, "The two reads drain the file.");
        });
    }

    #[test_case]
    fn test_directory_reads_list_every_entry_in_order() {
        mount_demo_image();
        with_test_pcb(|_| {
            let fd = sys_open(b".") as usize;
            assert_eq!(fd, 2, "Directory opens on fd 2.");

            let image = fs::image().expect("image mounted.");
            let mut name = [0_u8; 32];
            for index in 0..image.dentry_count() {
                let read = sys_read(2, name.as_mut_ptr() as u64, 32);
                assert_eq!(read, 32, "Each entry read returns the name width.");
                let expected = image.dentry_by_index(index).expect("index in range.");
                assert_eq!(name, expected.name, "Entries arrive in directory order.");
            }
            assert_eq!(
                sys_read(2, name.as_mut_ptr() as u64, 32),
                0,
                "Reading past the last entry returns 0.",
            );
        });
    }

    #[test_case]
    fn test_stdout_refuses_reads_and_files_refuse_writes() {
        mount_demo_image();
        with_test_pcb(|_| {
            let mut buf = [0_u8; 4];
            assert_eq!(
                FileOps::Stdout.read(1, &mut buf),
                -1,
                "stdout has no read direction.",
            );
            assert_eq!(
                FileOps::Regular.write(&buf),
                -1,
                "Regular files are read-only.",
            );
            assert_eq!(
                FileOps::Directory.write(&buf),
                -1,
                "The directory is read-only.",
            );
        });
    }

    #[test_case]
    fn test_getargs_validates_pointer_and_size() {
        mount_demo_image();
        with_test_pcb(|pcb| {
            pcb.args[..5].copy_from_slice(b"arg1\0");

            let mut local = [0_u8; 16];
            assert_eq!(
                sys_getargs(local.as_mut_ptr() as u64, 16),
                -1,
                "A kernel-space destination is rejected.",
            );
            assert_eq!(sys_getargs(0, 16), -1, "A null destination is rejected.");

            pcb.args = [0; ARGS_LEN];
            assert_eq!(
                sys_getargs(crate::paging::USER_PROG, 16),
                -1,
                "Empty args are rejected even for a user-space destination.",
            );
        });
    }

    #[test_case]
    fn test_vidmap_rejects_pointers_outside_the_user_window() {
        mount_demo_image();
        with_test_pcb(|_| {
            assert_eq!(sys_vidmap(0), -1, "Null pointer cell is rejected.");
            assert_eq!(sys_vidmap(0x1000), -1, "Kernel pointer cell is rejected.");
        });
    }

    #[test_case]
    fn test_unknown_and_stub_syscall_numbers_fail() {
        assert_eq!(
            super::syscall_dispatch(0, 0, 0, 0),
            -1,
            "Syscall numbers start at 1.",
        );
        assert_eq!(
            super::syscall_dispatch(99, 0, 0, 0),
            -1,
            "Unknown syscall numbers fail.",
        );
        assert_eq!(
            super::syscall_dispatch(super::SYS_SET_HANDLER, 2, 0, 0),
            -1,
            "set_handler is a stub that always fails.",
        );
        assert_eq!(
            super::syscall_dispatch(super::SYS_SIGRETURN, 0, 0, 0),
            -1,
            "sigreturn is a stub that always fails.",
        );
    }
}
