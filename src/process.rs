//! Process control.
//!
//! Up to six processes occupy fixed 4 MiB physical slots; pid = slot index
//! plus one, and pid 0 never exists. Each process owns an 8 KiB kernel stack
//! region just below 8 MiB with its PCB at the bottom of that region, so the
//! running process's PCB is always reachable by masking the kernel stack
//! pointer.
//!
//! `execute` never returns through a normal epilogue: it hands the CPU to
//! the new program, and control comes back only when that program's `halt`
//! (or a fatal exception) unwinds to the frame `execute` captured on entry.

use core::arch::{asm, naked_asm};
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;
use x86_64::instructions::interrupts;

use crate::pit::StackRegisters;
use crate::syscall::FileOps;
use crate::{fs, gdt, paging, pit, println};

/// Capacity of the process table.
pub const MAX_PROCESSES: usize = 6;
/// The three root shells, pids 1..=3.
pub const SHELL_COUNT: usize = 3;
/// File descriptors per process.
pub const MAX_FD: usize = 8;
/// Capacity of a PCB's argument string, including its terminator.
pub const ARGS_LEN: usize = 128;

/// Status a parent observes when its child died from a CPU exception.
pub const EXCEPTION_STATUS: u64 = 256;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
/// Byte offset of the entry point in a loadable header.
const ENTRY_OFFSET: usize = 24;
/// A program image may fill the user window above the load offset.
const MAX_PROG_SIZE: usize = (paging::FOUR_MB - paging::PROG_OFFSET) as usize;

/// One file descriptor table entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FdEntry {
    /// Which driver serves this descriptor.
    pub ops: FileOps,
    /// Backing inode; meaningful for regular files only.
    pub inode: u32,
    /// Current byte offset (directory index for the directory).
    pub file_position: i32,
    pub in_use: bool,
}

impl FdEntry {
    /// An unused table entry.
    #[must_use]
    pub const fn free() -> Self {
        Self {
            ops: FileOps::Regular,
            inode: 0,
            file_position: 0,
            in_use: false,
        }
    }
}

/// Process control block, written at the bottom of the process's kernel
/// stack region (`8 MiB − pid·8 KiB`).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Pcb {
    pub pid: usize,
    /// Pid of the process that executed this one; 0 for the root shells.
    pub parent_pid: usize,
    /// Top of the parent's kernel stack region. By convention this is the
    /// fixed region boundary, not the parent's live stack pointer; `halt`
    /// unwinds through `parent_rbp` so the boundary is all it needs.
    pub parent_rsp: u64,
    /// The parent's frame base captured at entry to `execute`.
    pub parent_rbp: u64,
    /// File descriptor table; entries 0 and 1 are stdin and stdout.
    pub fdt: [FdEntry; MAX_FD],
    /// Argument tail of the `execute` command, null-terminated.
    pub args: [u8; ARGS_LEN],
    /// Whether this process has an active `vidmap` page.
    pub vidmem: bool,
}

impl Pcb {
    /// Fresh PCB with stdin/stdout open and everything else free.
    #[must_use]
    pub const fn new(pid: usize, parent_pid: usize, args: [u8; ARGS_LEN]) -> Self {
        let mut fdt = [FdEntry::free(); MAX_FD];
        fdt[0] = FdEntry {
            ops: FileOps::Stdin,
            inode: 0,
            file_position: 0,
            in_use: true,
        };
        fdt[1] = FdEntry {
            ops: FileOps::Stdout,
            inode: 0,
            file_position: 0,
            in_use: true,
        };

        Self {
            pid,
            parent_pid,
            parent_rsp: 0,
            parent_rbp: 0,
            fdt,
            args,
            vidmem: false,
        }
    }
}

/// Which process slots are occupied; slot index + 1 is the pid.
static PROCESS_SLOTS: Mutex<[bool; MAX_PROCESSES]> = Mutex::new([false; MAX_PROCESSES]);
/// Number of live processes.
static PROCESS_COUNT: AtomicUsize = AtomicUsize::new(0);
/// Entry point of the shell image, recorded at boot for cold starts and
/// root-shell re-launches.
static SHELL_ENTRY: AtomicU64 = AtomicU64::new(0);

/// When non-null, `current_pcb` resolves here instead of masking the stack
/// pointer. Lets code that does not run on a process kernel stack (the test
/// harness) stand in a PCB of its own.
static PCB_OVERRIDE: AtomicPtr<Pcb> = AtomicPtr::new(core::ptr::null_mut());

/// Top of the given process's kernel stack region.
#[must_use]
pub fn kernel_stack_top(pid: usize) -> u64 {
    paging::EIGHT_MB - (pid as u64 - 1) * paging::EIGHT_KB
}

/// Where the given process's PCB lives.
#[must_use]
pub fn pcb_ptr(pid: usize) -> *mut Pcb {
    (paging::EIGHT_MB - pid as u64 * paging::EIGHT_KB) as *mut Pcb
}

/// The PCB of the process whose kernel stack we are running on.
#[must_use]
pub fn current_pcb() -> &'static mut Pcb {
    let explicit = PCB_OVERRIDE.load(Ordering::SeqCst);
    if !explicit.is_null() {
        // SAFETY:
        // The override points at a PCB the installer keeps alive.
        return unsafe { &mut *explicit };
    }

    let rsp: u64;
    // SAFETY:
    // Reading the stack pointer has no side effects.
    unsafe {
        asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack));
    }

    // Kernel stack regions are 8 KiB aligned with the PCB at the bottom.
    let base = rsp & !(paging::EIGHT_KB - 1);

    // SAFETY:
    // Any kernel stack below 8 MiB belongs to a live process whose PCB was
    // written at the region base before the process first ran.
    unsafe { &mut *(base as *mut Pcb) }
}

/// Route `current_pcb` to an explicit block; pass null to return to stack
/// masking.
pub fn set_pcb_override(pcb: *mut Pcb) {
    PCB_OVERRIDE.store(pcb, Ordering::SeqCst);
}

/// Number of live processes.
#[must_use]
pub fn live_processes() -> usize {
    PROCESS_COUNT.load(Ordering::SeqCst)
}

/// A command split into its program name and argument tail.
#[derive(Debug, Clone, Copy)]
pub struct ParsedCommand {
    pub name: [u8; fs::NAME_LENGTH],
    pub name_len: usize,
    /// Leading spaces stripped, truncated to 127 bytes, null-terminated.
    pub args: [u8; ARGS_LEN],
}

/// Split a command into a filename (space/NUL delimited, at most 32 bytes)
/// and its argument tail.
#[must_use]
pub fn parse_command(command: &[u8]) -> ParsedCommand {
    let mut name = [0_u8; fs::NAME_LENGTH];
    let mut name_len = 0;
    while name_len < command.len()
        && command[name_len] != 0
        && command[name_len] != b' '
        && name_len < fs::NAME_LENGTH
    {
        name[name_len] = command[name_len];
        name_len += 1;
    }

    let mut tail = &command[name_len..];
    while let [b' ', rest @ ..] = tail {
        tail = rest;
    }

    let mut args = [0_u8; ARGS_LEN];
    let mut len = 0;
    while len < ARGS_LEN && len < tail.len() && tail[len] != 0 {
        args[len] = tail[len];
        len += 1;
    }
    args[ARGS_LEN - 1] = 0;

    ParsedCommand {
        name,
        name_len,
        args,
    }
}

/// The `execute` system call: load a program and run it in this slot.
///
/// Returns −1 when the process table is full, the file does not exist or is
/// not loadable. On success the call "returns" only when the child halts,
/// with the child's status.
pub fn execute(command: &[u8]) -> isize {
    if live_processes() >= MAX_PROCESSES {
        return -1;
    }

    interrupts::disable();

    let parsed = parse_command(command);
    let Some(image) = fs::image() else {
        return -1;
    };
    let Some(dentry) = image.dentry_by_name(&parsed.name[..parsed.name_len]) else {
        return -1;
    };

    let mut header = [0_u8; 32];
    if image.read_data(dentry.inode, 0, &mut header).is_err() {
        return -1;
    }
    if header[..4] != ELF_MAGIC {
        return -1;
    }

    let pid = {
        let mut slots = PROCESS_SLOTS.lock();
        match slots.iter().position(|used| !used) {
            Some(index) => {
                slots[index] = true;
                index + 1
            }
            None => return -1,
        }
    };
    PROCESS_COUNT.fetch_add(1, Ordering::SeqCst);

    paging::map_user_program(pid);
    load_program_image(image, dentry.inode);

    let parent_pid = pit::current_process();
    let mut pcb = Pcb::new(pid, parent_pid, parsed.args);
    pcb.parent_rsp = kernel_stack_top(parent_pid);
    pcb.parent_rbp = current_rbp();

    // SAFETY:
    // The PCB slot at the bottom of this pid's kernel stack region is
    // reserved for exactly this write.
    unsafe {
        core::ptr::write(pcb_ptr(pid), pcb);
    }

    pit::set_current_process(pid);
    gdt::set_kernel_stack(kernel_stack_top(pid));

    let entry = entry_point(&header);

    // SAFETY:
    // The program image is in place behind the user window, the TSS points
    // at this pid's kernel stack and the user segments are loaded.
    unsafe { enter_user(entry, paging::USER_STACK_TOP) }
}

/// The `halt` system call: tear this process down and resume its parent.
///
/// A root shell never dies; halting one starts it over instead.
pub fn halt(status: u8) -> isize {
    interrupts::disable();

    let pcb = current_pcb();
    if pcb.pid <= SHELL_COUNT {
        // SAFETY:
        // The shell image stays loaded in this slot; its entry point was
        // recorded at boot.
        unsafe { enter_user(shell_entry(), paging::USER_STACK_TOP) }
    }

    let parent_rbp = teardown(pcb);

    // SAFETY:
    // `parent_rbp` frames the parent's suspended `execute` call; unwinding
    // through it resumes the parent's syscall path with the status in rax.
    unsafe { unwind_to_parent(parent_rbp, u64::from(status)) }
}

/// Destroy a faulting user process and resume its parent with status 256.
pub fn exception_teardown(name: &str) -> ! {
    println!("Exception: {}", name);

    let pcb = current_pcb();
    if pcb.pid <= SHELL_COUNT {
        // SAFETY:
        // Same re-launch path as `halt`: the shell image stays loaded.
        unsafe { enter_user(shell_entry(), paging::USER_STACK_TOP) }
    }

    let parent_rbp = teardown(pcb);

    interrupts::enable();

    // SAFETY:
    // Same unwinding contract as `halt`.
    unsafe { unwind_to_parent(parent_rbp, EXCEPTION_STATUS) }
}

/// Release everything the process owns and rebind its scheduling slot to
/// the parent. Returns the parent frame to unwind through.
fn teardown(pcb: &mut Pcb) -> u64 {
    for fd in 2..MAX_FD {
        if pcb.fdt[fd].in_use {
            let _ = pcb.fdt[fd].ops.close();
            pcb.fdt[fd].in_use = false;
        }
    }
    pcb.fdt[0].in_use = false;
    pcb.fdt[1].in_use = false;

    PROCESS_COUNT.fetch_sub(1, Ordering::SeqCst);
    PROCESS_SLOTS.lock()[pcb.pid - 1] = false;

    gdt::set_kernel_stack(pcb.parent_rsp);
    pit::set_current_process(pcb.parent_pid);
    pit::set_current_saved(Some(StackRegisters {
        rsp: pcb.parent_rsp,
        rbp: pcb.parent_rbp,
    }));

    paging::map_user_program(pcb.parent_pid);
    if pcb.vidmem {
        pit::set_current_vid_map(false);
    }
    paging::flush_tlb();

    pcb.parent_rbp
}

/// Boot sequence: load three shells, prime the scheduler and run shell 1.
pub fn launch() -> ! {
    interrupts::disable();

    *PROCESS_SLOTS.lock() = [false; MAX_PROCESSES];

    let Some(image) = fs::image() else {
        println!("launch: no file image mounted");
        crate::hlt_loop();
    };
    let Some(dentry) = image.dentry_by_name(b"shell") else {
        println!("launch: no shell in the file image");
        crate::hlt_loop();
    };

    let mut header = [0_u8; 32];
    if image.read_data(dentry.inode, 0, &mut header).is_err() || header[..4] != ELF_MAGIC {
        println!("launch: shell is not loadable");
        crate::hlt_loop();
    }

    // Highest slot first, so the window ends up on shell 1's slot.
    for slot in (0..SHELL_COUNT).rev() {
        paging::map_user_program(slot + 1);
        load_program_image(image, dentry.inode);
        PROCESS_SLOTS.lock()[slot] = true;
    }

    for pid in 1..=SHELL_COUNT {
        let pcb = Pcb::new(pid, 0, [0_u8; ARGS_LEN]);

        // SAFETY:
        // The PCB slots under 8 MiB are reserved for these writes.
        unsafe {
            core::ptr::write(pcb_ptr(pid), pcb);
        }
    }
    PROCESS_COUNT.store(SHELL_COUNT, Ordering::SeqCst);

    gdt::set_kernel_stack(paging::EIGHT_MB);

    let entry = entry_point(&header);
    SHELL_ENTRY.store(entry, Ordering::SeqCst);

    // From here on, PIT ticks rotate the slots; 1 and 2 cold-start later.
    pit::arm();

    // SAFETY:
    // Shell 1's image is loaded behind the user window and the TSS points
    // at its kernel stack.
    unsafe { enter_user(entry, paging::USER_STACK_TOP) }
}

/// Start a fresh shell in the current (cold) scheduling slot.
pub fn cold_start_shell() -> ! {
    // SAFETY:
    // Every root shell slot keeps its image loaded from `launch`.
    unsafe { enter_user(shell_entry(), paging::USER_STACK_TOP) }
}

fn shell_entry() -> u64 {
    SHELL_ENTRY.load(Ordering::SeqCst)
}

/// Copy a program file into the user window at the load offset.
fn load_program_image(image: fs::Image<'static>, inode: u32) {
    // SAFETY:
    // The user window was just mapped to this process's physical slot; the
    // range below the load offset is untouched.
    let dst = unsafe {
        core::slice::from_raw_parts_mut(
            (paging::USER_PROG + paging::PROG_OFFSET) as *mut u8,
            MAX_PROG_SIZE,
        )
    };
    let _ = image.read_data(inode, 0, dst);
}

fn entry_point(header: &[u8; 32]) -> u64 {
    let mut word = [0_u8; 4];
    word.copy_from_slice(&header[ENTRY_OFFSET..ENTRY_OFFSET + 4]);
    u64::from(u32::from_le_bytes(word))
}

fn current_rbp() -> u64 {
    let rbp: u64;
    // SAFETY:
    // Reading the frame base has no side effects.
    unsafe {
        asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack));
    }
    rbp
}

/// Kernel stack pointer and base at the call site.
#[inline(always)]
#[must_use]
pub fn stack_registers() -> StackRegisters {
    let (rsp, rbp): (u64, u64);
    // SAFETY:
    // Reading the stack registers has no side effects.
    unsafe {
        asm!(
            "mov {0}, rsp",
            "mov {1}, rbp",
            out(reg) rsp,
            out(reg) rbp,
            options(nomem, nostack),
        );
    }
    StackRegisters { rsp, rbp }
}

/// Swap onto another slot's saved kernel stack.
///
/// # Safety
///
/// The registers must have been produced by [`stack_registers`] at the
/// scheduler's save point; everything held in the current frame is dead
/// after this call.
#[inline(always)]
pub unsafe fn restore_stack_registers(regs: StackRegisters) {
    // SAFETY:
    // The caller vouches for the saved registers.
    unsafe {
        asm!(
            "mov rsp, {0}",
            "mov rbp, {1}",
            in(reg) regs.rsp,
            in(reg) regs.rbp,
        );
    }
}

/// Enter Ring 3 at the given entry point with the given user stack.
///
/// # Safety
///
/// The user window must map the program image, the TSS must point at the
/// running process's kernel stack, and the GDT user segments must be loaded.
pub unsafe fn enter_user(entry: u64, user_stack: u64) -> ! {
    let user_cs = u64::from(gdt::user_code_selector().0);
    let user_ds = u64::from(gdt::user_data_selector().0);

    // SAFETY:
    // Forwarded from the caller.
    unsafe { switch_to_user(entry, user_stack, user_cs, user_ds) }
}

/// Build an `iretq` frame for Ring 3 and jump through it.
///
/// # Arguments (System V AMD64)
///
/// * `rdi` - user entry point
/// * `rsi` - user stack top
/// * `rdx` - user code selector (RPL=3)
/// * `rcx` - user data selector (RPL=3)
#[unsafe(naked)]
unsafe extern "C" fn switch_to_user(
    _entry: u64,
    _user_stack: u64,
    _user_cs: u64,
    _user_ds: u64,
) -> ! {
    naked_asm!(
        // Load the user data segment into all data segment registers.
        "mov ax, cx",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        // Build the iretq frame: SS, RSP, RFLAGS (IF set), CS, RIP.
        "push rcx",
        "push rsi",
        "pushfq",
        "pop r11",
        "or r11, 0x200",
        "push r11",
        "push rdx",
        "push rdi",
        "iretq",
    );
}

/// Resume the parent's suspended `execute` frame with `status` in rax.
///
/// `leave` moves onto the parent's kernel stack through the captured frame
/// base; `ret` then lands right after the parent's call into `execute`.
#[unsafe(naked)]
unsafe extern "C" fn unwind_to_parent(_parent_rbp: u64, _status: u64) -> ! {
    naked_asm!(
        "mov rbp, rdi",
        "mov rax, rsi",
        "leave",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::{parse_command, ARGS_LEN};

    #[test_case]
    fn test_parse_splits_name_and_args() {
        let parsed = parse_command(b"cat frame0.txt");
        assert_eq!(&parsed.name[..parsed.name_len], b"cat", "Name stops at the space.");
        assert_eq!(&parsed.args[..11], b"frame0.txt\0", "Args are null-terminated.");
    }

    #[test_case]
    fn test_parse_strips_leading_spaces_from_args() {
        let parsed = parse_command(b"shell    arg1 arg2");
        assert_eq!(&parsed.name[..parsed.name_len], b"shell", "Name is the first word.");
        assert_eq!(
            &parsed.args[..10],
            b"arg1 arg2\0",
            "Leading spaces are stripped, inner ones kept.",
        );
    }

    #[test_case]
    fn test_parse_caps_name_at_32_bytes() {
        let command = [b'x'; 40];
        let parsed = parse_command(&command);
        assert_eq!(parsed.name_len, 32, "Names stop at the dentry field width.");
    }

    #[test_case]
    fn test_parse_truncates_args_to_127_bytes() {
        let mut command = [b'a'; 140];
        command[3] = b' ';
        let parsed = parse_command(&command);
        assert_eq!(
            parsed.args[ARGS_LEN - 1],
            0,
            "The last cell always terminates the string.",
        );
        assert_eq!(parsed.args[ARGS_LEN - 2], b'a', "127 bytes of payload fit.");
    }

    #[test_case]
    fn test_parse_empty_command_yields_empty_name_and_args() {
        let parsed = parse_command(b"");
        assert_eq!(parsed.name_len, 0, "No name in an empty command.");
        assert_eq!(parsed.args[0], 0, "No args in an empty command.");
    }
}
