//! Ring 3 programs carried in the demo image.
//!
//! Each program is a freestanding, position-independent routine: every jump
//! is relative and every data reference goes through `rip`, so the image
//! builder can copy a routine's bytes behind a loadable header and the
//! loader can drop them at the fixed user offset unchanged. Programs invoke
//! syscalls via `int 0x80` with the following register convention:
//!
//! | Register | Purpose        |
//! |----------|----------------|
//! | `rax`    | syscall number |
//! | `rdi`    | argument 1     |
//! | `rsi`    | argument 2     |
//! | `rdx`    | argument 3     |
//!
//! The return value comes back in `rax`; the kernel restores every other
//! register, so the routines keep their state in callee-saved registers
//! across syscalls. Buffers live on the user stack, which sits inside the
//! user program window and therefore passes the `getargs`/`vidmap` pointer
//! checks.

use core::arch::naked_asm;

use crate::syscall::{
    SYS_CLOSE, SYS_EXECUTE, SYS_GETARGS, SYS_HALT, SYS_OPEN, SYS_READ, SYS_VIDMAP, SYS_WRITE,
};

/// The shell: prompt, read one line from stdin, strip the newline, execute
/// it, repeat. A command that does not resolve prints a note instead.
#[unsafe(naked)]
pub unsafe extern "C" fn shell() -> ! {
    naked_asm!(
        "and rsp, -16",
        "sub rsp, 256",
        // Prompt, then block on one line of input.
        "2:",
        "mov rax, {sys_write}",
        "mov rdi, 1",
        "lea rsi, [rip + 8f]",
        "mov rdx, 5",
        "int 0x80",
        "mov rax, {sys_read}",
        "xor rdi, rdi",
        "mov rsi, rsp",
        "mov rdx, 128",
        "int 0x80",
        // An empty line is just its newline.
        "cmp rax, 1",
        "jle 2b",
        // Strip the trailing newline and terminate the command string.
        "lea rcx, [rsp + rax - 1]",
        "cmp byte ptr [rcx], 0x0A",
        "jne 3f",
        "mov byte ptr [rcx], 0",
        "3:",
        "mov byte ptr [rsp + rax], 0",
        "mov rax, {sys_execute}",
        "mov rdi, rsp",
        "int 0x80",
        "test rax, rax",
        "jns 2b",
        "mov rax, {sys_write}",
        "mov rdi, 1",
        "lea rsi, [rip + 9f]",
        "mov rdx, 16",
        "int 0x80",
        "jmp 2b",
        "8: .ascii \"tsh> \"",
        "9: .ascii \"no such command\\n\"",
        sys_write = const SYS_WRITE,
        sys_read = const SYS_READ,
        sys_execute = const SYS_EXECUTE,
    );
}

/// List the directory: one 32-byte name per read until a zero-length read,
/// printing the used prefix of each name.
#[unsafe(naked)]
pub unsafe extern "C" fn ls() -> ! {
    naked_asm!(
        "and rsp, -16",
        "sub rsp, 64",
        "mov rax, {sys_open}",
        "lea rdi, [rip + 8f]",
        "int 0x80",
        "test rax, rax",
        "js 7f",
        "mov r12, rax",
        "2:",
        "mov rax, {sys_read}",
        "mov rdi, r12",
        "mov rsi, rsp",
        "mov rdx, 32",
        "int 0x80",
        "test rax, rax",
        "jle 6f",
        // Names are zero-padded; find the used length.
        "xor rcx, rcx",
        "3:",
        "cmp rcx, 32",
        "je 4f",
        "cmp byte ptr [rsp + rcx], 0",
        "je 4f",
        "inc rcx",
        "jmp 3b",
        "4:",
        "mov rax, {sys_write}",
        "mov rdi, 1",
        "mov rsi, rsp",
        "mov rdx, rcx",
        "int 0x80",
        "mov rax, {sys_write}",
        "mov rdi, 1",
        "lea rsi, [rip + 9f]",
        "mov rdx, 1",
        "int 0x80",
        "jmp 2b",
        "6:",
        "mov rax, {sys_close}",
        "mov rdi, r12",
        "int 0x80",
        "mov rax, {sys_halt}",
        "xor rdi, rdi",
        "int 0x80",
        "7:",
        "mov rax, {sys_halt}",
        "mov rdi, 1",
        "int 0x80",
        "8: .asciz \".\"",
        "9: .byte 0x0A",
        sys_open = const SYS_OPEN,
        sys_read = const SYS_READ,
        sys_write = const SYS_WRITE,
        sys_close = const SYS_CLOSE,
        sys_halt = const SYS_HALT,
    );
}

/// Print the file named by the argument string to stdout.
#[unsafe(naked)]
pub unsafe extern "C" fn cat() -> ! {
    naked_asm!(
        "and rsp, -16",
        // 128 bytes of argument at rsp, 1 KiB of file data above it.
        "sub rsp, 1280",
        "mov rax, {sys_getargs}",
        "mov rdi, rsp",
        "mov rsi, 128",
        "int 0x80",
        "test rax, rax",
        "js 7f",
        "mov rax, {sys_open}",
        "mov rdi, rsp",
        "int 0x80",
        "test rax, rax",
        "js 7f",
        "mov r12, rax",
        "2:",
        "mov rax, {sys_read}",
        "mov rdi, r12",
        "lea rsi, [rsp + 128]",
        "mov rdx, 1024",
        "int 0x80",
        "test rax, rax",
        "jle 6f",
        "mov rdx, rax",
        "mov rax, {sys_write}",
        "mov rdi, 1",
        "lea rsi, [rsp + 128]",
        "int 0x80",
        "jmp 2b",
        "6:",
        "mov rax, {sys_close}",
        "mov rdi, r12",
        "int 0x80",
        "mov rax, {sys_halt}",
        "xor rdi, rdi",
        "int 0x80",
        "7:",
        "mov rax, {sys_halt}",
        "mov rdi, 1",
        "int 0x80",
        sys_getargs = const SYS_GETARGS,
        sys_open = const SYS_OPEN,
        sys_read = const SYS_READ,
        sys_write = const SYS_WRITE,
        sys_close = const SYS_CLOSE,
        sys_halt = const SYS_HALT,
    );
}

/// Count forever, printing the running value as 16 hex digits per line.
#[unsafe(naked)]
pub unsafe extern "C" fn counter() -> ! {
    naked_asm!(
        "and rsp, -16",
        "sub rsp, 32",
        "xor r12, r12",
        "2:",
        "inc r12",
        // Render the count as 16 hex digits plus a newline.
        "mov rcx, 16",
        "mov rax, r12",
        "3:",
        "mov rdx, rax",
        "and rdx, 15",
        "cmp rdx, 10",
        "jb 4f",
        "add rdx, 39",
        "4:",
        "add rdx, 48",
        "mov byte ptr [rsp + rcx - 1], dl",
        "shr rax, 4",
        "loop 3b",
        "mov byte ptr [rsp + 16], 0x0A",
        "mov rax, {sys_write}",
        "mov rdi, 1",
        "mov rsi, rsp",
        "mov rdx, 17",
        "int 0x80",
        // Busy delay between prints.
        "mov rcx, 4000000",
        "5:",
        "loop 5b",
        "jmp 2b",
        sys_write = const SYS_WRITE,
    );
}

/// Map the video page and bounce a character along one text row, writing
/// the cells directly through the `vidmap` pointer.
#[unsafe(naked)]
pub unsafe extern "C" fn pingpong() -> ! {
    naked_asm!(
        "and rsp, -16",
        "sub rsp, 16",
        "mov rax, {sys_vidmap}",
        "mov rdi, rsp",
        "int 0x80",
        "test rax, rax",
        "js 7f",
        "mov r13, [rsp]",
        "xor r12, r12",
        "mov r14, 1",
        "2:",
        // Repaint row 12, then drop the ball at its new column.
        "xor rcx, rcx",
        "3:",
        "mov word ptr [r13 + 1920 + rcx*2], 0x0720",
        "inc rcx",
        "cmp rcx, 80",
        "jne 3b",
        "lea rax, [r13 + 1920]",
        "mov word ptr [rax + r12*2], 0x072A",
        "add r12, r14",
        "cmp r12, 0",
        "jg 4f",
        "mov r14, 1",
        "4:",
        "cmp r12, 79",
        "jl 5f",
        "mov r14, -1",
        "5:",
        // Busy delay between frames.
        "mov rcx, 2000000",
        "6:",
        "loop 6b",
        "jmp 2b",
        "7:",
        "mov rax, {sys_halt}",
        "mov rdi, 1",
        "int 0x80",
        sys_vidmap = const SYS_VIDMAP,
        sys_halt = const SYS_HALT,
    );
}
