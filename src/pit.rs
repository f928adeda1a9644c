//! PIT-driven round-robin scheduler.
//!
//! Channel 0 ticks at 100 Hz. Each tick rotates execution across three
//! scheduling slots, one per terminal: the outgoing slot's kernel stack
//! registers are saved, the user program window and the video window are
//! retargeted for the incoming slot, and execution resumes wherever that
//! slot was last interrupted. A slot that has never run is cold-started
//! into a fresh shell instead.

use core::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use spin::Mutex;
use x86_64::{instructions::port::Port, structures::idt::InterruptStackFrame};

use crate::interrupts::{self, InterruptIndex, PICS};
use crate::{gdt, paging, process, terminal};

/// Number of scheduling slots, one per terminal.
pub const SCHED_SLOTS: usize = 3;
/// PIC line of the PIT.
pub const PIT_IRQ: u8 = 0;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND_PORT: u16 = 0x43;
/// Square wave generator, channel 0, lobyte/hibyte access.
const PIT_REPEAT_MODE: u8 = 0x36;
/// PIT oscillator runs at approximately 1.193182 MHz.
const OSCILLATOR_FREQ: u32 = 1_193_182;
/// Scheduling quantum: 100 Hz = 10 ms.
const TICK_HZ: u32 = 100;

/// Kernel stack pointer and base of a suspended slot.
#[derive(Debug, Clone, Copy)]
pub struct StackRegisters {
    pub rsp: u64,
    pub rbp: u64,
}

/// State of one scheduling slot.
pub struct SchedSlot {
    /// Pid of the process currently bound to this slot.
    pub process_num: usize,
    /// Physical address of this terminal's shadow video page.
    pub video_buffer: u64,
    /// Whether the bound process has an active `vidmap` page.
    pub vid_map: bool,
    /// Saved kernel stack registers; `None` means the slot has never been
    /// scheduled and must cold-start into a fresh shell.
    pub saved: Option<StackRegisters>,
}

const fn slot(process_num: usize, video_buffer: u64) -> SchedSlot {
    SchedSlot {
        process_num,
        video_buffer,
        vid_map: false,
        saved: None,
    }
}

static SCHED: Mutex<[SchedSlot; SCHED_SLOTS]> = Mutex::new([
    slot(1, paging::SHADOW_PAGES[0]),
    slot(2, paging::SHADOW_PAGES[1]),
    slot(3, paging::SHADOW_PAGES[2]),
]);

static CUR_SCHED: AtomicUsize = AtomicUsize::new(0);
/// Previously scheduled slot; −1 holds ticks off until the boot sequence
/// has primed slot 0.
static PREV_SCHED: AtomicIsize = AtomicIsize::new(-1);

/// The scheduling slot (equivalently, terminal) currently running.
#[must_use]
pub fn scheduled() -> usize {
    CUR_SCHED.load(Ordering::SeqCst)
}

/// Pid bound to the current scheduling slot.
#[must_use]
pub fn current_process() -> usize {
    SCHED.lock()[scheduled()].process_num
}

/// Bind a new pid to the current scheduling slot.
pub fn set_current_process(pid: usize) {
    SCHED.lock()[scheduled()].process_num = pid;
}

/// Overwrite the current slot's saved stack registers.
pub fn set_current_saved(saved: Option<StackRegisters>) {
    SCHED.lock()[scheduled()].saved = saved;
}

/// Record whether the current slot's process holds a `vidmap` page.
pub fn set_current_vid_map(active: bool) {
    SCHED.lock()[scheduled()].vid_map = active;
}

/// Shadow page of the current slot's terminal.
#[must_use]
pub fn current_video_buffer() -> u64 {
    SCHED.lock()[scheduled()].video_buffer
}

/// Allow scheduling: the boot sequence calls this once slot 0 is primed.
pub fn arm() {
    PREV_SCHED.store(0, Ordering::SeqCst);
}

/// Program channel 0 for the scheduling tick and reset the slots: slot 0
/// starts alive on shell 1, slots 1 and 2 start cold.
pub fn init() {
    {
        let mut sched = SCHED.lock();
        sched[0] = slot(1, paging::SHADOW_PAGES[0]);
        sched[0].saved = Some(StackRegisters {
            rsp: paging::EIGHT_MB,
            rbp: paging::EIGHT_MB,
        });
        sched[1] = slot(2, paging::SHADOW_PAGES[1]);
        sched[2] = slot(3, paging::SHADOW_PAGES[2]);
    }

    #[expect(
        clippy::integer_division,
        reason = "Divisor truncation is how the PIT is programmed."
    )]
    let divisor = OSCILLATOR_FREQ / TICK_HZ;

    let mut command = Port::new(PIT_COMMAND_PORT);
    let mut channel0 = Port::new(PIT_CHANNEL0);

    // SAFETY:
    // Standard PIT programming: mode byte, then divisor low and high bytes.
    unsafe {
        command.write(PIT_REPEAT_MODE);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write(((divisor >> 8) & 0xFF) as u8);
    }

    interrupts::unmask_irq(PIT_IRQ);
}

/// Handler for PIT interrupts: rotate to the next scheduling slot.
pub extern "x86-interrupt" fn pit_interrupt_handler(_stack_frame: InterruptStackFrame) {
    interrupts::mask_irq(PIT_IRQ);

    // SAFETY:
    // The interrupt is being serviced; the PIC expects the acknowledgment.
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }

    // The very first tick can arrive while the boot sequence is still
    // priming slot 0; skip it.
    if PREV_SCHED.load(Ordering::SeqCst) == -1 {
        interrupts::unmask_irq(PIT_IRQ);
        return;
    }

    let prev = CUR_SCHED.load(Ordering::SeqCst);
    let next = (prev + 1) % SCHED_SLOTS;
    PREV_SCHED.store(prev as isize, Ordering::SeqCst);
    CUR_SCHED.store(next, Ordering::SeqCst);

    switch_process(prev, next);

    interrupts::unmask_irq(PIT_IRQ);
}

/// Suspend the outgoing slot and resume (or cold-start) the incoming one.
///
/// The save and the restore both happen inside this frame: the registers
/// saved for a slot always point at this exact spot, so restoring another
/// slot's registers resumes it through this function's epilogue and the
/// interrupted context's `iretq`.
#[inline(never)]
fn switch_process(prev: usize, next: usize) {
    let (next_pid, vid_map, video_buffer, next_saved) = {
        let sched = SCHED.lock();
        let incoming = &sched[next];
        (
            incoming.process_num,
            incoming.vid_map,
            incoming.video_buffer,
            incoming.saved,
        )
    };

    gdt::set_kernel_stack(process::kernel_stack_top(next_pid));
    paging::map_user_program(next_pid);

    if next == terminal::viewing() {
        if vid_map {
            paging::map_user_video(paging::VIDEO_MEM_ADDR);
        }
        paging::map_video_window(paging::VIDEO_MEM_ADDR);
    } else {
        if vid_map {
            paging::map_user_video(video_buffer);
        }
        paging::map_video_window(video_buffer);
    }
    paging::flush_tlb();

    terminal::set_printing(next);

    let outgoing = process::stack_registers();
    SCHED.lock()[prev].saved = Some(outgoing);

    match next_saved {
        None => {
            // Cold slot: ticks stay enabled and a fresh shell starts here.
            interrupts::unmask_irq(PIT_IRQ);
            process::cold_start_shell();
        }
        Some(regs) => {
            // SAFETY:
            // The registers were saved at the matching point of a previous
            // invocation of this function; swapping to them resumes that
            // slot through the shared epilogue.
            unsafe { process::restore_stack_registers(regs) };
        }
    }
}
