//! RTC driver.
//!
//! The hardware ticks at a fixed 1024 Hz; each scheduling slot owns a
//! virtual rate derived from it. A slot's counter runs up to its divider
//! and then raises that slot's interrupt flag, which is what a blocked
//! `rtc_read` is waiting on.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use x86_64::{instructions::port::Port, structures::idt::InterruptStackFrame};

use crate::interrupts::{self, InterruptIndex, PICS};
use crate::pit;

/// PIC line of the RTC (on the slave controller).
pub const RTC_IRQ: u8 = 8;
/// The slave PIC cascades through this master line.
const CASCADE_IRQ: u8 = 2;

const RTC_INDEX_PORT: u16 = 0x70;
const RTC_DATA_PORT: u16 = 0x71;
/// Register selectors with NMI disabled.
const REGISTER_A: u8 = 0x8A;
const REGISTER_B: u8 = 0x8B;
const REGISTER_C: u8 = 0x8C;
/// Rate bits for the 1024 Hz base frequency.
const RATE_1024_HZ: u8 = 0x06;

/// Base frequency every virtual rate divides.
const BASE_FREQ: i32 = 1024;
/// Divider value meaning "slot has no RTC rate".
const OFF: i32 = -1;

#[expect(clippy::declare_interior_mutable_const, reason = "Array seed value.")]
const FLAG_SEED: AtomicBool = AtomicBool::new(false);
#[expect(clippy::declare_interior_mutable_const, reason = "Array seed value.")]
const COUNT_SEED: AtomicI32 = AtomicI32::new(0);
#[expect(clippy::declare_interior_mutable_const, reason = "Array seed value.")]
const FREQ_SEED: AtomicI32 = AtomicI32::new(OFF);

/// Per-slot "a tick of my rate happened" flags.
static INTERRUPT_FLAGS: [AtomicBool; pit::SCHED_SLOTS] = [FLAG_SEED; pit::SCHED_SLOTS];
/// Per-slot counters toward the next virtual tick.
static COUNTS: [AtomicI32; pit::SCHED_SLOTS] = [COUNT_SEED; pit::SCHED_SLOTS];
/// Per-slot dividers of the 1024 Hz base, or [`OFF`].
static DIVIDERS: [AtomicI32; pit::SCHED_SLOTS] = [FREQ_SEED; pit::SCHED_SLOTS];

/// Program the RTC for periodic interrupts at 1024 Hz and unmask its line.
pub fn init() {
    let mut index = Port::new(RTC_INDEX_PORT);
    let mut data = Port::new(RTC_DATA_PORT);

    // SAFETY:
    // Standard CMOS/RTC programming sequence; NMI stays disabled while the
    // index register points at a control register.
    unsafe {
        index.write(REGISTER_B);
        let prev_b: u8 = data.read();
        index.write(REGISTER_B);
        // Bit 6 enables periodic interrupts.
        data.write(prev_b | 0x40);

        index.write(REGISTER_A);
        let prev_a: u8 = data.read();
        index.write(REGISTER_A);
        data.write((prev_a & 0xF0) | RATE_1024_HZ);
    }

    interrupts::unmask_irq(CASCADE_IRQ);
    interrupts::unmask_irq(RTC_IRQ);
}

/// Handler for RTC interrupts: advance every armed slot's counter.
pub extern "x86-interrupt" fn rtc_interrupt_handler(_stack_frame: InterruptStackFrame) {
    interrupts::mask_irq(RTC_IRQ);

    // SAFETY:
    // The interrupt is being serviced; the PIC expects the acknowledgment.
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Rtc.as_u8());
    }

    for slot in 0..pit::SCHED_SLOTS {
        let divider = DIVIDERS[slot].load(Ordering::SeqCst);
        if divider == OFF {
            continue;
        }
        let count = COUNTS[slot].load(Ordering::SeqCst) + 1;
        if count >= divider {
            INTERRUPT_FLAGS[slot].store(true, Ordering::SeqCst);
            COUNTS[slot].store(0, Ordering::SeqCst);
        } else {
            COUNTS[slot].store(count, Ordering::SeqCst);
        }
    }

    let mut index = Port::new(RTC_INDEX_PORT);
    let mut data = Port::new(RTC_DATA_PORT);

    // SAFETY:
    // Register C must be drained or the RTC stops raising interrupts.
    unsafe {
        index.write(REGISTER_C);
        let _: u8 = data.read();
    }

    interrupts::unmask_irq(RTC_IRQ);
}

/// Open the RTC for the scheduled slot at the default 2 Hz rate.
pub fn rtc_open() -> isize {
    DIVIDERS[pit::scheduled()].store(BASE_FREQ / 2, Ordering::SeqCst);
    0
}

/// Drop the scheduled slot's RTC rate.
pub fn rtc_close() -> isize {
    DIVIDERS[pit::scheduled()].store(OFF, Ordering::SeqCst);
    0
}

/// Block until the next tick of the scheduled slot's rate.
///
/// Only this slot's flag is reset; the shared base counter keeps running, so
/// the wait ends at the next tick boundary rather than a full period later.
pub fn rtc_read() -> isize {
    let slot = pit::scheduled();
    INTERRUPT_FLAGS[slot].store(false, Ordering::SeqCst);

    x86_64::instructions::interrupts::enable();
    while !INTERRUPT_FLAGS[slot].load(Ordering::SeqCst) {
        core::hint::spin_loop();
    }
    x86_64::instructions::interrupts::disable();

    0
}

/// Retarget the scheduled slot's rate.
///
/// The buffer must hold a 4-byte frequency from the supported set
/// {2, 4, 8, 16, 32, 64, 128, 512, 1024}; anything else fails.
pub fn rtc_write(buf: &[u8]) -> isize {
    if buf.len() != 4 {
        return -1;
    }

    let mut word = [0_u8; 4];
    word.copy_from_slice(buf);
    let freq = i32::from_le_bytes(word);

    match freq {
        2 | 4 | 8 | 16 | 32 | 64 | 128 | 512 | 1024 => {
            DIVIDERS[pit::scheduled()].store(BASE_FREQ / freq, Ordering::SeqCst);
            0
        }
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::{rtc_write, DIVIDERS, OFF};
    use crate::pit;
    use core::sync::atomic::Ordering;

    #[test_case]
    fn test_supported_frequencies_are_accepted() {
        for freq in [2_i32, 4, 8, 16, 32, 64, 128, 512, 1024] {
            assert_eq!(
                rtc_write(&freq.to_le_bytes()),
                0,
                "Power-of-two frequency should be accepted.",
            );
            assert_eq!(
                DIVIDERS[pit::scheduled()].load(Ordering::SeqCst),
                1024 / freq,
                "Divider should match the requested rate.",
            );
        }
        DIVIDERS[pit::scheduled()].store(OFF, Ordering::SeqCst);
    }

    #[test_case]
    fn test_unsupported_frequencies_are_rejected() {
        for freq in [0_i32, 1, 3, 256, 2048, -2] {
            assert_eq!(
                rtc_write(&freq.to_le_bytes()),
                -1,
                "Frequency outside the supported set must fail.",
            );
        }
    }

    #[test_case]
    fn test_short_buffer_is_rejected() {
        assert_eq!(rtc_write(&[2, 0]), -1, "rtc_write needs 4 bytes.");
    }
}
