//! Interrupt handling module.
//! Builds the Interrupt Descriptor Table: CPU exceptions destroy the
//! faulting user process (its parent resumes with status 256), the PIT,
//! keyboard and RTC lines go to their drivers, every other PIC line gets
//! an acknowledge-and-report handler, and vector 0x80 is the user-callable
//! syscall gate.

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use x86_64::structures::idt::{
    InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode,
};

use crate::{keyboard, pit, println, process, rtc, syscall};

/// The offset for the Programmable Interrupt Controller (PIC) 1 (starting after interrupt table
/// max offset).
pub const PIC_1_OFFSET: u8 = 32;
/// The offset for the Programmable Interrupt Controller (PIC) 2.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// The Programmable Interrupt Controller (PIC) used for handling hardware interrupts.
pub static PICS: spin::Mutex<ChainedPics> =
    spin::Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
/// Enum for the interrupt indices of the wired PIC lines.
pub enum InterruptIndex {
    /// PIT scheduling tick.
    Timer = PIC_1_OFFSET,
    /// Keyboard controller.
    Keyboard,
    /// RTC periodic interrupt, line 8 on the slave controller.
    Rtc = PIC_1_OFFSET + 8,
}

impl InterruptIndex {
    /// Returns the index as a `u8`.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns the index as a `usize`.
    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

/// Raise the PIC mask bit for one IRQ line.
pub fn mask_irq(irq: u8) {
    let mut pics = PICS.lock();

    // SAFETY:
    // Read-modify-write of the PIC mask registers for a single line.
    unsafe {
        let [mut master, mut slave] = pics.read_masks();
        if irq < 8 {
            master |= 1 << irq;
        } else {
            slave |= 1 << (irq - 8);
        }
        pics.write_masks(master, slave);
    }
}

/// Clear the PIC mask bit for one IRQ line.
pub fn unmask_irq(irq: u8) {
    let mut pics = PICS.lock();

    // SAFETY:
    // Read-modify-write of the PIC mask registers for a single line.
    unsafe {
        let [mut master, mut slave] = pics.read_masks();
        if irq < 8 {
            master &= !(1 << irq);
        } else {
            slave &= !(1 << (irq - 8));
        }
        pics.write_masks(master, slave);
    }
}

/// Whether the interrupted code was running in Ring 3.
fn from_user_mode(stack_frame: &InterruptStackFrame) -> bool {
    stack_frame.code_segment & 3 == 3
}

/// Shared exception tail: a faulting user process is torn down and its
/// parent resumes with status 256; a kernel fault is unrecoverable.
fn handle_fault(name: &str, stack_frame: &InterruptStackFrame) -> ! {
    if from_user_mode(stack_frame) {
        process::exception_teardown(name);
    }
    panic!("EXCEPTION: {} in kernel mode\n{:#?}", name, stack_frame);
}

/// Generate a handler for an exception without error code.
macro_rules! exception_handler {
    ($handler:ident, $name:expr) => {
        extern "x86-interrupt" fn $handler(stack_frame: InterruptStackFrame) {
            handle_fault($name, &stack_frame);
        }
    };
}

/// Generate a handler for an exception that pushes an error code.
macro_rules! exception_handler_with_code {
    ($handler:ident, $name:expr) => {
        extern "x86-interrupt" fn $handler(stack_frame: InterruptStackFrame, _error_code: u64) {
            handle_fault($name, &stack_frame);
        }
    };
}

exception_handler!(divide_error_handler, "Divide Error");
exception_handler!(debug_handler, "Debug");
exception_handler!(non_maskable_interrupt_handler, "NMI");
exception_handler!(breakpoint_handler, "Breakpoint");
exception_handler!(overflow_handler, "Overflow");
exception_handler!(bound_range_exceeded_handler, "BOUND Range Exceeded");
exception_handler!(invalid_opcode_handler, "Invalid Opcode");
exception_handler!(device_not_available_handler, "Device Not Available");
exception_handler!(x87_floating_point_handler, "x87 FPU Floating-Point Error");
exception_handler!(simd_floating_point_handler, "SIMD Floating-Point Exception");
exception_handler_with_code!(invalid_tss_handler, "Invalid TSS");
exception_handler_with_code!(segment_not_present_handler, "Segment Not Present");
exception_handler_with_code!(stack_segment_fault_handler, "Stack Segment Fault");
exception_handler_with_code!(general_protection_fault_handler, "General Protection");
exception_handler_with_code!(alignment_check_handler, "Alignment Check");

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    if from_user_mode(&stack_frame) {
        process::exception_teardown("Page Fault");
    }
    panic!(
        "EXCEPTION: Page Fault in kernel mode at {:?} ({:?})\n{:#?}",
        Cr2::read(),
        error_code,
        stack_frame,
    );
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    handle_fault("Double Fault", &stack_frame);
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    handle_fault("Machine Check", &stack_frame);
}

/// Generate an acknowledge-and-report handler for an unwired PIC line.
macro_rules! unknown_irq_handler {
    ($handler:ident, $line:expr, $label:expr) => {
        extern "x86-interrupt" fn $handler(_stack_frame: InterruptStackFrame) {
            println!("unhandled IRQ {} ({})", $line, $label);

            // SAFETY:
            // The interrupt is being serviced; the PIC expects the
            // acknowledgment.
            unsafe {
                PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + $line);
            }
        }
    };
}

unknown_irq_handler!(irq2_handler, 2, "slave cascade");
unknown_irq_handler!(irq3_handler, 3, "COM2");
unknown_irq_handler!(irq4_handler, 4, "serial port");
unknown_irq_handler!(irq5_handler, 5, "LPT2");
unknown_irq_handler!(irq6_handler, 6, "floppy");
unknown_irq_handler!(irq7_handler, 7, "LPT1");
unknown_irq_handler!(irq9_handler, 9, "redirected IRQ2");
unknown_irq_handler!(irq10_handler, 10, "open");
unknown_irq_handler!(irq11_handler, 11, "eth0");
unknown_irq_handler!(irq12_handler, 12, "PS/2 mouse");
unknown_irq_handler!(irq13_handler, 13, "FPU");
unknown_irq_handler!(irq14_handler, 14, "ide0");
unknown_irq_handler!(irq15_handler, 15, "ide1");

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt
            .set_handler_fn(non_maskable_interrupt_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded
            .set_handler_fn(bound_range_exceeded_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available
            .set_handler_fn(device_not_available_handler);
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present
            .set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault
            .set_handler_fn(stack_segment_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point
            .set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point
            .set_handler_fn(simd_floating_point_handler);

        // SAFETY:
        // The double fault handler is safe to set as the index is valid.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        idt[InterruptIndex::Timer.as_usize()].set_handler_fn(pit::pit_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_usize()]
            .set_handler_fn(keyboard::keyboard_interrupt_handler);
        idt[InterruptIndex::Rtc.as_usize()].set_handler_fn(rtc::rtc_interrupt_handler);

        idt[usize::from(PIC_1_OFFSET) + 2].set_handler_fn(irq2_handler);
        idt[usize::from(PIC_1_OFFSET) + 3].set_handler_fn(irq3_handler);
        idt[usize::from(PIC_1_OFFSET) + 4].set_handler_fn(irq4_handler);
        idt[usize::from(PIC_1_OFFSET) + 5].set_handler_fn(irq5_handler);
        idt[usize::from(PIC_1_OFFSET) + 6].set_handler_fn(irq6_handler);
        idt[usize::from(PIC_1_OFFSET) + 7].set_handler_fn(irq7_handler);
        idt[usize::from(PIC_1_OFFSET) + 9].set_handler_fn(irq9_handler);
        idt[usize::from(PIC_1_OFFSET) + 10].set_handler_fn(irq10_handler);
        idt[usize::from(PIC_1_OFFSET) + 11].set_handler_fn(irq11_handler);
        idt[usize::from(PIC_1_OFFSET) + 12].set_handler_fn(irq12_handler);
        idt[usize::from(PIC_1_OFFSET) + 13].set_handler_fn(irq13_handler);
        idt[usize::from(PIC_1_OFFSET) + 14].set_handler_fn(irq14_handler);
        idt[usize::from(PIC_1_OFFSET) + 15].set_handler_fn(irq15_handler);

        syscall::register_syscall_handler(&mut idt);

        idt
    };
}

/// Initialize the Interrupt Descriptor Table (IDT).
pub fn init_idt() {
    IDT.load();
}

#[cfg(test)]
mod tests {
    use super::InterruptIndex;

    #[test_case]
    fn test_wired_lines_land_in_the_remapped_vectors() {
        assert_eq!(InterruptIndex::Timer.as_u8(), 32, "PIT is IRQ 0.");
        assert_eq!(InterruptIndex::Keyboard.as_u8(), 33, "Keyboard is IRQ 1.");
        assert_eq!(InterruptIndex::Rtc.as_u8(), 40, "RTC is IRQ 8 on the slave.");
    }
}
