//! GDT and TSS initialization.
//! This module sets up the Global Descriptor Table (GDT) and the Task State Segment (TSS).
//! It includes both kernel and user mode segment descriptors to support Ring 3 execution,
//! and lets the scheduler retarget the Ring 0 entry stack as processes switch.

use lazy_static::lazy_static;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// The index of the IST entry for the double fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Size of the double fault handler stack.
const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 5;

/// The TSS lives in a plain static so the kernel entry stack (`rsp0`) can be
/// retargeted at runtime; the CPU reads the field on every Ring 3 → Ring 0
/// transition.
static mut TSS: TaskStateSegment = TaskStateSegment::new();

/// Initialize the Global Descriptor Table (GDT).
pub fn init() {
    // SAFETY:
    // Boot-path only; the TSS is not yet referenced by the CPU.
    unsafe {
        TSS.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            static mut STACK: [u8; DOUBLE_FAULT_STACK_SIZE] = [0; DOUBLE_FAULT_STACK_SIZE];

            let stack_start = VirtAddr::from_ptr(&raw const STACK);
            stack_start + DOUBLE_FAULT_STACK_SIZE as u64
        };
    }

    GDT.0.load();

    // SAFETY:
    // The GDT is loaded and the CS register is set to the code selector.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        load_tss(GDT.1.tss_selector);
    }
}

/// Point the Ring 0 entry stack at the given address.
///
/// Called whenever the scheduler or a process transition changes which
/// kernel stack the next privilege-level switch must land on.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY:
    // A plain 8-byte store; the CPU samples the field only when an
    // interrupt or syscall crosses into Ring 0.
    unsafe {
        TSS.privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Returns the user code segment selector with Ring 3 privilege level.
#[must_use]
pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code_selector
}

/// Returns the user data segment selector with Ring 3 privilege level.
#[must_use]
pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data_selector
}

/// Holds the GDT segment selectors used during initialization and user mode transitions.
struct Selectors {
    code_selector: SegmentSelector,
    tss_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.add_entry(Descriptor::kernel_code_segment());

        // SAFETY:
        // The TSS static lives for the whole kernel; `init` finished writing
        // its stack fields before the GDT is first dereferenced.
        let tss_selector = gdt.add_entry(Descriptor::tss_segment(unsafe { &*(&raw const TSS) }));

        // Add user mode segments. The selectors returned by `add_entry` have RPL=0,
        // so we create new selectors with RPL=3 for Ring 3 execution.
        let user_data_entry = gdt.add_entry(Descriptor::user_data_segment());
        let user_code_entry = gdt.add_entry(Descriptor::user_code_segment());

        let user_data_selector = SegmentSelector(user_data_entry.0 | 3);
        let user_code_selector = SegmentSelector(user_code_entry.0 | 3);

        (
            gdt,
            Selectors {
                code_selector,
                tss_selector,
                user_code_selector,
                user_data_selector,
            },
        )
    };
}
