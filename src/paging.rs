//! Paging controller.
//!
//! Three virtual windows move at runtime and everything else is fixed:
//!
//! - the 4 MiB user program window at 128 MiB, retargeted on every context
//!   switch to the physical slot of the running process,
//! - the video memory page at `0xB8000`, pointed at the physical VGA buffer
//!   or at the scheduled terminal's shadow page,
//! - the user video page at [`USER_VIDEO_MEM`], present only while a process
//!   has an active `vidmap`.
//!
//! Every mutation here ends with a full TLB flush before returning, so no
//! user-mode instruction can ever run against a stale translation.

use spin::Mutex;
use x86_64::{
    structures::paging::{
        Mapper, OffsetPageTable, Page, PageTableFlags, PhysFrame, Size2MiB, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::memory::BootInfoFrameAllocator;

/// Physical address of the VGA text buffer.
pub const VIDEO_MEM_ADDR: u64 = 0xB8000;
/// Per-terminal shadow pages, directly above the VGA buffer.
pub const SHADOW_PAGES: [u64; 3] = [0xB9000, 0xBA000, 0xBB000];
/// Virtual base of the user program window.
pub const USER_PROG: u64 = 0x800_0000;
/// Offset of the program image inside the user window.
pub const PROG_OFFSET: u64 = 0x4_8000;
/// Virtual address handed to user programs by `vidmap`.
pub const USER_VIDEO_MEM: u64 = 0x450_0000;
/// Top of the user-mode stack inside the user window.
pub const USER_STACK_TOP: u64 = 0x83F_FFFF;

/// 4 KiB.
pub const FOUR_KB: u64 = 0x1000;
/// 4 MiB: size of one user program slot.
pub const FOUR_MB: u64 = 0x40_0000;
/// 8 KiB: size of one per-process kernel stack region.
pub const EIGHT_KB: u64 = 0x2000;
/// 8 MiB: top of kernel memory, base of the user slots.
pub const EIGHT_MB: u64 = 0x80_0000;

struct PagingState {
    mapper: OffsetPageTable<'static>,
    frames: BootInfoFrameAllocator,
}

static PAGING: Mutex<Option<PagingState>> = Mutex::new(None);

/// Take over the boot mapper and install the fixed part of the memory map:
/// the kernel window at 4..8 MiB (identity, supervisor), the VGA page and
/// the three shadow pages (identity, supervisor).
pub fn init(mapper: OffsetPageTable<'static>, frames: BootInfoFrameAllocator) {
    *PAGING.lock() = Some(PagingState { mapper, frames });

    let kernel_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

    // Kernel window: per-process kernel stacks and PCBs live here.
    let mut addr = FOUR_MB;
    while addr < EIGHT_MB {
        remap_4k(addr, addr, kernel_flags);
        addr += FOUR_KB;
    }

    remap_4k(VIDEO_MEM_ADDR, VIDEO_MEM_ADDR, kernel_flags);
    for shadow in SHADOW_PAGES {
        remap_4k(shadow, shadow, kernel_flags);
    }
}

/// Point the user program window at the physical slot of the given process.
pub fn map_user_program(pid: usize) {
    let flags =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    let phys = EIGHT_MB + (pid as u64 - 1) * FOUR_MB;

    // Long mode has no 4 MiB pages; the slot is two 2 MiB mappings.
    remap_2m(USER_PROG, phys, flags);
    remap_2m(USER_PROG + FOUR_MB / 2, phys + FOUR_MB / 2, flags);
}

/// Point the kernel-side video window at the given physical frame: the VGA
/// buffer itself, or one terminal's shadow page.
pub fn map_video_window(phys: u64) {
    remap_4k(
        VIDEO_MEM_ADDR,
        phys,
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
    );
}

/// Point the user-visible video page at the given physical frame.
pub fn map_user_video(phys: u64) {
    remap_4k(
        USER_VIDEO_MEM,
        phys,
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
    );
}

/// Remove the user-visible video page.
pub fn unmap_user_video() {
    with_paging(|state| {
        let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(USER_VIDEO_MEM));
        let _ = state.mapper.unmap(page);
    });
    flush_tlb();
}

/// Invalidate every cached translation.
pub fn flush_tlb() {
    x86_64::instructions::tlb::flush_all();
}

fn remap_4k(virt: u64, phys: u64, flags: PageTableFlags) {
    with_paging(|state| {
        let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(virt));
        let frame = PhysFrame::containing_address(PhysAddr::new(phys));

        let _ = state.mapper.unmap(page);

        // SAFETY:
        // The windows managed here never overlap kernel code or data; the
        // target frames are part of the fixed physical layout.
        unsafe {
            match state.mapper.map_to(page, frame, flags, &mut state.frames) {
                Ok(flush) => flush.ignore(),
                Err(err) => panic!("failed to map page {virt:#x}: {err:?}"),
            }
        }
    });
    flush_tlb();
}

fn remap_2m(virt: u64, phys: u64, flags: PageTableFlags) {
    with_paging(|state| {
        let page: Page<Size2MiB> = Page::containing_address(VirtAddr::new(virt));
        let frame = PhysFrame::containing_address(PhysAddr::new(phys));

        let _ = state.mapper.unmap(page);

        // SAFETY:
        // The user program window is reserved for these mappings; the target
        // slot lies inside the fixed 8..32 MiB physical range.
        unsafe {
            match state.mapper.map_to(page, frame, flags, &mut state.frames) {
                Ok(flush) => flush.ignore(),
                Err(err) => panic!("failed to map user slot {virt:#x}: {err:?}"),
            }
        }
    });
    flush_tlb();
}

fn with_paging<R>(f: impl FnOnce(&mut PagingState) -> R) -> R {
    let mut guard = PAGING.lock();
    let state = guard.as_mut().expect("paging controller not initialized");
    f(state)
}

#[cfg(test)]
mod tests {
    use super::{EIGHT_MB, FOUR_MB, PROG_OFFSET, USER_PROG, USER_STACK_TOP, USER_VIDEO_MEM};

    #[test_case]
    fn test_user_window_constants_are_consistent() {
        assert_eq!(USER_PROG % FOUR_MB, 0, "User window must be slot-aligned.");
        assert!(
            USER_STACK_TOP < USER_PROG + FOUR_MB,
            "User stack must stay inside the user window.",
        );
        assert!(
            PROG_OFFSET < FOUR_MB,
            "Program image offset must stay inside the user window.",
        );
        assert!(
            USER_VIDEO_MEM < USER_PROG,
            "The vidmap page must not collide with the user window.",
        );
    }

    #[test_case]
    fn test_user_slots_fit_reserved_memory() {
        let top_slot = EIGHT_MB + 6 * FOUR_MB;
        assert_eq!(top_slot, 0x200_0000, "Six slots end at 32 MiB.");
    }
}
