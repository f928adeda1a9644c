//! Terminal multiplexer.
//!
//! Three terminals share the single VGA text buffer. The *viewing* terminal
//! (selected with Alt+F1/F2/F3) has its contents in video memory; the other
//! two live in their shadow pages. The *print* terminal selects where
//! `putc` output lands, which is what lets a scheduled-but-unviewed process
//! keep printing into its shadow page.

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;
use x86_64::instructions::interrupts;

use crate::vga_buffer;
use crate::{paging, pit};

/// Number of terminals, one per scheduling slot.
pub const NUM_TERMINALS: usize = 3;
/// Capacity of a terminal's line buffer: 127 characters plus the newline.
pub const LINE_BUFFER_LEN: usize = 128;

/// Keyboard-side state of one terminal.
pub struct Terminal {
    /// Line buffer filled by the keyboard ISR.
    pub line: [u8; LINE_BUFFER_LEN],
    /// Number of valid bytes in `line`.
    pub len: usize,
    pub shift_pressed: bool,
    pub ctrl_pressed: bool,
    pub alt_pressed: bool,
    pub caps_lock: bool,
    /// Set when Enter completed a line; the wake-up for a blocked read.
    pub line_ready: bool,
}

impl Terminal {
    const fn new() -> Self {
        Self {
            line: [0; LINE_BUFFER_LEN],
            len: 0,
            shift_pressed: false,
            ctrl_pressed: false,
            alt_pressed: false,
            caps_lock: false,
            line_ready: false,
        }
    }

    /// Whether the buffer has room for this character. A completed line
    /// accepts nothing more; the last cell is reserved for the newline.
    #[must_use]
    pub fn accepts(&self, ch: u8) -> bool {
        if self.line_ready {
            return false;
        }
        if ch == b'\n' {
            self.len < LINE_BUFFER_LEN
        } else {
            self.len < LINE_BUFFER_LEN - 1
        }
    }

    /// Append a character if there is room.
    pub fn push(&mut self, ch: u8) -> bool {
        if !self.accepts(ch) {
            return false;
        }
        self.line[self.len] = ch;
        self.len += 1;
        true
    }

    /// Drop the last buffered character.
    pub fn pop(&mut self) -> bool {
        if self.len == 0 {
            return false;
        }
        self.len -= 1;
        true
    }
}

/// All three terminals, mutated by the keyboard ISR and the terminal
/// syscalls, both of which run with interrupts disabled.
pub static TERMINALS: Mutex<[Terminal; NUM_TERMINALS]> = Mutex::new([
    Terminal::new(),
    Terminal::new(),
    Terminal::new(),
]);

static CUR_TERMINAL: AtomicUsize = AtomicUsize::new(0);
static PRINT_TERMINAL: AtomicUsize = AtomicUsize::new(0);

/// The terminal whose contents are on screen.
#[must_use]
pub fn viewing() -> usize {
    CUR_TERMINAL.load(Ordering::SeqCst)
}

/// The terminal `putc` currently prints into.
#[must_use]
pub fn printing() -> usize {
    PRINT_TERMINAL.load(Ordering::SeqCst)
}

/// Redirect `putc` output to the given terminal.
pub fn set_printing(terminal: usize) {
    PRINT_TERMINAL.store(terminal, Ordering::SeqCst);
}

/// Bring another terminal on screen.
///
/// Both copies must run while the video window points at physical VGA; the
/// keyboard ISR guarantees that before dispatching the Alt+F switch.
pub fn switch_to(new: usize) {
    let old = viewing();
    if new == old {
        return;
    }

    vga_buffer::copy_buffer(paging::VIDEO_MEM_ADDR, paging::SHADOW_PAGES[old]);
    vga_buffer::copy_buffer(paging::SHADOW_PAGES[new], paging::VIDEO_MEM_ADDR);

    CUR_TERMINAL.store(new, Ordering::SeqCst);
    vga_buffer::sync_hw_cursor(new);
}

/// Open the terminal driver: resets the viewing terminal's line buffer.
pub fn terminal_open() -> isize {
    interrupts::without_interrupts(|| {
        TERMINALS.lock()[viewing()].len = 0;
    });
    0
}

/// Close the terminal driver.
pub fn terminal_close() -> isize {
    interrupts::without_interrupts(|| {
        TERMINALS.lock()[viewing()].len = 0;
    });
    0
}

/// Print a buffer to the scheduled terminal's frame.
pub fn terminal_write(buf: &[u8]) -> isize {
    interrupts::without_interrupts(|| {
        for &byte in buf {
            vga_buffer::putc(byte);
        }
    });
    buf.len() as isize
}

/// Block until the user finishes a line, then hand it over.
///
/// The wake-up flag belongs to the *scheduled* terminal while the bytes come
/// from the *viewing* terminal's buffer; the two coincide whenever the
/// reader's terminal is on screen, which is the only case where keystrokes
/// are flowing to it.
pub fn terminal_read(buf: &mut [u8]) -> isize {
    let sched = pit::scheduled();

    interrupts::disable();
    TERMINALS.lock()[sched].line_ready = false;

    loop {
        let ready = TERMINALS.lock()[sched].line_ready;
        if ready {
            break;
        }

        // Keep the slot schedulable and the keyboard alive while we wait.
        interrupts::enable();
        core::hint::spin_loop();
        interrupts::disable();
    }

    let mut terminals = TERMINALS.lock();
    let term = &mut terminals[viewing()];
    let count = core::cmp::min(buf.len(), term.len);
    buf[..count].copy_from_slice(&term.line[..count]);
    term.len = 0;

    count as isize
}

#[cfg(test)]
mod tests {
    use super::{Terminal, LINE_BUFFER_LEN};

    #[test_case]
    fn test_line_buffer_reserves_last_cell_for_newline() {
        let mut term = Terminal::new();
        for _ in 0..LINE_BUFFER_LEN - 1 {
            let _ = term.push(b'a');
        }

        assert_eq!(term.len, LINE_BUFFER_LEN - 1, "127 characters fit.");
        assert!(!term.push(b'b'), "The 128th character is refused.");
        assert!(term.push(b'\n'), "A newline still fits in the last cell.");
        assert_eq!(term.len, LINE_BUFFER_LEN, "Buffer is full after newline.");
    }

    #[test_case]
    fn test_completed_line_accepts_nothing() {
        let mut term = Terminal::new();
        let _ = term.push(b'l');
        let _ = term.push(b's');
        term.line_ready = true;

        assert!(!term.push(b'x'), "A ready line refuses input.");
        assert_eq!(term.len, 2, "Buffer is untouched.");
    }

    #[test_case]
    fn test_pop_stops_at_empty_buffer() {
        let mut term = Terminal::new();
        assert!(!term.pop(), "Popping an empty buffer does nothing.");

        let _ = term.push(b'q');
        assert!(term.pop(), "Popping removes the buffered character.");
        assert_eq!(term.len, 0, "Buffer is empty again.");
    }
}
