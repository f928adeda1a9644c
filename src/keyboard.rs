//! PS/2 keyboard driver.
//!
//! Scan codes are translated through a 256-entry table: indices 0..127 hold
//! the base characters, 128..255 the shifted ones. Characters accumulate in
//! the *viewing* terminal's line buffer and are echoed to the screen, which
//! the handler temporarily maps to physical VGA so echo stays visible even
//! while another terminal's process is scheduled.

use x86_64::{instructions::port::Port, structures::idt::InterruptStackFrame};

use crate::interrupts::{self, InterruptIndex, PICS};
use crate::vga_buffer;
use crate::{paging, pit, terminal};

/// PIC line of the keyboard controller.
pub const KEYBOARD_IRQ: u8 = 1;

const KEYBOARD_DATA_PORT: u16 = 0x60;

/// Scan codes above this are key releases.
const RELEASE_BIT: u8 = 0x80;
/// Offset of the shifted half of the translation table.
const SHIFT_OFFSET: usize = 128;

const LEFT_SHIFT: u8 = 42;
const RIGHT_SHIFT: u8 = 54;
const CAPS_LOCK: u8 = 58;
const ENTER: u8 = 28;
const BACKSPACE: u8 = 14;
const CTRL: u8 = 29;
const ALT: u8 = 56;
const F1: u8 = 59;
const F3: u8 = 61;
const L_KEY: u8 = 38;

const LEFT_SHIFT_RELEASE: u8 = LEFT_SHIFT | RELEASE_BIT;
const RIGHT_SHIFT_RELEASE: u8 = RIGHT_SHIFT | RELEASE_BIT;
const CTRL_RELEASE: u8 = CTRL | RELEASE_BIT;
const ALT_RELEASE: u8 = ALT | RELEASE_BIT;

/// Scan code translation table for a US layout.
/// First half: no modifier. Second half: shift held.
#[rustfmt::skip]
static KEY_MAP: [u8; 256] = [
    0,   27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8',   /* 9 */
    b'9', b'0', b'-', b'=', 8,    /* Backspace */
    b'\t',       /* Tab */
    b'q', b'w', b'e', b'r',       /* 19 */
    b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n',  /* Enter key */
    0,           /* 29   - Control */
    b'a', b's', b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', /* 39 */
    b'\'', b'`', 0,  /* Left shift */
    b'\\', b'z', b'x', b'c', b'v', b'b', b'n',  /* 49 */
    b'm', b',', b'.', b'/', 0,    /* Right shift */
    b'*',
    0,    /* Alt */
    b' ', /* Space bar */
    0,    /* Caps lock */
    0,    /* 59 - F1 key ... > */
    0,    0,    0,    0,    0,    0,    0,    0,
    0,    /* < ... F10 */
    0,    /* 69 - Num lock */
    0,    /* Scroll Lock */
    0,    /* Home key */
    0,    /* Up Arrow */
    0,    /* Page Up */
    b'-',
    0,    /* Left Arrow */
    0,
    0,    /* Right Arrow */
    b'+',
    0,    /* 79 - End key */
    0,    /* Down Arrow */
    0,    /* Page Down */
    0,    /* Insert Key */
    0,    /* Delete Key */
    0,    0,    0,
    0,    /* F11 Key */
    0,    /* F12 Key */
    0,    0,    0,    0,    0,    0,    0,    0,    0,    0,  /* 98 */
    0,    0,    0,    0,    0,    0,    0,    0,    0,    0,  /* 108 */
    0,    0,    0,    0,    0,    0,    0,    0,    0,    0,  /* 118 */
    0,    0,    0,    0,    0,    0,    0,    0,    0,        /* 127 */
    0,   27, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*',  /* 9 */
    b'(', b')', b'_', b'+', 8,    /* Backspace */
    b'\t',       /* Tab */
    b'Q', b'W', b'E', b'R',       /* 19 */
    b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', b'\n',  /* Enter key */
    0,           /* 29   - Control */
    b'A', b'S', b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', /* 39 */
    b'"', b'~', 0,   /* Left shift */
    b'|', b'Z', b'X', b'C', b'V', b'B', b'N',   /* 49 */
    b'M', b'<', b'>', b'?', 0,    /* Right shift */
    b'*',
    0,    /* Alt */
    b' ', /* Space bar */
    0,    /* Caps lock */
    0,    /* 59 - F1 key ... > */
    0,    0,    0,    0,    0,    0,    0,    0,
    0,    /* < ... F10 */
    0,    /* 69 - Num lock */
    0,    /* Scroll Lock */
    0,    /* Home key */
    0,    /* Up Arrow */
    0,    /* Page Up */
    b'-',
    0,    /* Left Arrow */
    0,
    0,    /* Right Arrow */
    b'+',
    0,    /* 79 - End key */
    0,    /* Down Arrow */
    0,    /* Page Down */
    0,    /* Insert Key */
    0,    /* Delete Key */
    0,    0,    0,
    0,    /* F11 Key */
    0,    /* F12 Key */
    0,    0,    0,    0,    0,    0,    0,    0,    0,    0,  /* 98 */
    0,    0,    0,    0,    0,    0,    0,    0,    0,    0,  /* 108 */
    0,    0,    0,    0,    0,    0,    0,    0,    0,    0,  /* 118 */
    0,    0,    0,    0,    0,    0,    0,    0,    0,        /* 127 */
];

/// Enable keyboard interrupts on the PIC.
pub fn init() {
    interrupts::unmask_irq(KEYBOARD_IRQ);
}

/// Whether the scan code names a letter key (q..p, a..l, z..m).
const fn is_letter(scan_code: u8) -> bool {
    matches!(scan_code, 16..=25 | 30..=38 | 44..=50)
}

/// Translate a pressed key under the current modifier state.
///
/// Caps lock inverts shift for letters only; everything else shifts the
/// plain way. Returns 0 for keys without a printable character.
#[must_use]
pub fn translate(scan_code: u8, shift: bool, caps_lock: bool) -> u8 {
    let base = KEY_MAP[scan_code as usize];
    let shifted = KEY_MAP[scan_code as usize + SHIFT_OFFSET];

    if is_letter(scan_code) {
        if caps_lock == shift {
            base
        } else {
            shifted
        }
    } else if shift {
        shifted
    } else {
        base
    }
}

/// Handler for keyboard interrupts.
pub extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    interrupts::mask_irq(KEYBOARD_IRQ);

    // EOI up front: a terminal switch below may take a while.
    //
    // SAFETY:
    // The interrupt is being serviced; the PIC expects the acknowledgment.
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }

    let mut port = Port::new(KEYBOARD_DATA_PORT);

    // SAFETY:
    // Reading the keyboard controller's data port consumes the scan code.
    let scan_code: u8 = unsafe { port.read() };

    handle_scancode(scan_code);

    interrupts::unmask_irq(KEYBOARD_IRQ);
}

fn handle_scancode(scan_code: u8) {
    if scan_code >= RELEASE_BIT {
        handle_release(scan_code);
        return;
    }

    // Echo must land on the screen the user is looking at, whatever the
    // scheduler last mapped the video window to.
    terminal::set_printing(terminal::viewing());
    paging::map_video_window(paging::VIDEO_MEM_ADDR);

    handle_press(scan_code);

    // Hand the window back to whatever the scheduled process needs.
    if pit::scheduled() != terminal::viewing() {
        paging::map_video_window(pit::current_video_buffer());
    }
    terminal::set_printing(pit::scheduled());
}

fn handle_press(scan_code: u8) {
    let view = terminal::viewing();

    match scan_code {
        CTRL => terminal::TERMINALS.lock()[view].ctrl_pressed = true,
        ALT => terminal::TERMINALS.lock()[view].alt_pressed = true,
        LEFT_SHIFT | RIGHT_SHIFT => terminal::TERMINALS.lock()[view].shift_pressed = true,
        CAPS_LOCK => {
            let mut terminals = terminal::TERMINALS.lock();
            terminals[view].caps_lock = !terminals[view].caps_lock;
        }
        F1..=F3 => {
            let alt = terminal::TERMINALS.lock()[view].alt_pressed;
            if alt {
                terminal::switch_to((scan_code - F1) as usize);
            }
        }
        L_KEY if terminal::TERMINALS.lock()[view].ctrl_pressed => reprint_line(view),
        BACKSPACE => {
            let popped = terminal::TERMINALS.lock()[view].pop();
            if popped {
                vga_buffer::backspace();
            }
        }
        ENTER => {
            let pushed = terminal::TERMINALS.lock()[view].push(b'\n');
            if pushed {
                vga_buffer::putc(b'\n');
            }
            terminal::TERMINALS.lock()[pit::scheduled()].line_ready = true;
        }
        _ => {
            let (shift, caps) = {
                let terminals = terminal::TERMINALS.lock();
                (terminals[view].shift_pressed, terminals[view].caps_lock)
            };
            let ch = translate(scan_code, shift, caps);
            if ch == 0 {
                return;
            }
            let pushed = terminal::TERMINALS.lock()[view].push(ch);
            if pushed {
                vga_buffer::putc(ch);
            }
        }
    }
}

fn handle_release(scan_code: u8) {
    let view = terminal::viewing();

    match scan_code {
        LEFT_SHIFT_RELEASE | RIGHT_SHIFT_RELEASE => {
            terminal::TERMINALS.lock()[view].shift_pressed = false;
        }
        CTRL_RELEASE => terminal::TERMINALS.lock()[view].ctrl_pressed = false,
        ALT_RELEASE => terminal::TERMINALS.lock()[view].alt_pressed = false,
        _ => {}
    }
}

/// Ctrl+L: clear the screen and type the pending line back out.
fn reprint_line(view: usize) {
    vga_buffer::clear();

    let (line, len) = {
        let terminals = terminal::TERMINALS.lock();
        (terminals[view].line, terminals[view].len)
    };
    for &byte in &line[..len] {
        vga_buffer::putc(byte);
    }
}

#[cfg(test)]
mod tests {
    use super::translate;

    #[test_case]
    fn test_plain_letters_are_lowercase() {
        assert_eq!(translate(16, false, false), b'q', "q key, no modifiers.");
        assert_eq!(translate(50, false, false), b'm', "m key, no modifiers.");
    }

    #[test_case]
    fn test_shift_uppercases_letters_and_shifts_symbols() {
        assert_eq!(translate(16, true, false), b'Q', "Shift+q gives Q.");
        assert_eq!(translate(2, true, false), b'!', "Shift+1 gives !.");
    }

    #[test_case]
    fn test_caps_lock_uppercases_letters_only() {
        assert_eq!(translate(30, false, true), b'A', "Caps+a gives A.");
        assert_eq!(translate(2, false, true), b'1', "Caps does not shift digits.");
    }

    #[test_case]
    fn test_caps_lock_with_shift_gives_lowercase_letters() {
        assert_eq!(translate(30, true, true), b'a', "Caps+Shift+a gives a.");
        assert_eq!(translate(2, true, true), b'!', "Caps+Shift+1 still gives !.");
    }

    #[test_case]
    fn test_dead_keys_translate_to_zero() {
        assert_eq!(translate(59, false, false), 0, "F1 has no character.");
        assert_eq!(translate(29, false, false), 0, "Ctrl has no character.");
    }
}
