//! VGA text buffer management module.
//! Writes are routed either to the physical framebuffer or to the shadow
//! page of an off-screen terminal, so a scheduled-but-unviewed process can
//! keep printing without corrupting the viewer's screen.

#![allow(unused_imports, reason = "Imports are used in test cases.")]
use core::fmt::Write;
use writer::WRITER;
use x86_64::instructions::interrupts;

mod buffer;
mod colors;
mod constants;
#[macro_use]
pub mod macros;
mod writer;

pub use buffer::{Buffer, ScreenChar};
pub use constants::{BUFFER_HEIGHT, BUFFER_WIDTH};
pub use writer::{copy_buffer, Writer};

/// Print a single byte to the currently selected print terminal.
pub fn putc(byte: u8) {
    interrupts::without_interrupts(|| {
        WRITER.lock().write_byte(byte);
    });
}

/// Erase the character before the cursor of the print terminal.
pub fn backspace() {
    interrupts::without_interrupts(|| {
        WRITER.lock().backspace();
    });
}

/// Blank the print terminal and move its cursor to the top left corner.
pub fn clear() {
    interrupts::without_interrupts(|| {
        WRITER.lock().clear();
    });
}

/// Push the given terminal's saved cursor position to the VGA hardware cursor.
pub fn sync_hw_cursor(terminal: usize) {
    interrupts::without_interrupts(|| {
        WRITER.lock().sync_hw_cursor(terminal);
    });
}

/// Test that printing many lines will not panic.
#[test_case]
fn test_when_printing_many_lines_should_not_panic() {
    for _ in 0..200 {
        println!("test many print output.");
    }
}

/// Test that a printed line lands in the VGA buffer at the cursor row.
/// # Panics
/// Fail if the line is not printed on the screen.
#[test_case]
fn test_when_printing_a_line_should_appear_in_vga_buffer() {
    let line = "Some line that fits on a single line";

    interrupts::without_interrupts(|| {
        let mut writer = WRITER.lock();

        #[expect(
            clippy::uninlined_format_args,
            reason = "This is a test, we want to use format_args!"
        )]
        writeln!(writer, "\n{}", line).expect("Failed to write line to vga buffer.");

        let row = writer.cursor(crate::terminal::printing()).row - 1;
        for (i, c) in line.chars().enumerate() {
            let screen_char = writer.read_at(row, i);
            assert_eq!(
                char::from(screen_char.ascii_character),
                c,
                "Character mismatch at position {i}.",
            );
        }
    });
}

/// Test that a backspace removes the last printed character.
#[test_case]
fn test_when_backspacing_should_blank_previous_cell() {
    interrupts::without_interrupts(|| {
        let mut writer = WRITER.lock();
        writer.write_byte(b'\n');
        writer.write_byte(b'x');
        writer.backspace();

        let cursor = writer.cursor(crate::terminal::printing());
        let screen_char = writer.read_at(cursor.row, cursor.col);
        assert_eq!(
            screen_char.ascii_character, b' ',
            "Backspace should blank the cell it retreats over.",
        );
    });
}
