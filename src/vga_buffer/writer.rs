use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::paging;
use crate::terminal::{self, NUM_TERMINALS};
use crate::vga_buffer::{
    buffer::{Buffer, ScreenChar},
    colors::ColorCode,
    constants::{BUFFER_HEIGHT, BUFFER_WIDTH},
};

/// VGA CRT controller index port, used to move the hardware cursor.
const CRTC_INDEX_PORT: u16 = 0x3D4;
const CRTC_DATA_PORT: u16 = 0x3D5;

lazy_static! {
    /// Global instance of the VGA buffer writer.
    /// Holds one cursor per terminal; the write target is picked per byte
    /// from the current print terminal.
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        color_code: ColorCode::terminal_default(),
        cursors: [Cursor { row: 0, col: 0 }; NUM_TERMINALS],
    });
}

/// Cursor position of one terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub row: usize,
    pub col: usize,
}

////////////////////////
//   Screen Writer    //
////////////////////////

/// Writer over the physical VGA buffer and the three shadow frames.
///
/// Every byte goes to the frame of the *print terminal*: the physical buffer
/// when that terminal is the one being viewed, its shadow page otherwise.
pub struct Writer {
    pub color_code: ColorCode,
    cursors: [Cursor; NUM_TERMINALS],
}

impl Writer {
    /// Write a byte at the print terminal's cursor, advancing it.
    pub fn write_byte(&mut self, byte: u8) {
        let term = terminal::printing();
        match byte {
            b'\n' => self.new_line(term),
            character => {
                if self.cursors[term].col >= BUFFER_WIDTH {
                    self.new_line(term);
                }

                let Cursor { row, col } = self.cursors[term];
                let color_code = self.color_code;
                self.frame(term).chars[row][col].write(ScreenChar {
                    ascii_character: character,
                    color_code,
                });
                self.cursors[term].col += 1;
            }
        }
        self.sync_hw_cursor(term);
    }

    /// Write a string to the print terminal.
    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                // printable ASCII byte or newline
                0x20..=0x7e | b'\n' => self.write_byte(byte),
                // not part of printable ASCII range
                _ => self.write_byte(0xfe),
            }
        }
    }

    /// Step the cursor back one cell and blank it.
    pub fn backspace(&mut self) {
        let term = terminal::printing();
        let cursor = &mut self.cursors[term];
        if cursor.col > 0 {
            cursor.col -= 1;
        } else if cursor.row > 0 {
            cursor.row -= 1;
            cursor.col = BUFFER_WIDTH - 1;
        } else {
            return;
        }

        let Cursor { row, col } = self.cursors[term];
        let blank = ScreenChar::blank(self.color_code);
        self.frame(term).chars[row][col].write(blank);
        self.sync_hw_cursor(term);
    }

    /// Blank the print terminal's frame and home its cursor.
    pub fn clear(&mut self) {
        let term = terminal::printing();
        let blank = ScreenChar::blank(self.color_code);
        let frame = self.frame(term);
        for row in 0..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                frame.chars[row][col].write(blank);
            }
        }
        self.cursors[term] = Cursor { row: 0, col: 0 };
        self.sync_hw_cursor(term);
    }

    /// Saved cursor of the given terminal.
    #[must_use]
    pub fn cursor(&self, terminal: usize) -> Cursor {
        self.cursors[terminal]
    }

    /// Read back a cell of the print terminal's frame.
    #[must_use]
    pub fn read_at(&mut self, row: usize, col: usize) -> ScreenChar {
        let term = terminal::printing();
        self.frame(term).chars[row][col].read()
    }

    /// Move the VGA hardware cursor to the terminal's cursor, if that
    /// terminal is the one currently on screen.
    pub fn sync_hw_cursor(&mut self, terminal: usize) {
        if terminal != terminal::viewing() {
            return;
        }

        let Cursor { row, col } = self.cursors[terminal];
        let position = (row * BUFFER_WIDTH + col) as u16;

        let mut index = Port::new(CRTC_INDEX_PORT);
        let mut data = Port::new(CRTC_DATA_PORT);

        // SAFETY:
        // Registers 0x0E/0x0F of the CRT controller hold the cursor location.
        unsafe {
            index.write(0x0F_u8);
            data.write((position & 0xFF) as u8);
            index.write(0x0E_u8);
            data.write((position >> 8) as u8);
        }
    }

    /// Move all characters of the terminal's frame one row up and clear the
    /// last row.
    fn new_line(&mut self, term: usize) {
        self.cursors[term].col = 0;
        if self.cursors[term].row + 1 < BUFFER_HEIGHT {
            self.cursors[term].row += 1;
            return;
        }

        let color_code = self.color_code;
        let frame = self.frame(term);
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let character = frame.chars[row][col].read();
                frame.chars[row - 1][col].write(character);
            }
        }
        let blank = ScreenChar::blank(color_code);
        for col in 0..BUFFER_WIDTH {
            frame.chars[BUFFER_HEIGHT - 1][col].write(blank);
        }
    }

    /// Resolve the frame the given terminal currently renders into.
    fn frame(&mut self, term: usize) -> &'static mut Buffer {
        let addr = if term == terminal::viewing() {
            paging::VIDEO_MEM_ADDR
        } else {
            paging::SHADOW_PAGES[term]
        };

        // SAFETY:
        // Both the VGA buffer and the shadow pages are mapped at boot and
        // stay mapped for the lifetime of the kernel.
        unsafe { &mut *(addr as *mut Buffer) }
    }
}

impl fmt::Write for Writer {
    /// Implement the `write_str` function from the `fmt::Write` trait to be able to
    /// support the write! and writeln! macros.
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

/// Copy one full text frame to another, cell by cell.
///
/// Used when switching terminals: the on-screen contents move to the old
/// terminal's shadow page and the new terminal's shadow moves on screen.
pub fn copy_buffer(src_addr: u64, dst_addr: u64) {
    // SAFETY:
    // Both addresses name a 4 KiB frame (VGA buffer or shadow page) that is
    // mapped at boot; the two never alias.
    let (src, dst) = unsafe {
        (
            &mut *(src_addr as *mut Buffer),
            &mut *(dst_addr as *mut Buffer),
        )
    };

    for row in 0..BUFFER_HEIGHT {
        for col in 0..BUFFER_WIDTH {
            let character = src.chars[row][col].read();
            dst.chars[row][col].write(character);
        }
    }
}
