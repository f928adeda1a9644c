use volatile::Volatile;

use super::{
    colors::ColorCode,
    constants::{BUFFER_HEIGHT, BUFFER_WIDTH},
};

/// A text frame: either the live VGA buffer or one of the shadow pages.
pub struct Buffer {
    pub chars: [[Volatile<ScreenChar>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

/// Represent a character on the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ScreenChar {
    pub ascii_character: u8,
    pub color_code: ColorCode,
}

impl ScreenChar {
    /// A blank cell in the given color.
    pub const fn blank(color_code: ColorCode) -> Self {
        Self {
            ascii_character: b' ',
            color_code,
        }
    }
}
