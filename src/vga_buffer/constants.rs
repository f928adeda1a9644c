//! Dimensions of the VGA text mode buffer.

/// Number of text rows on screen.
pub const BUFFER_HEIGHT: usize = 25;
/// Number of text columns on screen.
pub const BUFFER_WIDTH: usize = 80;
