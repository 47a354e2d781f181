//! Pattern highlight palette.
//!
//! Exported patterns cycle deterministically through a fixed set of RGBA
//! colors. The wheel is per-instance state so concurrent runs never
//! interleave their color sequences.

/// Fixed RGBA palette (0xAABBGGRR, semi-transparent highlights).
pub const PALETTE: [u32; 7] = [
    0x70B4771F, 0x700E7FFF, 0x702CA02C, 0x702827D6, 0x70BD6794, 0x704B568C, 0x70C277E3,
];

/// Cycling cursor over [`PALETTE`].
#[derive(Debug, Clone, Default)]
pub struct ColorWheel {
    next: usize,
}

impl ColorWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next palette color, advancing the wheel.
    pub fn next_color(&mut self) -> u32 {
        let color = PALETTE[self.next % PALETTE.len()];
        self.next += 1;
        color
    }

    /// Rewind to the start of the palette.
    pub fn reset(&mut self) {
        self.next = 0;
    }
}
