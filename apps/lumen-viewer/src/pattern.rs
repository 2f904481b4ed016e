//! CPU-generated test pattern.

/// Two-colour checkerboard in tightly packed RGBA8.
#[derive(Debug, Clone, Copy)]
pub struct Checkerboard {
    pub width: u32,
    pub height: u32,
    /// Edge length of one square in pixels.
    pub cell: u32,
    pub light: [u8; 4],
    pub dark: [u8; 4],
}

impl Checkerboard {
    pub fn new(width: u32, height: u32, cell: u32) -> Self {
        Self {
            width,
            height,
            cell: cell.max(1),
            light: [0xe8, 0xe4, 0xd8, 0xff],
            dark: [0x2a, 0x3b, 0x55, 0xff],
        }
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }

    /// Colour of the pixel at (`x`, `y`). The top-left square is light.
    pub fn texel(&self, x: u32, y: u32) -> [u8; 4] {
        if (x / self.cell + y / self.cell) % 2 == 0 {
            self.light
        } else {
            self.dark
        }
    }

    /// Row-major pixel data.
    pub fn pixels(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for y in 0..self.height {
            for x in 0..self.width {
                data.extend_from_slice(&self.texel(x, y));
            }
        }
        data
    }
}
