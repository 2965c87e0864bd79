//! Framebuffer console: renders the kernel log onto the boot framebuffer.
//!
//! Strictly an output sink. Glyphs come from the built-in 8x8 font; the
//! console scrolls by moving whole glyph rows.

use crate::boot::{FramebufferInfo, PixelFormat};
use crate::drivers::font8x8;
use crate::log::{LogLevel, LogSink};
use crate::sync::SpinLock;

/// Glyph cell width in pixels.
const GLYPH_WIDTH: u32 = 8;

/// Glyph cell height in pixels.
const GLYPH_HEIGHT: u32 = 8;

/// Foreground color (light grey).
const FG: (u8, u8, u8) = (0xAA, 0xAA, 0xAA);

/// Background color (black).
const BG: (u8, u8, u8) = (0x00, 0x00, 0x00);

/// Cursor position in character cells.
struct Cursor {
    col: u32,
    row: u32,
}

/// A glyph console over one linear framebuffer.
pub struct FramebufferConsole {
    base: *mut u8,
    width: u32,
    height: u32,
    pitch: u32,
    bytes_per_pixel: u32,
    format: PixelFormat,
    cursor: SpinLock<Cursor>,
}

// SAFETY: All framebuffer writes go through raw pointers into the MMIO
// region; the cursor is behind its own lock.
unsafe impl Send for FramebufferConsole {}
unsafe impl Sync for FramebufferConsole {}

impl FramebufferConsole {
    /// Creates a console over a boot framebuffer.
    ///
    /// Returns `None` for depths other than 24 or 32 bpp.
    pub fn new(info: &FramebufferInfo) -> Option<Self> {
        if info.bpp != 24 && info.bpp != 32 {
            return None;
        }
        Some(Self {
            base: info.address.as_mut_ptr(),
            width: info.width,
            height: info.height,
            pitch: info.pitch,
            bytes_per_pixel: u32::from(info.bpp) / 8,
            format: info.pixel_format,
            cursor: SpinLock::new(Cursor { col: 0, row: 0 }),
        })
    }

    /// Encodes an (r, g, b) triple for the framebuffer's pixel format.
    fn encode(&self, (r, g, b): (u8, u8, u8)) -> u32 {
        match self.format {
            PixelFormat::Rgb32 => u32::from(r) | (u32::from(g) << 8) | (u32::from(b) << 16),
            PixelFormat::Bgr32 => u32::from(b) | (u32::from(g) << 8) | (u32::from(r) << 16),
            PixelFormat::Bitmask {
                red_shift,
                green_shift,
                blue_shift,
                ..
            } => {
                (u32::from(r) << red_shift)
                    | (u32::from(g) << green_shift)
                    | (u32::from(b) << blue_shift)
            }
        }
    }

    /// Writes one pixel.
    fn put_pixel(&self, x: u32, y: u32, value: u32) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = (y * self.pitch + x * self.bytes_per_pixel) as usize;
        // SAFETY: offset is inside the framebuffer per the bounds check and
        // the loader-provided geometry.
        unsafe {
            let ptr = self.base.add(offset);
            if self.bytes_per_pixel == 4 {
                ptr.cast::<u32>().write_volatile(value);
            } else {
                ptr.write_volatile(value as u8);
                ptr.add(1).write_volatile((value >> 8) as u8);
                ptr.add(2).write_volatile((value >> 16) as u8);
            }
        }
    }

    /// Draws one glyph at a character cell.
    fn draw_glyph(&self, col: u32, row: u32, byte: u8) {
        let glyph = font8x8::glyph(byte);
        let fg = self.encode(FG);
        let bg = self.encode(BG);
        let x0 = col * GLYPH_WIDTH;
        let y0 = row * GLYPH_HEIGHT;

        for (dy, &bits) in glyph.iter().enumerate() {
            for dx in 0..GLYPH_WIDTH {
                let lit = (bits >> dx) & 1 != 0;
                self.put_pixel(x0 + dx, y0 + dy as u32, if lit { fg } else { bg });
            }
        }
    }

    /// Scrolls everything up one glyph row.
    fn scroll_up(&self) {
        let row_bytes = (self.pitch * GLYPH_HEIGHT) as usize;
        let rows = self.height / GLYPH_HEIGHT;
        if rows <= 1 {
            return;
        }
        // SAFETY: source and destination both lie inside the framebuffer.
        unsafe {
            core::ptr::copy(
                self.base.add(row_bytes),
                self.base,
                row_bytes * (rows as usize - 1),
            );
            core::ptr::write_bytes(self.base.add(row_bytes * (rows as usize - 1)), 0, row_bytes);
        }
    }

    /// Writes one byte at the cursor, handling control characters.
    fn write_byte(&self, byte: u8) {
        let cols = self.width / GLYPH_WIDTH;
        let rows = self.height / GLYPH_HEIGHT;
        let mut cursor = self.cursor.lock();

        match byte {
            b'\n' => {
                cursor.col = 0;
                cursor.row += 1;
            }
            b'\r' => cursor.col = 0,
            byte => {
                if cursor.col >= cols {
                    cursor.col = 0;
                    cursor.row += 1;
                }
                if cursor.row >= rows {
                    self.scroll_up();
                    cursor.row = rows - 1;
                }
                self.draw_glyph(cursor.col, cursor.row, byte);
                cursor.col += 1;
            }
        }

        if cursor.row >= rows {
            self.scroll_up();
            cursor.row = rows - 1;
        }
    }
}

/// A [`LogSink`] drawing onto a [`FramebufferConsole`].
pub struct FramebufferSink {
    console: FramebufferConsole,
    max_level: LogLevel,
}

impl FramebufferSink {
    /// Wraps a console as a log sink.
    pub fn new(console: FramebufferConsole, max_level: LogLevel) -> Self {
        Self { console, max_level }
    }
}

impl LogSink for FramebufferSink {
    fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            self.console.write_byte(byte);
        }
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "framebuffer"
    }
}
