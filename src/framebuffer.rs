//! Packed 1 bit per pixel framebuffer.
//!
//! The buffer is read by DMA while application code writes to it, with no
//! lock in between. Every byte is an [`AtomicU8`], so a reader always sees a
//! byte either before or after a write, but a row that is being redrawn while
//! it is scanned out can show a mix of old and new bytes for one frame.

use core::convert::Infallible;
use core::sync::atomic::{AtomicU8, Ordering};

use embedded_graphics::{
    Pixel,
    pixelcolor::BinaryColor,
    prelude::{DrawTarget, OriginDimensions, Size},
};

use crate::Error;

pub const WIDTH: usize = 640;
pub const HEIGHT: usize = 480;
/// Bytes per scanline.
pub const ROW_BYTES: usize = WIDTH / 8;
/// Framebuffer size in bytes
pub const FRAME_BYTES: usize = (WIDTH * HEIGHT).div_ceil(8);

/// The physical channel the colour pin is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ColorChannel {
    #[default]
    Red,
    Green,
    Blue,
}

pub struct FrameBuffer {
    data: [AtomicU8; FRAME_BYTES],
    foreground: ColorChannel,
}

/// Byte index and bit mask of a pixel. The first pixel of a byte is its most
/// significant bit, because the colour program shifts left.
fn locate(x: usize, y: usize) -> Result<(usize, u8), Error> {
    if x >= WIDTH || y >= HEIGHT {
        return Err(Error::OutOfBounds { x, y });
    }
    let index = y * WIDTH + x;
    Ok((index / 8, 0x80 >> (index % 8)))
}

const fn fill_byte(color: BinaryColor) -> u8 {
    match color {
        BinaryColor::On => 0xff,
        BinaryColor::Off => 0x00,
    }
}

impl FrameBuffer {
    pub const fn new(foreground: ColorChannel) -> Self {
        FrameBuffer {
            data: [const { AtomicU8::new(0) }; FRAME_BYTES],
            foreground,
        }
    }

    pub const fn width(&self) -> usize {
        WIDTH
    }

    pub const fn height(&self) -> usize {
        HEIGHT
    }

    /// Size of the backing store in bytes.
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    pub fn foreground(&self) -> ColorChannel {
        self.foreground
    }

    pub fn set_pixel(&self, x: usize, y: usize) -> Result<(), Error> {
        let (byte, mask) = locate(x, y)?;
        // Only the application context writes, so load + store is enough and
        // also works on cores without atomic read-modify-write.
        let cell = &self.data[byte];
        cell.store(cell.load(Ordering::Relaxed) | mask, Ordering::Relaxed);
        Ok(())
    }

    pub fn clear_pixel(&self, x: usize, y: usize) -> Result<(), Error> {
        let (byte, mask) = locate(x, y)?;
        let cell = &self.data[byte];
        cell.store(cell.load(Ordering::Relaxed) & !mask, Ordering::Relaxed);
        Ok(())
    }

    pub fn pixel(&self, x: usize, y: usize) -> Result<BinaryColor, Error> {
        let (byte, mask) = locate(x, y)?;
        Ok(BinaryColor::from(
            self.data[byte].load(Ordering::Relaxed) & mask != 0,
        ))
    }

    pub fn fill(&self, color: BinaryColor) {
        let value = fill_byte(color);
        for cell in self.data.iter() {
            cell.store(value, Ordering::Relaxed);
        }
    }

    pub fn fill_row(&self, y: usize, color: BinaryColor) -> Result<(), Error> {
        let value = fill_byte(color);
        for cell in self.row(y)? {
            cell.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copies packed pixels into the start of row `y`.
    pub fn write_row(&self, y: usize, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > ROW_BYTES {
            return Err(Error::OutOfBounds {
                x: bytes.len() * 8 - 1,
                y,
            });
        }
        for (cell, &value) in self.row(y)?.iter().zip(bytes) {
            cell.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn row_view(&self, y: usize) -> Result<RowView<'_>, Error> {
        Ok(RowView { bytes: self.row(y)? })
    }

    pub fn canvas(&self) -> Canvas<'_> {
        Canvas { framebuffer: self }
    }

    /// Address of the first byte, for DMA.
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr().cast()
    }

    fn row(&self, y: usize) -> Result<&[AtomicU8], Error> {
        if y >= HEIGHT {
            return Err(Error::OutOfBounds { x: 0, y });
        }
        Ok(&self.data[y * ROW_BYTES..(y + 1) * ROW_BYTES])
    }
}

/// Read-only view of one packed scanline.
#[derive(Clone, Copy)]
pub struct RowView<'a> {
    bytes: &'a [AtomicU8],
}

impl<'a> RowView<'a> {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn byte(&self, index: usize) -> Option<u8> {
        self.bytes.get(index).map(|b| b.load(Ordering::Relaxed))
    }

    pub fn bytes(&self) -> impl Iterator<Item = u8> + 'a {
        self.bytes.iter().map(|b| b.load(Ordering::Relaxed))
    }

    pub fn copy_to(&self, out: &mut [u8]) {
        for (dst, value) in out.iter_mut().zip(self.bytes()) {
            *dst = value;
        }
    }
}

/// `embedded-graphics` target over a [`FrameBuffer`]. Pixels outside the
/// screen are dropped.
pub struct Canvas<'a> {
    framebuffer: &'a FrameBuffer,
}

impl OriginDimensions for Canvas<'_> {
    fn size(&self) -> Size {
        Size::new(WIDTH as u32, HEIGHT as u32)
    }
}

impl DrawTarget for Canvas<'_> {
    type Color = BinaryColor;

    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(coord, color) in pixels.into_iter() {
            if coord.x < 0 || coord.y < 0 {
                continue;
            }
            let (x, y) = (coord.x as usize, coord.y as usize);
            // Off screen on the far side fails in the same place, so the
            // error is the clip.
            let _ = match color {
                BinaryColor::On => self.framebuffer.set_pixel(x, y),
                BinaryColor::Off => self.framebuffer.clear_pixel(x, y),
            };
        }

        Ok(())
    }

    fn clear(&mut self, color: Self::Color) -> Result<(), Self::Error> {
        self.framebuffer.fill(color);
        Ok(())
    }
}
