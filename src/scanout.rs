//! Streaming the framebuffer to the colour pin.
//!
//! The colour program sits on [`VISIBLE_LINE_IRQ`](crate::timing::VISIBLE_LINE_IRQ),
//! shifts out one row at four PIO cycles per pixel and drops the pin again.
//! DMA keeps its FIFO topped up from the framebuffer and rewinds to the first
//! byte once a whole frame has gone out. Before its first line the program
//! waits for [`FRAME_IRQ`](crate::timing::FRAME_IRQ), so the first byte it
//! consumes always lands on the first visible line.

use crate::backend::Backend;
use crate::framebuffer::{FRAME_BYTES, FrameBuffer, ROW_BYTES};
use crate::resources::{Claim, ResourcePool};
use crate::timing::{LineBoundary, Timing};
use crate::Error;

/// `out pins, 1`, `nop [1]`, `jmp x--`.
pub const CYCLES_PER_PIXEL: u32 = 4;
/// Autopull threshold of the colour program: one framebuffer byte per pull.
pub const AUTOPULL_BITS: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanoutProgram {
    pub clock_hz: u32,
    /// Pixels per line minus one, loaded once into the colour program.
    pub pixel_preload: u32,
    pub row_bytes: u32,
    /// Bytes the data DMA channel moves before it is rewound.
    pub frame_bytes: u32,
}

impl ScanoutProgram {
    pub fn new(timing: &Timing) -> Self {
        ScanoutProgram {
            clock_hz: timing.pixel_clock_hz * CYCLES_PER_PIXEL,
            pixel_preload: timing.horizontal.active - 1,
            row_bytes: timing.horizontal.active.div_ceil(8),
            frame_bytes: (timing.horizontal.active * timing.vertical.active).div_ceil(8),
        }
    }

    pub fn pixels_per_line(&self) -> u32 {
        self.pixel_preload + 1
    }

    pub fn rows(&self) -> u32 {
        self.frame_bytes / self.row_bytes
    }
}

/// Colour at [`CYCLES_PER_PIXEL`] cycles per pixel. Takes the pixel count
/// once, waits for [`FRAME_IRQ`](crate::timing::FRAME_IRQ) and drops the
/// [`VISIBLE_LINE_IRQ`](crate::timing::VISIBLE_LINE_IRQ) left over from the
/// frame before, then shifts out one row per visible line.
pub fn color_program() -> pio::Program<32> {
    pio::pio_asm!(
        ".side_set 1 opt",
        "out y, 32",        // autopulls the pixel count; bytes follow
        "wait 1 irq 2",
        "irq clear 1",
        ".wrap_target",
        "mov x, y side 0",
        "wait 1 irq 1",
        "pixel:",
        "out pins, 1",
        "nop [1]",
        "jmp x-- pixel",
        ".wrap",
    )
    .program
}

struct ArmedScanout<'p> {
    _color_pin: Claim<'p>,
    _state_machine: Claim<'p>,
    _data_dma: Claim<'p>,
    _reload_dma: Claim<'p>,
}

pub struct ScanoutEngine<'p> {
    program: ScanoutProgram,
    framebuffer: &'static FrameBuffer,
    pool: &'p ResourcePool,
    armed: Option<ArmedScanout<'p>>,
}

impl<'p> ScanoutEngine<'p> {
    pub fn configure(
        timing: &Timing,
        framebuffer: &'static FrameBuffer,
        pool: &'p ResourcePool,
    ) -> Self {
        ScanoutEngine {
            program: ScanoutProgram::new(timing),
            framebuffer,
            pool,
            armed: None,
        }
    }

    pub fn program(&self) -> &ScanoutProgram {
        &self.program
    }

    /// Whether the framebuffer holds exactly one frame of this program.
    pub fn fits_framebuffer(&self) -> bool {
        self.framebuffer.len() == self.program.frame_bytes as usize
            && self.program.frame_bytes as usize == FRAME_BYTES
            && self.program.row_bytes as usize == ROW_BYTES
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn arm(&mut self, backend: &mut impl Backend, line: LineBoundary) -> Result<(), Error> {
        if self.armed.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let wiring = backend.wiring();
        if wiring.block != line.block() {
            return Err(Error::BlockMismatch {
                sync: line.block(),
                scanout: wiring.block,
            });
        }
        let color_pin = self.pool.claim_pin(wiring.pins.color)?;
        let state_machine = self.pool.claim_state_machine(line.block())?;
        let data_dma = self.pool.claim_dma_channel(wiring.data_dma)?;
        let reload_dma = self.pool.claim_dma_channel(wiring.reload_dma)?;

        backend.start_scanout(&self.program, state_machine.index(), self.framebuffer)?;
        debug!(
            "scanout running on PIO{} SM{}, DMA {} -> {}",
            line.block(),
            state_machine.index(),
            wiring.reload_dma,
            wiring.data_dma
        );

        self.armed = Some(ArmedScanout {
            _color_pin: color_pin,
            _state_machine: state_machine,
            _data_dma: data_dma,
            _reload_dma: reload_dma,
        });
        Ok(())
    }

    pub fn disarm(&mut self, backend: &mut impl Backend) {
        if self.armed.take().is_some() {
            backend.stop_scanout();
            debug!("scanout stopped");
        }
    }
}
