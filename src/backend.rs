//! The seam between the driver logic and the hardware that produces the
//! signal.
//!
//! A backend only has to do two things: start the sync programs so they run
//! on their own clock, and start colour output released by the sync
//! programs' line signal. Everything about who may use which resource and in
//! what order things happen lives above this trait.

use crate::{Error, FrameBuffer, ScanoutProgram, SyncProgram};

/// GPIO numbers of the three outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Pins {
    pub hsync: u8,
    pub vsync: u8,
    pub color: u8,
}

impl Default for Pins {
    fn default() -> Self {
        Pins {
            hsync: 4,
            vsync: 5,
            color: 0,
        }
    }
}

/// The physical resources a backend is built around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Wiring {
    /// PIO block the programs are loaded into.
    pub block: u8,
    pub pins: Pins,
    /// DMA channel streaming pixels to the colour program.
    pub data_dma: u8,
    /// DMA channel that rewinds `data_dma` to the start of the frame.
    pub reload_dma: u8,
}

/// State machines picked for the sync programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimingUnits {
    pub hsync: u8,
    pub vsync: u8,
}

pub trait Backend {
    fn wiring(&self) -> Wiring;

    /// Loads and starts both sync programs. From here on they raise the
    /// line, visible-line and frame IRQs of [`crate::timing`] without CPU
    /// involvement.
    fn start_timing(&mut self, program: &SyncProgram, units: TimingUnits) -> Result<(), Error>;

    /// Stops the sync programs and drives both sync pins to their idle level.
    fn stop_timing(&mut self);

    /// Starts the colour program on `state_machine` and the DMA ring feeding
    /// it from `framebuffer`.
    fn start_scanout(
        &mut self,
        program: &ScanoutProgram,
        state_machine: u8,
        framebuffer: &'static FrameBuffer,
    ) -> Result<(), Error>;

    /// Stops DMA and the colour program, leaving the colour pin low even if
    /// it was halfway through a line.
    fn stop_scanout(&mut self);
}
