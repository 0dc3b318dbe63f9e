//! Video modes and the horizontal / vertical sync generators.
//!
//! Both sync signals come from two PIO programs. The horizontal program runs
//! at the pixel clock, counts out one line and raises [`LINE_IRQ`] at the end
//! of the back porch. The vertical program counts those IRQs, moves the
//! vsync pin by side-set, and for every visible line raises
//! [`VISIBLE_LINE_IRQ`], which is what releases the colour program. Once
//! started, neither needs the CPU again.

use crate::backend::{Backend, TimingUnits};
use crate::framebuffer::{HEIGHT, WIDTH};
use crate::resources::{Claim, ResourcePool};
use crate::Error;

/// Raised by the horizontal program once per line, at the end of the back
/// porch.
pub const LINE_IRQ: u8 = 0;
/// Raised by the vertical program at the start of every visible line.
pub const VISIBLE_LINE_IRQ: u8 = 1;
/// Raised by the vertical program at the start of the last line of a frame.
pub const FRAME_IRQ: u8 = 2;
pub(crate) const IRQ_MASK: u8 = (1 << LINE_IRQ) | (1 << VISIBLE_LINE_IRQ) | (1 << FRAME_IRQ);
/// The flags the colour program waits on. Both stay set until consumed, so
/// they are cleared before the colour program starts.
pub(crate) const SCANOUT_IRQ_MASK: u8 = (1 << VISIBLE_LINE_IRQ) | (1 << FRAME_IRQ);

/// `mov x, osr` before the counted loop of the horizontal program.
pub const HSYNC_SETUP_CYCLES: u32 = 1;
/// `set pins, 0 [31]` three times.
pub const HSYNC_PULSE_CYCLES: u32 = 96;
/// `set pins, 1 [31]`, `set pins, 1 [14]`, `irq 0`.
pub const HSYNC_BACK_PORCH_CYCLES: u32 = 48;
/// `set y, 10` ahead of the front porch loop of the vertical program. The
/// loop waits `y + 1` lines but the first of them is the last visible line.
pub const VSYNC_FRONT_PORCH_Y: u32 = 10;
/// Two waits with vsync side-set low.
pub const VSYNC_PULSE_LINES: u32 = 2;
/// `set y, 31` ahead of the back porch loop. The loop waits `y + 1` lines,
/// the line in which [`FRAME_IRQ`] is raised is one more, and the second
/// sync wait ends on the line before the loop.
pub const VSYNC_BACK_PORCH_Y: u32 = 31;
/// PIO clock of the vertical program. It only has to react to IRQs quickly.
pub const VSYNC_CLOCK_HZ: u32 = 125_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VideoMode {
    Vga640x480At60,
    Vga640x400At70,
    Svga800x600At60,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Polarity {
    ActiveLow,
    ActiveHigh,
}

/// One direction of a mode, in pixels (horizontal) or lines (vertical).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Axis {
    pub active: u32,
    pub front_porch: u32,
    pub sync: u32,
    pub back_porch: u32,
}

impl Axis {
    pub const fn total(&self) -> u32 {
        self.active + self.front_porch + self.sync + self.back_porch
    }
}

/// Defines the timing parameters for a video mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timing {
    pub pixel_clock_hz: u32,
    pub horizontal: Axis,
    pub vertical: Axis,
    pub hsync_polarity: Polarity,
    pub vsync_polarity: Polarity,
}

/// Industry standard 640x480 60Hz timing.
pub static VGA_640X480_60: Timing = Timing {
    pixel_clock_hz: 25_175_000,
    horizontal: Axis {
        active: 640,
        front_porch: 16,
        sync: 96,
        back_porch: 48,
    },
    vertical: Axis {
        active: 480,
        front_porch: 10,
        sync: 2,
        back_porch: 33,
    },
    hsync_polarity: Polarity::ActiveLow,
    vsync_polarity: Polarity::ActiveLow,
};

/// 640x400 70Hz, the VGA text mode timing.
pub static VGA_640X400_70: Timing = Timing {
    pixel_clock_hz: 25_175_000,
    horizontal: Axis {
        active: 640,
        front_porch: 16,
        sync: 96,
        back_porch: 48,
    },
    vertical: Axis {
        active: 400,
        front_porch: 12,
        sync: 2,
        back_porch: 35,
    },
    hsync_polarity: Polarity::ActiveLow,
    vsync_polarity: Polarity::ActiveHigh,
};

/// Industry standard 800x600 60Hz timing.
pub static SVGA_800X600_60: Timing = Timing {
    pixel_clock_hz: 40_000_000,
    horizontal: Axis {
        active: 800,
        front_porch: 40,
        sync: 128,
        back_porch: 88,
    },
    vertical: Axis {
        active: 600,
        front_porch: 1,
        sync: 4,
        back_porch: 23,
    },
    hsync_polarity: Polarity::ActiveHigh,
    vsync_polarity: Polarity::ActiveHigh,
};

impl Timing {
    pub fn for_mode(mode: VideoMode) -> &'static Timing {
        match mode {
            VideoMode::Vga640x480At60 => &VGA_640X480_60,
            VideoMode::Vga640x400At70 => &VGA_640X400_70,
            VideoMode::Svga800x600At60 => &SVGA_800X600_60,
        }
    }

    /// Whether the fixed sync programs and the framebuffer can produce this
    /// timing. Pulse widths, porches and polarities are baked into the
    /// program text; only the visible area is loaded at start-up.
    pub fn is_supported(&self) -> bool {
        self.horizontal.active as usize == WIDTH
            && self.vertical.active as usize == HEIGHT
            && self.horizontal.sync == HSYNC_PULSE_CYCLES
            && self.horizontal.back_porch == HSYNC_BACK_PORCH_CYCLES
            && self.horizontal.front_porch > HSYNC_SETUP_CYCLES
            && self.vertical.front_porch == VSYNC_FRONT_PORCH_Y
            && self.vertical.sync == VSYNC_PULSE_LINES
            && self.vertical.back_porch == VSYNC_BACK_PORCH_Y + 2
            && self.hsync_polarity == Polarity::ActiveLow
            && self.vsync_polarity == Polarity::ActiveLow
    }
}

/// Parameters for the two sync programs, derived from a [`Timing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncProgram {
    /// Horizontal program clock: one cycle per pixel.
    pub hsync_clock_hz: u32,
    pub vsync_clock_hz: u32,
    /// Loaded into the horizontal program's counter; `jmp x--` runs it
    /// `n + 1` times.
    pub hsync_preload: u32,
    /// Visible lines minus one, loaded into the vertical program.
    pub vsync_preload: u32,
}

impl SyncProgram {
    pub fn new(timing: &Timing) -> Self {
        let pre_pulse = timing.horizontal.active + timing.horizontal.front_porch;
        SyncProgram {
            hsync_clock_hz: timing.pixel_clock_hz,
            vsync_clock_hz: VSYNC_CLOCK_HZ,
            hsync_preload: pre_pulse - HSYNC_SETUP_CYCLES - 1,
            vsync_preload: timing.vertical.active - 1,
        }
    }
}

/// Horizontal sync, one cycle per pixel. Pulls the pre-pulse count once, then
/// every line counts it down, holds the pin low for the pulse and raises
/// [`LINE_IRQ`] as the last cycle of the back porch.
pub fn hsync_program() -> pio::Program<32> {
    pio::pio_asm!(
        "pull block",
        ".wrap_target",
        "mov x, osr",
        "active:",
        "jmp x-- active",   // visible area and front porch
        "set pins, 0 [31]",
        "set pins, 0 [31]",
        "set pins, 0 [31]", // 96 cycle pulse
        "set pins, 1 [31]",
        "set pins, 1 [14]",
        "irq 0",            // end of back porch: next line starts
        ".wrap",
    )
    .program
}

/// Vertical sync, counting [`LINE_IRQ`]s. The pin is moved by side-set so the
/// edges land on line boundaries.
pub fn vsync_program() -> pio::Program<32> {
    pio::pio_asm!(
        ".side_set 1 opt",
        "pull block",
        ".wrap_target",
        "mov x, osr",
        "active:",
        "wait 1 irq 0",
        "irq 1",            // release the colour program for this line
        "jmp x-- active",
        "set y, 10",
        "front_porch:",
        "wait 1 irq 0",
        "jmp y-- front_porch",
        "wait 1 irq 0 side 0",
        "wait 1 irq 0",
        "set y, 31",
        "back_porch:",
        "wait 1 irq 0 side 1",
        "jmp y-- back_porch",
        "irq 2",            // last line of the frame
        ".wrap",
    )
    .program
}

/// Proof that the sync programs of a PIO block are running. Only
/// [`TimingController::arm`] hands these out, so scanout cannot be armed
/// before there is a line signal to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LineBoundary {
    block: u8,
}

impl LineBoundary {
    pub fn block(&self) -> u8 {
        self.block
    }
}

struct ArmedTiming<'p> {
    line: LineBoundary,
    _hsync_pin: Claim<'p>,
    _vsync_pin: Claim<'p>,
    _irq_flags: Claim<'p>,
    _hsync_sm: Claim<'p>,
    _vsync_sm: Claim<'p>,
}

pub struct TimingController<'p> {
    mode: VideoMode,
    timing: &'static Timing,
    program: SyncProgram,
    pool: &'p ResourcePool,
    armed: Option<ArmedTiming<'p>>,
}

impl<'p> TimingController<'p> {
    pub fn configure(mode: VideoMode, pool: &'p ResourcePool) -> Result<Self, Error> {
        let timing = Timing::for_mode(mode);
        if !timing.is_supported() {
            return Err(Error::ModeUnsupported(mode));
        }
        Ok(TimingController {
            mode,
            timing,
            program: SyncProgram::new(timing),
            pool,
            armed: None,
        })
    }

    pub fn mode(&self) -> VideoMode {
        self.mode
    }

    pub fn timing(&self) -> &'static Timing {
        self.timing
    }

    pub fn program(&self) -> &SyncProgram {
        &self.program
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn line_boundary(&self) -> Option<LineBoundary> {
        self.armed.as_ref().map(|armed| armed.line)
    }

    pub fn arm(&mut self, backend: &mut impl Backend) -> Result<LineBoundary, Error> {
        if self.armed.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let wiring = backend.wiring();
        let hsync_pin = self.pool.claim_pin(wiring.pins.hsync)?;
        let vsync_pin = self.pool.claim_pin(wiring.pins.vsync)?;
        let irq_flags = self.pool.claim_irq_flags(wiring.block, IRQ_MASK)?;
        let hsync_sm = self.pool.claim_state_machine(wiring.block)?;
        let vsync_sm = self.pool.claim_state_machine(wiring.block)?;

        let units = TimingUnits {
            hsync: hsync_sm.index(),
            vsync: vsync_sm.index(),
        };
        backend.start_timing(&self.program, units)?;
        debug!(
            "sync running on PIO{} SM{} / SM{}",
            wiring.block, units.hsync, units.vsync
        );

        let line = LineBoundary {
            block: wiring.block,
        };
        self.armed = Some(ArmedTiming {
            line,
            _hsync_pin: hsync_pin,
            _vsync_pin: vsync_pin,
            _irq_flags: irq_flags,
            _hsync_sm: hsync_sm,
            _vsync_sm: vsync_sm,
        });
        Ok(line)
    }

    pub fn disarm(&mut self, backend: &mut impl Backend) {
        if let Some(armed) = self.armed.take() {
            backend.stop_timing();
            debug!("sync stopped on PIO{}", armed.line.block);
        }
    }
}
