use core::fmt;

use crate::timing::VideoMode;

/// Hardware resources handed out by the [`ResourcePool`](crate::ResourcePool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResourceKind {
    StateMachine,
    IrqFlag,
    DmaChannel,
    /// PIO instruction memory, shared by every program loaded into a block.
    InstructionMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The requested timing mode cannot be generated by this driver.
    ModeUnsupported(VideoMode),
    /// The GPIO is already claimed by this or another driver instance.
    PinConflict(u8),
    /// The GPIO number does not exist on the chip described by the pool.
    InvalidPin(u8),
    /// Every resource of this kind is already claimed.
    ResourceExhausted(ResourceKind),
    AlreadyRunning,
    NotRunning,
    /// Scanout was offered a line signal from another PIO block. IRQ flags
    /// do not cross blocks, so the colour program would never be released.
    BlockMismatch { sync: u8, scanout: u8 },
    /// Pixel coordinate outside the framebuffer.
    OutOfBounds { x: usize, y: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ModeUnsupported(mode) => write!(f, "video mode {mode:?} is not supported"),
            Error::PinConflict(pin) => write!(f, "GPIO{pin} is already claimed"),
            Error::InvalidPin(pin) => write!(f, "GPIO{pin} does not exist"),
            Error::ResourceExhausted(kind) => write!(f, "no free {kind:?} left"),
            Error::AlreadyRunning => f.write_str("synchronisation is already running"),
            Error::NotRunning => f.write_str("synchronisation is not running"),
            Error::BlockMismatch { sync, scanout } => {
                write!(f, "sync runs on PIO{sync} but scanout was wired to PIO{scanout}")
            }
            Error::OutOfBounds { x, y } => write!(f, "pixel ({x}, {y}) is out of bounds"),
        }
    }
}

impl core::error::Error for Error {}
