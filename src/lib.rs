//! Monochrome 640x480 VGA output for RP2040 / RP235x.
//!
//! Sync pulses and pixel data are generated by PIO state machines fed by DMA,
//! so once [`Vga::start_synchronisation`] returns the signal runs without any
//! CPU involvement. Application code keeps drawing into the [`FrameBuffer`]
//! while it is being scanned out; see the module docs of [`framebuffer`] for
//! what that means for consistency.

#![cfg_attr(not(test), no_std)]

// This must go first so the macros are visible to the other modules.
mod fmt;

pub mod backend;
mod driver;
mod error;
pub mod framebuffer;
pub mod resources;
pub mod scanout;
pub mod timing;

#[cfg(feature = "rp")]
pub mod rp;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use backend::{Backend, Pins, TimingUnits, Wiring};
pub use driver::{State, Vga};
pub use error::{Error, ResourceKind};
pub use framebuffer::{Canvas, ColorChannel, FrameBuffer, RowView};
pub use resources::{Claim, PoolLayout, ResourcePool};
pub use scanout::{ScanoutEngine, ScanoutProgram};
pub use timing::{LineBoundary, SyncProgram, Timing, TimingController, VGA_640X480_60, VideoMode};

pub use embedded_graphics::pixelcolor::BinaryColor;
