use crate::backend::Backend;
use crate::resources::ResourcePool;
use crate::scanout::ScanoutEngine;
use crate::timing::{Timing, TimingController, VideoMode};
use crate::{Error, FrameBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    Idle,
    Running,
    /// Stopped after running. Behaves like `Idle`.
    Stopped,
}

/// One VGA output: a framebuffer, the PIO programs that show it and the
/// resources they hold while running.
pub struct Vga<'p, B: Backend> {
    backend: B,
    timing: TimingController<'p>,
    scanout: ScanoutEngine<'p>,
    framebuffer: &'static FrameBuffer,
    state: State,
}

impl<'p, B: Backend> Vga<'p, B> {
    /// Nothing is claimed until [`Vga::start_synchronisation`].
    pub fn new(
        mode: VideoMode,
        pool: &'p ResourcePool,
        backend: B,
        framebuffer: &'static mut FrameBuffer,
    ) -> Result<Self, Error> {
        let framebuffer: &'static FrameBuffer = framebuffer;
        let timing = TimingController::configure(mode, pool)?;
        let scanout = ScanoutEngine::configure(timing.timing(), framebuffer, pool);
        Ok(Vga {
            backend,
            timing,
            scanout,
            framebuffer,
            state: State::Idle,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    /// The pixels on screen. Writes show up on the next pass of the beam.
    pub fn framebuffer(&self) -> &'static FrameBuffer {
        self.framebuffer
    }

    pub fn timing(&self) -> &'static Timing {
        self.timing.timing()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Claims the pins, state machines and DMA channels, then starts the
    /// sync programs followed by colour output.
    pub fn start_synchronisation(&mut self) -> Result<&'static FrameBuffer, Error> {
        if self.state == State::Running {
            return Err(Error::AlreadyRunning);
        }
        if !self.scanout.fits_framebuffer() {
            return Err(Error::ModeUnsupported(self.timing.mode()));
        }

        let line = self.timing.arm(&mut self.backend)?;
        if let Err(e) = self.scanout.arm(&mut self.backend, line) {
            warn!("scanout failed to start: {}", e);
            self.timing.disarm(&mut self.backend);
            return Err(e);
        }

        self.state = State::Running;
        info!("vga: synchronisation started");
        Ok(self.framebuffer)
    }

    /// Stops colour output, then the sync programs, and gives every
    /// resource back. The output can be started again afterwards.
    pub fn stop_synchronisation(&mut self) -> Result<(), Error> {
        if self.state != State::Running {
            return Err(Error::NotRunning);
        }
        self.scanout.disarm(&mut self.backend);
        self.timing.disarm(&mut self.backend);
        self.state = State::Stopped;
        info!("vga: synchronisation stopped");
        Ok(())
    }
}

impl<B: Backend> Drop for Vga<'_, B> {
    fn drop(&mut self) {
        if self.state == State::Running {
            let _ = self.stop_synchronisation();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::boxed::Box;

    use embedded_graphics::pixelcolor::BinaryColor;

    use super::*;
    use crate::backend::Pins;
    use crate::framebuffer::{ColorChannel, HEIGHT, WIDTH};
    use crate::resources::{PoolLayout, Resource};
    use crate::sim::{SimBackend, SimDisplay};
    use crate::{Error, ResourceKind};

    fn framebuffer() -> &'static mut FrameBuffer {
        Box::leak(Box::new(FrameBuffer::new(ColorChannel::Red)))
    }

    fn vga<'a>(pool: &'a ResourcePool, display: &'a SimDisplay) -> Vga<'a, SimBackend<'a>> {
        Vga::new(
            VideoMode::Vga640x480At60,
            pool,
            SimBackend::new(display),
            framebuffer(),
        )
        .unwrap()
    }

    #[test]
    fn unsupported_modes_fail_construction() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let result = Vga::new(
            VideoMode::Svga800x600At60,
            &pool,
            SimBackend::new(&display),
            framebuffer(),
        );
        assert!(matches!(
            result,
            Err(Error::ModeUnsupported(VideoMode::Svga800x600At60))
        ));
        assert!(pool.is_empty());
    }

    #[test]
    fn start_claims_and_stop_releases_everything() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let mut vga = vga(&pool, &display);
        assert_eq!(vga.state(), State::Idle);
        assert!(pool.is_empty());

        vga.start_synchronisation().unwrap();
        assert_eq!(vga.state(), State::Running);
        for pin in [4, 5, 0] {
            assert!(pool.is_claimed(Resource::Pin(pin)));
        }
        assert!(pool.is_claimed(Resource::DmaChannel(10)));
        assert!(pool.is_claimed(Resource::DmaChannel(11)));
        assert!(display.timing_running());
        assert!(display.scanout_running());

        vga.stop_synchronisation().unwrap();
        assert_eq!(vga.state(), State::Stopped);
        assert!(pool.is_empty());
        assert!(!display.timing_running());
        assert!(!display.scanout_running());
    }

    #[test]
    fn second_start_is_rejected_and_leaves_the_session_alone() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let mut vga = vga(&pool, &display);
        vga.start_synchronisation().unwrap();
        let starts = display.starts();

        assert!(matches!(vga.start_synchronisation(), Err(Error::AlreadyRunning)));
        assert_eq!(vga.state(), State::Running);
        assert_eq!(display.starts(), starts);
        assert_eq!(display.stops(), 0);
        assert!(display.timing_running() && display.scanout_running());
    }

    #[test]
    fn stop_while_idle_is_rejected_without_side_effects() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let mut vga = vga(&pool, &display);
        assert!(matches!(vga.stop_synchronisation(), Err(Error::NotRunning)));
        assert_eq!(vga.state(), State::Idle);
        assert_eq!(display.stops(), 0);

        vga.start_synchronisation().unwrap();
        vga.stop_synchronisation().unwrap();
        let stops = display.stops();
        assert!(matches!(vga.stop_synchronisation(), Err(Error::NotRunning)));
        assert_eq!(vga.state(), State::Stopped);
        assert_eq!(display.stops(), stops);
    }

    #[test]
    fn restart_after_a_clean_stop() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let mut vga = vga(&pool, &display);
        vga.framebuffer().fill(BinaryColor::On);
        assert!(vga.start_synchronisation().is_ok());
        assert!(vga.stop_synchronisation().is_ok());
        assert!(vga.start_synchronisation().is_ok());
        assert_eq!(vga.state(), State::Running);
        assert_eq!(vga.framebuffer().pixel(0, 0), Ok(BinaryColor::On));
    }

    #[test]
    fn second_instance_on_the_same_sync_pin_conflicts() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let other_display = SimDisplay::new();
        let mut first = vga(&pool, &display);
        first.start_synchronisation().unwrap();

        let pins = Pins {
            hsync: 4,
            vsync: 7,
            color: 8,
        };
        let mut second = Vga::new(
            VideoMode::Vga640x480At60,
            &pool,
            SimBackend::with_wiring(&other_display, 1, pins, 2, 3),
            framebuffer(),
        )
        .unwrap();
        assert!(matches!(
            second.start_synchronisation(),
            Err(Error::PinConflict(4))
        ));
        assert_eq!(second.state(), State::Idle);
        assert!(!other_display.timing_running());
        assert!(first.is_running());
        assert!(!pool.is_claimed(Resource::Pin(7)));
    }

    #[test]
    fn failed_scanout_rolls_back_the_timing() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let mut vga = vga(&pool, &display);
        let colour_pin = pool.claim_pin(0).unwrap();

        assert!(matches!(
            vga.start_synchronisation(),
            Err(Error::PinConflict(0))
        ));
        assert_eq!(vga.state(), State::Idle);
        assert!(!display.timing_running());
        assert_eq!(display.starts(), display.stops());
        assert!(!pool.is_claimed(Resource::Pin(4)));
        assert!(!pool.is_claimed(Resource::Pin(5)));

        drop(colour_pin);
        assert!(pool.is_empty());
        vga.start_synchronisation().unwrap();
    }

    #[test]
    fn exhausted_state_machines_are_reported() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let mut vga = vga(&pool, &display);
        let _radio = pool.reserve_state_machine(0, 0).unwrap();
        let _other = pool.reserve_state_machine(0, 1).unwrap();

        // Two left: enough for the sync programs, not for colour.
        assert!(matches!(
            vga.start_synchronisation(),
            Err(Error::ResourceExhausted(ResourceKind::StateMachine))
        ));
        assert!(!display.timing_running());

        let _third = pool.reserve_state_machine(0, 2).unwrap();
        assert!(matches!(
            vga.start_synchronisation(),
            Err(Error::ResourceExhausted(ResourceKind::StateMachine))
        ));
        assert_eq!(display.starts(), display.stops());
    }

    #[test]
    fn dropping_a_running_driver_releases_its_resources() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        {
            let mut vga = vga(&pool, &display);
            vga.start_synchronisation().unwrap();
        }
        assert!(pool.is_empty());
        assert!(!display.timing_running());
    }

    #[test]
    fn framebuffer_capability_writes_the_scanned_buffer() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let mut vga = vga(&pool, &display);
        let fb = vga.start_synchronisation().unwrap();
        fb.set_pixel(WIDTH - 1, HEIGHT - 1).unwrap();
        assert_eq!(
            vga.framebuffer().pixel(WIDTH - 1, HEIGHT - 1),
            Ok(BinaryColor::On)
        );
        assert!(core::ptr::eq(fb, vga.framebuffer()));
    }
}
