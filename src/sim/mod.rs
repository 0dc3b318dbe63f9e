//! Host model of the PIO block, for running the driver without a board.
//!
//! [`SimDisplay`] stands in for the PIO block and DMA. It runs the assembled
//! sync and colour programs instruction by instruction in [`machine`] and
//! reports the level of the three output pins at every pixel clock. A
//! [`Monitor`] watches those levels the way a real screen does, locking on to
//! the sync pulses and sampling the colour line into a picture.

extern crate alloc;

pub mod machine;

use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::backend::{Backend, Pins, TimingUnits, Wiring};
use crate::framebuffer::{FRAME_BYTES, FrameBuffer, ROW_BYTES};
use crate::scanout::{AUTOPULL_BITS, CYCLES_PER_PIXEL, ScanoutProgram, color_program};
use crate::timing::{
    IRQ_MASK, Polarity, SCANOUT_IRQ_MASK, SyncProgram, Timing, hsync_program, vsync_program,
};
use crate::Error;
use machine::{Preload, StateMachine, TxFifo};

/// Pin levels at one pixel clock. `true` is high.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub hsync: bool,
    pub vsync: bool,
    pub color: bool,
}

pub trait Observer {
    fn sample(&mut self, sample: Sample);
}

impl<F: FnMut(Sample)> Observer for F {
    fn sample(&mut self, sample: Sample) {
        self(sample)
    }
}

struct SyncMachines {
    hsync: StateMachine,
    vsync: StateMachine,
    hsync_fifo: Preload,
    vsync_fifo: Preload,
}

/// The data/reload DMA pair in front of the colour FIFO: the count pushed by
/// the CPU, then the frame byte by byte, rewound after the last one.
struct ScanoutDma {
    preload: Option<u32>,
    framebuffer: &'static FrameBuffer,
    frame_bytes: u32,
    next: u32,
}

impl TxFifo for ScanoutDma {
    fn pull(&mut self) -> Option<u32> {
        if let Some(word) = self.preload.take() {
            return Some(word);
        }
        // An empty transfer completes without ever writing the FIFO.
        if self.frame_bytes == 0 {
            return None;
        }
        let index = self.next as usize;
        self.next = (self.next + 1) % self.frame_bytes;
        let byte = self
            .framebuffer
            .row_view(index / ROW_BYTES)
            .ok()
            .and_then(|row| row.byte(index % ROW_BYTES))
            .unwrap_or(0);
        // A byte written to the FIFO shows up in all four lanes.
        Some(u32::from(byte) * 0x0101_0101)
    }
}

struct SimScanout {
    machine: StateMachine,
    dma: ScanoutDma,
}

struct Hardware {
    timing: Option<SyncMachines>,
    scanout: Option<SimScanout>,
    /// IRQ flags of the PIO block.
    irq: u8,
    color: bool,
    starts: u32,
    stops: u32,
}

impl Hardware {
    /// One pixel clock. The colour program runs at four times that, and so
    /// does the vertical program here: it only reacts to IRQs, so its real
    /// 125 MHz clock changes nothing it outputs. Within a cycle the machines
    /// step in program order and see each other's IRQs at once.
    fn step(&mut self, observer: &mut impl Observer) {
        let Some(sync) = self.timing.as_mut() else {
            return;
        };
        for tick in 0..CYCLES_PER_PIXEL {
            if tick == 0 {
                sync.hsync.step(&mut self.irq, &mut sync.hsync_fifo);
            }
            sync.vsync.step(&mut self.irq, &mut sync.vsync_fifo);
            if let Some(scanout) = self.scanout.as_mut() {
                scanout.machine.step(&mut self.irq, &mut scanout.dma);
                self.color = scanout.machine.pin();
            }
            if tick == 0 {
                observer.sample(Sample {
                    hsync: sync.hsync.pin(),
                    vsync: sync.vsync.pin(),
                    color: self.color,
                });
            }
        }
    }
}

/// The PIO block, DMA and output pins of one simulated board.
pub struct SimDisplay {
    hw: Mutex<CriticalSectionRawMutex, RefCell<Hardware>>,
}

impl Default for SimDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDisplay {
    pub const fn new() -> Self {
        SimDisplay {
            hw: Mutex::new(RefCell::new(Hardware {
                timing: None,
                scanout: None,
                irq: 0,
                color: false,
                starts: 0,
                stops: 0,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Hardware) -> R) -> R {
        self.hw.lock(|hw| f(&mut hw.borrow_mut()))
    }

    /// Runs the hardware for `clocks` pixel clocks. Nothing happens while the
    /// sync programs are stopped.
    pub fn advance(&self, clocks: u32, observer: &mut impl Observer) {
        self.with(|hw| {
            for _ in 0..clocks {
                hw.step(observer);
            }
        })
    }

    pub fn timing_running(&self) -> bool {
        self.with(|hw| hw.timing.is_some())
    }

    pub fn scanout_running(&self) -> bool {
        self.with(|hw| hw.scanout.is_some())
    }

    /// Current level of the colour pin.
    pub fn color_level(&self) -> bool {
        self.with(|hw| hw.color)
    }

    /// IRQ flags currently set in the block.
    pub fn irq_flags(&self) -> u8 {
        self.with(|hw| hw.irq)
    }

    /// Programs started so far, sync and colour counted separately.
    pub fn starts(&self) -> u32 {
        self.with(|hw| hw.starts)
    }

    pub fn stops(&self) -> u32 {
        self.with(|hw| hw.stops)
    }
}

pub struct SimBackend<'a> {
    display: &'a SimDisplay,
    wiring: Wiring,
}

impl<'a> SimBackend<'a> {
    /// PIO0 and the default pins. Pixels go out on DMA channel 11, reloaded
    /// by channel 10.
    pub fn new(display: &'a SimDisplay) -> Self {
        Self::with_wiring(display, 0, Pins::default(), 11, 10)
    }

    pub fn with_wiring(
        display: &'a SimDisplay,
        block: u8,
        pins: Pins,
        data_dma: u8,
        reload_dma: u8,
    ) -> Self {
        SimBackend {
            display,
            wiring: Wiring {
                block,
                pins,
                data_dma,
                reload_dma,
            },
        }
    }

    pub fn display(&self) -> &'a SimDisplay {
        self.display
    }
}

impl Backend for SimBackend<'_> {
    fn wiring(&self) -> Wiring {
        self.wiring
    }

    fn start_timing(&mut self, program: &SyncProgram, _units: TimingUnits) -> Result<(), Error> {
        self.display.with(|hw| {
            if hw.timing.is_some() {
                return Err(Error::AlreadyRunning);
            }
            hw.timing = Some(SyncMachines {
                hsync: StateMachine::new(&hsync_program(), true, None),
                vsync: StateMachine::new(&vsync_program(), true, None),
                hsync_fifo: Preload::new(program.hsync_preload),
                vsync_fifo: Preload::new(program.vsync_preload),
            });
            hw.irq &= !IRQ_MASK;
            hw.starts += 1;
            Ok(())
        })
    }

    fn stop_timing(&mut self) {
        self.display.with(|hw| {
            hw.timing = None;
            hw.stops += 1;
        });
    }

    fn start_scanout(
        &mut self,
        program: &ScanoutProgram,
        _state_machine: u8,
        framebuffer: &'static FrameBuffer,
    ) -> Result<(), Error> {
        self.display.with(|hw| {
            if hw.scanout.is_some() {
                return Err(Error::AlreadyRunning);
            }
            hw.scanout = Some(SimScanout {
                machine: StateMachine::new(&color_program(), false, Some(AUTOPULL_BITS)),
                dma: ScanoutDma {
                    preload: Some(program.pixel_preload),
                    framebuffer,
                    frame_bytes: program.frame_bytes,
                    next: 0,
                },
            });
            hw.irq &= !SCANOUT_IRQ_MASK;
            hw.starts += 1;
            Ok(())
        })
    }

    fn stop_scanout(&mut self) {
        self.display.with(|hw| {
            hw.scanout = None;
            hw.color = false;
            hw.stops += 1;
        });
    }
}

/// What a monitor saw over one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Pixel clocks between hsync leading edges.
    pub line_period: u32,
    pub hsync_width: u32,
    /// Lines between vsync leading edges.
    pub frame_lines: u32,
    pub vsync_width: u32,
    /// Clocks with the colour line high outside the visible area.
    pub blanking_violations: u32,
    /// Packed like the framebuffer.
    pub image: Vec<u8>,
}

impl CapturedFrame {
    pub fn pixel(&self, x: usize, y: usize, width: usize) -> bool {
        let index = y * width + x;
        self.image[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn matches(&self, framebuffer: &FrameBuffer) -> bool {
        (0..framebuffer.height()).all(|y| {
            framebuffer.row_view(y).is_ok_and(|row| {
                let start = y * row.len();
                row.bytes().eq(self.image[start..start + row.len()].iter().copied())
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    WaitingForVsync,
    Recording,
    Done,
}

/// Locks on to the sync pulses of a known mode and records one frame.
pub struct Monitor {
    timing: &'static Timing,
    state: MonitorState,
    previous: Option<(bool, bool)>,
    clock: u64,
    last_hsync_lead: Option<u64>,
    hsync_run: u32,
    /// Clocks since the end of the last hsync pulse.
    since_hsync: u32,
    /// Hsync pulses since the end of the vsync pulse, `None` before it.
    since_vsync: Option<u32>,
    frame: CapturedFrame,
}

impl Monitor {
    pub fn new(timing: &'static Timing) -> Self {
        Monitor {
            timing,
            state: MonitorState::WaitingForVsync,
            previous: None,
            clock: 0,
            last_hsync_lead: None,
            hsync_run: 0,
            since_hsync: 0,
            since_vsync: None,
            frame: CapturedFrame {
                line_period: 0,
                hsync_width: 0,
                frame_lines: 0,
                vsync_width: 0,
                blanking_violations: 0,
                image: vec![0; FRAME_BYTES],
            },
        }
    }

    /// Watches `display` until a whole frame went by, or gives up after
    /// three frames' worth of clocks.
    pub fn capture(display: &SimDisplay, timing: &'static Timing) -> Option<CapturedFrame> {
        let mut monitor = Monitor::new(timing);
        let line = timing.horizontal.total();
        for _ in 0..3 * timing.vertical.total() {
            if monitor.is_done() {
                break;
            }
            display.advance(line, &mut monitor);
        }
        monitor.finish()
    }

    pub fn is_done(&self) -> bool {
        self.state == MonitorState::Done
    }

    pub fn finish(self) -> Option<CapturedFrame> {
        self.is_done().then_some(self.frame)
    }

    fn asserted(level: bool, polarity: Polarity) -> bool {
        level == (polarity == Polarity::ActiveHigh)
    }

    fn record_color(&mut self, color: bool) {
        let h = self.timing.horizontal;
        let v = self.timing.vertical;
        let position = self.since_vsync.and_then(|rows| {
            let x = self.since_hsync.checked_sub(h.back_porch)?;
            let y = rows.checked_sub(v.back_porch)?;
            (x < h.active && y < v.active).then_some((x, y))
        });
        match position {
            Some((x, y)) => {
                if color {
                    let index = (y * h.active + x) as usize;
                    self.frame.image[index / 8] |= 0x80 >> (index % 8);
                }
            }
            None => {
                if color {
                    self.frame.blanking_violations += 1;
                }
            }
        }
    }
}

impl Observer for Monitor {
    fn sample(&mut self, sample: Sample) {
        if self.state == MonitorState::Done {
            return;
        }
        let hsync = Self::asserted(sample.hsync, self.timing.hsync_polarity);
        let vsync = Self::asserted(sample.vsync, self.timing.vsync_polarity);
        let (was_hsync, was_vsync) = self.previous.unwrap_or((hsync, vsync));
        self.previous = Some((hsync, vsync));
        let recording = self.state == MonitorState::Recording;

        if vsync && !was_vsync {
            match self.state {
                MonitorState::WaitingForVsync => self.state = MonitorState::Recording,
                _ => {
                    self.state = MonitorState::Done;
                    return;
                }
            }
        }
        if !vsync && was_vsync && recording {
            self.since_vsync = Some(0);
        }

        if hsync && !was_hsync {
            if let Some(last) = self.last_hsync_lead {
                self.frame.line_period = (self.clock - last) as u32;
            }
            self.last_hsync_lead = Some(self.clock);
            self.hsync_run = 0;
            if self.state == MonitorState::Recording {
                self.frame.frame_lines += 1;
                if vsync {
                    self.frame.vsync_width += 1;
                }
            }
        }
        if hsync {
            self.hsync_run += 1;
        }
        if !hsync && was_hsync {
            self.frame.hsync_width = self.hsync_run;
            self.since_hsync = 0;
            if let Some(rows) = self.since_vsync.as_mut() {
                *rows += 1;
            }
        }

        if self.state == MonitorState::Recording {
            self.record_color(sample.color);
        }
        self.since_hsync = self.since_hsync.saturating_add(1);
        self.clock += 1;
    }
}


#[cfg(test)]
mod tests {
    use std::boxed::Box;

    use embedded_graphics::pixelcolor::BinaryColor;

    use super::*;
    use crate::framebuffer::{ColorChannel, HEIGHT, WIDTH};
    use crate::resources::{PoolLayout, ResourcePool};
    use crate::scanout::ScanoutEngine;
    use crate::timing::{FRAME_IRQ, TimingController, VGA_640X480_60, VideoMode};
    use crate::Vga;

    const LINE: u32 = 800;
    const FRAME: u32 = 800 * 525;

    fn framebuffer() -> &'static mut FrameBuffer {
        Box::leak(Box::new(FrameBuffer::new(ColorChannel::Red)))
    }

    fn running<'a>(pool: &'a ResourcePool, display: &'a SimDisplay) -> Vga<'a, SimBackend<'a>> {
        let mut vga = Vga::new(
            VideoMode::Vga640x480At60,
            pool,
            SimBackend::new(display),
            framebuffer(),
        )
        .unwrap();
        vga.start_synchronisation().unwrap();
        vga
    }

    fn skip(display: &SimDisplay, clocks: u32) {
        display.advance(clocks, &mut |_: Sample| {});
    }

    /// Steps one pixel clock at a time until the colour pin is at `level`.
    fn run_until_color(display: &SimDisplay, level: bool) {
        for _ in 0..FRAME {
            if display.color_level() == level {
                return;
            }
            skip(display, 1);
        }
        panic!("colour pin never went {}", if level { "high" } else { "low" });
    }

    #[test]
    fn sync_timing_matches_the_mode() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let _vga = running(&pool, &display);

        let frame = Monitor::capture(&display, &VGA_640X480_60).unwrap();
        let (h, v) = (VGA_640X480_60.horizontal, VGA_640X480_60.vertical);
        assert_eq!(frame.line_period, 800);
        assert_eq!(frame.line_period, h.total());
        assert_eq!(frame.hsync_width, h.sync);
        assert_eq!(frame.frame_lines, 525);
        assert_eq!(frame.frame_lines, v.total());
        assert_eq!(frame.vsync_width, v.sync);
    }

    #[test]
    fn sync_pins_idle_at_their_inactive_level() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let _vga = running(&pool, &display);

        let mut low_hsync = 0;
        let mut low_vsync = 0;
        display.advance(FRAME, &mut |s: Sample| {
            if !s.hsync {
                low_hsync += 1;
            }
            if !s.vsync {
                low_vsync += 1;
            }
        });
        assert_eq!(low_hsync, 96 * 525);
        assert_eq!(low_vsync, 2 * LINE);
    }

    #[test]
    fn captured_frame_shows_the_framebuffer() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let vga = running(&pool, &display);
        let fb = vga.framebuffer();
        fb.set_pixel(0, 0).unwrap();
        fb.set_pixel(WIDTH - 1, HEIGHT - 1).unwrap();
        fb.set_pixel(WIDTH - 1, 0).unwrap();
        fb.set_pixel(0, HEIGHT - 1).unwrap();
        for x in (0..WIDTH).step_by(3) {
            fb.set_pixel(x, x * HEIGHT / WIDTH).unwrap();
        }
        fb.fill_row(200, BinaryColor::On).unwrap();

        let frame = Monitor::capture(&display, &VGA_640X480_60).unwrap();
        assert!(frame.matches(fb));
        assert!(frame.pixel(0, 0, WIDTH));
        assert!(frame.pixel(WIDTH - 1, HEIGHT - 1, WIDTH));
        assert!(!frame.pixel(1, 0, WIDTH));
        assert_eq!(frame.blanking_violations, 0);
    }

    #[test]
    fn colour_stays_low_during_blanking() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let vga = running(&pool, &display);
        vga.framebuffer().fill(BinaryColor::On);

        let frame = Monitor::capture(&display, &VGA_640X480_60).unwrap();
        assert_eq!(frame.blanking_violations, 0);
        assert!(frame.image.iter().all(|&b| b == 0xff));

        let mut high = 0;
        display.advance(FRAME, &mut |s: Sample| {
            if s.color {
                high += 1;
            }
        });
        assert_eq!(high, 640 * 480);
    }

    /// Arms timing, lets `clocks` go by, then arms scanout with only row 0
    /// lit and checks where that row ends up.
    fn scanout_armed_after(clocks: u32) {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let fb: &'static FrameBuffer = framebuffer();
        fb.fill_row(0, BinaryColor::On).unwrap();
        let mut backend = SimBackend::new(&display);

        let mut timing = TimingController::configure(VideoMode::Vga640x480At60, &pool).unwrap();
        let line = timing.arm(&mut backend).unwrap();
        skip(&display, clocks);

        let mut scanout = ScanoutEngine::configure(timing.timing(), fb, &pool);
        scanout.arm(&mut backend, line).unwrap();

        let frame = Monitor::capture(&display, &VGA_640X480_60).unwrap();
        assert!(frame.matches(fb));
        assert!(frame.pixel(0, 0, WIDTH));
        assert!(!frame.pixel(0, 1, WIDTH));
        assert_eq!(frame.blanking_violations, 0);

        scanout.disarm(&mut backend);
        timing.disarm(&mut backend);
        assert!(pool.is_empty());
    }

    #[test]
    fn scanout_armed_mid_frame_still_starts_at_row_zero() {
        scanout_armed_after(LINE * 123 + 317);
    }

    #[test]
    fn scanout_armed_frames_after_timing_still_starts_at_row_zero() {
        scanout_armed_after(LINE * 600 + 41);
        scanout_armed_after(FRAME * 3 + LINE * 7);
    }

    #[test]
    fn frame_flag_stays_set_until_scanout_starts() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let fb: &'static FrameBuffer = framebuffer();
        let mut backend = SimBackend::new(&display);
        let mut timing = TimingController::configure(VideoMode::Vga640x480At60, &pool).unwrap();
        let line = timing.arm(&mut backend).unwrap();

        skip(&display, LINE * 600);
        assert_ne!(display.irq_flags() & (1 << FRAME_IRQ), 0);

        let mut scanout = ScanoutEngine::configure(timing.timing(), fb, &pool);
        scanout.arm(&mut backend, line).unwrap();
        assert_eq!(display.irq_flags() & SCANOUT_IRQ_MASK, 0);
    }

    #[test]
    fn stopping_mid_line_drops_the_colour_pin() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let mut vga = running(&pool, &display);
        vga.framebuffer().fill(BinaryColor::On);

        // Into the second frame, then halfway along a visible line.
        skip(&display, 2 * FRAME);
        run_until_color(&display, false);
        run_until_color(&display, true);
        skip(&display, 320);
        assert!(display.color_level());

        vga.stop_synchronisation().unwrap();
        assert!(!display.color_level());
        let mut samples = 0;
        display.advance(LINE, &mut |_: Sample| samples += 1);
        assert_eq!(samples, 0);
    }

    #[test]
    fn empty_transfer_leaves_the_colour_pin_low() {
        let display = SimDisplay::new();
        let fb: &'static FrameBuffer = framebuffer();
        fb.fill(BinaryColor::On);
        let mut backend = SimBackend::new(&display);
        let program = ScanoutProgram {
            frame_bytes: 0,
            ..ScanoutProgram::new(&VGA_640X480_60)
        };

        backend
            .start_timing(&SyncProgram::new(&VGA_640X480_60), TimingUnits { hsync: 0, vsync: 1 })
            .unwrap();
        backend.start_scanout(&program, 2, fb).unwrap();
        let mut high = 0;
        display.advance(2 * FRAME, &mut |s: Sample| {
            if s.color {
                high += 1;
            }
        });
        assert_eq!(high, 0);
    }

    #[test]
    fn default_wiring_streams_pixels_on_channel_11() {
        let display = SimDisplay::new();
        let wiring = SimBackend::new(&display).wiring();
        assert_eq!(wiring.data_dma, 11);
        assert_eq!(wiring.reload_dma, 10);
    }

    #[test]
    fn no_signal_no_frame() {
        let display = SimDisplay::new();
        assert!(Monitor::capture(&display, &VGA_640X480_60).is_none());
    }

    #[test]
    fn concurrent_writes_tear_rows_but_never_bytes() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let display = SimDisplay::new();
        let vga = running(&pool, &display);
        let fb = vga.framebuffer();

        let frames = std::thread::scope(|s| {
            let scanner = s.spawn(|| {
                (0..4)
                    .map(|_| Monitor::capture(&display, &VGA_640X480_60).unwrap())
                    .collect::<Vec<_>>()
            });
            let mut on = true;
            while !scanner.is_finished() {
                fb.fill(BinaryColor::from(on));
                on = !on;
            }
            scanner.join().unwrap()
        });

        for frame in frames {
            assert_eq!(frame.blanking_violations, 0);
            assert_eq!(frame.line_period, 800);
            assert_eq!(frame.frame_lines, 525);
            assert!(frame.image.iter().all(|&b| b == 0x00 || b == 0xff));
        }
    }
}
