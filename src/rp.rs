//! PIO and DMA backend for RP2040 / RP235x.
//!
//! Three programs share one PIO block: horizontal sync, vertical sync and
//! colour. The colour state machine is fed by a pair of chained DMA channels.
//! The data channel copies one frame byte by byte into the TX FIFO, then
//! chains to the reload channel, which writes the frame address back into the
//! data channel's read pointer and chains to it again.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_rp::Peri;
use embassy_rp::dma::Channel;
use embassy_rp::gpio::Level;
use embassy_rp::pac::common::{RW, Reg};
use embassy_rp::pac::dma::regs::CtrlTrig;
use embassy_rp::pac::dma::vals::{DataSize, TreqSel};
use embassy_rp::peripherals::{PIO0, PIO1};
use embassy_rp::pio::{
    Common, Config as PioConfig, Direction, FifoJoin, Instance as PioInstance, LoadedProgram,
    Pin, Pio, PioPin, ShiftConfig, ShiftDirection, StateMachine,
};
use fixed::FixedU32;
use fixed::types::extra::U8;

use crate::backend::{Backend, Pins, TimingUnits, Wiring};
use crate::scanout::{AUTOPULL_BITS, color_program};
use crate::timing::{IRQ_MASK, SCANOUT_IRQ_MASK, hsync_program, vsync_program};
use crate::{Error, FrameBuffer, ResourceKind, ScanoutProgram, SyncProgram};

/// Frame start address per PIO block. The reload channel reads it from here.
static FRAME_ADDRESS: [AtomicU32; 2] = [AtomicU32::new(0), AtomicU32::new(0)];

/// A PIO block the driver can run in.
pub trait VgaPio: PioInstance {
    const BLOCK: u8;

    fn regs() -> embassy_rp::pac::pio::Pio;

    /// DREQ of the TX FIFO of state machine `sm`.
    fn tx_dreq(sm: u8) -> TreqSel {
        TreqSel::from_bits(Self::BLOCK * 8 + sm)
    }
}

impl VgaPio for PIO0 {
    const BLOCK: u8 = 0;

    fn regs() -> embassy_rp::pac::pio::Pio {
        embassy_rp::pac::PIO0
    }
}

impl VgaPio for PIO1 {
    const BLOCK: u8 = 1;

    fn regs() -> embassy_rp::pac::pio::Pio {
        embassy_rp::pac::PIO1
    }
}

/// Runs `$body` with `$sm` bound to the state machine numbered `$index`.
macro_rules! with_state_machine {
    ($backend:expr, $index:expr, |$sm:ident| $body:block) => {
        match $index {
            0 => {
                let $sm = &mut $backend.sm0;
                $body
            }
            1 => {
                let $sm = &mut $backend.sm1;
                $body
            }
            2 => {
                let $sm = &mut $backend.sm2;
                $body
            }
            _ => {
                let $sm = &mut $backend.sm3;
                $body
            }
        }
    };
}

/// Divider taking the system clock down to `clock_hz`, in 1/256 steps.
fn clock_divider(clock_hz: u32) -> FixedU32<U8> {
    let sys_hz = embassy_rp::clocks::clk_sys_freq();
    let bits = u64::from(sys_hz) * 256 / u64::from(clock_hz);
    if bits < 256 {
        warn!(
            "system clock {} Hz is below the {} Hz a program needs",
            sys_hz, clock_hz
        );
    }
    FixedU32::from_bits(bits.clamp(256, u64::from(u32::MAX)) as u32)
}

fn enable_state_machines<P: VgaPio>(mask: u8) {
    P::regs().ctrl().modify(|w| {
        w.set_sm_restart(mask);
        w.set_clkdiv_restart(mask);
        w.set_sm_enable(w.sm_enable() | mask);
    });
}

fn disable_state_machines<P: VgaPio>(mask: u8) {
    P::regs().ctrl().modify(|w| w.set_sm_enable(w.sm_enable() & !mask));
}

fn setup_data_channel<D: Channel>(
    data_channel: &Peri<'_, D>,
    reload_channel: u8,
    dreq: TreqSel,
    frame_bytes: u32,
    color_tx_register: &Reg<u32, RW>,
) {
    data_channel.regs().al1_ctrl().write(|c| {
        let mut t = CtrlTrig(*c);
        t.set_incr_read(true);
        t.set_incr_write(false);
        t.set_data_size(DataSize::SIZE_BYTE);
        t.set_treq_sel(dreq);
        t.set_irq_quiet(true);
        t.set_chain_to(reload_channel);
        t.set_en(true);
        *c = t.0;
    });
    data_channel
        .regs()
        .trans_count()
        .write(|c| c.0 = frame_bytes);
    data_channel
        .regs()
        .write_addr()
        .write(|c| *c = color_tx_register.as_ptr() as u32);
}

/// Writing the trigger alias at the end starts the ring: the reload channel
/// runs first and hands over to the data channel.
fn start_reload_channel<R: Channel>(
    reload_channel: &Peri<'_, R>,
    data_channel: u8,
    frame_address: &'static AtomicU32,
) {
    reload_channel.regs().al1_ctrl().write(|c| {
        let mut t = CtrlTrig(*c);
        t.set_incr_read(false);
        t.set_incr_write(false);
        t.set_data_size(DataSize::SIZE_WORD);
        t.set_treq_sel(TreqSel::PERMANENT);
        t.set_irq_quiet(true);
        t.set_chain_to(data_channel);
        t.set_en(true);
        *c = t.0;
    });
    reload_channel
        .regs()
        .read_addr()
        .write(|c| *c = frame_address.as_ptr() as u32);
    reload_channel.regs().trans_count().write(|c| c.0 = 1);
    reload_channel
        .regs()
        .al2_write_addr_trig()
        .write(|c| *c = embassy_rp::pac::DMA.ch(data_channel as usize).read_addr().as_ptr() as u32);
}

struct SyncSession<'d, P: PioInstance> {
    units: TimingUnits,
    hsync: LoadedProgram<'d, P>,
    vsync: LoadedProgram<'d, P>,
}

struct ScanoutSession<'d, P: PioInstance> {
    state_machine: u8,
    program: LoadedProgram<'d, P>,
}

/// Owns one PIO block, the three output pins and two DMA channels.
pub struct PioBackend<'d, P: VgaPio, D: Channel, R: Channel> {
    common: Common<'d, P>,
    sm0: StateMachine<'d, P, 0>,
    sm1: StateMachine<'d, P, 1>,
    sm2: StateMachine<'d, P, 2>,
    sm3: StateMachine<'d, P, 3>,
    hsync: Pin<'d, P>,
    vsync: Pin<'d, P>,
    color: Pin<'d, P>,
    data_channel: Peri<'d, D>,
    reload_channel: Peri<'d, R>,
    sync: Option<SyncSession<'d, P>>,
    scanout: Option<ScanoutSession<'d, P>>,
}

impl<'d, P: VgaPio, D: Channel, R: Channel> PioBackend<'d, P, D, R> {
    pub fn new(
        pio: Pio<'d, P>,
        hsync: Peri<'d, impl PioPin>,
        vsync: Peri<'d, impl PioPin>,
        color: Peri<'d, impl PioPin>,
        data_channel: Peri<'d, D>,
        reload_channel: Peri<'d, R>,
    ) -> Self {
        let Pio {
            mut common,
            sm0,
            sm1,
            sm2,
            sm3,
            ..
        } = pio;
        let (hsync, vsync, color) = (
            common.make_pio_pin(hsync),
            common.make_pio_pin(vsync),
            common.make_pio_pin(color),
        );
        PioBackend {
            common,
            sm0,
            sm1,
            sm2,
            sm3,
            hsync,
            vsync,
            color,
            data_channel,
            reload_channel,
            sync: None,
            scanout: None,
        }
    }

    fn load(
        common: &mut Common<'d, P>,
        program: &pio::Program<32>,
    ) -> Result<LoadedProgram<'d, P>, Error> {
        common
            .try_load_program(program)
            .map_err(|_| Error::ResourceExhausted(ResourceKind::InstructionMemory))
    }
}

impl<'d, P: VgaPio, D: Channel, R: Channel> Backend for PioBackend<'d, P, D, R> {
    fn wiring(&self) -> Wiring {
        Wiring {
            block: P::BLOCK,
            pins: Pins {
                hsync: self.hsync.pin(),
                vsync: self.vsync.pin(),
                color: self.color.pin(),
            },
            data_dma: self.data_channel.number(),
            reload_dma: self.reload_channel.number(),
        }
    }

    fn start_timing(&mut self, program: &SyncProgram, units: TimingUnits) -> Result<(), Error> {
        if self.sync.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let hsync = Self::load(&mut self.common, &hsync_program())?;
        let vsync = match Self::load(&mut self.common, &vsync_program()) {
            Ok(vsync) => vsync,
            Err(e) => {
                // SAFETY: nothing has been started from this program yet.
                unsafe { self.common.free_instr(hsync.used_memory) };
                return Err(e);
            }
        };

        let hsync_cfg = {
            let mut cfg = PioConfig::default();
            cfg.use_program(&hsync, &[]);
            cfg.set_set_pins(&[&self.hsync]);
            cfg.clock_divider = clock_divider(program.hsync_clock_hz);
            cfg
        };
        let vsync_cfg = {
            let mut cfg = PioConfig::default();
            cfg.use_program(&vsync, &[&self.vsync]);
            cfg.clock_divider = clock_divider(program.vsync_clock_hz);
            cfg
        };

        with_state_machine!(self, units.hsync, |sm| {
            sm.set_config(&hsync_cfg);
            sm.set_pins(Level::High, &[&self.hsync]);
            sm.set_pin_dirs(Direction::Out, &[&self.hsync]);
            sm.clear_fifos();
            sm.tx().push(program.hsync_preload);
        });
        with_state_machine!(self, units.vsync, |sm| {
            sm.set_config(&vsync_cfg);
            sm.set_pins(Level::High, &[&self.vsync]);
            sm.set_pin_dirs(Direction::Out, &[&self.vsync]);
            sm.clear_fifos();
            sm.tx().push(program.vsync_preload);
        });

        // Stale flags from an earlier session would release the vertical
        // program early.
        P::regs().irq().write(|w| w.set_irq(IRQ_MASK));
        enable_state_machines::<P>((1 << units.hsync) | (1 << units.vsync));
        trace!(
            "sync programs at {} and {}, dividers {} / {}",
            hsync.origin,
            vsync.origin,
            hsync_cfg.clock_divider.to_bits(),
            vsync_cfg.clock_divider.to_bits()
        );

        self.sync = Some(SyncSession {
            units,
            hsync,
            vsync,
        });
        Ok(())
    }

    fn stop_timing(&mut self) {
        let Some(session) = self.sync.take() else {
            return;
        };
        let units = session.units;
        disable_state_machines::<P>((1 << units.hsync) | (1 << units.vsync));

        with_state_machine!(self, units.hsync, |sm| {
            sm.set_pins(Level::High, &[&self.hsync]);
            sm.clear_fifos();
        });
        with_state_machine!(self, units.vsync, |sm| {
            sm.set_pins(Level::High, &[&self.vsync]);
            sm.clear_fifos();
        });

        // SAFETY: both state machines running these programs are disabled.
        unsafe {
            self.common.free_instr(session.hsync.used_memory);
            self.common.free_instr(session.vsync.used_memory);
        }
    }

    fn start_scanout(
        &mut self,
        program: &ScanoutProgram,
        state_machine: u8,
        framebuffer: &'static FrameBuffer,
    ) -> Result<(), Error> {
        if self.scanout.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let loaded = Self::load(&mut self.common, &color_program())?;

        let cfg = {
            let mut cfg = PioConfig::default();
            cfg.use_program(&loaded, &[&self.color]);
            cfg.set_out_pins(&[&self.color]);
            cfg.clock_divider = clock_divider(program.clock_hz);
            cfg.shift_out = ShiftConfig {
                threshold: AUTOPULL_BITS,
                direction: ShiftDirection::Left,
                auto_fill: true,
            };
            cfg.fifo_join = FifoJoin::TxOnly;
            cfg
        };

        with_state_machine!(self, state_machine, |sm| {
            sm.set_config(&cfg);
            sm.set_pins(Level::Low, &[&self.color]);
            sm.set_pin_dirs(Direction::Out, &[&self.color]);
            sm.clear_fifos();
            sm.tx().push(program.pixel_preload);
        });
        // The vertical program has been raising both since it started. A
        // stale frame flag would release the colour program mid-frame.
        P::regs().irq().write(|w| w.set_irq(SCANOUT_IRQ_MASK));
        enable_state_machines::<P>(1 << state_machine);

        let frame_address = &FRAME_ADDRESS[usize::from(P::BLOCK)];
        frame_address.store(framebuffer.as_ptr() as u32, Ordering::Release);
        setup_data_channel(
            &self.data_channel,
            self.reload_channel.number(),
            P::tx_dreq(state_machine),
            program.frame_bytes,
            &P::regs().txf(usize::from(state_machine)),
        );
        start_reload_channel(&self.reload_channel, self.data_channel.number(), frame_address);

        self.scanout = Some(ScanoutSession {
            state_machine,
            program: loaded,
        });
        Ok(())
    }

    fn stop_scanout(&mut self) {
        let Some(session) = self.scanout.take() else {
            return;
        };

        // Break the chain before aborting, or the channels restart each other.
        for channel in [self.data_channel.regs(), self.reload_channel.regs()] {
            channel.al1_ctrl().modify(|c| {
                let mut t = CtrlTrig(*c);
                t.set_en(false);
                *c = t.0;
            });
        }
        let mask = (1u16 << self.data_channel.number()) | (1u16 << self.reload_channel.number());
        embassy_rp::pac::DMA
            .chan_abort()
            .write(|w| w.set_chan_abort(mask));
        while self.data_channel.regs().ctrl_trig().read().busy()
            || self.reload_channel.regs().ctrl_trig().read().busy()
        {
            spin_loop();
        }

        disable_state_machines::<P>(1 << session.state_machine);
        with_state_machine!(self, session.state_machine, |sm| {
            sm.set_pins(Level::Low, &[&self.color]);
            sm.clear_fifos();
        });

        // SAFETY: the colour state machine is disabled.
        unsafe { self.common.free_instr(session.program.used_memory) };
    }
}
