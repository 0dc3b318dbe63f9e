//! Demo firmware: blinks the screen a few times, draws a test card, then
//! stops the output again.

#![no_std]
#![no_main]

use defmt::*;
use embassy_executor::Spawner;
use embassy_rp::bind_interrupts;
use embassy_rp::peripherals::PIO0;
use embassy_rp::pio::{InterruptHandler as PioInterruptHandler, Pio};
use embassy_time::Timer;
use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::mono_font::ascii::FONT_10X20;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{Circle, Line, PrimitiveStyle, Rectangle};
use embedded_graphics::text::{Alignment, Text};
use static_cell::ConstStaticCell;
use tiny_vga::rp::PioBackend;
use tiny_vga::{BinaryColor, ColorChannel, FrameBuffer, PoolLayout, ResourcePool, Vga, VideoMode};
use {defmt_rtt as _, panic_probe as _};

static FRAMEBUFFER: ConstStaticCell<FrameBuffer> =
    ConstStaticCell::new(FrameBuffer::new(ColorChannel::Red));
static POOL: ResourcePool = ResourcePool::new(PoolLayout::RP235XA);

bind_interrupts!(struct Irqs {
    PIO0_IRQ_0 => PioInterruptHandler<PIO0>;
});

fn draw_test_card(framebuffer: &FrameBuffer) {
    let mut canvas = framebuffer.canvas();
    let stroke = PrimitiveStyle::with_stroke(BinaryColor::On, 1);
    let bounds = canvas.bounding_box();

    let Ok(()) = canvas.clear(BinaryColor::Off);
    let Ok(()) = bounds.into_styled(stroke).draw(&mut canvas);
    let Ok(()) = Line::new(bounds.top_left, bounds.bottom_right().unwrap_or_default())
        .into_styled(stroke)
        .draw(&mut canvas);
    let Ok(()) = Circle::with_center(bounds.center(), 200)
        .into_styled(stroke)
        .draw(&mut canvas);
    let Ok(()) = Rectangle::with_center(bounds.center(), Size::new(300, 40))
        .into_styled(PrimitiveStyle::with_fill(BinaryColor::Off))
        .draw(&mut canvas);
    let Ok(_) = Text::with_alignment(
        "tiny-vga 640x480",
        bounds.center() + Point::new(0, 6),
        MonoTextStyle::new(&FONT_10X20, BinaryColor::On),
        Alignment::Center,
    )
    .draw(&mut canvas);
}

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    let p = embassy_rp::init(Default::default());

    let backend = PioBackend::new(
        Pio::new(p.PIO0, Irqs),
        p.PIN_4,
        p.PIN_5,
        p.PIN_0,
        // Pixels on 11, reloaded by 10.
        p.DMA_CH11,
        p.DMA_CH10,
    );
    let mut vga = unwrap!(Vga::new(
        VideoMode::Vga640x480At60,
        &POOL,
        backend,
        FRAMEBUFFER.take(),
    ));
    let framebuffer = unwrap!(vga.start_synchronisation());
    info!("vga running");

    for i in 0..4 {
        framebuffer.fill(BinaryColor::On);
        Timer::after_millis(500).await;
        info!("blink {}", i);
        framebuffer.fill(BinaryColor::Off);
        Timer::after_millis(500).await;
    }

    draw_test_card(framebuffer);
    Timer::after_secs(10).await;

    unwrap!(vga.stop_synchronisation());
    info!("vga stopped");
    loop {
        Timer::after_secs(1).await;
    }
}
