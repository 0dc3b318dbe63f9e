//! Cycle-by-cycle interpreter for assembled PIO programs.
//!
//! Runs the instruction words of a [`pio::Program`] the way a state machine
//! does: delays, side-set on issue, stalls on `wait` / `pull` / autopull, and
//! IRQ flags shared with the other machines of the block. Each machine drives
//! a single pin, so `set`, `out`, `mov` and side-set all land on it. The OSR
//! shifts left, the only direction the driver configures, and starts out
//! empty as it does after `set_config`.

use pio::Program;

/// Words for `pull` and autopull: the TX FIFO plus whatever keeps it filled.
pub trait TxFifo {
    fn pull(&mut self) -> Option<u32>;
}

/// One word pushed by the CPU before the machine was enabled.
pub struct Preload(Option<u32>);

impl Preload {
    pub fn new(word: u32) -> Self {
        Preload(Some(word))
    }
}

impl TxFifo for Preload {
    fn pull(&mut self) -> Option<u32> {
        self.0.take()
    }
}

enum Flow {
    Stall,
    Next,
    Jump(u8),
}

pub struct StateMachine {
    code: [u16; 32],
    wrap_source: u8,
    wrap_target: u8,
    /// Side-set width including the enable bit.
    side_bits: u8,
    side_optional: bool,
    autopull: Option<u8>,
    pc: u8,
    x: u32,
    y: u32,
    osr: u32,
    /// Bits shifted out of the OSR since it was filled.
    osr_count: u8,
    delay: u8,
    /// Side-set and `irq` already fired for the instruction stalled at `pc`.
    issued: bool,
    pin: bool,
}

impl StateMachine {
    pub fn new(program: &Program<32>, pin: bool, autopull: Option<u8>) -> Self {
        let mut code = [0; 32];
        for (slot, word) in code.iter_mut().zip(program.code.iter()) {
            *slot = *word;
        }
        StateMachine {
            code,
            wrap_source: program.wrap.source,
            wrap_target: program.wrap.target,
            side_bits: program.side_set.bits(),
            side_optional: program.side_set.optional(),
            autopull,
            pc: 0,
            x: 0,
            y: 0,
            osr: 0,
            osr_count: 32,
            delay: 0,
            issued: false,
            pin,
        }
    }

    pub fn pin(&self) -> bool {
        self.pin
    }

    /// Runs one cycle of the machine's clock.
    pub fn step(&mut self, irq: &mut u8, fifo: &mut impl TxFifo) {
        if self.delay > 0 {
            self.delay -= 1;
            return;
        }
        let word = self.code[usize::from(self.pc & 0x1f)];
        let (side, delay) = self.delay_side(word);
        let first_cycle = !self.issued;
        if first_cycle {
            if let Some(level) = side {
                self.pin = level;
            }
            self.issued = true;
        }

        let flow = match word >> 13 {
            0b000 => self.jmp(word),
            0b001 => self.wait(word, irq),
            // No RX side: `in` and `push` only matter to the ISR.
            0b010 => Flow::Next,
            0b011 => self.out(word, fifo),
            0b100 => self.pull(word, fifo),
            0b101 => self.mov(word),
            0b110 => self.irq(word, irq, first_cycle),
            _ => self.set(word),
        };
        self.pc = match flow {
            Flow::Stall => return,
            Flow::Next if self.pc == self.wrap_source => self.wrap_target,
            Flow::Next => (self.pc + 1) & 0x1f,
            Flow::Jump(address) => address & 0x1f,
        };
        self.issued = false;
        self.delay = delay;
    }

    /// Splits bits 12..8 into the side-set level, if any, and the delay.
    fn delay_side(&self, word: u16) -> (Option<bool>, u8) {
        let field = ((word >> 8) & 0x1f) as u8;
        let delay_bits = 5 - self.side_bits;
        let delay = field & ((1 << delay_bits) - 1);
        if self.side_bits == 0 {
            return (None, delay);
        }
        let side = field >> delay_bits;
        let value_bits = self.side_bits - u8::from(self.side_optional);
        let enabled = !self.side_optional || side & (1 << value_bits) != 0;
        (enabled.then_some(side & 1 != 0), delay)
    }

    fn threshold(&self) -> u8 {
        self.autopull.unwrap_or(32)
    }

    fn fill(&mut self, word: u32) {
        self.osr = word;
        self.osr_count = 0;
    }

    fn jmp(&mut self, word: u16) -> Flow {
        let taken = match (word >> 5) & 0b111 {
            0b000 => true,
            0b001 => self.x == 0,
            0b010 => {
                let taken = self.x != 0;
                self.x = self.x.wrapping_sub(1);
                taken
            }
            0b011 => self.y == 0,
            0b100 => {
                let taken = self.y != 0;
                self.y = self.y.wrapping_sub(1);
                taken
            }
            0b101 => self.x != self.y,
            0b110 => self.pin,
            _ => self.osr_count < self.threshold(),
        };
        if taken {
            Flow::Jump((word & 0x1f) as u8)
        } else {
            Flow::Next
        }
    }

    fn wait(&mut self, word: u16, irq: &mut u8) -> Flow {
        let polarity = word & 0x80 != 0;
        let level = match (word >> 5) & 0b11 {
            0b10 => {
                let flag = 1u8 << (word & 0b111);
                let set = *irq & flag != 0;
                if polarity && set {
                    *irq &= !flag;
                    return Flow::Next;
                }
                set
            }
            // GPIO and pin waits: the only pin there is.
            _ => self.pin,
        };
        if level == polarity {
            Flow::Next
        } else {
            Flow::Stall
        }
    }

    fn out(&mut self, word: u16, fifo: &mut impl TxFifo) -> Flow {
        if let Some(threshold) = self.autopull {
            if self.osr_count >= threshold {
                match fifo.pull() {
                    Some(next) => self.fill(next),
                    None => return Flow::Stall,
                }
            }
        }
        let count = match u32::from(word & 0x1f) {
            0 => 32,
            n => n,
        };
        let data = if count == 32 {
            self.osr
        } else {
            self.osr >> (32 - count)
        };
        self.osr = self.osr.checked_shl(count).unwrap_or(0);
        self.osr_count = (u32::from(self.osr_count) + count).min(32) as u8;
        match (word >> 5) & 0b111 {
            0b000 => self.pin = data & 1 != 0,
            0b001 => self.x = data,
            0b010 => self.y = data,
            0b101 => return Flow::Jump(data as u8),
            // null, pindirs, isr, exec
            _ => {}
        }
        Flow::Next
    }

    fn pull(&mut self, word: u16, fifo: &mut impl TxFifo) -> Flow {
        if word & 0x80 == 0 {
            return Flow::Next;
        }
        let if_empty = word & 0x40 != 0;
        let block = word & 0x20 != 0;
        if if_empty && self.osr_count < self.threshold() {
            return Flow::Next;
        }
        match fifo.pull() {
            Some(next) => self.fill(next),
            None if block => return Flow::Stall,
            None => self.fill(self.x),
        }
        Flow::Next
    }

    fn mov(&mut self, word: u16) -> Flow {
        let value = match word & 0b111 {
            0b000 => u32::from(self.pin),
            0b001 => self.x,
            0b010 => self.y,
            0b111 => self.osr,
            // null, status, isr
            _ => 0,
        };
        let value = match (word >> 3) & 0b11 {
            0b01 => !value,
            0b10 => value.reverse_bits(),
            _ => value,
        };
        match (word >> 5) & 0b111 {
            0b000 => self.pin = value & 1 != 0,
            0b001 => self.x = value,
            0b010 => self.y = value,
            0b101 => return Flow::Jump(value as u8),
            0b111 => self.fill(value),
            _ => {}
        }
        Flow::Next
    }

    fn irq(&mut self, word: u16, irq: &mut u8, first_cycle: bool) -> Flow {
        let flag = 1u8 << (word & 0b111);
        if word & 0x40 != 0 {
            *irq &= !flag;
            return Flow::Next;
        }
        if first_cycle {
            *irq |= flag;
        }
        if word & 0x20 != 0 && *irq & flag != 0 {
            Flow::Stall
        } else {
            Flow::Next
        }
    }

    fn set(&mut self, word: u16) -> Flow {
        let data = u32::from(word & 0x1f);
        match (word >> 5) & 0b111 {
            0b000 => self.pin = data & 1 != 0,
            0b001 => self.x = data,
            0b010 => self.y = data,
            _ => {}
        }
        Flow::Next
    }
}
