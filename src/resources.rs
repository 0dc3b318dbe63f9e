//! Claim registry for the hardware a VGA output needs.
//!
//! Drivers never share pins, state machines, IRQ flags or DMA channels: every
//! one of them is claimed here first and held as a [`Claim`] until the output
//! is torn down. Dropping the claim gives the resource back, so an early `?`
//! return never leaves anything half-claimed.
//!
//! Code outside this crate that drives PIO or DMA itself (a PIO SPI for a
//! radio, say) should claim its resources here too, so the two never collide.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::{Error, ResourceKind};

/// Largest number of PIO blocks on any supported chip.
pub const MAX_BLOCKS: usize = 3;
/// State machines per PIO block.
pub const STATE_MACHINES_PER_BLOCK: u8 = 4;
/// IRQ flags per PIO block.
pub const IRQ_FLAGS_PER_BLOCK: u8 = 8;

/// What the chip has to hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolLayout {
    pub pins: u8,
    pub blocks: u8,
    pub dma_channels: u8,
}

impl PoolLayout {
    pub const RP2040: PoolLayout = PoolLayout {
        pins: 30,
        blocks: 2,
        dma_channels: 12,
    };

    pub const RP235XA: PoolLayout = PoolLayout {
        pins: 30,
        blocks: 3,
        dma_channels: 16,
    };

    pub const RP235XB: PoolLayout = PoolLayout {
        pins: 48,
        blocks: 3,
        dma_channels: 16,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Resource {
    Pin(u8),
    StateMachine { block: u8, index: u8 },
    IrqFlags { block: u8, mask: u8 },
    DmaChannel(u8),
}

#[derive(Clone, Copy, Default)]
struct Claims {
    pins: u64,
    state_machines: [u8; MAX_BLOCKS],
    irq_flags: [u8; MAX_BLOCKS],
    dma_channels: u32,
}

impl Claims {
    fn release(&mut self, resource: Resource) {
        match resource {
            Resource::Pin(pin) => self.pins &= !(1 << pin),
            Resource::StateMachine { block, index } => {
                self.state_machines[block as usize] &= !(1 << index)
            }
            Resource::IrqFlags { block, mask } => self.irq_flags[block as usize] &= !mask,
            Resource::DmaChannel(channel) => self.dma_channels &= !(1 << channel),
        }
    }
}

pub struct ResourcePool {
    layout: PoolLayout,
    claims: Mutex<CriticalSectionRawMutex, Cell<Claims>>,
}

impl ResourcePool {
    pub const fn new(layout: PoolLayout) -> Self {
        ResourcePool {
            layout,
            claims: Mutex::new(Cell::new(Claims {
                pins: 0,
                state_machines: [0; MAX_BLOCKS],
                irq_flags: [0; MAX_BLOCKS],
                dma_channels: 0,
            })),
        }
    }

    pub fn layout(&self) -> PoolLayout {
        self.layout
    }

    fn update<R>(&self, f: impl FnOnce(&mut Claims) -> R) -> R {
        self.claims.lock(|cell| {
            let mut claims = cell.get();
            let result = f(&mut claims);
            cell.set(claims);
            result
        })
    }

    fn claims(&self) -> Claims {
        self.claims.lock(|cell| cell.get())
    }

    fn check_block(&self, block: u8, kind: ResourceKind) -> Result<(), Error> {
        if block >= self.layout.blocks || block as usize >= MAX_BLOCKS {
            return Err(Error::ResourceExhausted(kind));
        }
        Ok(())
    }

    pub fn claim_pin(&self, pin: u8) -> Result<Claim<'_>, Error> {
        if pin >= self.layout.pins || pin >= 64 {
            return Err(Error::InvalidPin(pin));
        }
        self.update(|claims| {
            if claims.pins & (1 << pin) != 0 {
                return Err(Error::PinConflict(pin));
            }
            claims.pins |= 1 << pin;
            Ok(())
        })?;
        trace!("claimed GPIO{}", pin);
        Ok(Claim::new(self, Resource::Pin(pin)))
    }

    /// Claims the lowest free state machine of `block`.
    pub fn claim_state_machine(&self, block: u8) -> Result<Claim<'_>, Error> {
        self.check_block(block, ResourceKind::StateMachine)?;
        let index = self.update(|claims| {
            let used = &mut claims.state_machines[block as usize];
            let index = (0..STATE_MACHINES_PER_BLOCK)
                .find(|i| *used & (1 << i) == 0)
                .ok_or(Error::ResourceExhausted(ResourceKind::StateMachine))?;
            *used |= 1 << index;
            Ok(index)
        })?;
        trace!("claimed PIO{} SM{}", block, index);
        Ok(Claim::new(self, Resource::StateMachine { block, index }))
    }

    /// Claims a specific state machine, for code that hard-wires its SM.
    pub fn reserve_state_machine(&self, block: u8, index: u8) -> Result<Claim<'_>, Error> {
        self.check_block(block, ResourceKind::StateMachine)?;
        if index >= STATE_MACHINES_PER_BLOCK {
            return Err(Error::ResourceExhausted(ResourceKind::StateMachine));
        }
        self.update(|claims| {
            let used = &mut claims.state_machines[block as usize];
            if *used & (1 << index) != 0 {
                return Err(Error::ResourceExhausted(ResourceKind::StateMachine));
            }
            *used |= 1 << index;
            Ok(())
        })?;
        Ok(Claim::new(self, Resource::StateMachine { block, index }))
    }

    /// Claims every IRQ flag in `mask` of `block`, or none of them.
    pub fn claim_irq_flags(&self, block: u8, mask: u8) -> Result<Claim<'_>, Error> {
        self.check_block(block, ResourceKind::IrqFlag)?;
        self.update(|claims| {
            let used = &mut claims.irq_flags[block as usize];
            if *used & mask != 0 {
                return Err(Error::ResourceExhausted(ResourceKind::IrqFlag));
            }
            *used |= mask;
            Ok(())
        })?;
        Ok(Claim::new(self, Resource::IrqFlags { block, mask }))
    }

    pub fn claim_dma_channel(&self, channel: u8) -> Result<Claim<'_>, Error> {
        if channel >= self.layout.dma_channels || channel >= 32 {
            return Err(Error::ResourceExhausted(ResourceKind::DmaChannel));
        }
        self.update(|claims| {
            if claims.dma_channels & (1 << channel) != 0 {
                return Err(Error::ResourceExhausted(ResourceKind::DmaChannel));
            }
            claims.dma_channels |= 1 << channel;
            Ok(())
        })?;
        trace!("claimed DMA channel {}", channel);
        Ok(Claim::new(self, Resource::DmaChannel(channel)))
    }

    pub fn is_claimed(&self, resource: Resource) -> bool {
        let claims = self.claims();
        match resource {
            Resource::Pin(pin) => pin < 64 && claims.pins & (1 << pin) != 0,
            Resource::StateMachine { block, index } => claims
                .state_machines
                .get(block as usize)
                .is_some_and(|used| index < 8 && used & (1 << index) != 0),
            Resource::IrqFlags { block, mask } => claims
                .irq_flags
                .get(block as usize)
                .is_some_and(|used| used & mask == mask),
            Resource::DmaChannel(channel) => {
                channel < 32 && claims.dma_channels & (1 << channel) != 0
            }
        }
    }

    /// True when nothing at all is claimed.
    pub fn is_empty(&self) -> bool {
        let claims = self.claims();
        claims.pins == 0
            && claims.dma_channels == 0
            && claims.state_machines.iter().all(|&m| m == 0)
            && claims.irq_flags.iter().all(|&m| m == 0)
    }

    fn release(&self, resource: Resource) {
        self.update(|claims| claims.release(resource));
        trace!("released {}", resource);
    }
}

/// A claimed resource, given back to the pool on drop.
pub struct Claim<'p> {
    pool: &'p ResourcePool,
    resource: Resource,
}

impl<'p> Claim<'p> {
    fn new(pool: &'p ResourcePool, resource: Resource) -> Self {
        Claim { pool, resource }
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    /// Pin number, state machine index, first IRQ flag or DMA channel.
    pub fn index(&self) -> u8 {
        match self.resource {
            Resource::Pin(pin) => pin,
            Resource::StateMachine { index, .. } => index,
            Resource::IrqFlags { mask, .. } => mask.trailing_zeros() as u8,
            Resource::DmaChannel(channel) => channel,
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.pool.release(self.resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_are_exclusive_until_released() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let claim = pool.claim_pin(4).unwrap();
        assert_eq!(claim.index(), 4);
        assert!(matches!(pool.claim_pin(4), Err(Error::PinConflict(4))));
        assert!(pool.is_claimed(Resource::Pin(4)));
        drop(claim);
        assert!(!pool.is_claimed(Resource::Pin(4)));
        assert!(pool.claim_pin(4).is_ok());
    }

    #[test]
    fn pins_outside_the_chip_are_rejected() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        assert!(matches!(pool.claim_pin(30), Err(Error::InvalidPin(30))));
        let pool = ResourcePool::new(PoolLayout::RP235XB);
        assert!(pool.claim_pin(47).is_ok());
        assert!(matches!(pool.claim_pin(48), Err(Error::InvalidPin(48))));
    }

    #[test]
    fn state_machines_run_out_per_block() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let foreign = pool.reserve_state_machine(0, 0).unwrap();
        let claims: [_; 3] = core::array::from_fn(|_| pool.claim_state_machine(0).unwrap());
        let indices: Vec<u8> = claims.iter().map(|c| c.index()).collect();
        assert_eq!(indices, [1, 2, 3]);
        assert!(matches!(
            pool.claim_state_machine(0),
            Err(Error::ResourceExhausted(ResourceKind::StateMachine))
        ));
        // The other block is untouched.
        assert_eq!(pool.claim_state_machine(1).unwrap().index(), 0);
        drop(foreign);
        assert_eq!(pool.claim_state_machine(0).unwrap().index(), 0);
    }

    #[test]
    fn blocks_missing_from_the_chip_have_nothing_to_give() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        assert!(matches!(
            pool.claim_state_machine(2),
            Err(Error::ResourceExhausted(ResourceKind::StateMachine))
        ));
        let pool = ResourcePool::new(PoolLayout::RP235XA);
        assert!(pool.claim_state_machine(2).is_ok());
    }

    #[test]
    fn irq_flags_are_claimed_all_or_nothing() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let low = pool.claim_irq_flags(0, 0b0000_0111).unwrap();
        assert_eq!(low.index(), 0);
        assert!(pool.claim_irq_flags(0, 0b0000_1100).is_err());
        // The failed attempt must not have claimed flag 3.
        assert!(!pool.is_claimed(Resource::IrqFlags { block: 0, mask: 0b1000 }));
        assert!(pool.claim_irq_flags(0, 0b0000_1000).is_ok());
        assert!(pool.claim_irq_flags(1, 0b0000_0111).is_ok());
    }

    #[test]
    fn dma_channels_are_exclusive() {
        let pool = ResourcePool::new(PoolLayout::RP2040);
        let a = pool.claim_dma_channel(10).unwrap();
        assert!(pool.claim_dma_channel(10).is_err());
        assert!(pool.claim_dma_channel(12).is_err());
        drop(a);
        assert!(pool.is_empty());
    }
}
