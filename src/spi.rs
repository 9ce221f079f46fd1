//! The bit-banged three wire serial bus used to program the ADC chips.
//!
//! The bus lives entirely inside one 32-bit word of a fabric register: some bits are chip selects,
//! one is serial data and one is the serial clock. Every edge on the bus is a full register write,
//! so a single ADC register write costs fifty transport writes.

use crate::{
    hmcad1511::AdcRegister,
    transport::{
        self,
        with_transport,
        Transport,
    },
};
use packed_struct::PackingError;
use std::sync::{
    Mutex,
    Weak,
};
use thiserror::Error;
use tracing::{
    debug,
    trace,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error("Failed to pack an ADC register")]
    Packing(#[from] PackingError),
    #[error("There is no chip {chip}, this bus only has {available}")]
    NoSuchChip { chip: usize, available: usize },
    #[error("Got {addrs} addresses but {data} data words")]
    LengthMismatch { addrs: usize, data: usize },
}

/// Which logic level selects a chip
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Polarity {
    #[default]
    ActiveLow,
    ActiveHigh,
}

/// Where the bus lives and which bits of the word drive which line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiConfig {
    /// Name of the fabric register holding the bus
    pub register: String,
    /// 32-bit word within that register
    pub word_offset: usize,
    /// One bit per chip, lowest bit is chip 0
    pub chip_select: u32,
    pub sdata: u32,
    pub sclk: u32,
    pub polarity: Polarity,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            register: "adcleda_controller".to_string(),
            word_offset: 0,
            chip_select: 0x3c << 24,
            sdata: 0x40 << 24,
            sclk: 0x80 << 24,
            polarity: Polarity::ActiveLow,
        }
    }
}

impl SpiConfig {
    /// The layout of the ADC16 controller, with up to eight active-high chip selects
    #[must_use]
    pub fn adc16() -> Self {
        Self {
            register: "adc16_controller".to_string(),
            word_offset: 0,
            chip_select: 0xff,
            sdata: 0x100,
            sclk: 0x200,
            polarity: Polarity::ActiveHigh,
        }
    }

    /// Number of chips on the bus
    #[must_use]
    pub fn chips(&self) -> usize {
        self.chip_select.count_ones() as usize
    }

    /// The chip select bit of the `chip`-th chip
    fn chip_bit(&self, chip: usize) -> Option<u32> {
        (0..32)
            .map(|i| 1u32 << i)
            .filter(|bit| self.chip_select & bit != 0)
            .nth(chip)
    }
}

#[derive(Debug)]
pub struct Spi<T> {
    /// Upwards pointer to the parent's transport
    transport: Weak<Mutex<T>>,
    config: SpiConfig,
    /// Chip select bits of the chips we're talking to
    selected: u32,
}

impl<T> Spi<T>
where
    T: Transport,
{
    /// Attach to the bus and flush it with a write of zero to register zero, with every chip
    /// selected
    /// # Errors
    /// Returns an error on bad transport
    pub fn new(transport: Weak<Mutex<T>>, config: SpiConfig) -> Result<Self, Error> {
        let spi = Self {
            transport,
            selected: config.chip_select,
            config,
        };
        spi.write(0x00, 0x0000)?;
        Ok(spi)
    }

    #[must_use]
    pub fn config(&self) -> &SpiConfig {
        &self.config
    }

    /// Talk to a single chip, or to every chip with `None`
    /// # Errors
    /// Returns an error if the bus has no such chip
    pub fn select(&mut self, chip: Option<usize>) -> Result<(), Error> {
        self.selected = match chip {
            None => self.config.chip_select,
            Some(chip) => self.config.chip_bit(chip).ok_or(Error::NoSuchChip {
                chip,
                available: self.config.chips(),
            })?,
        };
        Ok(())
    }

    /// Indices of the currently selected chips
    #[must_use]
    pub fn selected_chips(&self) -> Vec<usize> {
        (0..self.config.chips())
            .filter(|&chip| {
                self.config
                    .chip_bit(chip)
                    .is_some_and(|bit| self.selected & bit != 0)
            })
            .collect()
    }

    /// Chip select bits with the selected chips asserted
    fn asserted(&self) -> u32 {
        match self.config.polarity {
            Polarity::ActiveHigh => self.selected,
            Polarity::ActiveLow => self.config.chip_select & !self.selected,
        }
    }

    /// Every chip deasserted with the clock high
    fn idle(&self) -> u32 {
        let deasserted = match self.config.polarity {
            Polarity::ActiveHigh => 0,
            Polarity::ActiveLow => self.config.chip_select,
        };
        deasserted | self.config.sclk
    }

    fn put(&self, transport: &mut T, bits: u32) -> Result<(), Error> {
        trace!(bits = format_args!("{bits:#010x}"), "bus state");
        transport.write(&self.config.register, self.config.word_offset * 4, &bits)?;
        Ok(())
    }

    fn clock_out(&self, transport: &mut T, bit: bool) -> Result<(), Error> {
        let out = self.asserted() | if bit { self.config.sdata } else { 0 };
        // Clock low, then high to latch
        self.put(transport, out)?;
        self.put(transport, out | self.config.sclk)
    }

    fn shift(&self, transport: &mut T, addr: u8, data: u16) -> Result<(), Error> {
        self.put(transport, self.idle())?;
        for i in (0..8).rev() {
            self.clock_out(transport, (addr >> i) & 1 == 1)?;
        }
        for i in (0..16).rev() {
            self.clock_out(transport, (data >> i) & 1 == 1)?;
        }
        self.put(transport, self.idle())
    }

    /// Write a raw word to the bus register
    /// # Errors
    /// Returns an error on bad transport
    pub fn write_state(&self, bits: u32) -> Result<(), Error> {
        with_transport(&self.transport, |t| self.put(t, bits))
    }

    /// Clock a single bit into the selected chips
    /// # Errors
    /// Returns an error on bad transport
    pub fn send_bit(&self, bit: bool) -> Result<(), Error> {
        with_transport(&self.transport, |t| self.clock_out(t, bit))
    }

    /// Write `data` to ADC register `addr` on every selected chip.
    /// The transfer is framed by an idle word on both ends, as the ADC16 `setreg` does.
    /// # Errors
    /// Returns an error on bad transport
    pub fn write(&self, addr: u8, data: u16) -> Result<(), Error> {
        debug!(
            addr = format_args!("{addr:#04x}"),
            data = format_args!("{data:#06x}"),
            chips = ?self.selected_chips(),
            "Writing ADC register"
        );
        with_transport(&self.transport, |t| self.shift(t, addr, data))
    }

    /// Write each `data[i]` to `addrs[i]`, in order
    /// # Errors
    /// Returns an error if the slices differ in length (before touching the bus) or on bad
    /// transport
    pub fn write_many(&self, addrs: &[u8], data: &[u16]) -> Result<(), Error> {
        if addrs.len() != data.len() {
            return Err(Error::LengthMismatch {
                addrs: addrs.len(),
                data: data.len(),
            });
        }
        for (addr, value) in addrs.iter().zip(data) {
            self.write(*addr, *value)?;
        }
        Ok(())
    }

    /// Write a typed register to every selected chip
    /// # Errors
    /// Returns an error on bad transport
    pub fn write_reg<R>(&self, reg: &R) -> Result<(), Error>
    where
        R: AdcRegister,
    {
        self.write(R::ADDRESS, reg.word()?)
    }
}
