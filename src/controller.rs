//! The fabric side of the ADC interface: SERDES reset, bitslip, polarity flip and the IDELAY taps.
//!
//! These all live in the second word of the controller register, beside the serial bus in the
//! first.

use crate::transport::{
    self,
    with_transport,
    Deserialize,
    Serialize,
    Transport,
};
use adcleda_derive::WordSerde;
use packed_struct::prelude::*;
use std::{
    sync::{
        Mutex,
        Weak,
    },
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

/// Largest delay tap the IDELAYs accept
pub const MAX_TAP: u8 = 31;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error("There is no chip {chip}, the controller only has {available}")]
    NoSuchChip { chip: usize, available: usize },
    #[error("Delay tap {0} is out of range (0..=31)")]
    BadTap(u8),
}

#[derive(Debug, PackedStruct, WordSerde, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
#[allow(clippy::struct_excessive_bools)]
pub struct ControlWord {
    #[packed_field(bits = "0")]
    flip_lo: bool,
    #[packed_field(bits = "1")]
    spare1: bool,
    #[packed_field(bits = "2")]
    /// Holds the SERDES blocks in reset while set
    pub serdes_reset: bool,
    #[packed_field(bits = "3")]
    spare3: bool,
    #[packed_field(bits = "4..=6")]
    flip_hi: Integer<u8, packed_bits::Bits<3>>,
    #[packed_field(bits = "7..=10")]
    /// One bit per chip, a rising edge slips every lane of that chip by one bit
    pub bitslip: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "11..=15")]
    pub delay_tap: Integer<u8, packed_bits::Bits<5>>,
    #[packed_field(bits = "16..=31", endian = "msb")]
    /// One bit per lane, loads `delay_tap` into that lane's IDELAY
    pub strobe: Integer<u16, packed_bits::Bits<16>>,
}

impl ControlWord {
    /// Invert the channel polarity bits (mask 0x71)
    pub fn toggle_polarity(&mut self) {
        self.flip_lo = !self.flip_lo;
        self.flip_hi = (u8::from(self.flip_hi) ^ 0b111).into();
    }

    fn tap(tap: u8, strobe: u16) -> Self {
        Self {
            delay_tap: tap.into(),
            strobe: strobe.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub register: String,
    /// 32-bit word within the register
    pub word_offset: usize,
    /// How long to hold resets and strobes
    pub settle: Duration,
    pub chips: usize,
    pub lanes_per_chip: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            register: "adcleda_controller".to_string(),
            word_offset: 1,
            settle: Duration::from_secs(1),
            chips: 4,
            lanes_per_chip: 4,
        }
    }
}

impl ControllerConfig {
    #[must_use]
    pub fn lanes(&self) -> usize {
        self.chips * self.lanes_per_chip
    }

    /// Strobe mask covering every lane of `chip`
    #[must_use]
    pub fn chip_lanes(&self, chip: usize) -> u16 {
        let lanes = (1u32 << self.lanes_per_chip) - 1;
        ((lanes << (chip * self.lanes_per_chip)) & 0xffff) as u16
    }

    /// Strobe mask covering every lane
    #[must_use]
    pub fn all_lanes(&self) -> u16 {
        (0..self.chips).fold(0, |mask, chip| mask | self.chip_lanes(chip))
    }
}

#[derive(Debug)]
pub struct Controller<T> {
    /// Upwards pointer to the parent's transport
    transport: Weak<Mutex<T>>,
    config: ControllerConfig,
    /// The tap last swept to by [`Controller::inc_tap`]
    tap: u8,
}

impl<T> Controller<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(transport: Weak<Mutex<T>>, config: ControllerConfig) -> Self {
        Self {
            transport,
            config,
            tap: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn offset(&self) -> usize {
        self.config.word_offset * 4
    }

    /// Read the control word
    /// # Errors
    /// Returns an error on bad transport
    pub fn read(&self) -> Result<ControlWord, Error> {
        with_transport(&self.transport, |t| {
            Ok(t.read(&self.config.register, self.offset())?)
        })
    }

    /// Write the control word
    /// # Errors
    /// Returns an error on bad transport
    pub fn write(&self, word: &ControlWord) -> Result<(), Error> {
        with_transport(&self.transport, |t| {
            Ok(t.write(&self.config.register, self.offset(), word)?)
        })
    }

    fn settle(&self) {
        if !self.config.settle.is_zero() {
            std::thread::sleep(self.config.settle);
        }
    }

    /// Pulse the SERDES reset, holding it for the settle time
    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_serdes(&self) -> Result<(), Error> {
        debug!("Resetting SERDES");
        let mut word = self.read()?;
        word.serdes_reset = false;
        self.write(&word)?;
        word.serdes_reset = true;
        self.write(&word)?;
        self.settle();
        word.serdes_reset = false;
        self.write(&word)
    }

    /// Slip every lane of each of `chips` by one bit
    /// # Errors
    /// Returns an error on bad transport or if a chip doesn't exist
    pub fn bitslip(&self, chips: &[usize]) -> Result<(), Error> {
        let mut mask = 0u8;
        for &chip in chips {
            if chip >= self.config.chips {
                return Err(Error::NoSuchChip {
                    chip,
                    available: self.config.chips,
                });
            }
            mask |= 1 << chip;
        }
        debug!(?chips, "Bitslipping");
        let mut word = self.read()?;
        word.bitslip = 0.into();
        self.write(&word)?;
        word.bitslip = mask.into();
        self.write(&word)?;
        self.settle();
        word.bitslip = 0.into();
        self.write(&word)
    }

    /// Invert the polarity of the flippable channels
    /// # Errors
    /// Returns an error on bad transport
    pub fn flip_polarity(&self) -> Result<(), Error> {
        let mut word = self.read()?;
        word.toggle_polarity();
        debug!(word = ?word, "Flipping channel polarity");
        self.write(&word)
    }

    /// Load `tap` into the IDELAY of every lane in the `lanes` mask
    /// # Errors
    /// Returns an error on bad transport or if the tap is out of range
    pub fn set_taps(&self, tap: u8, lanes: u16) -> Result<(), Error> {
        if tap > MAX_TAP {
            return Err(Error::BadTap(tap));
        }
        self.write(&ControlWord::tap(tap, 0))?;
        self.write(&ControlWord::tap(tap, lanes))?;
        self.write(&ControlWord::tap(tap, 0))
    }

    /// Step every lane to the next tap, wrapping after 31, holding each write for the settle
    /// time. Returns the new tap.
    /// # Errors
    /// Returns an error on bad transport
    pub fn inc_tap(&mut self) -> Result<u8, Error> {
        self.tap = (self.tap + 1) & MAX_TAP;
        debug!(tap = self.tap, "Incrementing delay tap");
        let all = self.config.all_lanes();
        self.write(&ControlWord::tap(self.tap, 0))?;
        self.settle();
        self.write(&ControlWord::tap(self.tap, all))?;
        self.settle();
        self.write(&ControlWord::tap(self.tap, 0))?;
        Ok(self.tap)
    }

    #[must_use]
    pub fn tap(&self) -> u8 {
        self.tap
    }

    /// Pick up the tap the hardware was last left at, so [`Controller::inc_tap`] continues from
    /// there
    /// # Errors
    /// Returns an error on bad transport
    pub fn load_tap(&mut self) -> Result<u8, Error> {
        self.tap = self.read()?.delay_tap.into();
        Ok(self.tap)
    }
}
