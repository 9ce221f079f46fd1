//! Register words for the HMCAD1511 ADC.
//! Only the registers the LEDA test sequence and the ADC16 calibration touch are modelled; anything
//! else can still be poked raw through [`crate::adc::Adc::setreg`].

use adcleda_derive::address;
use packed_struct::prelude::*;
use std::{
    fmt,
    str::FromStr,
};
use thiserror::Error;

/// Types that carry the 8-bit serial address of the ADC register they describe
pub trait Address {
    const ADDRESS: u8;
}

/// A 16-bit ADC register with a known address, ready to be shifted out over the serial bus
pub trait AdcRegister: Address + PackedStruct<ByteArray = [u8; 2]> {
    /// The 16-bit value as it goes over the wire
    /// # Errors
    /// Returns an error if a field doesn't fit its bits
    fn word(&self) -> Result<u16, PackingError> {
        Ok(u16::from_be_bytes(self.pack()?))
    }
}

impl<R> AdcRegister for R where R: Address + PackedStruct<ByteArray = [u8; 2]> {}

#[address(0x00)]
#[derive(Debug, PackedStruct, Default, Copy, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
pub struct Reset {
    #[packed_field(bits = "0")]
    /// Self-clearing software reset
    pub reset: bool,
}

#[address(0x0F)]
#[derive(Debug, PackedStruct, Default, Copy, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
pub struct SleepPd {
    #[packed_field(bits = "8")]
    /// Go to sleep mode
    pub sleep: bool,
    #[packed_field(bits = "9")]
    /// Go to power down
    pub pd: bool,
}

#[address(0x25)]
#[derive(Debug, PackedStruct, Default, Copy, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
/// Ramp and custom test patterns
pub struct PatternCtl {
    #[packed_field(bits = "4..=6", ty = "enum")]
    pub pattern: TestPattern,
}

#[derive(Debug, PrimitiveEnum, Default, Copy, Clone, PartialEq, Eq)]
/// Output pattern type of register 0x25
pub enum TestPattern {
    #[default]
    Disabled = 0,
    Ramp = 0b100,
    DualCustom = 0b010,
    SingleCustom = 0b001,
}

#[address(0x26)]
#[derive(Debug, PackedStruct, Default, Copy, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
/// Bits for custom pattern 1
pub struct CustomPattern1 {
    #[packed_field(bits = "8..=15")]
    pub bits_custom1: Integer<u8, packed_bits::Bits<8>>,
}

#[address(0x27)]
#[derive(Debug, PackedStruct, Default, Copy, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
/// Bits for custom pattern 2
pub struct CustomPattern2 {
    #[packed_field(bits = "8..=15")]
    pub bits_custom2: Integer<u8, packed_bits::Bits<8>>,
}

#[address(0x2A)]
#[derive(Debug, PackedStruct, Default, Copy, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
/// Programmable coarse gain in quad channel setup
pub struct QuadCoarseGains {
    #[packed_field(bits = "0..=3", ty = "enum")]
    pub cgain4_ch1: CoarseGain,
    #[packed_field(bits = "4..=7", ty = "enum")]
    pub cgain4_ch2: CoarseGain,
    #[packed_field(bits = "8..=11", ty = "enum")]
    pub cgain4_ch3: CoarseGain,
    #[packed_field(bits = "12..=15", ty = "enum")]
    pub cgain4_ch4: CoarseGain,
}

impl QuadCoarseGains {
    /// Every channel at the same gain
    #[must_use]
    pub fn uniform(gain: CoarseGain) -> Self {
        Self {
            cgain4_ch1: gain,
            cgain4_ch2: gain,
            cgain4_ch3: gain,
            cgain4_ch4: gain,
        }
    }
}

#[derive(Debug, PrimitiveEnum, Default, Copy, Clone, PartialEq, Eq)]
/// Digital coarse gain, as a multiplication factor
pub enum CoarseGain {
    #[default]
    X1 = 0,
    X1_25 = 1,
    X2 = 2,
    X2_5 = 3,
    X4 = 4,
    X5 = 5,
    X8 = 6,
    X10 = 7,
    X12_5 = 8,
    X16 = 9,
    X20 = 10,
    X25 = 11,
    X32 = 12,
    X50 = 13,
}

impl CoarseGain {
    const NAMES: [(&'static str, CoarseGain); 14] = [
        ("1", CoarseGain::X1),
        ("1.25", CoarseGain::X1_25),
        ("2", CoarseGain::X2),
        ("2.5", CoarseGain::X2_5),
        ("4", CoarseGain::X4),
        ("5", CoarseGain::X5),
        ("8", CoarseGain::X8),
        ("10", CoarseGain::X10),
        ("12.5", CoarseGain::X12_5),
        ("16", CoarseGain::X16),
        ("20", CoarseGain::X20),
        ("25", CoarseGain::X25),
        ("32", CoarseGain::X32),
        ("50", CoarseGain::X50),
    ];
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("`{0}` is not one of 1, 1.25, 2, 2.5, 4, 5, 8, 10, 12.5, 16, 20, 25, 32 or 50")]
pub struct BadGain(String);

impl FromStr for CoarseGain {
    type Err = BadGain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches(['x', 'X']);
        Self::NAMES
            .iter()
            .find(|(name, _)| *name == trimmed)
            .map(|(_, gain)| *gain)
            .ok_or_else(|| BadGain(s.to_string()))
    }
}

impl fmt::Display for CoarseGain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = Self::NAMES
            .iter()
            .find(|(_, gain)| gain == self)
            .map_or("?", |(name, _)| name);
        write!(f, "{name}x")
    }
}

#[address(0x42)]
#[derive(Debug, PackedStruct, Default, Copy, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
/// Phase of the LVDS bit clock relative to the frame clock
pub struct PhaseDdr {
    #[packed_field(bits = "5..=6", ty = "enum")]
    pub phase_ddr: LclkPhase,
}

#[derive(Debug, PrimitiveEnum, Default, Copy, Clone, PartialEq, Eq)]
pub enum LclkPhase {
    _270 = 0,
    _180 = 1,
    #[default]
    _90 = 2,
    _0 = 3,
}

#[address(0x45)]
#[derive(Debug, PackedStruct, Default, Copy, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
/// Deskew (10101010) and sync (11110000) training patterns
pub struct FramePatternCtl {
    #[packed_field(bits = "0..=1", ty = "enum")]
    pub pattern: FramePattern,
}

#[derive(Debug, PrimitiveEnum, Default, Copy, Clone, PartialEq, Eq)]
pub enum FramePattern {
    #[default]
    Disabled = 0,
    Deskew = 1,
    Sync = 2,
}

#[address(0x46)]
#[derive(Debug, PackedStruct, Default, Copy, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
/// Output binary format and bit order
pub struct DataFormat {
    #[packed_field(bits = "2")]
    /// Invert the MSB, giving two's complement instead of offset binary
    pub btc_mode: bool,
    #[packed_field(bits = "3")]
    /// Shift out the MSB first
    pub msb_first: bool,
}

/// The data source of the ADC outputs
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Sampled analog data
    #[default]
    None,
    /// 0 to 255 ramp
    Ramp,
    /// 10101010
    Deskew,
    /// 11110000
    Sync,
    /// Custom pattern 1
    Custom,
    /// Alternating custom patterns 1 and 2
    Dual,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown pattern `{0}`, expected none, ramp, deskew, sync, custom or dual")]
pub struct BadPattern(String);

impl FromStr for Pattern {
    type Err = BadPattern;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "none" | "data" => Self::None,
            "ramp" => Self::Ramp,
            "deskew" | "eye" => Self::Deskew,
            "sync" | "frame" => Self::Sync,
            "custom" => Self::Custom,
            "dual" => Self::Dual,
            _ => return Err(BadPattern(s.to_string())),
        })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Ramp => "ramp",
            Self::Deskew => "deskew",
            Self::Sync => "sync",
            Self::Custom => "custom",
            Self::Dual => "dual",
        })
    }
}
