//! Operations on the HMCAD1511 chips, carried over the bit-banged bus.
//! Every operation applies to the chips currently selected on the bus.

use crate::{
    hmcad1511::{
        Address,
        CoarseGain,
        CustomPattern1,
        CustomPattern2,
        DataFormat,
        FramePattern,
        FramePatternCtl,
        LclkPhase,
        Pattern,
        PatternCtl,
        PhaseDdr,
        QuadCoarseGains,
        Reset,
        SleepPd,
        TestPattern,
    },
    spi::{
        Error,
        Spi,
    },
    transport::Transport,
};
use std::collections::BTreeMap;
use tracing::{
    info,
    warn,
};

/// Highest register address `init` will touch
pub const MAX_INIT_ADDR: u8 = 0x56;
/// LVDS common mode drive strength, maxed out unless asked otherwise
const VCOM_DRIVE: (u8, u16) = (0x50, 0x30);

/// Registers to program during [`Adc::init`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitOptions {
    /// Raw address/value pairs, written in address order
    pub registers: BTreeMap<u8, u16>,
    /// Put the LVDS bit clock at 0 degrees
    pub phase_ddr: bool,
}

impl InitOptions {
    /// The writes `init` will make, after applying the defaults and dropping out of range
    /// addresses
    #[must_use]
    pub fn writes(&self) -> Vec<(u8, u16)> {
        let mut regs = self.registers.clone();
        if self.phase_ddr {
            regs.insert(PhaseDdr::ADDRESS, 0x60);
        }
        regs.entry(VCOM_DRIVE.0).or_insert(VCOM_DRIVE.1);
        regs.into_iter()
            .filter(|(addr, _)| {
                let ok = *addr <= MAX_INIT_ADDR;
                if !ok {
                    warn!(addr = format_args!("{addr:#04x}"), "Skipping out of range register");
                }
                ok
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct Adc<T> {
    spi: Spi<T>,
}

impl<T> Adc<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(spi: Spi<T>) -> Self {
        Self { spi }
    }

    #[must_use]
    pub fn spi(&self) -> &Spi<T> {
        &self.spi
    }

    /// Talk to a single chip, or to every chip with `None`
    /// # Errors
    /// Returns an error if there is no such chip
    pub fn select(&mut self, chip: Option<usize>) -> Result<(), Error> {
        self.spi.select(chip)
    }

    /// Software reset
    /// # Errors
    /// Returns an error on bad transport
    pub fn reset(&self) -> Result<(), Error> {
        self.spi.write_reg(&Reset { reset: true })
    }

    /// Power down every selected chip, then bring them back up one at a time
    /// # Errors
    /// Returns an error on bad transport
    pub fn power_cycle(&mut self) -> Result<(), Error> {
        self.spi.write_reg(&SleepPd {
            pd: true,
            ..Default::default()
        })?;
        let chips = self.spi.selected_chips();
        // The selection is restored even if a power up fails
        let powered = chips.iter().try_for_each(|&chip| {
            self.spi.select(Some(chip))?;
            self.spi.write_reg(&SleepPd::default())
        });
        self.restore(&chips)?;
        powered
    }

    fn restore(&mut self, chips: &[usize]) -> Result<(), Error> {
        // Only single chips or everything can be selected
        match chips {
            [chip] => self.spi.select(Some(*chip)),
            _ => self.spi.select(None),
        }
    }

    /// Reset then power cycle, the start-up sequence for a freshly programmed board
    /// # Errors
    /// Returns an error on bad transport
    pub fn start(&mut self) -> Result<(), Error> {
        info!("Resetting ADC");
        self.reset()?;
        info!("Power cycling ADC");
        self.power_cycle()?;
        info!("ADC started");
        Ok(())
    }

    /// Latch configuration changes that need a power cycle
    /// # Errors
    /// Returns an error on bad transport
    pub fn commit(&mut self) -> Result<(), Error> {
        self.power_cycle()
    }

    /// Reset, program the requested registers then power cycle
    /// # Errors
    /// Returns an error on bad transport
    pub fn init(&mut self, opts: &InitOptions) -> Result<(), Error> {
        self.reset()?;
        for (addr, value) in opts.writes() {
            info!(
                addr = format_args!("{addr:#04x}"),
                value = format_args!("{value:#06x}"),
                "Setting ADC register"
            );
            self.spi.write(addr, value)?;
        }
        self.power_cycle()
    }

    /// Write a raw value to an ADC register
    /// # Errors
    /// Returns an error on bad transport
    pub fn setreg(&self, addr: u8, value: u16) -> Result<(), Error> {
        self.spi.write(addr, value)
    }

    /// Switch the outputs to `pattern`, clearing any pattern already in place
    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_pattern(&self, pattern: Pattern) -> Result<(), Error> {
        self.spi.write_reg(&FramePatternCtl::default())?;
        self.spi.write_reg(&PatternCtl::default())?;
        match pattern {
            Pattern::None => Ok(()),
            Pattern::Ramp => self.spi.write_reg(&PatternCtl {
                pattern: TestPattern::Ramp,
            }),
            Pattern::Custom => self.spi.write_reg(&PatternCtl {
                pattern: TestPattern::SingleCustom,
            }),
            Pattern::Dual => self.spi.write_reg(&PatternCtl {
                pattern: TestPattern::DualCustom,
            }),
            Pattern::Deskew => self.spi.write_reg(&FramePatternCtl {
                pattern: FramePattern::Deskew,
            }),
            Pattern::Sync => self.spi.write_reg(&FramePatternCtl {
                pattern: FramePattern::Sync,
            }),
        }
    }

    /// Back to sampled data
    /// # Errors
    /// Returns an error on bad transport
    pub fn clear_pattern(&self) -> Result<(), Error> {
        self.enable_pattern(Pattern::None)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn ramp_pattern(&self) -> Result<(), Error> {
        self.enable_pattern(Pattern::Ramp)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn deskew_pattern(&self) -> Result<(), Error> {
        self.enable_pattern(Pattern::Deskew)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn sync_pattern(&self) -> Result<(), Error> {
        self.enable_pattern(Pattern::Sync)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn custom_pattern(&self) -> Result<(), Error> {
        self.enable_pattern(Pattern::Custom)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn dual_pattern(&self) -> Result<(), Error> {
        self.enable_pattern(Pattern::Dual)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_custom1(&self, bits: u8) -> Result<(), Error> {
        self.spi.write_reg(&CustomPattern1 {
            bits_custom1: bits.into(),
        })
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_custom2(&self, bits: u8) -> Result<(), Error> {
        self.spi.write_reg(&CustomPattern2 {
            bits_custom2: bits.into(),
        })
    }

    /// Output two's complement instead of offset binary with `invert_msb`, MSB first with
    /// `msb_first`
    /// # Errors
    /// Returns an error on bad transport
    pub fn data_format(&self, invert_msb: bool, msb_first: bool) -> Result<(), Error> {
        self.spi.write_reg(&DataFormat {
            btc_mode: invert_msb,
            msb_first,
        })
    }

    /// Set every channel to the same coarse gain
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_coarse_gain(&self, gain: CoarseGain) -> Result<(), Error> {
        info!(%gain, "Setting digital gain");
        self.spi.write_reg(&QuadCoarseGains::uniform(gain))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_phase_ddr(&self, phase: LclkPhase) -> Result<(), Error> {
        self.spi.write_reg(&PhaseDdr { phase_ddr: phase })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        spi::{
            tests::leda_mock,
            SpiConfig,
        },
        transport::mock::Mock,
    };
    use std::sync::{
        Arc,
        Mutex,
    };

    /// Decode the bus traffic back into (chips selected, address, data) per register write
    fn decode(transport: &Arc<Mutex<Mock>>) -> Vec<(u32, u8, u16)> {
        let words = transport
            .lock()
            .unwrap()
            .words_written("adcleda_controller", 0);
        words
            .chunks(50)
            .map(|write| {
                let mut bits = 0u32;
                for pair in write[1..49].chunks(2) {
                    bits = (bits << 1) | u32::from(pair[1] & 0x40 << 24 != 0);
                }
                // Selected chips have their select line low
                let selected = !write[1] & 0x3c << 24;
                (selected >> 26, (bits >> 16) as u8, (bits & 0xffff) as u16)
            })
            .collect()
    }

    fn setup() -> (Arc<Mutex<Mock>>, Adc<Mock>) {
        let transport = leda_mock();
        let spi = Spi::new(Arc::downgrade(&transport), SpiConfig::default()).unwrap();
        transport.lock().unwrap().clear_history();
        (transport, Adc::new(spi))
    }

    #[test]
    fn test_start() {
        let (transport, mut adc) = setup();
        adc.start().unwrap();
        assert_eq!(
            decode(&transport),
            vec![
                (0b1111, 0x00, 0x0001),
                (0b1111, 0x0f, 0x0200),
                (0b0001, 0x0f, 0x0000),
                (0b0010, 0x0f, 0x0000),
                (0b0100, 0x0f, 0x0000),
                (0b1000, 0x0f, 0x0000),
            ]
        );
        // Back to everything selected
        assert_eq!(adc.spi().selected_chips(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_power_cycle_one_chip() {
        let (transport, mut adc) = setup();
        adc.select(Some(2)).unwrap();
        adc.commit().unwrap();
        assert_eq!(
            decode(&transport),
            vec![(0b0100, 0x0f, 0x0200), (0b0100, 0x0f, 0x0000)]
        );
        assert_eq!(adc.spi().selected_chips(), vec![2]);
    }

    #[test]
    fn test_patterns() {
        let (transport, adc) = setup();
        adc.ramp_pattern().unwrap();
        adc.deskew_pattern().unwrap();
        adc.sync_pattern().unwrap();
        adc.custom_pattern().unwrap();
        adc.dual_pattern().unwrap();
        adc.clear_pattern().unwrap();
        let writes: Vec<(u8, u16)> = decode(&transport)
            .into_iter()
            .map(|(_, a, d)| (a, d))
            .collect();
        let clear: [(u8, u16); 2] = [(0x45, 0x0000), (0x25, 0x0000)];
        let mut expected: Vec<(u8, u16)> = vec![];
        for set in [
            Some((0x25u8, 0x0040u16)),
            Some((0x45, 0x0001)),
            Some((0x45, 0x0002)),
            Some((0x25, 0x0010)),
            Some((0x25, 0x0020)),
            None,
        ] {
            expected.extend(clear);
            expected.extend(set);
        }
        assert_eq!(writes, expected);
    }

    #[test]
    fn test_registers() {
        let (transport, adc) = setup();
        adc.set_custom1(0xa5).unwrap();
        adc.set_custom2(0x0f).unwrap();
        adc.data_format(true, false).unwrap();
        adc.set_coarse_gain(CoarseGain::X4).unwrap();
        adc.setreg(0x31, 0x0001).unwrap();
        let writes: Vec<(u8, u16)> = decode(&transport)
            .into_iter()
            .map(|(_, a, d)| (a, d))
            .collect();
        assert_eq!(
            writes,
            vec![
                (0x26, 0xa500),
                (0x27, 0x0f00),
                (0x46, 0x0004),
                (0x2a, 0x4444),
                (0x31, 0x0001)
            ]
        );
    }

    #[test]
    fn test_init_writes() {
        let opts = InitOptions {
            registers: BTreeMap::from([(0x57, 1), (0x33, 1), (0x00, 0)]),
            phase_ddr: true,
        };
        assert_eq!(
            opts.writes(),
            vec![(0x00, 0), (0x33, 1), (0x42, 0x60), (0x50, 0x30)]
        );
        // An explicit 0x50 wins
        let opts = InitOptions {
            registers: BTreeMap::from([(0x50, 0x10)]),
            phase_ddr: false,
        };
        assert_eq!(opts.writes(), vec![(0x50, 0x10)]);
    }

    #[test]
    fn test_init() {
        let (transport, mut adc) = setup();
        adc.init(&InitOptions::default()).unwrap();
        let writes: Vec<(u8, u16)> = decode(&transport)
            .into_iter()
            .map(|(_, a, d)| (a, d))
            .collect();
        assert_eq!(writes[0], (0x00, 0x0001));
        assert_eq!(writes[1], (0x50, 0x0030));
        assert_eq!(writes[2], (0x0f, 0x0200));
        assert_eq!(writes.len(), 7);
    }
}
