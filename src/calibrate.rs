//! SERDES calibration: walk the IDELAY taps across the deskew pattern's eye and park each lane in
//! the middle of it, then bitslip each chip until the sync pattern lines up with the frame.

use crate::{
    adc::Adc,
    capture::{
        self,
        deinterleave,
        Snapshot,
        LANES,
    },
    controller::{
        self,
        Controller,
        MAX_TAP,
    },
    spi,
    transport::Transport,
};
use std::ops::RangeInclusive;
use thiserror::Error;
use tracing::{
    debug,
    info,
    warn,
};

/// Most bitslips a chip can need before the pattern repeats
const MAX_BITSLIPS: usize = 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Spi(#[from] spi::Error),
    #[error(transparent)]
    Controller(#[from] controller::Error),
    #[error(transparent)]
    Capture(#[from] capture::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationOptions {
    /// What every sample reads as once a lane is centred on the deskew pattern
    pub deskew_expected: u8,
    /// What the first sample of a chip reads as once it's framed on the sync pattern
    pub sync_expected: u8,
    /// Captures to accumulate per tap
    pub num_iters: usize,
    /// Chips to calibrate, `None` for all of them
    pub chips: Option<Vec<usize>>,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            deskew_expected: 0xaa,
            sync_expected: 0xf0,
            num_iters: 1,
            chips: None,
        }
    }
}

/// The outcome of sweeping the taps of one chip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapWalk {
    pub chip: usize,
    /// Whether the chip was bitslipped to get the eye inside the sweep
    pub bitslipped: bool,
    /// Tap each lane was set to, `None` where no tap was error free
    pub taps: Vec<Option<u8>>,
    /// Error counts, indexed by tap then lane within the chip
    pub counts: Vec<Vec<usize>>,
}

/// Per-lane pass/fail of the training patterns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneReport {
    pub deskew: Vec<bool>,
    pub sync: Vec<bool>,
}

impl LaneReport {
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.deskew.iter().chain(&self.sync).all(|ok| *ok)
    }
}

/// The longest run of good taps, the lowest one on a tie
#[must_use]
pub fn longest_run(good: &[bool]) -> Option<RangeInclusive<u8>> {
    let mut best: Option<RangeInclusive<u8>> = None;
    let mut start = None;
    for (tap, ok) in good.iter().copied().chain(std::iter::once(false)).enumerate() {
        let tap = u8::try_from(tap).unwrap_or(u8::MAX);
        match (ok, start) {
            (true, None) => start = Some(tap),
            (false, Some(first)) => {
                let run = first..=tap - 1;
                if best.as_ref().map_or(true, |b| run.len() > b.len()) {
                    best = Some(run);
                }
                start = None;
            }
            _ => (),
        }
    }
    best
}

/// Runs the calibration against the blocks of one board
#[derive(Debug)]
pub struct Calibrator<'a, T> {
    adc: &'a Adc<T>,
    controller: &'a Controller<T>,
    snapshot: &'a Snapshot<T>,
    opts: CalibrationOptions,
}

impl<'a, T> Calibrator<'a, T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(
        adc: &'a Adc<T>,
        controller: &'a Controller<T>,
        snapshot: &'a Snapshot<T>,
        opts: CalibrationOptions,
    ) -> Self {
        Self {
            adc,
            controller,
            snapshot,
            opts,
        }
    }

    fn lanes_per_chip(&self) -> usize {
        self.controller.config().lanes_per_chip
    }

    /// The chips the options ask for, restricted to the ones that exist
    #[must_use]
    pub fn chips(&self) -> Vec<usize> {
        let available = self.controller.config().chips;
        match &self.opts.chips {
            None => (0..available).collect(),
            Some(chips) => chips.iter().copied().filter(|c| *c < available).collect(),
        }
    }

    fn lanes(&self) -> Result<Vec<Vec<u8>>, Error> {
        Ok(deinterleave(&self.snapshot.capture()?, LANES))
    }

    /// Set every lane in the `lanes` mask to `tap` and count, for every lane, the samples that
    /// aren't the deskew pattern
    /// # Errors
    /// Returns an error on bad transport
    pub fn test_tap(&self, tap: u8, lanes: u16) -> Result<Vec<usize>, Error> {
        self.controller.set_taps(tap, lanes)?;
        let mut counts = vec![0; LANES];
        for _ in 0..self.opts.num_iters {
            for (count, lane) in counts.iter_mut().zip(self.lanes()?) {
                *count += lane
                    .iter()
                    .filter(|s| **s != self.opts.deskew_expected)
                    .count();
            }
        }
        Ok(counts)
    }

    /// Sweep every tap over `chip` with the deskew pattern on and centre each lane in its eye
    /// # Errors
    /// Returns an error on bad transport
    pub fn walk_taps(&self, chip: usize) -> Result<TapWalk, Error> {
        self.adc.deskew_pattern()?;
        let per_chip = self.lanes_per_chip();
        let first_lane = chip * per_chip;
        let lanes = first_lane..first_lane + per_chip;
        let mask = self.controller.config().chip_lanes(chip);

        // If either end of the sweep is already clean the eye won't be crossed, so shift the
        // pattern by a bit
        let at_0 = self.test_tap(0, mask)?;
        let at_max = self.test_tap(MAX_TAP, mask)?;
        let bitslipped = lanes
            .clone()
            .any(|lane| at_0.get(lane) == Some(&0) || at_max.get(lane) == Some(&0));
        if bitslipped {
            info!(chip, "Bitslipping to sample the eye pattern better");
            self.controller.bitslip(&[chip])?;
        }

        let mut counts = Vec::with_capacity(usize::from(MAX_TAP) + 1);
        for tap in 0..=MAX_TAP {
            let all = self.test_tap(tap, mask)?;
            let chip_counts = lanes.clone().map(|l| all.get(l).copied().unwrap_or(0));
            counts.push(chip_counts.collect::<Vec<_>>());
        }

        let mut taps = Vec::with_capacity(per_chip);
        for (i, lane) in lanes.enumerate() {
            let good: Vec<bool> = counts.iter().map(|c| c[i] == 0).collect();
            match longest_run(&good) {
                Some(run) => {
                    let tap = (run.start() + run.end()) / 2;
                    debug!(chip, lane, tap, ?run, "Setting delay tap");
                    self.controller.set_taps(tap, 1 << lane)?;
                    taps.push(Some(tap));
                }
                None => {
                    warn!(chip, lane, "No good taps found");
                    taps.push(None);
                }
            }
        }
        Ok(TapWalk {
            chip,
            bitslipped,
            taps,
            counts,
        })
    }

    fn framed(&self, chip: usize) -> Result<bool, Error> {
        let lanes = self.lanes()?;
        let first = lanes
            .get(chip * self.lanes_per_chip())
            .and_then(|lane| lane.first());
        Ok(first == Some(&self.opts.sync_expected))
    }

    /// Turn on the sync pattern and bitslip each chip until it's framed. Returns whether each
    /// chip made it.
    /// # Errors
    /// Returns an error on bad transport
    pub fn sync_chips(&self, chips: &[usize]) -> Result<Vec<bool>, Error> {
        self.adc.sync_pattern()?;
        chips
            .iter()
            .map(|&chip| -> Result<bool, Error> {
                for _ in 0..MAX_BITSLIPS {
                    if self.framed(chip)? {
                        break;
                    }
                    self.controller.bitslip(&[chip])?;
                }
                let ok = self.framed(chip)?;
                if !ok {
                    warn!(chip, "Failed to sync");
                }
                Ok(ok)
            })
            .collect()
    }

    /// Walk the taps of every chip, calling `on_chip` as each finishes, then sync them. Returns
    /// whether each chip synced.
    /// # Errors
    /// Returns an error on bad transport
    pub fn calibrate(&self, mut on_chip: impl FnMut(&TapWalk)) -> Result<Vec<bool>, Error> {
        let chips = self.chips();
        info!(?chips, "Calibrating");
        for &chip in &chips {
            let walk = self.walk_taps(chip)?;
            on_chip(&walk);
        }
        self.sync_chips(&chips)
    }

    /// Capture both training patterns and check every lane, then go back to sampled data
    /// # Errors
    /// Returns an error on bad transport
    pub fn verify(&self) -> Result<LaneReport, Error> {
        let check = |expected: u8| -> Result<Vec<bool>, Error> {
            Ok(self
                .lanes()?
                .iter()
                .map(|lane| !lane.is_empty() && lane.iter().all(|s| *s == expected))
                .collect())
        };
        self.adc.deskew_pattern()?;
        let deskew = check(self.opts.deskew_expected)?;
        self.adc.sync_pattern()?;
        let sync = check(self.opts.sync_expected)?;
        self.adc.clear_pattern()?;
        Ok(LaneReport { deskew, sync })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        capture::{
            reverse_nibbles,
            SnapshotConfig,
        },
        controller::ControllerConfig,
        core::{
            Register,
            RegisterMap,
        },
        spi::{
            Spi,
            SpiConfig,
        },
        transport::TransportResult,
    };
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            Mutex,
        },
        time::Duration,
    };

    const SAMPLES: usize = 8;

    /// A board whose lanes only see the training patterns inside a window of taps, and whose
    /// chips only frame after the right number of bitslips
    #[derive(Debug, Default)]
    pub(crate) struct FakeBoard {
        words: [u32; 2],
        shift: u32,
        shifted: usize,
        /// Register 0x45
        frame: u16,
        taps: [u8; LANES],
        slips: [usize; 4],
        /// Good taps per lane for an even and an odd number of bitslips
        pub windows: Vec<[RangeInclusive<u8>; 2]>,
        /// Bitslips (mod 8) each chip needs to frame
        pub sync_at: [Option<usize>; 4],
    }

    impl FakeBoard {
        pub(crate) fn new() -> Self {
            let mut windows: Vec<_> = (0..12u8)
                .map(|lane| {
                    let lo = 3 + lane % 4;
                    [lo..=lo + 12, lo..=lo + 12]
                })
                .collect();
            // The last chip starts with its eye against tap 0
            windows.extend((0..4).map(|_| [0..=9, 10..=24]));
            Self {
                windows,
                sync_at: [Some(0), Some(3), Some(7), Some(1)],
                ..Default::default()
            }
        }

        pub(crate) fn registers() -> RegisterMap {
            HashMap::from([
                (
                    "adcleda_controller".into(),
                    Register { addr: 0, length: 8 },
                ),
                ("fifo_data_ctrl".into(), Register { addr: 8, length: 4 }),
                ("fifo_data_status".into(), Register { addr: 12, length: 4 }),
                (
                    "fifo_data_bram".into(),
                    Register {
                        addr: 16,
                        length: LANES * SAMPLES,
                    },
                ),
            ])
        }

        fn bus(&mut self, word: u32) {
            let cfg = SpiConfig::default();
            let rising = word & cfg.sclk != 0 && self.words[0] & cfg.sclk == 0;
            let selected = word & cfg.chip_select != cfg.chip_select;
            if rising && selected {
                self.shift = (self.shift << 1) | u32::from(word & cfg.sdata != 0);
                self.shifted += 1;
            }
            if word == cfg.chip_select | cfg.sclk {
                if self.shifted == 24 && self.shift >> 16 == 0x45 {
                    self.frame = (self.shift & 0xffff) as u16;
                }
                self.shift = 0;
                self.shifted = 0;
            }
            self.words[0] = word;
        }

        fn control(&mut self, word: u32) {
            let tap = ((word >> 11) & 0x1f) as u8;
            let strobe = word >> 16;
            for (lane, t) in self.taps.iter_mut().enumerate() {
                if strobe & (1 << lane) != 0 {
                    *t = tap;
                }
            }
            let rising = (word >> 7) & !(self.words[1] >> 7) & 0xf;
            for (chip, slips) in self.slips.iter_mut().enumerate() {
                if rising & (1 << chip) != 0 {
                    *slips += 1;
                }
            }
            self.words[1] = word;
        }

        fn sample(&self, lane: usize) -> u8 {
            let chip = lane / 4;
            match self.frame {
                1 if self.windows[lane][self.slips[chip] % 2].contains(&self.taps[lane]) => 0xaa,
                2 if self.sync_at[chip] == Some(self.slips[chip] % 8) => 0xf0,
                _ => 0x00,
            }
        }
    }

    impl Transport for FakeBoard {
        fn is_running(&mut self) -> TransportResult<bool> {
            Ok(true)
        }

        fn read_n_bytes(
            &mut self,
            device: &str,
            offset: usize,
            n: usize,
        ) -> TransportResult<Vec<u8>> {
            let bytes: Vec<u8> = match device {
                "adcleda_controller" => self.words.iter().flat_map(|w| w.to_be_bytes()).collect(),
                "fifo_data_status" => (0x8000_0000u32 | (LANES * SAMPLES) as u32)
                    .to_be_bytes()
                    .to_vec(),
                "fifo_data_bram" => (0..SAMPLES)
                    .flat_map(|_| (0..LANES).map(|lane| reverse_nibbles(self.sample(lane))))
                    .collect(),
                _ => vec![0; offset + n],
            };
            Ok(bytes[offset..offset + n].to_vec())
        }

        fn write_bytes(&mut self, device: &str, offset: usize, data: &[u8]) -> TransportResult<()> {
            if device == "adcleda_controller" {
                let word = u32::from_be_bytes(data.try_into().unwrap());
                match offset {
                    0 => self.bus(word),
                    4 => self.control(word),
                    _ => unreachable!(),
                }
            }
            Ok(())
        }

        fn listdev(&mut self) -> TransportResult<RegisterMap> {
            Ok(Self::registers())
        }

        fn program(&mut self, _bitstream: &str) -> TransportResult<()> {
            Ok(())
        }

        fn deprogram(&mut self) -> TransportResult<()> {
            Ok(())
        }
    }

    struct Parts {
        transport: Arc<Mutex<FakeBoard>>,
        adc: Adc<FakeBoard>,
        controller: Controller<FakeBoard>,
        snapshot: Snapshot<FakeBoard>,
    }

    fn parts(board: FakeBoard) -> Parts {
        let transport = Arc::new(Mutex::new(board));
        let weak = Arc::downgrade(&transport);
        Parts {
            adc: Adc::new(Spi::new(weak.clone(), SpiConfig::default()).unwrap()),
            controller: Controller::new(
                weak.clone(),
                ControllerConfig {
                    settle: Duration::ZERO,
                    ..Default::default()
                },
            ),
            snapshot: Snapshot::new(
                weak,
                "fifo_data",
                SnapshotConfig {
                    polls: 1,
                    poll_interval: Duration::ZERO,
                },
            ),
            transport,
        }
    }

    #[test]
    fn test_longest_run() {
        let good = [false, true, true, false, true, true, true, false];
        assert_eq!(longest_run(&good), Some(4..=6));
        assert_eq!(longest_run(&[true, true, false, true, true]), Some(0..=1));
        assert_eq!(longest_run(&[false, true, true, true]), Some(1..=3));
        assert_eq!(longest_run(&[false; 4]), None);
        assert_eq!(longest_run(&[]), None);
    }

    #[test]
    fn test_test_tap() {
        let p = parts(FakeBoard::new());
        let cal = Calibrator::new(&p.adc, &p.controller, &p.snapshot, Default::default());
        p.adc.deskew_pattern().unwrap();
        let counts = cal.test_tap(5, 0x000f).unwrap();
        // Lanes 0..=2 have their windows starting at 3, 4 and 5, lane 3 at 6
        assert_eq!(&counts[..4], &[0, 0, 0, SAMPLES - 1]);
        // Lanes that weren't strobed sit at tap 0
        assert_eq!(counts[4], SAMPLES - 1);
    }

    #[test]
    fn test_walk_taps() {
        let p = parts(FakeBoard::new());
        let cal = Calibrator::new(&p.adc, &p.controller, &p.snapshot, Default::default());
        let walk = cal.walk_taps(0).unwrap();
        assert!(!walk.bitslipped);
        assert_eq!(walk.taps, vec![Some(9), Some(10), Some(11), Some(12)]);
        assert_eq!(walk.counts.len(), 32);
        assert_eq!(p.transport.lock().unwrap().taps[..4], [9, 10, 11, 12]);

        let walk = cal.walk_taps(3).unwrap();
        assert!(walk.bitslipped);
        assert_eq!(walk.taps, vec![Some(17); 4]);
        assert_eq!(p.transport.lock().unwrap().slips[3], 1);
    }

    #[test]
    fn test_walk_taps_no_eye() {
        let mut board = FakeBoard::new();
        board.windows[5] = [40..=40, 40..=40];
        let p = parts(board);
        let cal = Calibrator::new(&p.adc, &p.controller, &p.snapshot, Default::default());
        let walk = cal.walk_taps(1).unwrap();
        assert_eq!(walk.taps[1], None);
        assert!(walk.taps[0].is_some());
    }

    #[test]
    fn test_calibrate() {
        let p = parts(FakeBoard::new());
        let cal = Calibrator::new(&p.adc, &p.controller, &p.snapshot, Default::default());
        let mut walked = vec![];
        let synced = cal.calibrate(|walk| walked.push(walk.chip)).unwrap();
        assert_eq!(walked, vec![0, 1, 2, 3]);
        assert_eq!(synced, vec![true; 4]);
        assert_eq!(p.transport.lock().unwrap().slips, [0, 3, 7, 1]);
        let report = cal.verify().unwrap();
        assert!(report.all_ok());
        // Back to sampled data
        assert_eq!(p.transport.lock().unwrap().frame, 0);
    }

    #[test]
    fn test_sync_failure() {
        let mut board = FakeBoard::new();
        board.sync_at[1] = None;
        let p = parts(board);
        let cal = Calibrator::new(
            &p.adc,
            &p.controller,
            &p.snapshot,
            CalibrationOptions {
                chips: Some(vec![0, 1, 9]),
                ..Default::default()
            },
        );
        assert_eq!(cal.chips(), vec![0, 1]);
        assert_eq!(cal.sync_chips(&cal.chips()).unwrap(), vec![true, false]);
        // Gave up after a full cycle
        assert_eq!(p.transport.lock().unwrap().slips[1], 8);
        let report = cal.verify().unwrap();
        assert!(!report.all_ok());
        assert!(report.sync[..4].iter().all(|ok| *ok));
        assert!(report.sync[4..8].iter().all(|ok| !*ok));
    }
}
