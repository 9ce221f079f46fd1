//! The LEDA ADC test board: one transport shared by the serial bus, the SERDES controller and the
//! snapshot blocks hanging off it.

use crate::{
    adc::Adc,
    calibrate::{
        self,
        CalibrationOptions,
        Calibrator,
    },
    capture::{
        self,
        channel_bytes,
        deinterleave,
        Snapshot,
        SnapshotConfig,
        LANES,
    },
    controller::{
        self,
        Controller,
        ControllerConfig,
    },
    core::{
        estimate_fpga_clock,
        revision,
        RevisionInfo,
    },
    spi::{
        self,
        Spi,
        SpiConfig,
    },
    transport::{
        self,
        Transport,
    },
};
use std::{
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error(transparent)]
    Spi(#[from] spi::Error),
    #[error(transparent)]
    Controller(#[from] controller::Error),
    #[error(transparent)]
    Capture(#[from] capture::Error),
    #[error(transparent)]
    Calibrate(#[from] calibrate::Error),
    #[error("The FPGA isn't running a design")]
    NotRunning,
    #[error("The running design has no `{0}` device")]
    MissingDevice(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardConfig {
    pub spi: SpiConfig,
    pub controller: ControllerConfig,
    /// Snapshot of all sixteen interleaved lanes
    pub data_snapshot: String,
    /// Snapshot of a single channel
    pub channel_snapshot: String,
    pub snapshot: SnapshotConfig,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            spi: SpiConfig::default(),
            controller: ControllerConfig::default(),
            data_snapshot: "fifo_data".to_string(),
            channel_snapshot: "fifo_data_a".to_string(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct LedaBoard<T> {
    transport: Arc<Mutex<T>>,
    pub adc: Adc<T>,
    pub controller: Controller<T>,
    pub data: Snapshot<T>,
    pub channel: Snapshot<T>,
}

impl<T> LedaBoard<T>
where
    T: Transport,
{
    /// Attach to a board that's already running the ADC design, flushing the serial bus
    /// # Errors
    /// Returns an error if the board isn't running, the design lacks the controller, or on bad
    /// transport
    pub fn new(mut transport: T, config: BoardConfig) -> Result<Self, Error> {
        if !transport.is_running()? {
            return Err(Error::NotRunning);
        }
        let devices = transport.listdev()?;
        for register in [&config.spi.register, &config.controller.register] {
            if !devices.contains_key(register.as_str()) {
                return Err(Error::MissingDevice(register.clone()));
            }
        }
        let transport = Arc::new(Mutex::new(transport));
        let weak = Arc::downgrade(&transport);
        let spi = Spi::new(weak.clone(), config.spi)?;
        Ok(Self {
            adc: Adc::new(spi),
            controller: Controller::new(weak.clone(), config.controller),
            data: Snapshot::new(weak.clone(), &config.data_snapshot, config.snapshot.clone()),
            channel: Snapshot::new(weak, &config.channel_snapshot, config.snapshot),
            transport,
        })
    }

    /// Load `bitstream`, attach, then run the ADC start-up sequence
    /// # Errors
    /// Returns an error on bad transport or if the design doesn't have the controller
    pub fn program(mut transport: T, bitstream: &str, config: BoardConfig) -> Result<Self, Error> {
        transport.program(bitstream)?;
        info!(bitstream, "Programmed");
        let mut board = Self::new(transport, config)?;
        board.start()?;
        Ok(board)
    }

    /// Shared handle to the underlying transport
    #[must_use]
    pub fn transport(&self) -> Arc<Mutex<T>> {
        self.transport.clone()
    }

    fn with_transport<R>(
        &self,
        f: impl FnOnce(&mut T) -> transport::TransportResult<R>,
    ) -> Result<R, Error> {
        let mut guard = self
            .transport
            .lock()
            .map_err(|_| transport::Error::Poisoned)?;
        Ok(f(&mut *guard)?)
    }

    /// Reset and power cycle every ADC chip
    /// # Errors
    /// Returns an error on bad transport
    pub fn start(&mut self) -> Result<(), Error> {
        self.adc.select(None)?;
        self.adc.start()?;
        Ok(())
    }

    /// Capture all lanes, corrected for bit order
    /// # Errors
    /// Returns an error on bad transport or if the capture never completes
    pub fn data(&self) -> Result<Vec<Vec<u8>>, Error> {
        Ok(deinterleave(&self.data.capture()?, LANES))
    }

    /// Capture the single channel snapshot
    /// # Errors
    /// Returns an error on bad transport or if the capture never completes
    pub fn channel(&self) -> Result<Vec<u8>, Error> {
        Ok(channel_bytes(&self.channel.capture()?))
    }

    /// FPGA clock rate in MHz, measured over `delay`
    /// # Errors
    /// Returns an error on bad transport
    pub fn estimate_clock(&self, delay: Duration) -> Result<f64, Error> {
        self.with_transport(|t| estimate_fpga_clock(t, delay))
    }

    /// Application and library revisions of the running design
    /// # Errors
    /// Returns an error on bad transport
    pub fn revision(&self) -> Result<(Option<RevisionInfo>, Option<RevisionInfo>), Error> {
        self.with_transport(revision)
    }

    #[must_use]
    pub fn calibrator(&self, opts: CalibrationOptions) -> Calibrator<'_, T> {
        Calibrator::new(&self.adc, &self.controller, &self.data, opts)
    }
}
