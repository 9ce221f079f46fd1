//! Configuration and SERDES calibration of the HMCAD1511 ADCs on the LEDA test boards.
//!
//! The ADC chips are programmed over a three-wire serial bus that is bit-banged through a single
//! 32-bit fabric register, while their LVDS outputs are aligned by walking IDELAY taps and
//! bitslipping the SERDES blocks until the training patterns come back intact.

pub mod adc;
pub mod board;
pub mod calibrate;
pub mod capture;
pub mod controller;
pub mod core;
pub mod hmcad1511;
pub mod prelude;
pub mod spi;
pub mod transport;
