//! Prelude (helpful reexports) for this package

pub use crate::{
    adc::InitOptions,
    board::{
        BoardConfig,
        LedaBoard,
    },
    calibrate::CalibrationOptions,
    hmcad1511::{
        CoarseGain,
        Pattern,
    },
    transport::{
        mock::Mock,
        tapcp::{
            self,
            Tapcp,
        },
        Transport,
    },
};
