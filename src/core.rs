//! The core types and functions shared by every block on the board
use crate::transport::{
    Transport,
    TransportResult,
};
use kstring::KString;
use std::{
    collections::HashMap,
    time::{
        Duration,
        Instant,
    },
};

/// The representation of an interal register
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Register {
    /// The offset in FPGA memory of this register
    pub addr: usize,
    /// The number of bytes stored at this location
    pub length: usize,
}

/// The mapping from register names and their data (address and size)
pub type RegisterMap = HashMap<KString, Register>;

/// Read the `sys_clkcounter` register twice, `delay` apart, to estimate the clock rate in
/// megahertz. Waiting longer than one wrap of the counter gives nonsense.
/// # Errors
/// Returns an error on bad transport
#[allow(clippy::cast_precision_loss)]
pub fn estimate_fpga_clock<T>(transport: &mut T, delay: Duration) -> TransportResult<f64>
where
    T: Transport,
{
    let earlier = Instant::now();
    let first_count: u32 = transport.read("sys_clkcounter", 0)?;
    let transport_delay = earlier.elapsed();
    std::thread::sleep(delay);
    let second_count: u32 = transport.read("sys_clkcounter", 0)?;
    Ok(clock_rate_mhz(
        first_count,
        second_count,
        delay.saturating_sub(transport_delay),
    ))
}

#[allow(clippy::cast_precision_loss)]
fn clock_rate_mhz(first: u32, second: u32, elapsed: Duration) -> f64 {
    // The counter is 32 bits and wraps
    let ticks = second.wrapping_sub(first);
    f64::from(ticks) / (elapsed.as_secs_f64() * 1_000_000_f64)
}

/// Revision control system the gateware was built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionInfo {
    /// Built from an unversioned tree, seconds since the unix epoch
    Timestamp(u32),
    Git { rev: String, dirty: bool },
    Svn { rev: String, dirty: bool },
}

impl From<u32> for RevisionInfo {
    fn from(word: u32) -> Self {
        if word & 0x8000_0000 != 0 {
            return Self::Timestamp(word & !0x8000_0000);
        }
        let dirty = word & 0x1000_0000 != 0;
        let rev = word & 0x0fff_ffff;
        if word & 0x4000_0000 == 0 {
            Self::Git {
                rev: format!("{rev:07x}"),
                dirty,
            }
        } else {
            Self::Svn {
                rev: format!("{rev}"),
                dirty,
            }
        }
    }
}

impl std::fmt::Display for RevisionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timestamp(t) => write!(f, "built at {t} (unix time)"),
            Self::Git { rev, dirty } => write!(f, "git {rev}{}", if *dirty { "-dirty" } else { "" }),
            Self::Svn { rev, dirty } => write!(f, "svn r{rev}{}", if *dirty { "-dirty" } else { "" }),
        }
    }
}

/// Read the application and library revision registers, if the design has them
/// # Errors
/// Returns an error on bad transport
pub fn revision<T>(
    transport: &mut T,
) -> TransportResult<(Option<RevisionInfo>, Option<RevisionInfo>)>
where
    T: Transport,
{
    let devices = transport.listdev()?;
    let mut read_rcs = |name: &str| -> TransportResult<Option<RevisionInfo>> {
        if devices.contains_key(name) {
            let word: u32 = transport.read(name, 0)?;
            Ok(Some(word.into()))
        } else {
            Ok(None)
        }
    };
    Ok((read_rcs("rcs_app")?, read_rcs("rcs_lib")?))
}
