use adcleda::hmcad1511::{
    CoarseGain,
    Pattern,
};
use clap::{
    ArgAction,
    Parser,
    Subcommand,
};
use std::net::IpAddr;

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Reset the ADCs, program registers, calibrate the SERDES and switch to sampled data
    Init {
        /// Bitstream to load first
        #[arg(long)]
        bof: Option<String>,
        /// Digital gain once calibrated (1, 1.25, 2 ... 50)
        #[arg(short, long)]
        gain: Option<CoarseGain>,
        /// ADC register addr=value pairs to set before power cycling
        #[arg(short, long, value_parser = parse_reg, value_delimiter = ',')]
        reg: Vec<(u8, u16)>,
        /// Put the LVDS bit clock at 0 degrees
        #[arg(long)]
        phase_ddr: bool,
        /// Number of snapshots per tap
        #[arg(short, long, default_value_t = 1)]
        iters: usize,
    },
    /// Print the FPGA clock and design revision
    Status {
        /// Also check every lane against the training patterns
        #[arg(short, long)]
        check: bool,
    },
    /// Capture and print the bit-corrected lanes
    Dump {
        /// Samples to print per lane
        #[arg(short = 'n', long, default_value_t = 16)]
        samples: usize,
        /// Dump the single channel snapshot instead
        #[arg(long)]
        channel: bool,
    },
    /// Write raw addr=value pairs to ADC registers
    Setreg {
        #[arg(value_parser = parse_reg, required = true)]
        regs: Vec<(u8, u16)>,
        /// Only write to this chip
        #[arg(long)]
        chip: Option<usize>,
    },
    /// Select a test pattern (none, ramp, deskew, sync, custom, dual)
    Pattern {
        pattern: Pattern,
        /// Only switch this chip
        #[arg(long)]
        chip: Option<usize>,
    },
    /// Toggle the channel polarity
    Flip,
    /// Step every lane's delay tap by one, or load a given tap
    Tap { tap: Option<u8> },
    /// Pulse the SERDES reset
    ResetSerdes,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Args {
    /// Address of the board
    #[arg(long, env = "ADCLEDA_HOST")]
    pub(crate) host: IpAddr,
    /// TAPCP (TFTP) port
    #[arg(short, long, default_value_t = 69)]
    pub(crate) port: u16,
    /// How long to hold SERDES resets and strobes, in milliseconds
    #[arg(long, env = "ADCLEDA_SETTLE_MS", default_value_t = 1000)]
    pub(crate) settle_ms: u64,
    /// More log output, repeat for more still (RUST_LOG overrides)
    #[arg(short, long, action = ArgAction::Count)]
    pub(crate) verbose: u8,
    #[command(subcommand)]
    pub(crate) command: Command,
}

fn parse_int(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("`{s}`: {e}"))
}

/// Parse `addr=value`, either in decimal or 0x-prefixed hex
pub(crate) fn parse_reg(s: &str) -> Result<(u8, u16), String> {
    let (addr, value) = s
        .split_once('=')
        .ok_or_else(|| format!("`{s}` isn't of the form addr=value"))?;
    let addr = u8::try_from(parse_int(addr)?).map_err(|_| format!("address `{addr}` too big"))?;
    let value =
        u16::try_from(parse_int(value)?).map_err(|_| format!("value `{value}` too big"))?;
    Ok((addr, value))
}
