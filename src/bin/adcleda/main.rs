mod args;

use adcleda::{
    controller::ControllerConfig,
    prelude::*,
};
use anyhow::bail;
use args::*;
use clap::Parser;
use indicatif::{
    ProgressBar,
    ProgressStyle,
};
use std::{
    net::SocketAddr,
    time::Duration,
};
use tracing::{
    debug,
    info,
};
use tracing_subscriber::EnvFilter;

type Board = LedaBoard<Tapcp>;

fn init(
    board: &mut Board,
    opts: &InitOptions,
    iters: usize,
    gain: Option<CoarseGain>,
) -> anyhow::Result<()> {
    info!("Resetting ADC, setting registers and power cycling");
    board.adc.select(None)?;
    board.adc.init(opts)?;

    let cal = board.calibrator(CalibrationOptions {
        num_iters: iters,
        ..Default::default()
    });
    let chips = cal.chips();
    let bar = ProgressBar::new(chips.len() as u64);
    bar.set_style(ProgressStyle::with_template("{msg} {bar:20} {pos}/{len}")?);
    bar.set_message("Calibrating SERDES blocks");
    let status = cal.calibrate(|walk| {
        for (lane, tap) in walk.taps.iter().enumerate() {
            if tap.is_none() {
                bar.println(format!("chip {} lane {lane}: no good taps", walk.chip));
            }
        }
        bar.inc(1);
    })?;
    bar.finish();

    let failed: Vec<usize> = chips
        .iter()
        .zip(&status)
        .filter(|(_, ok)| !**ok)
        .map(|(chip, _)| *chip)
        .collect();
    if failed.is_empty() {
        println!("SERDES calibration successful.");
    } else {
        for chip in &failed {
            println!("ERROR: SERDES calibration failed for ADC {chip}.");
        }
    }

    info!("Selecting analog inputs");
    board.adc.clear_pattern()?;
    match gain {
        Some(gain) => board.adc.set_coarse_gain(gain)?,
        None => info!("Using default digital gain of 1"),
    }
    if !failed.is_empty() {
        bail!("{} chip(s) failed to calibrate", failed.len());
    }
    Ok(())
}

fn status(board: &Board, check: bool) -> anyhow::Result<()> {
    let clock = board.estimate_clock(Duration::from_secs(1))?;
    println!("FPGA clock: {clock:.3} MHz");
    let (app, lib) = board.revision()?;
    for (name, rev) in [("app", app), ("lib", lib)] {
        match rev {
            Some(rev) => println!("{name}: {rev}"),
            None => println!("{name}: unknown"),
        }
    }
    if check {
        let report = board.calibrator(CalibrationOptions::default()).verify()?;
        for (lane, (deskew, sync)) in report.deskew.iter().zip(&report.sync).enumerate() {
            let mark = |ok: &bool| if *ok { "OK" } else { "BAD" };
            println!("lane {lane:2}: deskew {} sync {}", mark(deskew), mark(sync));
        }
        if !report.all_ok() {
            bail!("Calibration check failed");
        }
    }
    Ok(())
}

fn signed(b: u8) -> i8 {
    i8::from_ne_bytes([b])
}

fn dump(board: &Board, samples: usize, channel: bool) -> anyhow::Result<()> {
    if channel {
        for s in board.channel()?.iter().take(samples) {
            println!("{:4}", signed(*s));
        }
        return Ok(());
    }
    let lanes = board.data()?;
    let rows = lanes.iter().map(Vec::len).min().unwrap_or(0).min(samples);
    for i in 0..rows {
        let row: Vec<String> = lanes
            .iter()
            .map(|lane| format!("{:4}", signed(lane[i])))
            .collect();
        println!("{}", row.join(" "));
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
    debug!("Logging started");

    let host = SocketAddr::new(args.host, args.port);
    info!(%host, "Connecting");
    let transport = Tapcp::connect(host)?;
    let config = BoardConfig {
        controller: ControllerConfig {
            settle: Duration::from_millis(args.settle_ms),
            ..Default::default()
        },
        ..Default::default()
    };

    match args.command {
        Command::Init {
            bof,
            gain,
            reg,
            phase_ddr,
            iters,
        } => {
            let mut board = match bof {
                Some(bof) => LedaBoard::program(transport, &bof, config)?,
                None => LedaBoard::new(transport, config)?,
            };
            let opts = InitOptions {
                registers: reg.into_iter().collect(),
                phase_ddr,
            };
            for (addr, value) in &opts.registers {
                info!("Will set ADC register {addr:#04x} to {value:#06x}");
            }
            init(&mut board, &opts, iters, gain)?;
        }
        Command::Status { check } => status(&LedaBoard::new(transport, config)?, check)?,
        Command::Dump { samples, channel } => {
            dump(&LedaBoard::new(transport, config)?, samples, channel)?;
        }
        Command::Setreg { regs, chip } => {
            let mut board = LedaBoard::new(transport, config)?;
            board.adc.select(chip)?;
            for (addr, value) in regs {
                board.adc.setreg(addr, value)?;
            }
        }
        Command::Pattern { pattern, chip } => {
            let mut board = LedaBoard::new(transport, config)?;
            board.adc.select(chip)?;
            board.adc.enable_pattern(pattern)?;
            println!("Pattern set to {pattern}");
        }
        Command::Flip => LedaBoard::new(transport, config)?.controller.flip_polarity()?,
        Command::Tap { tap } => {
            let mut board = LedaBoard::new(transport, config)?;
            let tap = match tap {
                Some(tap) => {
                    let all = board.controller.config().all_lanes();
                    board.controller.set_taps(tap, all)?;
                    tap
                }
                None => {
                    board.controller.load_tap()?;
                    board.controller.inc_tap()?
                }
            };
            println!("Delay tap {tap}");
        }
        Command::ResetSerdes => LedaBoard::new(transport, config)?.controller.reset_serdes()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed() {
        assert_eq!(signed(0x7f), 127);
        assert_eq!(signed(0x80), -128);
        assert_eq!(signed(0xff), -1);
    }
}
