use std::path::PathBuf;

use clap::Parser;
use dap_flash::{FlashOptions, ProbeId, flash_file, list_all_probes};

/// Flash a raw firmware image into an STM32F4 over a CMSIS-DAP probe
#[derive(Parser)]
struct Args {
    /// Firmware binary, written from the start of flash
    firmware: PathBuf,
    /// Probe vendor id (hex)
    #[arg(long, value_parser = parse_hex)]
    vid: Option<u16>,
    /// Probe product id (hex)
    #[arg(long, value_parser = parse_hex)]
    pid: Option<u16>,
    /// SWCLK frequency in Hz
    #[arg(long, default_value_t = 2_000_000)]
    clock: u32,
}

fn parse_hex(s: &str) -> Result<u16, std::num::ParseIntError> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut options = FlashOptions::default();
    options.probe = ProbeId {
        vid: args.vid.unwrap_or(options.probe.vid),
        pid: args.pid.unwrap_or(options.probe.pid),
    };
    options.link.clock_hz = args.clock;

    for probe in list_all_probes()? {
        log::debug!("Attached: {} ({})", probe.name, probe.id);
    }

    let report = flash_file(&args.firmware, &options)?;
    println!(
        "Flashed {} bytes into sectors {:?}, idcode {:#010x}{}",
        report.bytes_written,
        report.sectors,
        report.idcode,
        if report.reset_ok { "" } else { " (reset failed)" }
    );
    Ok(())
}
