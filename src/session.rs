//! One flashing run from probe discovery to release.

use eh1::delay::DelayNs;
use std::{ops::Range, path::Path, time::Duration};

use crate::{
    FirmwareImage, FlashError, ProbeId, discover,
    delay::Delay,
    flash::{FlashDriver, PollPolicy},
    image::load,
    link::{CommandSet, DapLink, InfoId, LinkConfig},
    swd::{SwdAccess, reg},
    target::TargetConfig,
    transport::{DEFAULT_TIMEOUT, DapTransport, UsbTransport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashOptions {
    pub probe: ProbeId,
    pub link: LinkConfig,
    pub commands: CommandSet,
    pub target: TargetConfig,
    /// Where the image lands; the start of flash unless overridden
    pub base: Option<u32>,
    pub erase_poll: PollPolicy,
    pub program_poll: PollPolicy,
    /// Bound on each USB transfer
    pub timeout: Duration,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            probe: ProbeId::default(),
            link: LinkConfig::default(),
            commands: CommandSet::default(),
            target: TargetConfig::default(),
            base: None,
            erase_poll: PollPolicy::ERASE,
            program_poll: PollPolicy::PROGRAM,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl FlashOptions {
    pub fn base(&self) -> u32 {
        self.base.unwrap_or(self.target.sectors.base)
    }
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub idcode: u32,
    /// Erased sector indexes
    pub sectors: Range<u32>,
    /// Padded image length
    pub bytes_written: usize,
    /// `false` when the final reset was refused; the image is still good
    pub reset_ok: bool,
}

/// Reads a firmware file and flashes it.
pub fn flash_file(
    path: impl AsRef<Path>,
    options: &FlashOptions,
) -> Result<FlashReport, FlashError> {
    let image = FirmwareImage::from_file(path)?;
    flash_firmware(&image, options)
}

/// Finds and claims the probe, then flashes `image`.
pub fn flash_firmware(
    image: &FirmwareImage,
    options: &FlashOptions,
) -> Result<FlashReport, FlashError> {
    let probe = discover(options.probe)?;
    log::info!("Using {} ({})", probe.name, probe.id);
    let transport = UsbTransport::claim(&probe, options.timeout)?;
    let link = DapLink::new(transport, options.commands);
    program_target(link, image, options, Delay)
}

/// Runs the whole sequence on an opened probe.
///
/// The link is consumed and released on return, whatever the outcome.
pub fn program_target<T: DapTransport, D: DelayNs>(
    link: DapLink<T>,
    image: &FirmwareImage,
    options: &FlashOptions,
    delay: D,
) -> Result<FlashReport, FlashError> {
    let base = options.base();
    // reject bad ranges before the probe sees a single command
    options
        .target
        .sectors
        .sectors_for(base, image.len())
        .map_err(|address| FlashError::SectorIndexOutOfRange { address })?;

    let mut swd = SwdAccess::new(link, options.target.csw);
    let link = swd.link();
    link.negotiate_packet_size()?;
    match link.info_string(InfoId::Product) {
        Ok(Some(product)) => log::info!("Probe: {product}"),
        Ok(None) => {}
        Err(e) => log::warn!("Probe name unavailable: {e}"),
    }
    link.connect()?;
    link.configure(&options.link)?;

    let idcode = swd.read_dp(reg::DP_IDCODE)?;
    if options.target.idcode_matches(idcode) {
        log::info!("IDCODE {idcode:#010x}");
    } else {
        log::warn!(
            "IDCODE {idcode:#010x} does not look like {} (expected {:#010x}), continuing",
            options.target.name,
            options.target.idcode
        );
    }

    let sectors = {
        let mut driver = FlashDriver::new(&mut swd, delay, options.target)
            .with_poll(options.erase_poll, options.program_poll);
        load(&mut driver, image, base)?
    };

    let reset_ok = match swd.link().reset_target() {
        Ok(()) => {
            log::info!("Target reset");
            true
        }
        Err(e) => {
            log::warn!("{e}, firmware is programmed but the target was not reset");
            false
        }
    };

    Ok(FlashReport {
        idcode,
        sectors,
        bytes_written: image.len(),
        reset_ok,
    })
}
