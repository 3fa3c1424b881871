use eh1::delay::DelayNs;
use std::{ops::Range, path::PathBuf, time::Duration};

use crate::{
    DapError,
    image::FirmwareImage,
    swd::{MemoryAccess, SwdError},
    target::{FlashCr, FlashSr, TargetConfig},
};

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error(transparent)]
    Link(#[from] DapError),
    #[error(transparent)]
    Swd(#[from] SwdError),
    #[error("Reading register {address:#010x} failed: {source}")]
    RegisterReadFailed { address: u32, source: SwdError },
    #[error("Flash still locked after key sequence (CR {cr:#010x})")]
    UnlockFailed { cr: u32 },
    #[error("Address {address:#010x} is outside the sector table")]
    SectorIndexOutOfRange { address: u64 },
    #[error("Address {address:#010x} is not word aligned")]
    Misaligned { address: u32 },
    #[error("Erase of sector {sector} failed (SR {status:#010x})")]
    EraseError { sector: u32, status: u32 },
    #[error("Erase of sector {sector} timed out")]
    EraseTimeout { sector: u32 },
    #[error("Programming {address:#010x} failed (SR {status:#010x})")]
    ProgramError { address: u32, status: u32 },
    #[error("Programming {address:#010x} timed out")]
    ProgramTimeout { address: u32 },
    #[error("Verify failed at {address:#010x}: expected {expected:#010x}, read {actual:#010x}")]
    VerifyMismatch {
        address: u32,
        expected: u32,
        actual: u32,
    },
    #[error("Reading {path} failed: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// How long to wait for the flash controller to drop BSY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// SR reads before giving up
    pub max_polls: u32,
    /// Pause after each busy read
    pub interval: Duration,
}

impl PollPolicy {
    /// About one second per sector.
    pub const ERASE: PollPolicy = PollPolicy {
        max_polls: 100,
        interval: Duration::from_millis(10),
    };
    pub const PROGRAM: PollPolicy = PollPolicy {
        max_polls: 10,
        interval: Duration::from_millis(1),
    };

    /// No sleeping between polls.
    pub const fn immediate(max_polls: u32) -> Self {
        Self {
            max_polls,
            interval: Duration::ZERO,
        }
    }
}

/// STM32F4 flash controller driven through 32-bit memory accesses.
pub struct FlashDriver<'a, M: MemoryAccess, D: DelayNs> {
    mem: &'a mut M,
    delay: D,
    target: TargetConfig,
    erase_poll: PollPolicy,
    program_poll: PollPolicy,
}

impl<'a, M: MemoryAccess, D: DelayNs> FlashDriver<'a, M, D> {
    pub fn new(mem: &'a mut M, delay: D, target: TargetConfig) -> Self {
        Self {
            mem,
            delay,
            target,
            erase_poll: PollPolicy::ERASE,
            program_poll: PollPolicy::PROGRAM,
        }
    }

    pub fn with_poll(mut self, erase: PollPolicy, program: PollPolicy) -> Self {
        self.erase_poll = erase;
        self.program_poll = program;
        self
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    fn read_reg(&mut self, address: u32) -> Result<u32, FlashError> {
        self.mem
            .read_word(address)
            .map_err(|source| FlashError::RegisterReadFailed { address, source })
    }

    fn read_cr(&mut self) -> Result<FlashCr, FlashError> {
        Ok(FlashCr::from_bits(self.read_reg(self.target.flash.cr)?))
    }

    fn write_cr(&mut self, cr: FlashCr) -> Result<(), FlashError> {
        self.mem.write_word(self.target.flash.cr, cr.into_bits())?;
        Ok(())
    }

    fn read_sr(&mut self) -> Result<FlashSr, FlashError> {
        Ok(FlashSr::from_bits(self.read_reg(self.target.flash.sr)?))
    }

    /// Unlocks CR with the key sequence. Does nothing when already unlocked.
    pub fn unlock(&mut self) -> Result<(), FlashError> {
        if !self.read_cr()?.lock() {
            log::debug!("Flash already unlocked");
            return Ok(());
        }
        log::debug!("Flash locked, writing keys");
        let keys = self.target.flash;
        self.mem.write_word(keys.keyr, keys.key1)?;
        self.mem.write_word(keys.keyr, keys.key2)?;
        let cr = self.read_cr()?;
        if cr.lock() {
            return Err(FlashError::UnlockFailed { cr: cr.into_bits() });
        }
        log::info!("Flash unlocked");
        Ok(())
    }

    /// Sets LOCK. The controller ignores further CR writes until unlocked.
    pub fn lock(&mut self) -> Result<(), FlashError> {
        let cr = self.read_cr()?;
        self.write_cr(cr.with_lock(true))?;
        log::debug!("Flash locked");
        Ok(())
    }

    /// Clears stale write-one-to-clear error flags in SR.
    fn clear_errors(&mut self) -> Result<(), FlashError> {
        let sr = self.read_sr()?;
        if sr.has_error() {
            log::debug!("Clearing stale flash errors (SR {:#010x})", sr.into_bits());
            self.mem
                .write_word(self.target.flash.sr, FlashSr::ERRORS.into_bits())?;
        }
        Ok(())
    }

    /// Polls SR until BSY drops. `None` when the poll budget runs out.
    fn wait_idle(&mut self, policy: PollPolicy) -> Result<Option<FlashSr>, FlashError> {
        for poll in 1..=policy.max_polls {
            let sr = self.read_sr()?;
            if !sr.bsy() {
                return Ok(Some(sr));
            }
            if poll < policy.max_polls {
                self.delay.delay_us(policy.interval.as_micros() as u32);
            }
        }
        Ok(None)
    }

    /// Sectors covering `[start, start + len)`. No hardware access.
    pub fn sectors_for(&self, start: u32, len: usize) -> Result<Range<u32>, FlashError> {
        self.target
            .sectors
            .sectors_for(start, len)
            .map_err(|address| FlashError::SectorIndexOutOfRange { address })
    }

    /// Erases every sector touched by `[start, start + len)`.
    ///
    /// The whole range is checked against the sector table before the probe
    /// is touched.
    pub fn erase_range(&mut self, start: u32, len: usize) -> Result<Range<u32>, FlashError> {
        let sectors = self.sectors_for(start, len)?;
        if sectors.is_empty() {
            return Ok(sectors);
        }
        self.unlock()?;
        self.clear_errors()?;
        for sector in sectors.clone() {
            self.erase_one(sector)?;
        }
        Ok(sectors)
    }

    /// Erases a single sector by index.
    pub fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        let map = self.target.sectors;
        if sector >= map.sector_count {
            return Err(FlashError::SectorIndexOutOfRange {
                address: map.base as u64 + sector as u64 * map.sector_size as u64,
            });
        }
        self.unlock()?;
        self.clear_errors()?;
        self.erase_one(sector)
    }

    fn erase_one(&mut self, sector: u32) -> Result<(), FlashError> {
        let cr = FlashCr::new()
            .with_ser(true)
            .with_snb(sector as u8)
            .with_psize(FlashCr::PSIZE_X32);
        self.write_cr(cr)?;
        self.write_cr(cr.with_strt(true))?;

        let Some(sr) = self.wait_idle(self.erase_poll)? else {
            return Err(FlashError::EraseTimeout { sector });
        };
        if sr.read_error() || sr.program_error() {
            return Err(FlashError::EraseError {
                sector,
                status: sr.into_bits(),
            });
        }
        self.write_cr(FlashCr::new())?;
        log::info!(
            "Sector {sector} erased ({:#010x})",
            self.target.sectors.sector_address(sector)
        );
        Ok(())
    }

    /// Programs the image word by word starting at `start`.
    pub fn program(&mut self, start: u32, image: &FirmwareImage) -> Result<(), FlashError> {
        if start % 4 != 0 {
            return Err(FlashError::Misaligned { address: start });
        }
        self.sectors_for(start, image.len())?;
        self.unlock()?;
        self.clear_errors()?;
        self.write_cr(
            FlashCr::new()
                .with_pg(true)
                .with_psize(FlashCr::PSIZE_X32),
        )?;

        for (offset, word) in image.words() {
            let address = start + offset as u32;
            self.mem.write_word(address, word)?;
            let Some(sr) = self.wait_idle(self.program_poll)? else {
                return Err(FlashError::ProgramTimeout { address });
            };
            if sr.program_error() || sr.read_error() {
                return Err(FlashError::ProgramError {
                    address,
                    status: sr.into_bits(),
                });
            }
            if offset % 0x1000 == 0 && offset > 0 {
                log::debug!("Programmed {offset:#x} of {:#x} bytes", image.len());
            }
        }

        self.write_cr(FlashCr::new())?;
        log::info!("Programmed {} bytes at {start:#010x}", image.len());
        Ok(())
    }

    /// Reads every word back and compares it with the image.
    pub fn verify(&mut self, start: u32, image: &FirmwareImage) -> Result<(), FlashError> {
        self.sectors_for(start, image.len())?;
        for (offset, expected) in image.words() {
            let address = start + offset as u32;
            let actual = self.read_reg(address)?;
            if actual != expected {
                return Err(FlashError::VerifyMismatch {
                    address,
                    expected,
                    actual,
                });
            }
        }
        log::info!("Verified {} bytes", image.len());
        Ok(())
    }
}
