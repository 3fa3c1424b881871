//! Target family description: flash controller registers and sector layout.

use std::ops::Range;

use crate::swd::Csw;

/// Absolute addresses of the flash controller registers and the unlock keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegisterSet {
    pub keyr: u32,
    pub sr: u32,
    pub cr: u32,
    pub ar: u32,
    pub key1: u32,
    pub key2: u32,
}

/// Uniform sector table starting at `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorMap {
    pub base: u32,
    pub sector_size: u32,
    pub sector_count: u32,
}

impl SectorMap {
    /// Sector containing `address`, `None` outside the mapped range.
    pub fn sector_index(&self, address: u32) -> Option<u32> {
        let index = address.checked_sub(self.base)? / self.sector_size;
        (index < self.sector_count).then_some(index)
    }

    pub fn sector_address(&self, index: u32) -> u32 {
        self.base + index * self.sector_size
    }

    /// Sectors covering `[start, start + len)`. On failure, the first
    /// address that falls outside the table.
    pub fn sectors_for(&self, start: u32, len: usize) -> Result<Range<u32>, u64> {
        if len == 0 {
            return Ok(0..0);
        }
        let first = self.sector_index(start).ok_or(start as u64)?;
        let last_address = start as u64 + len as u64 - 1;
        let last = u32::try_from(last_address)
            .ok()
            .and_then(|address| self.sector_index(address))
            .ok_or(last_address)?;
        Ok(first..last + 1)
    }

    /// One past the last mapped byte.
    pub fn end(&self) -> u64 {
        self.base as u64 + self.sector_size as u64 * self.sector_count as u64
    }
}

/// FLASH_CR
#[bitfield_struct::bitfield(u32, order = Lsb)]
pub struct FlashCr {
    /// Programming
    pub pg: bool,
    /// Sector erase
    pub ser: bool,
    /// Mass erase
    pub mer: bool,
    /// Sector number
    #[bits(4)]
    pub snb: u8,
    _r0: bool,
    /// Program size: 0b00 x8, 0b01 x16, 0b10 x32, 0b11 x64
    #[bits(2)]
    pub psize: u8,
    #[bits(6)]
    _r1: u8,
    /// Start an erase
    pub strt: bool,
    #[bits(7)]
    _r2: u8,
    pub eopie: bool,
    pub errie: bool,
    #[bits(5)]
    _r3: u8,
    pub lock: bool,
}

impl FlashCr {
    pub const PSIZE_X32: u8 = 0b10;
}

/// FLASH_SR
#[bitfield_struct::bitfield(u32, order = Lsb)]
pub struct FlashSr {
    /// End of operation
    pub eop: bool,
    pub operr: bool,
    #[bits(2)]
    _r0: u8,
    /// Write protection error
    pub wrperr: bool,
    /// Programming alignment error
    pub pgaerr: bool,
    /// Programming parallelism error
    pub pgperr: bool,
    /// Programming sequence error
    pub pgserr: bool,
    /// Read protection error
    pub rderr: bool,
    #[bits(7)]
    _r1: u8,
    pub bsy: bool,
    #[bits(15)]
    _r2: u16,
}

impl FlashSr {
    /// Every write-one-to-clear error flag.
    pub const ERRORS: FlashSr = FlashSr::new()
        .with_operr(true)
        .with_wrperr(true)
        .with_pgaerr(true)
        .with_pgperr(true)
        .with_pgserr(true)
        .with_rderr(true);

    pub fn read_error(&self) -> bool {
        self.rderr()
    }

    pub fn program_error(&self) -> bool {
        self.operr() || self.wrperr() || self.pgaerr() || self.pgperr() || self.pgserr()
    }

    pub fn has_error(&self) -> bool {
        self.into_bits() & Self::ERRORS.into_bits() != 0
    }
}

/// Everything the flasher needs to know about a target family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetConfig {
    pub name: &'static str,
    pub flash: FlashRegisterSet,
    pub sectors: SectorMap,
    /// Expected DP IDCODE; only the low 12 bits are compared.
    pub idcode: u32,
    /// MEM-AP CSW used for word accesses
    pub csw: Csw,
}

impl TargetConfig {
    pub const IDCODE_MASK: u32 = 0xFFF;

    /// STM32F407
    pub const STM32F4: TargetConfig = TargetConfig {
        name: "STM32F4",
        flash: FlashRegisterSet {
            keyr: 0x4002_3C04,
            sr: 0x4002_3C0C,
            cr: 0x4002_3C10,
            ar: 0x4002_3C14,
            key1: 0x4567_0123,
            key2: 0xCDEF_89AB,
        },
        sectors: SectorMap {
            base: 0x0800_0000,
            sector_size: 0x1_0000,
            sector_count: 12,
        },
        idcode: 0x2BA0_1477,
        csw: Csw::WORD,
    };

    pub fn idcode_matches(&self, idcode: u32) -> bool {
        idcode & Self::IDCODE_MASK == self.idcode & Self::IDCODE_MASK
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self::STM32F4
    }
}
