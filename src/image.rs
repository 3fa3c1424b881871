//! Firmware images and the erase, program, verify sequence.

use eh1::delay::DelayNs;
use std::{ops::Range, path::Path};

use crate::{
    flash::{FlashDriver, FlashError},
    swd::MemoryAccess,
};

/// Value of erased flash, used to pad the last word.
pub const FILL_BYTE: u8 = 0xFF;

/// Raw firmware, padded to whole 32-bit words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Vec<u8>,
    original_len: usize,
}

impl FirmwareImage {
    pub fn new(mut bytes: Vec<u8>) -> Self {
        let original_len = bytes.len();
        bytes.resize(original_len.next_multiple_of(4), FILL_BYTE);
        Self {
            bytes,
            original_len,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlashError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| FlashError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Read {} bytes from {}", bytes.len(), path.display());
        Ok(Self::new(bytes))
    }

    /// Padded length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn original_len(&self) -> usize {
        self.original_len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// `(byte offset, little-endian word)` pairs.
    pub fn words(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.bytes
            .chunks_exact(4)
            .enumerate()
            .map(|(i, w)| (i * 4, u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
    }
}

/// Erases the sectors under the image, programs it, locks the controller and
/// reads everything back. Returns the erased sector indexes.
pub fn load<M: MemoryAccess, D: DelayNs>(
    driver: &mut FlashDriver<'_, M, D>,
    image: &FirmwareImage,
    base: u32,
) -> Result<Range<u32>, FlashError> {
    let sectors = driver.erase_range(base, image.len())?;
    driver.program(base, image)?;
    driver.lock()?;
    driver.verify(base, image)?;
    Ok(sectors)
}
