//! Encrypted firmware images as distributed for the chargers.
//!
//! An image starts with eight little endian `u32` header words followed by the
//! body, encrypted with a running XOR key. The second header word doubles as the
//! embedded checksum and the initial key.

use crate::codec::checksum32;
use std::fmt;
use std::path::Path;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const HEADER_LENGTH: usize = 32;
const BLOCK_LENGTH: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    #[error("firmware header needs {HEADER_LENGTH} bytes, image has {0}")]
    HeaderTooShort(usize),
    #[error("cannot read firmware image: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ImageHeader {
    pub key: u32,
    pub embedded_checksum: u32,
    pub app_storage_offset: u32,
    pub data_storage_offset: u32,
    pub app_size: u32,
    pub data_size: u32,
    pub initial_baud_rate: u32,
    pub fast_baud_rate: u32,
}

impl ImageHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, FirmwareError> {
        if bytes.len() < HEADER_LENGTH {
            log::warn!(
                "Invalid firmware header size - required={} received={}",
                HEADER_LENGTH,
                bytes.len()
            );
            return Err(FirmwareError::HeaderTooShort(bytes.len()));
        }
        let word = |index: usize| {
            let offset = index * BLOCK_LENGTH;
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        Ok(Self {
            key: word(0),
            embedded_checksum: word(1),
            app_storage_offset: word(2),
            data_storage_offset: word(3),
            app_size: word(4),
            data_size: word(5),
            initial_baud_rate: word(6),
            fast_baud_rate: word(7),
        })
    }
}

/// Flash area and checksum the bootloader compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FlashRegion {
    pub offset: u32,
    pub size: u32,
    pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedImage {
    pub header: ImageHeader,
    pub body: Vec<u8>,
    pub calculated_checksum: u32,
}

impl DecryptedImage {
    pub fn checksum_matches(&self) -> bool {
        self.calculated_checksum == self.header.embedded_checksum
    }

    pub fn flash_region(&self) -> FlashRegion {
        FlashRegion {
            offset: self.header.app_storage_offset,
            size: self.header.app_size,
            checksum: self.calculated_checksum,
        }
    }
}

impl fmt::Display for DecryptedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = &self.header;
        writeln!(f, "Embedded checksum:   {:#x}", header.embedded_checksum)?;
        writeln!(f, "Calculated checksum: {:#x}", self.calculated_checksum)?;
        writeln!(
            f,
            "Checksum {}",
            if self.checksum_matches() { "OK" } else { "wrong" }
        )?;
        writeln!(f, "App storage offset:  {:#x}", header.app_storage_offset)?;
        writeln!(f, "App size:            {} bytes", header.app_size)?;
        writeln!(f, "Data storage offset: {:#x}", header.data_storage_offset)?;
        writeln!(f, "Data size:           {} bytes", header.data_size)?;
        writeln!(f, "Initial baud rate:   {}", header.initial_baud_rate)?;
        write!(f, "Fast baud rate:      {}", header.fast_baud_rate)
    }
}

/// Decrypts the body of `image`. A trailing partial block is dropped.
pub fn decrypt(image: &[u8]) -> Result<DecryptedImage, FirmwareError> {
    let header = ImageHeader::parse(image)?;
    let key1 = header.key;
    let mut key2 = header.embedded_checksum;
    let blocks = image[HEADER_LENGTH..].chunks_exact(BLOCK_LENGTH);
    if !blocks.remainder().is_empty() {
        log::debug!(
            "Ignoring {} trailing bytes of the firmware image",
            blocks.remainder().len()
        );
    }

    let words = blocks
        .map(|block| {
            let word = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) ^ key2;
            key2 = key2.wrapping_add(key1) ^ key1;
            word
        })
        .collect::<Vec<_>>();
    let calculated_checksum = checksum32(words.iter().copied());
    let body = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    Ok(DecryptedImage {
        header,
        body,
        calculated_checksum,
    })
}

pub fn inspect_file(path: impl AsRef<Path>) -> Result<DecryptedImage, FirmwareError> {
    let image = std::fs::read(path)?;
    decrypt(&image)
}
