//! GCF firmware container parsing.
//!
//! Layout (little-endian):
//!
//! ```text
//! bytes  0..3  : magic           U32 = 0xCAFEFEED
//! byte   4     : file type       U8
//! bytes  5..8  : target address  U32
//! bytes  9..12 : payload size    U32
//! byte   13    : crc8            U8 (Dallas CRC-8, passed through as-is)
//! ```
//!
//! File type 90 appends a CRC32 after the header and shifts the payload
//! to offset 18. File type 60 (encrypted app images for newer products)
//! keeps offset 14 but starts the payload with an inner image header
//! that carries the CRC32.

use crate::bytes::ByteReader;
use crate::error::{Error, Result};

pub const GCF_MAGIC: u32 = 0xCAFEFEED;
pub const GCF_HEADER_SIZE: usize = 14;
pub const MAX_GCF_FILE_SIZE: usize = 1024 * 800;

pub const FLASH_TYPE_APP_ENCRYPTED: u8 = 60;
pub const FLASH_TYPE_APP_ENCRYPTED_2: u8 = 90;

/// A loaded and validated firmware file.
pub struct GcfFile {
    name: String,
    content: Vec<u8>,
    fw_version: u32,
    file_type: u8,
    target_address: u32,
    payload_size: u32,
    crc8: u8,
    crc32: u32,
    data_offset: usize,
}

impl GcfFile {
    pub fn parse(name: &str, content: Vec<u8>) -> Result<Self> {
        if content.len() > MAX_GCF_FILE_SIZE {
            return Err(Error::FileTooLarge(MAX_GCF_FILE_SIZE));
        }
        if content.len() < GCF_HEADER_SIZE {
            return Err(Error::FileTooShort);
        }

        let fw_version = fw_version_from_name(name);

        let mut r = ByteReader::new(&content);
        let magic = r.get_u32();
        let file_type = r.get_u8();
        let target_address = r.get_u32();
        let payload_size = r.get_u32();
        let crc8 = r.get_u8();

        log::debug!(
            "GCF header: magic: {magic:#010X}, type: {file_type}, \
             address: {target_address:#010X}, data.size: {payload_size}"
        );

        let mut crc32 = 0;
        let mut data_offset = GCF_HEADER_SIZE;

        if file_type == FLASH_TYPE_APP_ENCRYPTED {
            // inner image header, the CRC32 covers the whole container
            let product = r.get_u32();
            let _total_size = r.get_u32();
            let _image_size = r.get_u32();
            let image_type = r.get_u32();
            let image_target = r.get_u32();
            let image_plain_size = r.get_u32();
            crc32 = r.get_u32();

            log::debug!(
                "GCF image header: product: {product:#010X}, img.type: {image_type}, \
                 img.address: {image_target:#010X}, img.data.size: {image_plain_size}, \
                 crc32: {crc32:#010X}"
            );
        } else if file_type == FLASH_TYPE_APP_ENCRYPTED_2 {
            // CRC32 is part of the header but not counted in payload_size
            crc32 = r.get_u32();
            data_offset = GCF_HEADER_SIZE + 4;
        }

        if magic != GCF_MAGIC {
            return Err(Error::BadMagic(magic));
        }

        // a file shorter than data_offset (truncated type 90 header)
        // must fail the same way as a wrong declared size
        let actual = content.len().checked_sub(data_offset);
        if actual != Some(payload_size as usize) {
            return Err(Error::SizeMismatch {
                declared: payload_size,
                actual: actual.unwrap_or(0) as u32,
            });
        }

        Ok(GcfFile {
            name: name.to_string(),
            content,
            fw_version,
            file_type,
            target_address,
            payload_size,
            crc8,
            crc32,
            data_offset,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fw_version(&self) -> u32 {
        self.fw_version
    }

    pub fn file_type(&self) -> u8 {
        self.file_type
    }

    pub fn target_address(&self) -> u32 {
        self.target_address
    }

    pub fn payload_size(&self) -> u32 {
        self.payload_size
    }

    pub fn crc8(&self) -> u8 {
        self.crc8
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    /// Payload bytes `[offset, offset + length)` relative to the data
    /// offset, as served to bootloader data requests.
    pub fn payload(&self, offset: usize, length: usize) -> &[u8] {
        &self.content[self.data_offset + offset..self.data_offset + offset + length]
    }
}

/// Extracts the firmware version from a file name: the first `0x`
/// prefixed hex literal, e.g. `deCONZ_ConBeeII_0x26780700.bin.GCF`.
/// Returns 0 when the name carries none.
fn fw_version_from_name(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut version: u32 = 0;

    for i in 0..bytes.len() {
        if bytes[i] == b'0' && i + 1 < bytes.len() && bytes[i + 1] == b'x' {
            for &ch in &bytes[i + 2..] {
                let nibble = match ch {
                    b'0'..=b'9' => ch - b'0',
                    b'a'..=b'f' => ch - b'a' + 10,
                    b'A'..=b'F' => ch - b'A' + 10,
                    _ => break,
                };
                version = (version << 4) | u32::from(nibble);
            }
            break;
        }
    }

    version
}
