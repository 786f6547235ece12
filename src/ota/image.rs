//! ESP-IDF application image layout.
//!
//! An app image starts with the image header, followed by the first segment
//! header, followed by the application descriptor. Only the fields the
//! updater needs are decoded; everything is read through length-checked
//! slices.

use heapless::String;

use super::error::{OtaError, Result};

pub const IMAGE_HEADER_LEN: usize = 24;
pub const SEGMENT_HEADER_LEN: usize = 8;
pub const APP_DESC_LEN: usize = 256;
/// Bytes that must be present before the descriptor can be read.
pub const MIN_HEADER_LEN: usize = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN + APP_DESC_LEN;

pub const IMAGE_MAGIC: u8 = 0xE9;
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;

// Offsets inside esp_app_desc_t
const DESC_SECURE_VERSION: usize = 4;
const DESC_VERSION: usize = 16;
const DESC_PROJECT_NAME: usize = 48;
const DESC_TIME: usize = 80;
const DESC_DATE: usize = 96;
const DESC_IDF_VER: usize = 112;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub segment_count: u8,
    pub entry_addr: u32,
    pub chip_id: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppDescriptor {
    pub secure_version: u32,
    pub version: String<32>,
    pub project_name: String<32>,
    pub time: String<16>,
    pub date: String<16>,
    pub idf_ver: String<32>,
}

/// Cursor over a byte slice that never reads past the end.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or(OtaError::ImageTooSmall {
                len: self.bytes.len(),
                required: offset.saturating_add(len),
            })
    }

    fn u8(&self, offset: usize) -> Result<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    fn u16_le(&self, offset: usize) -> Result<u16> {
        let b = self.slice(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&self, offset: usize) -> Result<u32> {
        let b = self.slice(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn c_str<const N: usize>(&self, offset: usize) -> Result<String<N>> {
        let raw = self.slice(offset, N)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(N);
        let mut out = String::new();
        for c in std::string::String::from_utf8_lossy(&raw[..end]).chars() {
            if out.push(c).is_err() {
                break;
            }
        }
        Ok(out)
    }
}

impl ImageHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let r = Reader::new(bytes);
        let magic = r.u8(0)?;
        if magic != IMAGE_MAGIC {
            return Err(OtaError::ImageCorrupted(format!(
                "bad image magic 0x{:02x}",
                magic
            )));
        }
        Ok(Self {
            segment_count: r.u8(1)?,
            entry_addr: r.u32_le(4)?,
            chip_id: r.u16_le(12)?,
        })
    }
}

impl AppDescriptor {
    /// Decode the descriptor embedded at the start of an app image.
    pub fn from_image(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_HEADER_LEN {
            return Err(OtaError::ImageTooSmall {
                len: bytes.len(),
                required: MIN_HEADER_LEN,
            });
        }
        ImageHeader::parse(bytes)?;
        Self::parse(&bytes[IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN..])
    }

    /// Decode a bare `esp_app_desc_t`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let r = Reader::new(bytes);
        let magic = r.u32_le(0)?;
        if magic != APP_DESC_MAGIC {
            return Err(OtaError::ImageCorrupted(format!(
                "bad app descriptor magic 0x{:08x}",
                magic
            )));
        }
        Ok(Self {
            secure_version: r.u32_le(DESC_SECURE_VERSION)?,
            version: r.c_str(DESC_VERSION)?,
            project_name: r.c_str(DESC_PROJECT_NAME)?,
            time: r.c_str(DESC_TIME)?,
            date: r.c_str(DESC_DATE)?,
            idf_ver: r.c_str(DESC_IDF_VER)?,
        })
    }

    /// Inverse of [`AppDescriptor::parse`]; used to fabricate images off-target.
    pub fn encode(&self) -> [u8; APP_DESC_LEN] {
        let mut out = [0u8; APP_DESC_LEN];
        out[0..4].copy_from_slice(&APP_DESC_MAGIC.to_le_bytes());
        out[DESC_SECURE_VERSION..DESC_SECURE_VERSION + 4]
            .copy_from_slice(&self.secure_version.to_le_bytes());
        put_c_str(&mut out[DESC_VERSION..DESC_VERSION + 32], &self.version);
        put_c_str(&mut out[DESC_PROJECT_NAME..DESC_PROJECT_NAME + 32], &self.project_name);
        put_c_str(&mut out[DESC_TIME..DESC_TIME + 16], &self.time);
        put_c_str(&mut out[DESC_DATE..DESC_DATE + 16], &self.date);
        put_c_str(&mut out[DESC_IDF_VER..DESC_IDF_VER + 32], &self.idf_ver);
        out
    }
}

fn put_c_str(dst: &mut [u8], s: &str) {
    // Leave room for the terminating NUL
    let n = s.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
}
