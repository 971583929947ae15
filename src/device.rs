//! The device report returned when the target enters boot mode.

use std::fmt;
use std::str::Utf8Error;

use thiserror::Error;

/// Exact size of the boot report payload.
pub const DEVICE_INFO_LEN: usize = 60;

const MODEL_FIELD_LEN: usize = 32;
const VERSION_FIELD_LEN: usize = 16;

/// Fixed 60-byte little-endian record carried in the payload of an
/// enter-boot reply.
///
/// Layout: `model:32 | flash_size:4 | app_address:4 | fragment_size:4 |
/// boot_version:16`. Both string fields are zero-padded UTF-8; trailing
/// NULs are stripped on decode and restored on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: String,
    pub flash_size: u32,
    pub app_address: u32,
    /// The fragment size the bootloader would prefer uploads to use.
    pub fragment_size: u32,
    pub boot_version: String,
}

impl DeviceInfo {
    pub fn decode(data: &[u8]) -> Result<Self, DeviceInfoError> {
        if data.len() != DEVICE_INFO_LEN {
            return Err(DeviceInfoError::WrongLength(data.len()));
        }

        let model = padded_str(&data[0..32])?.to_string();
        let flash_size = u32_le(&data[32..36]);
        let app_address = u32_le(&data[36..40]);
        let fragment_size = u32_le(&data[40..44]);
        let boot_version = padded_str(&data[44..60])?.to_string();

        Ok(Self {
            model,
            flash_size,
            app_address,
            fragment_size,
            boot_version,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, DeviceInfoError> {
        let mut data = vec![0u8; DEVICE_INFO_LEN];

        write_padded(&mut data[0..32], &self.model, MODEL_FIELD_LEN)?;
        data[32..36].copy_from_slice(&self.flash_size.to_le_bytes());
        data[36..40].copy_from_slice(&self.app_address.to_le_bytes());
        data[40..44].copy_from_slice(&self.fragment_size.to_le_bytes());
        write_padded(&mut data[44..60], &self.boot_version, VERSION_FIELD_LEN)?;

        Ok(data)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (flash {} B, app @ {:#010x}, fragment {} B, bootloader {})",
            self.model, self.flash_size, self.app_address, self.fragment_size, self.boot_version,
        )
    }
}

/// The string content of a zero-padded field, trailing NULs stripped.
fn padded_str(field: &[u8]) -> Result<&str, Utf8Error> {
    let end = field
        .iter()
        .position(|byte| *byte == 0)
        .unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
}

fn write_padded(field: &mut [u8], value: &str, max: usize) -> Result<(), DeviceInfoError> {
    let bytes = value.as_bytes();
    if bytes.len() > max {
        return Err(DeviceInfoError::StringTooLong {
            len: bytes.len(),
            max,
        });
    }
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceInfoError {
    #[error("device info payload must be {DEVICE_INFO_LEN} bytes, got {0}")]
    WrongLength(usize),
    #[error("device info string is not valid UTF-8: {0}")]
    InvalidString(#[from] Utf8Error),
    #[error("string of {len} bytes does not fit a {max}-byte field")]
    StringTooLong { len: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeviceInfo {
        DeviceInfo {
            model: "DEV-X".to_string(),
            flash_size: 128 * 1024,
            app_address: 0x0800_0000,
            fragment_size: 1024,
            boot_version: "v1.2.3".to_string(),
        }
    }

    #[test]
    fn decode_boot_report() {
        let mut data = vec![0u8; DEVICE_INFO_LEN];
        data[0..5].copy_from_slice(b"DEV-X");
        data[32..36].copy_from_slice(&[0x00, 0x00, 0x02, 0x00]);
        data[36..40].copy_from_slice(&[0x00, 0x00, 0x00, 0x08]);
        data[40..44].copy_from_slice(&[0x00, 0x04, 0x00, 0x00]);
        data[44..50].copy_from_slice(b"v1.2.3");

        assert_eq!(DeviceInfo::decode(&data).unwrap(), sample());
    }

    #[test]
    fn encode_restores_padding() {
        let encoded = sample().encode().unwrap();

        assert_eq!(encoded.len(), DEVICE_INFO_LEN);
        assert_eq!(&encoded[0..5], b"DEV-X");
        assert!(encoded[5..32].iter().all(|byte| *byte == 0));
        assert_eq!(DeviceInfo::decode(&encoded).unwrap(), sample());
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert_eq!(
            DeviceInfo::decode(&[0u8; 59]),
            Err(DeviceInfoError::WrongLength(59)),
        );
    }

    #[test]
    fn encode_rejects_oversize_model() {
        let mut info = sample();
        info.model = "X".repeat(33);
        assert_eq!(
            info.encode(),
            Err(DeviceInfoError::StringTooLong { len: 33, max: 32 }),
        );
    }

    #[test]
    fn display_names_the_load_address() {
        let line = sample().to_string();
        assert!(line.contains("DEV-X"));
        assert!(line.contains("0x08000000"));
        assert!(line.contains("1024"));
    }
}
