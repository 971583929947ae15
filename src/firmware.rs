//! Loading, checking, and packetizing firmware images.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info, warn};
use md5::{Digest, Md5};
use thiserror::Error;

use crate::crc;

/// Images above this size are refused. This is host policy, not a wire
/// limit; resident bootloaders for parts this crate targets never carry
/// more flash than this.
pub const MAX_IMAGE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("no firmware file selected")]
    EmptyPath,
    #[error("failed to read firmware file: {0}")]
    Io(#[from] std::io::Error),
    #[error("firmware file is empty")]
    EmptyFile,
    #[error("firmware file of {0} bytes exceeds the {MAX_IMAGE_SIZE}-byte limit")]
    Oversize(usize),
    #[error("fragment size must be positive")]
    InvalidFragmentSize,
    #[error("fragment index {index} out of range ({total} fragments)")]
    FragmentOutOfRange { index: u32, total: u32 },
    #[error("no firmware image loaded")]
    NoImage,
    #[error("firmware image failed validation: {0}")]
    Corrupted(&'static str),
}

/// A loaded firmware image. Immutable once published by
/// [`FirmwareStore::load`]; destroyed by [`FirmwareStore::clear`] or by
/// loading another image over it.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    file_name: String,
    path: PathBuf,
    data: Vec<u8>,
    modified: Option<SystemTime>,
    digest: String,
    crc32: u32,
    fragment_size: usize,
    fragment_crcs: BTreeMap<u32, u32>,
    app_address: u32,
    valid: bool,
}

impl FirmwareImage {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    /// The whole-image digest as lowercase hex.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn app_address(&self) -> u32 {
        self.app_address
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn fragment_count(&self) -> u32 {
        self.data.len().div_ceil(self.fragment_size) as u32
    }

    pub fn fragment_crc(&self, index: u32) -> Option<u32> {
        self.fragment_crcs.get(&index).copied()
    }

    /// Builds the upload payload for fragment `index`:
    ///
    /// ```text
    /// index:4 LE | total:4 LE | data[..] | crc32:4 LE
    /// ```
    ///
    /// The final fragment's data portion is shorter than the fragment size
    /// when the image length is not an integer multiple of it.
    pub fn build_fragment(&self, index: u32) -> Result<Vec<u8>, FirmwareError> {
        let total = self.fragment_count();
        let crc = self
            .fragment_crc(index)
            .ok_or(FirmwareError::FragmentOutOfRange { index, total })?;

        let start = index as usize * self.fragment_size;
        let end = (start + self.fragment_size).min(self.data.len());
        let data = &self.data[start..end];

        let mut payload = Vec::with_capacity(12 + data.len());
        payload.extend_from_slice(&index.to_le_bytes());
        payload.extend_from_slice(&total.to_le_bytes());
        payload.extend_from_slice(data);
        payload.extend_from_slice(&crc.to_le_bytes());

        Ok(payload)
    }

    /// Recomputes the digest, the whole-image CRC, and every fragment CRC
    /// from the in-memory buffer and compares them against the stored
    /// values. Logs the first failing check; never mutates the image.
    pub fn validate(&self) -> Result<(), FirmwareError> {
        if hex_digest(&self.data) != self.digest {
            warn!("{}: image digest mismatch", self.file_name);
            return Err(FirmwareError::Corrupted("digest mismatch"));
        }
        if !crc::verify(&self.data, self.crc32) {
            warn!("{}: whole-image CRC mismatch", self.file_name);
            return Err(FirmwareError::Corrupted("whole-image CRC mismatch"));
        }
        for (index, expected) in &self.fragment_crcs {
            let start = *index as usize * self.fragment_size;
            let end = (start + self.fragment_size).min(self.data.len());
            if !crc::verify(&self.data[start..end], *expected) {
                warn!("{}: CRC mismatch in fragment {}", self.file_name, index);
                return Err(FirmwareError::Corrupted("fragment CRC mismatch"));
            }
        }

        debug!("{}: image validation passed", self.file_name);
        Ok(())
    }

    /// A cloneable summary for event subscribers; the raw buffer stays here.
    pub fn meta(&self) -> FirmwareMeta {
        FirmwareMeta {
            file_name: self.file_name.clone(),
            size: self.data.len(),
            digest: self.digest.clone(),
            crc32: self.crc32,
            fragment_size: self.fragment_size,
            fragment_count: self.fragment_count(),
            app_address: self.app_address,
        }
    }
}

/// Descriptor of a loaded image, published on the event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareMeta {
    pub file_name: String,
    pub size: usize,
    pub digest: String,
    pub crc32: u32,
    pub fragment_size: usize,
    pub fragment_count: u32,
    pub app_address: u32,
}

/// Owns at most one loaded image. Single-writer: `load` and `clear`
/// mutate, everything else reads.
#[derive(Debug, Default)]
pub struct FirmwareStore {
    image: Option<FirmwareImage>,
}

impl FirmwareStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(&self) -> Option<&FirmwareImage> {
        self.image.as_ref()
    }

    pub fn clear(&mut self) {
        if let Some(image) = self.image.take() {
            info!("cleared firmware image {}", image.file_name);
        }
    }

    /// Reads the file at `path` into memory, computes its integrity data,
    /// and publishes the resulting image.
    pub fn load(
        &mut self,
        path: impl AsRef<Path>,
        fragment_size: usize,
        app_address: u32,
    ) -> Result<&FirmwareImage, FirmwareError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(FirmwareError::EmptyPath);
        }
        if fragment_size == 0 {
            return Err(FirmwareError::InvalidFragmentSize);
        }

        let data = fs::read(path)?;
        if data.is_empty() {
            return Err(FirmwareError::EmptyFile);
        }
        if data.len() > MAX_IMAGE_SIZE {
            return Err(FirmwareError::Oversize(data.len()));
        }

        let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        info!("read firmware file {:?}: {} bytes", path, data.len());

        let digest = hex_digest(&data);
        debug!("image digest: {digest}");

        let crc32 = crc::checksum(&data);
        debug!("image CRC32: {crc32:#010x}");

        let fragment_crcs = crc::fragment_checksums(&data, fragment_size);
        debug!(
            "computed {} fragment checksums ({} bytes each)",
            fragment_crcs.len(),
            fragment_size,
        );

        Ok(self.image.insert(FirmwareImage {
            file_name,
            path: path.to_path_buf(),
            data,
            modified,
            digest,
            crc32,
            fragment_size,
            fragment_crcs,
            app_address,
            valid: true,
        }))
    }
}

/// MD5 of `data` as lowercase hex without separators.
pub fn hex_digest(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    digest.iter().fold(
        String::with_capacity(digest.len() * 2),
        |mut hex, byte| {
            // Infallible for String.
            let _ = write!(hex, "{byte:02x}");
            hex
        },
    )
}
