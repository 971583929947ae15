use std::collections::BTreeMap;

use crc::{Algorithm, Crc};

/// The bootloader uses the common Ethernet CRC-32 (reflected 0x04C11DB7),
/// which is what the ST-style hardware CRC peripheral produces once input
/// and output reflection are enabled.
pub const BOOT_CRC32: Crc<u32> = Crc::<u32>::new(&Algorithm {
    width: 32,
    poly: 0x04C11DB7,
    init: 0xFFFFFFFF,
    refin: true,
    refout: true,
    xorout: 0xFFFFFFFF,
    check: 0xCBF43926,
    residue: 0xDEBB20E3,
});

/// CRC32 over an entire buffer.
///
/// An empty buffer checksums to 0 (the init and final-xor values cancel),
/// which callers use as a sentinel. 0 must not be treated as a valid CRC
/// for non-empty data.
pub fn checksum(data: &[u8]) -> u32 {
    BOOT_CRC32.checksum(data)
}

/// CRC32 over `len` bytes of `data` starting at `offset`.
///
/// The range is clamped to the buffer; a range that lies entirely outside
/// the buffer checksums to 0 like an empty input.
pub fn checksum_range(data: &[u8], offset: usize, len: usize) -> u32 {
    let start = offset.min(data.len());
    let end = offset.saturating_add(len).min(data.len());
    checksum(&data[start..end])
}

/// Computes the CRC32 of every fragment of `data` when carved into
/// `fragment_size`-byte pieces, keyed by 0-based fragment index.
///
/// `fragment_size` must be positive. The final fragment may be shorter
/// than `fragment_size`.
pub fn fragment_checksums(data: &[u8], fragment_size: usize) -> BTreeMap<u32, u32> {
    debug_assert!(fragment_size > 0);

    data.chunks(fragment_size)
        .enumerate()
        .map(|(index, chunk)| (index as u32, checksum(chunk)))
        .collect()
}

/// Checks a buffer against an expected CRC32.
pub fn verify(data: &[u8], expected: u32) -> bool {
    checksum(data) == expected
}
