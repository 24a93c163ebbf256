//! CRC32 checksum utilities.

use crc32fast::Hasher;

/// Compute CRC32 checksum of the given data.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verify that data matches expected CRC.
pub fn verify_crc(data: &[u8], expected: u32) -> bool {
    crc32(data) == expected
}
