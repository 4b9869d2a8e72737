//! CRC32C header and data digest support
//!
//! RFC 3720 Section 12.1 - HeaderDigest and DataDigest negotiate the
//! CRC32C (Castagnoli) checksum. The 32-bit CRC is transmitted least
//! significant byte first, immediately after the segment it covers.

use crc::{Crc, CRC_32_ISCSI};

/// Digest size on the wire in bytes
pub const DIGEST_SIZE: usize = 4;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Compute the header digest over a 48-byte BHS (plus any AHS bytes)
pub fn header_digest(header: &[u8]) -> u32 {
    CASTAGNOLI.checksum(header)
}

/// Compute the data digest over a data segment and its 0-3 pad bytes
pub fn data_digest(data: &[u8], pad: &[u8]) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    digest.update(data);
    digest.update(pad);
    digest.finalize()
}

/// Encode a digest in wire order
pub fn digest_to_wire(crc: u32) -> [u8; DIGEST_SIZE] {
    crc.to_le_bytes()
}

/// Decode a digest received from the wire
pub fn digest_from_wire(bytes: [u8; DIGEST_SIZE]) -> u32 {
    u32::from_le_bytes(bytes)
}

/// Check a received header digest. Pure comparison; the caller decides
/// whether to resynchronize on mismatch.
pub fn verify_header_digest(header: &[u8], received: [u8; DIGEST_SIZE]) -> bool {
    header_digest(header) == digest_from_wire(received)
}

/// Check a received data digest covering the data segment and padding
pub fn verify_data_digest(data: &[u8], pad: &[u8], received: [u8; DIGEST_SIZE]) -> bool {
    data_digest(data, pad) == digest_from_wire(received)
}
