//! CRC-32 for NAND blocks.
//!
//! The polynomial is the IEEE 802.3 one, which has a Hamming distance of 4
//! over 4096-bit messages; see Koopman, "32-Bit Cyclic Redundancy Codes
//! for Internet Applications" (DSN 2002). The twist is that the
//! computation runs over inverted coefficients, chosen so that a fully
//! erased block, stored checksum bytes included, passes verification.

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;

    while i < 256 {
        let mut r = i as u32;
        let mut j = 0;
        while j < 8 {
            r = (r >> 1) ^ if r & 1 != 0 { 0xEDB8_8320 } else { 0 };
            j += 1;
        }
        table[i] = r;
        i += 1;
    }

    table
}

const TABLE: [u32; 256] = build_table();

/// The carry to pass when there is no previous checksum to chain from.
pub const CRC32_INIT: u32 = 0xFFFF_FFFF;

/// Checksum a block of data, optionally carrying a previous checksum.
///
/// A fully erased block checksums to `0xFFFFFFFF`, which is also its own
/// erased checksum field.
pub fn crc32_nand(block: &[u8], carry: u32) -> u32 {
    let mut r = !carry;

    for &b in block {
        r = (r >> 8) ^ TABLE[((r ^ u32::from(!b)) & 0xFF) as usize];
    }

    !r
}
