//! A single-error-correcting, double-error-detecting Hamming code.
//!
//! Three parity bytes cover a chunk of up to 512 bytes. The parity is
//! stored complemented, so an erased chunk with erased parity has a zero
//! syndrome.

use crate::error::Error;

const LOG2_CHUNK_SIZE: usize = 9;
const LOG2_CHUNK_BITS: usize = LOG2_CHUNK_SIZE + 3;

/// Largest chunk the code covers.
pub const MAX_CHUNK_SIZE: usize = 1 << LOG2_CHUNK_SIZE;

/// ECC size is fixed, independent of the chunk size.
pub const ECC_SIZE: usize = 3;

/// Parity of the chunk's bit-position subsets.
///
/// Partition the bits of the chunk into pairs of subsets (Pm, Pm'): bit
/// position i belongs to Pm if bit m of i is clear, to Pm' otherwise. The
/// result packs the subset parities as `...P3', P3, P2', P2, P1', P1, P0',
/// P0`.
///
/// This is a linear code: the parity of the difference of two chunks
/// equals the difference of their parities. Flipping the bit at position i
/// flips the parity of exactly one subset out of every pair, namely the one i
/// belongs to, so comparing which member of each pair changed recovers
/// every bit of i.
fn parity_scan(chunk: &[u8]) -> u32 {
    let mut column: u8 = 0;
    let mut line: u16 = 0;
    let mut line_bar: u16 = 0;
    let mut out: u32 = 0;

    for (i, &c) in chunk.iter().enumerate() {
        column ^= c;

        if c.count_ones() & 1 != 0 {
            line ^= i as u16;
            line_bar ^= !(i as u16);
        }
    }

    for _ in 0..LOG2_CHUNK_SIZE {
        out = (out << 1) | u32::from((line_bar >> 8) & 1);
        out = (out << 1) | u32::from((line >> 8) & 1);
        line <<= 1;
        line_bar <<= 1;
    }

    for mask in [0x0Fu8, 0xF0, 0x33, 0xCC, 0x55, 0xAA] {
        out = (out << 1) | ((column & mask).count_ones() & 1);
    }

    out ^ 0xFF_FFFF
}

/// Generate parity bytes for the given chunk.
pub fn generate(chunk: &[u8], ecc: &mut [u8; ECC_SIZE]) {
    let p = parity_scan(chunk);

    ecc[0] = p as u8;
    ecc[1] = (p >> 8) as u8;
    ecc[2] = (p >> 16) as u8;
}

/// Compare a chunk against its stored parity. Zero means the chunk is ok.
pub fn syndrome(chunk: &[u8], ecc: &[u8; ECC_SIZE]) -> u32 {
    let stored = u32::from(ecc[2]) << 16 | u32::from(ecc[1]) << 8 | u32::from(ecc[0]);

    parity_scan(chunk) ^ stored
}

/// Attempt to repair a chunk with a non-zero syndrome.
///
/// Fails with [`Error::Ecc`] when the syndrome is not consistent with a
/// single flipped bit.
pub fn repair(chunk: &mut [u8], syndrome: u32) -> Result<(), Error> {
    // There might be no error
    if syndrome == 0 {
        return Ok(());
    }

    // A single set bit is an error in the parity bytes themselves
    if syndrome & (syndrome - 1) == 0 {
        return Ok(());
    }

    // Otherwise, exactly one of every complementary pair of syndrome bits
    // must be set, and picking the Pm' members out spells the bit position.
    let mut pos = 0usize;
    let mut pos_bit = 1usize;
    let mut syn = syndrome;

    for _ in 0..LOG2_CHUNK_BITS {
        match syn & 3 {
            1 => pos |= pos_bit,
            2 => {}
            _ => return Err(Error::Ecc),
        }

        syn >>= 2;
        pos_bit <<= 1;
    }

    // Flip the bit back
    if (pos >> 3) < chunk.len() {
        chunk[pos >> 3] ^= 1 << (pos & 7);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const CHUNK_SIZE: usize = 512;
    const TEST_SIZE: usize = CHUNK_SIZE + ECC_SIZE;

    fn flip_test(rng: &mut StdRng, good: &[u8; TEST_SIZE]) {
        let mut bad = *good;
        let which = rng.random_range(0..TEST_SIZE * 8);
        bad[which >> 3] ^= 1 << (which & 7);

        let (chunk, ecc) = bad.split_at_mut(CHUNK_SIZE);
        let e = syndrome(chunk, ecc[..ECC_SIZE].try_into().unwrap());
        assert_ne!(e, 0);

        repair(chunk, e).unwrap();
        assert_eq!(&bad[..CHUNK_SIZE], &good[..CHUNK_SIZE]);
    }

    fn test_properties(rng: &mut StdRng, block: &[u8; TEST_SIZE]) {
        let ecc: &[u8; ECC_SIZE] = block[CHUNK_SIZE..].try_into().unwrap();
        assert_eq!(syndrome(&block[..CHUNK_SIZE], ecc), 0);

        for _ in 0..20 {
            flip_test(rng, block);
        }
    }

    #[test]
    fn erased_chunk_is_clean() {
        let mut rng = StdRng::seed_from_u64(0);
        let block = [0xFFu8; TEST_SIZE];
        test_properties(&mut rng, &block);
    }

    #[test]
    fn random_chunks_round_trip() {
        let mut rng = StdRng::seed_from_u64(0);

        for _ in 0..10 {
            let mut block = [0xFFu8; TEST_SIZE];
            rng.fill(&mut block[..CHUNK_SIZE]);

            let (chunk, ecc) = block.split_at_mut(CHUNK_SIZE);
            generate(chunk, ecc.try_into().unwrap());
            test_properties(&mut rng, &block);
        }
    }

    #[test]
    fn double_flip_is_detected() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut block = [0u8; TEST_SIZE];
        rng.fill(&mut block[..CHUNK_SIZE]);

        let (chunk, ecc) = block.split_at_mut(CHUNK_SIZE);
        generate(chunk, (&mut *ecc).try_into().unwrap());

        // Two flips in the same chunk: repairable it is not, but the
        // syndrome must not be silently zero.
        chunk[3] ^= 0x10;
        chunk[200] ^= 0x01;
        let e = syndrome(chunk, (&*ecc).try_into().unwrap());
        assert_ne!(e, 0);
    }
}
