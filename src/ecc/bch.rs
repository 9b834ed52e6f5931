//! Bose-Chaudhuri-Hocquenghem error correcting codes, as described in:
//!
//! Hocquenghem, A. (September 1959), "Codes correcteurs d'erreurs",
//! Chiffres (in French) (Paris) 2: 147–156
//!
//! Bose, R. C.; Ray-Chaudhuri, D. K. (March 1960), "On A Class of Error
//! Correcting Binary Group Codes", Information and Control 3 (1): 68–79
//!
//! Codewords are built over the *complement* of the data, and the parity
//! bytes are stored complemented, so that an erased (all-0xFF) chunk with
//! erased parity verifies clean.

use super::gf13::{self, Elem};

const MAX_SYNS: usize = 8;
const MAX_POLY: usize = MAX_SYNS * 2;

/// Maximum number of parity bytes any of the provided codes needs.
pub const MAX_ECC: usize = 7;

/// Chunk size limit: chunk bits plus parity bits must stay below the
/// order of the Galois field. Smaller chunks are fine.
pub const MAX_CHUNK_SIZE: usize = 1023 - MAX_ECC;

/// One member of the BCH code family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BchCode {
    /// Number of syndromes computed when decoding.
    syns: usize,

    /// Generator polynomial, in reciprocal form: the LSB is the
    /// highest-order term.
    generator: u64,

    /// Degree of the generator.
    degree: u32,

    /// Number of parity bytes.
    ecc_bytes: usize,
}

/// Corrects 1 flipped bit per chunk with 2 parity bytes.
pub const BCH_1BIT: BchCode = BchCode {
    syns: 2,
    generator: 0x201B,
    degree: 13,
    ecc_bytes: 2,
};

/// Corrects 2 flipped bits per chunk with 4 parity bytes.
pub const BCH_2BIT: BchCode = BchCode {
    syns: 4,
    generator: 0x4D5154B,
    degree: 26,
    ecc_bytes: 4,
};

/// Corrects 3 flipped bits per chunk with 5 parity bytes.
pub const BCH_3BIT: BchCode = BchCode {
    syns: 6,
    generator: 0xBAF5B2BDED,
    degree: 39,
    ecc_bytes: 5,
};

/// Corrects 4 flipped bits per chunk with 7 parity bytes.
pub const BCH_4BIT: BchCode = BchCode {
    syns: 8,
    generator: 0x14523043AB86AB,
    degree: 52,
    ecc_bytes: 7,
};

/// Add `src` scaled by `c` and shifted by `shift` into `dst`.
fn poly_add(dst: &mut [Elem; MAX_POLY], src: &[Elem; MAX_POLY], c: Elem, shift: i32) {
    for i in 0..MAX_POLY {
        let p = i as i32 + shift;
        let v = src[i];

        if !(0..MAX_POLY as i32).contains(&p) || v == 0 {
            continue;
        }

        dst[p as usize] ^= gf13::mul(v, c);
    }
}

fn poly_eval(s: &[Elem; MAX_POLY], x: Elem) -> Elem {
    let mut sum: Elem = 0;
    let mut t = x;

    for &c in s {
        if c != 0 {
            sum ^= gf13::mul(c, t);
        }
        t = gf13::mul(t, x);
    }

    sum
}

/// Find the error locator polynomial for the given syndrome vector.
fn berlekamp_massey(syns: &[Elem]) -> [Elem; MAX_POLY] {
    let mut c = [0 as Elem; MAX_POLY];
    let mut b = [0 as Elem; MAX_POLY];
    let mut l = 0usize;
    let mut m = 1i32;
    let mut scale: Elem = 1;

    c[0] = 1;
    b[0] = 1;

    for n in 0..syns.len() {
        let mut d = syns[n];
        for i in 1..=l {
            if c[i] != 0 && syns[n - i] != 0 {
                d ^= gf13::mul(c[i], syns[n - i]);
            }
        }

        let mult = gf13::div(d, scale);

        if d == 0 {
            m += 1;
        } else if l * 2 <= n {
            let t = c;
            poly_add(&mut c, &b, mult, m);
            b = t;
            l = n + 1 - l;
            scale = d;
            m = 1;
        } else {
            poly_add(&mut c, &b, mult, m);
            m += 1;
        }
    }

    c
}

impl BchCode {
    /// Number of parity bytes this code appends to a chunk.
    pub fn ecc_bytes(&self) -> usize {
        self.ecc_bytes
    }

    /// Number of flipped bits this code can correct per chunk.
    pub fn correctable_bits(&self) -> usize {
        self.syns / 2
    }

    /// Divide the (complemented) chunk by the generator.
    fn chunk_remainder(&self, chunk: &[u8]) -> u64 {
        let mut rem: u64 = 0;

        for &byte in chunk {
            rem ^= u64::from(byte ^ 0xFF);

            for _ in 0..8 {
                if rem & 1 != 0 {
                    rem ^= self.generator;
                }
                rem >>= 1;
            }
        }

        rem
    }

    fn pack_poly(&self, poly: u64, ecc: &mut [u8]) {
        let mut p = poly;
        for byte in ecc[..self.ecc_bytes].iter_mut() {
            *byte = !(p as u8);
            p >>= 8;
        }
    }

    fn unpack_poly(&self, ecc: &[u8]) -> u64 {
        let mut poly: u64 = 0;
        for &byte in ecc[..self.ecc_bytes].iter().rev() {
            poly = (poly << 8) | u64::from(byte ^ 0xFF);
        }
        poly & ((1u64 << self.degree) - 1)
    }

    /// Generate parity for `chunk` into `ecc[..self.ecc_bytes()]`.
    pub fn generate(&self, chunk: &[u8], ecc: &mut [u8]) {
        self.pack_poly(self.chunk_remainder(chunk), ecc);
    }

    /// Check a chunk against its stored parity. Much cheaper than
    /// computing syndromes; run it first, and again after
    /// [`repair`](Self::repair) to detect an uncorrectable chunk.
    pub fn verify(&self, chunk: &[u8], ecc: &[u8]) -> bool {
        self.chunk_remainder(chunk) == self.unpack_poly(ecc)
    }

    /// Evaluate the received codeword (chunk plus remainder) at `x`.
    fn syndrome(&self, chunk: &[u8], remainder: u64, x: Elem) -> Elem {
        let mut y: Elem = 0;
        let mut t: Elem = 1;

        for &byte in chunk {
            let mut c = byte ^ 0xFF;
            for _ in 0..8 {
                if c & 1 != 0 {
                    y ^= t;
                }
                c >>= 1;
                t = gf13::mul(t, x);
            }
        }

        let mut rem = remainder;
        for _ in 0..self.degree {
            if rem & 1 != 0 {
                y ^= t;
            }
            rem >>= 1;
            t = gf13::mul(t, x);
        }

        y
    }

    /// Correct errors in place, in both the chunk and the parity bytes.
    /// Does not report success: run [`verify`](Self::verify) afterwards.
    pub fn repair(&self, chunk: &mut [u8], ecc: &mut [u8]) {
        let remainder = self.unpack_poly(ecc);

        // Compute the syndrome vector
        let mut syns = [0 as Elem; MAX_SYNS];
        let mut x: Elem = 2;
        for syn in syns[..self.syns].iter_mut() {
            *syn = self.syndrome(chunk, remainder, x);
            x = gf13::mulx(x);
        }

        let sigma = berlekamp_massey(&syns[..self.syns]);

        // Each root of sigma corresponds to an error location; correct the
        // chunk data first, then the parity.
        let mut x: Elem = 1;
        for i in 0..chunk.len() * 8 {
            if poly_eval(&sigma, x) == 0 {
                chunk[i >> 3] ^= 1 << (i & 7);
            }
            x = gf13::divx(x);
        }

        for i in 0..self.degree as usize {
            if poly_eval(&sigma, x) == 0 {
                ecc[i >> 3] ^= 1 << (i & 7);
            }
            x = gf13::divx(x);
        }
    }
}
