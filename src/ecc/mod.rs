//! Error-correction codecs for NAND page data.
//!
//! These are building blocks for [`Nand`](crate::nand::Nand)
//! implementations, which own ECC entirely; the journal and map never see
//! a parity byte. All three codecs share the NAND-friendly property that a
//! fully erased chunk, stored parity included, verifies clean, so freshly
//! erased pages need no special-casing in a driver.
//!
//! - [`hamming`]: corrects 1 flipped bit and detects 2 per chunk of up to
//!   512 bytes, with 3 parity bytes. Cheap enough for small MCUs.
//! - [`bch`]: 1- to 4-bit correcting codes over GF(2^13) for chunks of up
//!   to 1016 bytes, matching the per-528-byte-sector requirements of
//!   typical SLC parts.
//! - [`crc32`]: error *detection* for integrators that let the controller
//!   correct and only need an integrity check.

pub mod bch;
pub mod crc32;
pub mod hamming;

mod gf13;
