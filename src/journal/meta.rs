//! The on-flash checkpoint metapage format.
//!
//! The last page of every checkpoint period is a *metapage*: a 16-byte
//! header, a small caller-owned cookie, then one 132-byte metadata record
//! per user page of the period, in period order, padded to the page size
//! with 0xFF.

use deku::prelude::*;

use crate::nand::PageIndex;

/// Number of bytes used by the checkpoint header.
pub const HEADER_SIZE: usize = 16;

/// Size of the caller-owned cookie region following the header.
pub const COOKIE_SIZE: usize = 4;

/// Size of the metadata record accompanying each user page. Independent of
/// the underlying page size.
pub const META_SIZE: usize = 132;

/// The fixed checkpoint header. Encodes to exactly [`HEADER_SIZE`] bytes:
/// the 3-byte magic, the epoch, then three little-endian u32 fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little", magic = b"Dha")]
pub(super) struct CheckpointHeader {
    pub epoch: u8,
    pub tail: PageIndex,
    pub bb_current: u32,
    pub bb_last: u32,
}

impl CheckpointHeader {
    /// Parse a header from the start of a metapage, verifying the magic.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let ((_, _), hdr) = Self::from_bytes((buf, 0)).ok()?;
        Some(hdr)
    }

    /// Write the header over the start of a metapage buffer.
    pub fn encode_into(&self, buf: &mut [u8]) {
        let bytes = self.to_bytes().unwrap();
        buf[..bytes.len()].copy_from_slice(&bytes);
    }
}

/// Byte offset of the metadata record for the `which`-th user page of a
/// period.
pub(super) fn user_offset(which: u32) -> usize {
    HEADER_SIZE + COOKIE_SIZE + which as usize * META_SIZE
}

/// Calculate a checkpoint period: the largest power of two such that the
/// header, the cookie and one record per user page all fit in a single
/// metapage, capped at one block.
pub(super) fn choose_ppc(log2_page_size: u8, max: u8) -> u8 {
    let max_meta = (1usize << log2_page_size) - HEADER_SIZE - COOKIE_SIZE;
    let mut total_meta = META_SIZE;
    let mut ppc = 1;

    while ppc < max {
        total_meta = total_meta * 2 + META_SIZE;
        if total_meta > max_meta {
            break;
        }
        ppc += 1;
    }

    ppc
}
