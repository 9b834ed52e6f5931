//! The 132-byte per-sector metadata record.
//!
//! A record names the logical sector its page holds, followed by 32
//! alt-pointer entries: `alt[d]` is the journal page of the most recent
//! earlier record whose sector ID differs from this one's in exactly bit
//! `31 - d` and agrees on all higher bits. Together the alt vectors of the
//! journal's records form the radix trie the map walks.

use crate::journal::META_SIZE;
use crate::nand::PageIndex;

/// A logical sector number.
pub type SectorId = u32;

/// Number of alt-pointer levels: one per bit of the sector ID.
pub(super) const RADIX_DEPTH: usize = 32;

/// The ID carried by padding and garbage records.
pub(super) const SECTOR_NONE: SectorId = u32::MAX;

const PAGE_NONE: PageIndex = u32::MAX;

/// The sector ID bit distinguishing the two subtrees at `depth`.
pub(super) fn divergence_bit(depth: usize) -> u32 {
    1 << (RADIX_DEPTH - depth - 1)
}

pub(super) fn id(meta: &[u8; META_SIZE]) -> SectorId {
    u32::from_le_bytes(meta[0..4].try_into().unwrap())
}

pub(super) fn set_id(meta: &mut [u8; META_SIZE], id: SectorId) {
    meta[0..4].copy_from_slice(&id.to_le_bytes());
}

pub(super) fn alt(meta: &[u8; META_SIZE], depth: usize) -> Option<PageIndex> {
    let at = 4 + depth * 4;
    let raw = u32::from_le_bytes(meta[at..at + 4].try_into().unwrap());
    (raw != PAGE_NONE).then_some(raw)
}

pub(super) fn set_alt(meta: &mut [u8; META_SIZE], depth: usize, page: Option<PageIndex>) {
    let at = 4 + depth * 4;
    meta[at..at + 4].copy_from_slice(&page.unwrap_or(PAGE_NONE).to_le_bytes());
}
