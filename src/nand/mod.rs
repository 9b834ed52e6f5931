//! Abstractions and code to access NAND flash

use crate::error::Error;

pub mod sim;

/// Index of a page on the device. Bits `[0..log2_ppb)` select the page
/// within its block; the bits above select the block.
pub type PageIndex = u32;

/// Index of an erase block on the device.
pub type BlockIndex = u32;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device.
///
/// Page and block sizes are held as base-2 logarithms; both are fixed
/// powers of two on real parts, and the journal's addressing arithmetic is
/// all shifts and masks over them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Geometry {
    /// log2 of the page size in bytes
    pub log2_page_size: u8,

    /// log2 of the number of pages per erase block
    pub log2_ppb: u8,

    /// Total number of erase blocks
    pub num_blocks: u32,
}

impl Geometry {
    /// Page size in bytes
    pub fn page_size(&self) -> usize {
        1 << self.log2_page_size
    }

    /// Pages per erase block
    pub fn pages_per_block(&self) -> u32 {
        1 << self.log2_ppb
    }

    /// Total number of pages on the device
    pub fn total_pages(&self) -> u32 {
        self.num_blocks << self.log2_ppb
    }

    /// The block containing `page`
    pub fn block_of(&self, page: PageIndex) -> BlockIndex {
        page >> self.log2_ppb
    }

    /// The first page of `block`
    pub fn first_page(&self, block: BlockIndex) -> PageIndex {
        block << self.log2_ppb
    }
}

/// Represents a NAND flash device.
///
/// The methods take `&mut self` throughout: even the query operations may
/// need driver-side state (command sequencing, caches, statistics), and the
/// journal owns its driver exclusively anyway.
///
/// Implementations report failures through [`Error`]: a failed program or
/// erase is [`Error::BadBlock`] (the journal reacts by relocating and
/// retiring the block), an uncorrectable read is [`Error::Ecc`].
pub trait Nand {
    /// Get the layout of the NAND
    fn geometry(&self) -> Geometry;

    /// Is the given block marked bad?
    ///
    /// Called frequently; must be cheap.
    fn is_bad(&mut self, blk: BlockIndex) -> bool;

    /// Persist a bad-block marker for `blk`. Idempotent.
    ///
    /// There is no way to react to a failure here, so none is reported.
    fn mark_bad(&mut self, blk: BlockIndex);

    /// Erase a block. After success, every page in the block is free.
    fn erase(&mut self, blk: BlockIndex) -> Result<(), Error>;

    /// Program a full page.
    ///
    /// Within a block, pages are programmed in strictly increasing order
    /// between erases (skipping pages forfeits the skipped pages), to
    /// comply with the sequential-write requirements of MLC parts.
    fn prog(&mut self, page: PageIndex, data: &[u8]) -> Result<(), Error>;

    /// Is the given page still unprogrammed?
    ///
    /// Only used while resuming; may read OOB data or use a heuristic.
    fn is_free(&mut self, page: PageIndex) -> bool;

    /// Read part of a page into `data[..length]`.
    fn read(
        &mut self,
        page: PageIndex,
        offset: usize,
        length: usize,
        data: &mut [u8],
    ) -> Result<(), Error>;

    /// Read a page from one location and program it at another.
    ///
    /// Logically read+prog, but a driver may route it through the chip's
    /// internal buffer. ECC must still be applied.
    fn copy(&mut self, src: PageIndex, dst: PageIndex) -> Result<(), Error>;
}
