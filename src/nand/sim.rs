//! A simulated in-memory NAND flash, for testing purposes.
//!
//! Beyond plain storage, the simulator models the failure behavior the
//! journal is built to survive: factory-marked bad blocks, blocks that fail
//! on first use, and "timebomb" blocks that fail after a set number of
//! operations. A failing program or erase scribbles deterministic garbage
//! over the affected range, like a real part losing a page mid-write.
//!
//! Misuse of the NAND contract (programming pages out of order, touching a
//! block that is marked bad, out-of-range indices) is a bug in the caller,
//! not a device condition, and panics.

use std::fmt;
use std::io::{Read, Write};

use rand::Rng;

use super::{BlockIndex, Geometry, Nand, PageIndex};
use crate::error::Error;

/// Fill `buf` with a reproducible byte sequence derived from `seed`.
///
/// Used for the garbage written by failing operations, and by tests to
/// generate and verify page payloads.
pub fn seq_fill(seed: u64, buf: &mut [u8]) {
    let mut state = seed;
    for chunk in buf.chunks_mut(8) {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        chunk.copy_from_slice(&z.to_le_bytes()[..chunk.len()]);
    }
}

/// Call counts, kept per simulator instance
#[derive(Debug, Default, Clone, Copy)]
pub struct SimStats {
    pub is_bad: u64,
    pub mark_bad: u64,
    pub erase: u64,
    pub erase_fail: u64,
    pub is_free: u64,
    pub prog: u64,
    pub prog_fail: u64,
    pub read: u64,
    pub read_bytes: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct SimBlock {
    /// Carries a persistent bad-block marker
    marked_bad: bool,

    /// Fails every program/erase from now on
    failed: bool,

    /// Index of the next unprogrammed page. 0 is a fully erased block,
    /// `pages_per_block` a fully programmed one.
    next_page: u32,

    /// If non-zero, the number of operations until permanent failure.
    timebomb: u32,
}

/// An in-memory NAND flash device with fault injection
#[derive(Debug, Clone)]
pub struct SimNand {
    geom: Geometry,
    blocks: Box<[SimBlock]>,
    data: Box<[u8]>,
    stats: SimStats,
    frozen: u32,
}

impl SimNand {
    /// Create a simulated device in its factory state: every page reads as
    /// uninitialized junk and counts as programmed, so nothing is usable
    /// until erased.
    pub fn new(geom: Geometry) -> Self {
        let mut sim = Self {
            geom,
            blocks: vec![SimBlock::default(); geom.num_blocks as usize].into_boxed_slice(),
            data: vec![0u8; geom.page_size() * geom.total_pages() as usize].into_boxed_slice(),
            stats: SimStats::default(),
            frozen: 0,
        };
        sim.reset();
        sim
    }

    /// Return to the factory state, clearing all injected faults and stats.
    pub fn reset(&mut self) {
        self.stats = SimStats::default();
        self.data.fill(0x55);
        for blk in self.blocks.iter_mut() {
            *blk = SimBlock {
                next_page: self.geom.pages_per_block(),
                ..SimBlock::default()
            };
        }
    }

    /// Make `blk` fail on its next program or erase.
    pub fn set_failed(&mut self, blk: BlockIndex) {
        self.blocks[blk as usize].failed = true;
    }

    /// Make `blk` fail permanently after `ttl` further operations.
    pub fn set_timebomb(&mut self, blk: BlockIndex, ttl: u32) {
        self.blocks[blk as usize].timebomb = ttl;
    }

    /// Create some factory-marked bad blocks.
    pub fn inject_bad<R: Rng>(&mut self, rng: &mut R, count: usize) {
        for _ in 0..count {
            let blk = rng.random_range(0..self.geom.num_blocks) as usize;
            self.blocks[blk].marked_bad = true;
            self.blocks[blk].failed = true;
        }
    }

    /// Create some unmarked bad blocks.
    pub fn inject_failed<R: Rng>(&mut self, rng: &mut R, count: usize) {
        for _ in 0..count {
            let blk = rng.random_range(0..self.geom.num_blocks);
            self.set_failed(blk);
        }
    }

    /// Arm timebombs on random blocks, each with a TTL in `1..=max_ttl`.
    pub fn inject_timebombs<R: Rng>(&mut self, rng: &mut R, count: usize, max_ttl: u32) {
        for _ in 0..count {
            let blk = rng.random_range(0..self.geom.num_blocks);
            let ttl = rng.random_range(1..=max_ttl);
            self.set_timebomb(blk, ttl);
        }
    }

    /// Halt counting of statistics (stackable with [`thaw`](Self::thaw)),
    /// so that test instrumentation doesn't pollute the counters.
    pub fn freeze(&mut self) {
        self.frozen += 1;
    }

    /// Resume counting of statistics.
    pub fn thaw(&mut self) {
        self.frozen -= 1;
    }

    /// Operation counters since the last [`reset`](Self::reset).
    pub fn stats(&self) -> SimStats {
        self.stats
    }

    /// Does `blk` carry a bad-block marker?
    ///
    /// Unlike [`Nand::is_bad`] this is an inspection hook: it neither
    /// counts against the stats nor requires `&mut`.
    pub fn is_marked_bad(&self, blk: BlockIndex) -> bool {
        self.blocks[blk as usize].marked_bad
    }

    /// Initialize the NAND contents from a stream, e.g. a dumped image.
    ///
    /// Every block is treated as fully programmed afterwards; injected
    /// faults and bad-block marks are cleared.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let block_size = self.geom.page_size() << self.geom.log2_ppb;
        for blk in 0..self.geom.num_blocks as usize {
            self.blocks[blk] = SimBlock {
                next_page: self.geom.pages_per_block(),
                ..SimBlock::default()
            };
            read.read_exact(&mut self.data[blk * block_size..(blk + 1) * block_size])?;
        }
        Ok(())
    }

    /// Write the contents of the simulated NAND out to a writable stream.
    /// Marked-bad blocks are rendered as a 0xBD fill.
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let block_size = self.geom.page_size() << self.geom.log2_ppb;
        let bad = vec![0xBDu8; block_size];
        for blk in 0..self.geom.num_blocks as usize {
            if self.blocks[blk].marked_bad {
                write.write_all(&bad)?;
            } else {
                write.write_all(&self.data[blk * block_size..(blk + 1) * block_size])?;
            }
        }
        Ok(())
    }

    fn bump<F: FnOnce(&mut SimStats)>(&mut self, f: F) {
        if self.frozen == 0 {
            f(&mut self.stats);
        }
    }

    fn check_block(&self, blk: BlockIndex, what: &str) {
        assert!(
            blk < self.geom.num_blocks,
            "sim: {what} called on invalid block {blk}"
        );
    }

    fn timebomb_tick(&mut self, blk: BlockIndex) {
        let b = &mut self.blocks[blk as usize];
        if b.timebomb > 0 {
            b.timebomb -= 1;
            if b.timebomb == 0 {
                b.failed = true;
            }
        }
    }

    fn page_range(&self, page: PageIndex) -> std::ops::Range<usize> {
        let start = page as usize * self.geom.page_size();
        start..start + self.geom.page_size()
    }
}

impl Nand for SimNand {
    fn geometry(&self) -> Geometry {
        self.geom
    }

    fn is_bad(&mut self, blk: BlockIndex) -> bool {
        self.check_block(blk, "is_bad");
        self.bump(|s| s.is_bad += 1);
        self.blocks[blk as usize].marked_bad
    }

    fn mark_bad(&mut self, blk: BlockIndex) {
        self.check_block(blk, "mark_bad");
        self.bump(|s| s.mark_bad += 1);
        self.blocks[blk as usize].marked_bad = true;
    }

    fn erase(&mut self, blk: BlockIndex) -> Result<(), Error> {
        self.check_block(blk, "erase");
        assert!(
            !self.blocks[blk as usize].marked_bad,
            "sim: erase called on block which is marked bad: {blk}"
        );

        self.bump(|s| s.erase += 1);
        self.blocks[blk as usize].next_page = 0;
        self.timebomb_tick(blk);

        let range = self.page_range(self.geom.first_page(blk));
        let range = range.start..range.start + (self.geom.page_size() << self.geom.log2_ppb);
        if self.blocks[blk as usize].failed {
            self.bump(|s| s.erase_fail += 1);
            seq_fill(blk as u64 * 57 + 29, &mut self.data[range]);
            return Err(Error::BadBlock);
        }

        self.data[range].fill(0xFF);
        Ok(())
    }

    fn prog(&mut self, page: PageIndex, data: &[u8]) -> Result<(), Error> {
        let blk = self.geom.block_of(page);
        let pno = page & (self.geom.pages_per_block() - 1);
        self.check_block(blk, "prog");
        assert_eq!(data.len(), self.geom.page_size(), "sim: prog content not page-sized");
        assert!(
            !self.blocks[blk as usize].marked_bad,
            "sim: prog called on block which is marked bad: {blk}"
        );
        assert!(
            pno >= self.blocks[blk as usize].next_page,
            "sim: out-of-order page programming: block {}, page {} (expected {})",
            blk,
            pno,
            self.blocks[blk as usize].next_page
        );

        self.bump(|s| s.prog += 1);
        self.blocks[blk as usize].next_page = pno + 1;
        self.timebomb_tick(blk);

        let range = self.page_range(page);
        if self.blocks[blk as usize].failed {
            self.bump(|s| s.prog_fail += 1);
            seq_fill(page as u64 * 57 + 29, &mut self.data[range]);
            return Err(Error::BadBlock);
        }

        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn is_free(&mut self, page: PageIndex) -> bool {
        let blk = self.geom.block_of(page);
        let pno = page & (self.geom.pages_per_block() - 1);
        self.check_block(blk, "is_free");
        self.bump(|s| s.is_free += 1);
        self.blocks[blk as usize].next_page <= pno
    }

    fn read(
        &mut self,
        page: PageIndex,
        offset: usize,
        length: usize,
        data: &mut [u8],
    ) -> Result<(), Error> {
        let blk = self.geom.block_of(page);
        self.check_block(blk, "read");
        assert!(
            offset + length <= self.geom.page_size(),
            "sim: read called on invalid range: offset = {offset}, length = {length}"
        );

        self.bump(|s| {
            s.read += 1;
            s.read_bytes += length as u64;
        });

        let range = self.page_range(page);
        data[..length].copy_from_slice(&self.data[range][offset..offset + length]);
        Ok(())
    }

    fn copy(&mut self, src: PageIndex, dst: PageIndex) -> Result<(), Error> {
        let mut buf = vec![0u8; self.geom.page_size()];
        self.read(src, 0, self.geom.page_size(), &mut buf)?;
        self.prog(dst, &buf)
    }
}

impl fmt::Display for SimNand {
    /// Render the operation counters and a one-character-per-block status
    /// map: `.` erased, `:` in use, `b` failed, `?` marked bad, `B` both.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        writeln!(f, "NAND operation counts:")?;
        writeln!(f, "    is_bad:         {}", s.is_bad)?;
        writeln!(f, "    mark_bad:       {}", s.mark_bad)?;
        writeln!(f, "    erase:          {}", s.erase)?;
        writeln!(f, "    erase failures: {}", s.erase_fail)?;
        writeln!(f, "    is_free:        {}", s.is_free)?;
        writeln!(f, "    prog:           {}", s.prog)?;
        writeln!(f, "    prog failures:  {}", s.prog_fail)?;
        writeln!(f, "    read:           {}", s.read)?;
        writeln!(f, "    read (bytes):   {}", s.read_bytes)?;
        writeln!(f)?;

        writeln!(f, "Block status:")?;
        for row in self.blocks.chunks(64) {
            write!(f, "    ")?;
            for b in row {
                let c = match (b.failed, b.marked_bad) {
                    (true, true) => 'B',
                    (true, false) => 'b',
                    (false, true) => '?',
                    (false, false) if b.next_page > 0 => ':',
                    (false, false) => '.',
                };
                write!(f, "{c}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
