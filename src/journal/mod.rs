//! Append-only page journal with embedded periodic checkpoints.
//!
//! The journal presents the NAND pages as a double-ended queue. Pages,
//! together with a fixed-size metadata record, are pushed at the head; the
//! oldest pages are popped from the tail. Block erasure, metadata batching
//! and bad-block skipping are handled internally.
//!
//! User pages are grouped into *checkpoint periods* of `2^log2_ppc`
//! contiguous aligned pages. The last page of each period is a metapage
//! carrying the checkpoint header and the metadata records of the other
//! pages in the period (see [`meta`]). Because blocks are programmed
//! strictly from page 0 upward, any block containing a checkpoint contains
//! one at the first metapage slot, which is what allows [`resume`] to
//! binary-search the device instead of scanning it.
//!
//! It is up to the user to keep the queue within the capacity of the chip;
//! [`capacity`] and [`size`] assist with this. If the head would run into
//! the tail's block, appends fail with [`Error::JournalFull`].
//!
//! # Recovery
//!
//! When a program fails part-way into a block, the good pages already in
//! that block have to be relocated before the block can be retired. The
//! failing append returns [`Outcome::NeedsRecovery`] and the journal enters
//! recovery mode; the caller then runs the assisted recovery procedure:
//! fetch [`next_recoverable`], relocate that page (normally with [`copy`]
//! and metadata from [`read_meta`]), and confirm with [`ack_recoverable`];
//! append a padding entry if no page is pending. A further
//! `NeedsRecovery` outcome during the procedure means recovery has been
//! restarted from scratch on a fresh destination block; do not ack it.
//! Bad-block marking is performed automatically as recovery completes.
//!
//! [`resume`]: Journal::resume
//! [`capacity`]: Journal::capacity
//! [`size`]: Journal::size
//! [`next_recoverable`]: Journal::next_recoverable
//! [`ack_recoverable`]: Journal::ack_recoverable
//! [`copy`]: Journal::copy
//! [`read_meta`]: Journal::read_meta
//! [`Outcome::NeedsRecovery`]: crate::error::Outcome::NeedsRecovery

mod meta;

pub use meta::{COOKIE_SIZE, HEADER_SIZE, META_SIZE};

use meta::{choose_ppc, user_offset, CheckpointHeader};

use crate::error::{Error, Outcome};
use crate::nand::{BlockIndex, Geometry, Nand, PageIndex};

/// Number of fresh blocks tried before a failing operation gives up with
/// [`Error::TooBad`].
pub const MAX_RETRIES: usize = 8;

/// Is `p` a multiple of `1 << n`?
fn is_aligned(p: PageIndex, n: u8) -> bool {
    p & ((1 << n) - 1) == 0
}

/// Do `a` and `b` belong to the same `1 << n`-aligned group?
fn align_eq(a: PageIndex, b: PageIndex, n: u8) -> bool {
    (a ^ b) >> n == 0
}

/// The journal's recovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Normal,
    Recovering {
        /// Last good user page of the block being recovered. Relocation
        /// ends once this page has been acked.
        root: PageIndex,

        /// Next user page to relocate.
        next: PageIndex,

        /// First page of the replacement block, where relocation started.
        start: PageIndex,

        /// Page holding the metadata that was still buffered in RAM when
        /// the block failed, if any had to be dumped.
        meta: Option<PageIndex>,
    },
}

/// An append-only queue of pages with periodic embedded checkpoints.
///
/// `PAGE_SIZE` must equal the page size reported by the NAND driver's
/// geometry; it sizes the internal metadata buffer so that the journal
/// performs no allocation.
#[derive(Debug)]
pub struct Journal<const PAGE_SIZE: usize, N: Nand> {
    /// The NAND driver the journal runs on. Public so that integrators can
    /// read page payloads and tests can reach the simulator.
    pub nand: N,

    geom: Geometry,
    log2_ppc: u8,

    /// One page of RAM accumulating the next metapage.
    page_buf: [u8; PAGE_SIZE],

    /// Incremented whenever the head passes the end of the chip and wraps.
    epoch: u8,

    /// Bad blocks seen by the head since it last wrapped.
    bb_current: u32,

    /// Estimate of the total bad-block count: the previous epoch's final
    /// `bb_current`.
    bb_last: u32,

    /// Oldest user page still in the queue.
    tail: PageIndex,

    /// The tail as of the last persisted checkpoint.
    tail_sync: PageIndex,

    /// Next free raw page to program.
    head: PageIndex,

    /// Most recently appended user page; `None` when the journal is empty.
    root: Option<PageIndex>,

    recovery: Recovery,
}

impl<const PAGE_SIZE: usize, N: Nand> Journal<PAGE_SIZE, N> {
    /// Set up a journal on the given NAND. No NAND operations are
    /// performed; the journal starts empty. Call [`resume`](Self::resume)
    /// to pick up the state persisted on flash.
    ///
    /// # Panics
    ///
    /// Panics if `PAGE_SIZE` disagrees with the driver's geometry.
    pub fn new(nand: N) -> Self {
        let geom = nand.geometry();
        assert_eq!(
            PAGE_SIZE,
            geom.page_size(),
            "journal PAGE_SIZE does not match NAND page size"
        );

        let mut journal = Self {
            nand,
            geom,
            log2_ppc: choose_ppc(geom.log2_page_size, geom.log2_ppb),
            page_buf: [0xFF; PAGE_SIZE],
            epoch: 0,
            bb_current: 0,
            bb_last: 0,
            tail: 0,
            tail_sync: 0,
            head: 0,
            root: None,
            recovery: Recovery::Normal,
        };
        journal.reset();
        journal
    }

    /// log2 of the checkpoint period, in pages.
    pub fn log2_ppc(&self) -> u8 {
        self.log2_ppc
    }

    /// The device layout the journal was initialized with.
    pub fn geometry(&self) -> Geometry {
        self.geom
    }

    /// Location of the most recently appended user page, or `None` in an
    /// empty journal. Map lookups start here.
    pub fn root(&self) -> Option<PageIndex> {
        self.root
    }

    /// Location of the oldest user page in the queue.
    pub fn tail(&self) -> PageIndex {
        self.tail
    }

    /// The tail position as of the last persisted checkpoint.
    pub fn tail_sync(&self) -> PageIndex {
        self.tail_sync
    }

    /// Next raw page the journal will program.
    pub fn head(&self) -> PageIndex {
        self.head
    }

    /// Current epoch counter.
    pub fn epoch(&self) -> u8 {
        self.epoch
    }

    /// The oldest user page, or `None` if the queue is empty.
    pub fn peek(&self) -> Option<PageIndex> {
        (self.head != self.tail).then_some(self.tail)
    }

    /// Is everything appended so far persistent?
    ///
    /// True whenever the head sits on a period boundary: the previous
    /// period's metapage, and with it all earlier metadata, is on flash.
    pub fn is_checkpointed(&self) -> bool {
        is_aligned(self.head, self.log2_ppc)
    }

    /// Is the journal in recovery mode?
    pub fn in_recovery(&self) -> bool {
        matches!(self.recovery, Recovery::Recovering { .. })
    }

    /// The next user page awaiting relocation, while in recovery.
    pub fn next_recoverable(&self) -> Option<PageIndex> {
        match self.recovery {
            Recovery::Recovering { next, .. } => Some(next),
            Recovery::Normal => None,
        }
    }

    /// The caller-owned cookie region of the checkpoint header.
    ///
    /// Cookie bytes ride along in every checkpoint and are restored by
    /// [`resume`](Self::resume), which makes them a cheap place for a tiny
    /// piece of upper-layer state.
    pub fn cookie(&self) -> &[u8] {
        &self.page_buf[HEADER_SIZE..HEADER_SIZE + COOKIE_SIZE]
    }

    /// Mutable access to the cookie region. Takes effect at the next
    /// checkpoint.
    pub fn cookie_mut(&mut self) -> &mut [u8] {
        &mut self.page_buf[HEADER_SIZE..HEADER_SIZE + COOKIE_SIZE]
    }

    /// An upper bound on the number of user pages storable in the journal,
    /// based on the current bad-block estimate.
    pub fn capacity(&self) -> u32 {
        let max_bad = self.bb_last.max(self.bb_current);
        let good_blocks = self.geom.num_blocks.saturating_sub(max_bad + 1);
        let good_cps = good_blocks << (self.geom.log2_ppb - self.log2_ppc);

        // Good checkpoint periods times user pages per period
        (good_cps << self.log2_ppc) - good_cps
    }

    /// An upper bound on the number of user pages currently in the queue.
    pub fn size(&self) -> u32 {
        // Count the raw pages and the metapages between tail and head; the
        // difference is the user pages.
        let total = self.geom.total_pages();
        let mut num_pages = self.head;
        let mut num_cps = self.head >> self.log2_ppc;

        if self.head < self.tail {
            num_pages += total;
            num_cps += total >> self.log2_ppc;
        }

        num_pages -= self.tail;
        num_cps -= self.tail >> self.log2_ppc;

        num_pages - num_cps
    }

    /// Forget the queue contents without touching flash: the tail catches
    /// up with the head and the journal reports empty.
    ///
    /// Nothing on flash is altered, so a subsequent
    /// [`resume`](Self::resume) rebuilds the pre-`clear` state.
    pub fn clear(&mut self) {
        self.tail = self.head;
        self.tail_sync = self.head;
        self.root = None;
        self.clear_user_meta();
    }

    /// Reset to a blank journal.
    fn reset(&mut self) {
        self.epoch = 0;
        // No bad-block estimate yet; guess conservatively.
        self.bb_last = self.geom.num_blocks >> 6;
        self.bb_current = 0;
        self.head = 0;
        self.tail = 0;
        self.tail_sync = 0;
        self.root = None;
        self.recovery = Recovery::Normal;
        self.page_buf.fill(0xFF);
    }

    /// Wipe the per-page metadata records, keeping the header and cookie.
    fn clear_user_meta(&mut self) {
        self.page_buf[HEADER_SIZE + COOKIE_SIZE..].fill(0xFF);
    }

    /// In-block metapage slot index shared by every period.
    fn ppc_mask(&self) -> u32 {
        (1 << self.log2_ppc) - 1
    }

    /* ================================================================
     * Resume
     */

    /// Start up the journal: search the NAND for the most recent
    /// checkpoint and restore the queue state from it.
    ///
    /// This operation is O(log N) in the number of pages; everything else
    /// the journal does is O(1). On failure (including a blank device) the
    /// journal is reset to empty and the error is returned.
    pub fn resume(&mut self) -> Result<(), Error> {
        match self.try_resume() {
            Ok(()) => {
                self.recovery = Recovery::Normal;
                ftl_debug!(
                    "journal: resumed, head={} tail={} epoch={}",
                    self.head,
                    self.tail,
                    self.epoch
                );
                Ok(())
            }
            Err(e) => {
                self.reset();
                ftl_debug!("journal: resume failed, starting blank");
                Err(e)
            }
        }
    }

    fn try_resume(&mut self) -> Result<(), Error> {
        // Find the first checkpoint-containing block and adopt its epoch
        let (first, hdr) = self.find_checkblock(0)?;
        self.epoch = hdr.epoch;

        // Find the last checkpoint-containing block in this epoch
        let last = self.find_last_checkblock(first);

        // Find the last programmed checkpoint group in that block
        let group = self.find_last_group(last);

        // Linear scan backward for the last good checkpoint, which names
        // the root and restores the header fields
        let hdr = self.find_root(group)?;
        self.tail = hdr.tail;
        self.tail_sync = hdr.tail;
        self.bb_current = hdr.bb_current;
        self.bb_last = hdr.bb_last;
        self.clear_user_meta();

        // Another linear scan for the next free user page
        self.find_head(group)
    }

    /// Find the first block at or after `blk` whose first metapage slot
    /// holds a valid checkpoint header. Leaves that metapage in `page_buf`.
    ///
    /// If a block contains any checkpoint at all, it has one at the first
    /// metapage slot: blocks are programmed strictly from page 0 upward,
    /// so the first period's metapage is always the first to exist.
    fn find_checkblock(
        &mut self,
        mut blk: BlockIndex,
    ) -> Result<(BlockIndex, CheckpointHeader), Error> {
        for _ in 0..MAX_RETRIES {
            if blk >= self.geom.num_blocks {
                break;
            }

            if !self.nand.is_bad(blk) {
                let p = self.geom.first_page(blk) | self.ppc_mask();
                if self.nand.read(p, 0, PAGE_SIZE, &mut self.page_buf).is_ok() {
                    if let Some(hdr) = CheckpointHeader::decode(&self.page_buf) {
                        return Ok((blk, hdr));
                    }
                }
            }

            blk += 1;
        }

        Err(Error::TooBad)
    }

    /// Binary-search for the last block whose first-metapage epoch matches
    /// the current one. Blocks of a later epoch are older: the epoch wraps
    /// only after traversing the entire device.
    fn find_last_checkblock(&mut self, first: BlockIndex) -> BlockIndex {
        let mut low = first;
        let mut high = self.geom.num_blocks - 1;

        while low <= high {
            let mid = (low + high) >> 1;

            match self.find_checkblock(mid) {
                Ok((found, hdr)) if hdr.epoch == self.epoch => {
                    if found + 1 >= self.geom.num_blocks {
                        return found;
                    }
                    match self.find_checkblock(found + 1) {
                        Ok((next, next_hdr)) if next_hdr.epoch == self.epoch => low = next,
                        _ => return found,
                    }
                }
                _ => {
                    if mid == 0 {
                        return first;
                    }
                    high = mid - 1;
                }
            }
        }

        first
    }

    /// Binary-search the periods of `blk` for the last one whose first
    /// user page is programmed, returning that period's first page.
    ///
    /// If any page of a period is programmed, its first user page is; and
    /// once one period is fully unprogrammed, so is everything after it.
    fn find_last_group(&mut self, blk: BlockIndex) -> PageIndex {
        let num_groups = 1i32 << (self.geom.log2_ppb - self.log2_ppc);
        let mut low = 0i32;
        let mut high = num_groups - 1;

        while low <= high {
            let mid = (low + high) >> 1;
            let p = self.geom.first_page(blk) | ((mid as u32) << self.log2_ppc);

            if self.nand.is_free(p) {
                high = mid - 1;
            } else if mid + 1 >= num_groups || self.nand.is_free(p + (1 << self.log2_ppc)) {
                return p;
            } else {
                low = mid + 1;
            }
        }

        self.geom.first_page(blk)
    }

    /// Scan backward from the period containing `start` for the last
    /// metapage with a matching magic and epoch. Its last user page
    /// becomes the root; the parsed header is returned with the metapage
    /// contents left in `page_buf`.
    fn find_root(&mut self, start: PageIndex) -> Result<CheckpointHeader, Error> {
        let blk = self.geom.block_of(start);
        let mut group = ((start & ((1 << self.geom.log2_ppb) - 1)) >> self.log2_ppc) as i32;

        while group >= 0 {
            let p = self.geom.first_page(blk) + (((group as u32) + 1) << self.log2_ppc) - 1;

            if self.nand.read(p, 0, PAGE_SIZE, &mut self.page_buf).is_ok() {
                if let Some(hdr) = CheckpointHeader::decode(&self.page_buf) {
                    if hdr.epoch == self.epoch {
                        self.root = Some(p - 1);
                        return Ok(hdr);
                    }
                }
            }

            group -= 1;
        }

        Err(Error::TooBad)
    }

    /// Walk forward from `start` to the first free user page, which
    /// becomes the head. Skips metapage slots; moving past the last user
    /// page of a block advances to the next good block (wrapping, and
    /// bumping the epoch, if need be).
    fn find_head(&mut self, start: PageIndex) -> Result<(), Error> {
        self.head = start;

        loop {
            // On the last user page of the block? The next free page can
            // only be in another block.
            if is_aligned(self.head + 2, self.geom.log2_ppb) {
                return self.advance_head_block();
            }

            self.head += 1;
            if is_aligned(self.head + 1, self.log2_ppc) {
                self.head += 1;
            }

            if self.nand.is_free(self.head) {
                return Ok(());
            }
        }
    }

    /* ================================================================
     * Head movement and bad-block skipping
     */

    /// Find the next block the head could move to, without committing to
    /// the move: skips bad blocks (counting them), wraps at the end of the
    /// device (bumping the would-be epoch and rolling the bad-block
    /// statistics), refuses the tail's block.
    fn scan_next_block(&mut self) -> Result<(BlockIndex, u8, u32, u32), Error> {
        let mut blk = self.geom.block_of(self.head);
        let mut bad_cur = self.bb_current;
        let mut bad_last = self.bb_last;
        let mut epoch = self.epoch;

        for _ in 0..MAX_RETRIES {
            blk += 1;
            if blk >= self.geom.num_blocks {
                blk = 0;
                epoch = epoch.wrapping_add(1);
                bad_last = bad_cur;
                bad_cur = 0;
            }

            if blk == self.geom.block_of(self.tail) {
                return Err(Error::JournalFull);
            }

            if !self.nand.is_bad(blk) {
                return Ok((blk, epoch, bad_last, bad_cur));
            }

            bad_cur += 1;
        }

        Err(Error::TooBad)
    }

    /// Move the head to the start of the next usable block.
    fn advance_head_block(&mut self) -> Result<(), Error> {
        let (blk, epoch, bad_last, bad_cur) = self.scan_next_block()?;

        if epoch != self.epoch {
            ftl_debug!("journal: head wrapped, epoch {} -> {}", self.epoch, epoch);
        }

        self.head = self.geom.first_page(blk);
        self.epoch = epoch;
        self.bb_last = bad_last;
        self.bb_current = bad_cur;
        Ok(())
    }

    /// Check that the head will be able to leave its block, without moving
    /// it. Used before appends that seal a block, so that fullness is
    /// reported before any I/O instead of stranding the head on a
    /// just-programmed page.
    fn ensure_next_block(&mut self) -> Result<(), Error> {
        self.scan_next_block().map(|_| ())
    }

    /* ================================================================
     * Reading metadata
     */

    /// Read the 132-byte metadata record of user page `p`.
    ///
    /// `p` must be a user page currently in the queue. Depending on where
    /// `p` sits, the record is served from the in-RAM buffer (current
    /// period), from the metadata page dumped at the start of a recovery,
    /// or from the period's on-flash metapage.
    pub fn read_meta(&mut self, p: PageIndex, buf: &mut [u8; META_SIZE]) -> Result<(), Error> {
        let offset = user_offset(p & self.ppc_mask());

        // Buffered metadata for the current period
        if align_eq(p, self.head, self.log2_ppc) {
            buf.copy_from_slice(&self.page_buf[offset..offset + META_SIZE]);
            return Ok(());
        }

        // Incomplete metadata dumped at the start of recovery
        if let Recovery::Recovering {
            root,
            meta: Some(meta_page),
            ..
        } = self.recovery
        {
            if align_eq(p, root, self.log2_ppc) {
                return self.nand.read(meta_page, offset, META_SIZE, buf);
            }
        }

        // General case: the metapage of p's checkpoint group
        self.nand.read(p | self.ppc_mask(), offset, META_SIZE, buf)
    }

    /* ================================================================
     * Dequeue
     */

    /// Remove the oldest page from the queue.
    ///
    /// Only bookkeeping: the page itself stays on flash until its block is
    /// erased by a future lap of the head, and the removal becomes
    /// permanent at the next checkpoint.
    pub fn dequeue(&mut self) -> Result<(), Error> {
        if self.head == self.tail {
            return Ok(());
        }

        // Next user page, skipping the metapage slot
        let mut t = self.tail + 1;
        if is_aligned(t + 1, self.log2_ppc) {
            t += 1;
        }

        if is_aligned(t, self.geom.log2_ppb) {
            // Crossed a block boundary; skip any bad blocks
            let mut blk = self.geom.block_of(self.tail);

            for _ in 0..MAX_RETRIES {
                if blk == self.geom.block_of(self.head) {
                    return Err(Error::TooBad);
                }

                blk += 1;
                if blk >= self.geom.num_blocks {
                    blk = 0;
                }

                if !self.nand.is_bad(blk) {
                    self.tail = self.geom.first_page(blk);
                    if self.head == self.tail {
                        self.root = None;
                    }
                    return Ok(());
                }
            }

            return Err(Error::TooBad);
        }

        self.tail = t;
        if self.head == self.tail {
            self.root = None;
        }
        Ok(())
    }

    /* ================================================================
     * Append path
     */

    /// Append a page to the journal.
    ///
    /// `data` is programmed at the head and `meta` is recorded for it;
    /// both become persistent at the next checkpoint. Passing `None` for
    /// `data` appends a padding entry: the page slot is consumed without
    /// being programmed. Passing `None` for `meta` records an all-0xFF
    /// (garbage) record.
    ///
    /// A mid-block program failure yields [`Outcome::NeedsRecovery`]; see
    /// the module documentation for the procedure.
    pub fn enqueue(
        &mut self,
        data: Option<&[u8]>,
        meta: Option<&[u8; META_SIZE]>,
    ) -> Result<Outcome, Error> {
        self.check_size()?;

        for _ in 0..MAX_RETRIES {
            let res = self
                .prepare_prog()
                .and_then(|()| match data {
                    Some(data) => self.nand.prog(self.head, data),
                    None => Ok(()),
                });

            match res {
                Ok(()) => return self.push_meta(meta),
                Err(Error::BadBlock) => {
                    if self.recover_from()? {
                        return Ok(Outcome::NeedsRecovery);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::TooBad)
    }

    /// Append a copy of an existing journal page, with new metadata.
    ///
    /// Functionally an [`enqueue`](Self::enqueue) of the source page's
    /// contents, but routed through the NAND's copy primitive, which may
    /// avoid staging the data through RAM.
    pub fn copy(&mut self, src: PageIndex, meta: Option<&[u8; META_SIZE]>) -> Result<Outcome, Error> {
        self.check_size()?;

        for _ in 0..MAX_RETRIES {
            let res = self
                .prepare_prog()
                .and_then(|()| self.nand.copy(src, self.head));

            match res {
                Ok(()) => return self.push_meta(meta),
                Err(Error::BadBlock) => {
                    if self.recover_from()? {
                        return Ok(Outcome::NeedsRecovery);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::TooBad)
    }

    fn check_size(&self) -> Result<(), Error> {
        if self.size() >= self.capacity() {
            return Err(Error::JournalFull);
        }
        Ok(())
    }

    /// Get the head's page ready for programming.
    fn prepare_prog(&mut self) -> Result<(), Error> {
        // An append that seals the block's last metapage is immediately
        // followed by a head advance; make sure that advance can succeed
        // before any I/O happens.
        if is_aligned(self.head + 2, self.geom.log2_ppb) {
            self.ensure_next_block()?;
        }

        if is_aligned(self.head, self.geom.log2_ppb) {
            // A wrapped head may not enter the tail's block
            if self.head < self.tail && align_eq(self.head, self.tail, self.geom.log2_ppb) {
                return Err(Error::JournalFull);
            }

            self.nand.erase(self.geom.block_of(self.head))?;
        }

        Ok(())
    }

    /// Account for a just-written user page: buffer its metadata, advance
    /// the head, and seal the period's metapage when the buffer is full.
    fn push_meta(&mut self, meta: Option<&[u8; META_SIZE]>) -> Result<Outcome, Error> {
        let old_head = self.head;
        let offset = user_offset(self.head & self.ppc_mask());

        match meta {
            Some(m) => self.page_buf[offset..offset + META_SIZE].copy_from_slice(m),
            None => self.page_buf[offset..offset + META_SIZE].fill(0xFF),
        }
        self.head += 1;

        // Unless the buffer just filled, no further I/O
        if !is_aligned(self.head + 1, self.log2_ppc) {
            self.root = Some(old_head);
            return Ok(Outcome::Written);
        }

        // Seal the checkpoint: the head sits on the metapage slot
        CheckpointHeader {
            epoch: self.epoch,
            tail: self.tail,
            bb_current: self.bb_current,
            bb_last: self.bb_last,
        }
        .encode_into(&mut self.page_buf);

        if let Err(e) = self.nand.prog(self.head, &self.page_buf) {
            if e != Error::BadBlock {
                return Err(e);
            }
            // A metapage slot is never block-aligned, so this always
            // arms (or restarts) recovery rather than silently skipping.
            let entered = self.recover_from()?;
            debug_assert!(entered);
            return Ok(Outcome::NeedsRecovery);
        }

        self.clear_user_meta();
        self.tail_sync = self.tail;

        // Find the next free page
        if is_aligned(self.head + 1, self.geom.log2_ppb) {
            if let Err(e) = self.advance_head_block() {
                self.head = old_head;
                return Err(e);
            }
        } else {
            self.head += 1;
        }

        self.root = Some(old_head);
        Ok(Outcome::Written)
    }

    /* ================================================================
     * Recovery
     */

    /// React to a `BadBlock` program failure at the head.
    ///
    /// Returns `true` if recovery was armed (or restarted) and the caller
    /// must report [`Outcome::NeedsRecovery`], `false` if the failure was
    /// absorbed silently and the append should simply be retried.
    fn recover_from(&mut self) -> Result<bool, Error> {
        let old_head = self.head;

        // Find the next available block
        self.advance_head_block()?;

        // Already in the middle of a recovery? Start it over on the block
        // we just obtained.
        if self.in_recovery() {
            self.restart_recovery(old_head);
            return Ok(true);
        }

        // A block-aligned failure lost nothing: nothing of the failed
        // block had been programmed yet.
        let root = match self.root {
            Some(root) if !is_aligned(old_head, self.geom.log2_ppb) => root,
            _ => {
                ftl_debug!("journal: block {} failed clean, skipping", self.geom.block_of(old_head));
                self.nand.mark_bad(self.geom.block_of(old_head));
                self.recover_tail_fixup(old_head);
                return Ok(false);
            }
        };

        ftl_debug!(
            "journal: entering recovery for block {}",
            self.geom.block_of(root)
        );

        // Holding buffered metadata? Dump it to flash first, so reads of
        // the failed block's records stay serviceable during recovery.
        let meta = if !is_aligned(old_head, self.log2_ppc) {
            Some(self.dump_meta()?)
        } else {
            None
        };

        self.recovery = Recovery::Recovering {
            root,
            next: root & !((1 << self.geom.log2_ppb) - 1),
            start: self.head,
            meta,
        };

        Ok(true)
    }

    /// Restart a recovery whose destination block failed in turn: retire
    /// the failed destination and re-arm the source enumeration.
    fn restart_recovery(&mut self, old_head: PageIndex) {
        let Recovery::Recovering { root, next, start, meta } = &mut self.recovery else {
            unreachable!("restart_recovery outside recovery");
        };

        ftl_trace!("journal: recovery restarted");

        // Mark the failed destination bad immediately, unless it also
        // holds the dumped metadata; that block is retired when recovery
        // completes.
        match meta {
            Some(m) if align_eq(*m, old_head, self.geom.log2_ppb) => {}
            _ => self.nand.mark_bad(self.geom.block_of(old_head)),
        }

        *next = *root & !((1 << self.geom.log2_ppb) - 1);
        *start = self.head;

        // Relocated copies made so far live in the failed destination;
        // point lookups back at the original block.
        self.root = Some(*root);
    }

    /// Write the partially-filled metadata buffer to a page of its own, so
    /// that it survives the loss of the in-progress period. Returns the
    /// page it went to.
    fn dump_meta(&mut self) -> Result<PageIndex, Error> {
        for _ in 0..MAX_RETRIES {
            let head_blk = self.geom.block_of(self.head);

            match self
                .nand
                .erase(head_blk)
                .and_then(|()| self.nand.prog(self.head, &self.page_buf))
            {
                Ok(()) => {
                    let page = self.head;
                    self.head += 1;
                    self.clear_user_meta();
                    return Ok(page);
                }
                Err(Error::BadBlock) => {
                    // The block went bad; move on and retire it
                    self.advance_head_block()?;
                    self.nand.mark_bad(head_blk);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::TooBad)
    }

    /// If the tail sits in the block being retired, move it to the next
    /// good block.
    fn recover_tail_fixup(&mut self, bad_page: PageIndex) {
        if !align_eq(self.tail, bad_page, self.geom.log2_ppb) {
            return;
        }

        let tail_sync_hit = align_eq(self.tail_sync, bad_page, self.geom.log2_ppb);
        let mut blk = self.geom.block_of(self.tail);

        for _ in 0..MAX_RETRIES {
            blk += 1;
            if blk >= self.geom.num_blocks {
                blk = 0;
            }

            if !self.nand.is_bad(blk) {
                self.tail = self.geom.first_page(blk);
                if tail_sync_hit {
                    self.tail_sync = self.tail;
                }
                return;
            }
        }
    }

    /// Confirm that the page last returned by
    /// [`next_recoverable`](Self::next_recoverable) has been relocated.
    ///
    /// Acking the recovery root completes the procedure: the failed source
    /// block (and the dumped-metadata block, if it is a separate one) is
    /// marked bad and the journal returns to normal operation. Do not call
    /// this after a relocation that itself reported
    /// [`Outcome::NeedsRecovery`].
    pub fn ack_recoverable(&mut self) {
        let Recovery::Recovering { root, next, start, meta } = self.recovery else {
            return;
        };

        if next == root {
            // The last page is relocated; retire the source block
            self.nand.mark_bad(self.geom.block_of(root));

            // If metadata was dumped onto a block other than the one
            // recovery continued on, that block is disposable too.
            if let Some(meta_page) = meta {
                if !align_eq(start, meta_page, self.geom.log2_ppb) {
                    self.nand.mark_bad(self.geom.block_of(meta_page));
                }
            }

            self.recover_tail_fixup(root);
            self.recovery = Recovery::Normal;
            ftl_debug!("journal: recovery complete");
        } else {
            // Skip to the next user page
            let mut n = next + 1;
            if is_aligned(n + 1, self.log2_ppc) {
                n += 1;
            }
            if let Recovery::Recovering { next, .. } = &mut self.recovery {
                *next = n;
            }
        }
    }
}
