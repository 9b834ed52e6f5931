//! The sector map: logical sectors on top of the journal.
//!
//! Every journal entry written by the map carries a [`record`]: the sector
//! ID plus an alt-pointer vector. The vectors chain the entries into a
//! binary radix trie rooted at the most recent entry, so looking a sector
//! up costs at most 32 metadata reads ([`Map::find`]) and no RAM-resident
//! index at all; the entire map state is reconstructed from flash by
//! [`Map::resume`].
//!
//! Space is reclaimed incrementally: every write triggers a few garbage
//! collection steps which inspect the journal tail, re-append entries that
//! are still live, and drop the rest. The `gc_ratio` chosen at
//! construction is the number of steps per write; any value ≥ 2 gives the
//! collector net forward progress on a steady-state rewrite workload.
//!
//! The map stores its live-sector count in the journal's checkpoint cookie,
//! so a resume restores it without walking the trie.

mod record;

pub use record::SectorId;

use crate::error::{Error, Outcome};
use crate::journal::{Journal, MAX_RETRIES, META_SIZE};
use crate::nand::{Nand, PageIndex};

/// A crash-safe array of logical sectors, one NAND page each.
#[derive(Debug)]
pub struct Map<const PAGE_SIZE: usize, N: Nand> {
    /// The journal backing this map. Public so integrators can reach
    /// journal-level facilities (statistics, raw page access in tests).
    pub journal: Journal<PAGE_SIZE, N>,

    /// Number of live logical sectors.
    count: u32,

    /// Garbage collection steps per user write.
    gc_ratio: u8,
}

impl<const PAGE_SIZE: usize, N: Nand> Map<PAGE_SIZE, N> {
    /// Set up a map over the given NAND. No NAND operations are performed;
    /// call [`resume`](Self::resume) to pick up the on-flash state.
    ///
    /// A `gc_ratio` of 0 is treated as 1.
    pub fn new(nand: N, gc_ratio: u8) -> Self {
        let mut map = Self {
            journal: Journal::new(nand),
            count: 0,
            gc_ratio: gc_ratio.max(1),
        };
        map.store_count();
        map
    }

    /// Start up the map: resume the journal and restore the sector count
    /// from the recovered checkpoint. On failure (including a blank
    /// device) the map comes up empty and the cause is returned.
    pub fn resume(&mut self) -> Result<(), Error> {
        match self.journal.resume() {
            Ok(()) => {
                self.count = u32::from_le_bytes(self.journal.cookie().try_into().unwrap());
                Ok(())
            }
            Err(e) => {
                self.count = 0;
                self.store_count();
                Err(e)
            }
        }
    }

    /// Number of sectors the device can hold, less the reserve kept so the
    /// garbage collector can always make progress.
    pub fn capacity(&self) -> u32 {
        let gc_reserve = 1u32 << self.journal.log2_ppc();
        self.journal.capacity().saturating_sub(gc_reserve)
    }

    /// Number of live sectors.
    pub fn size(&self) -> u32 {
        self.count
    }

    /// Locate the page holding the current copy of sector `s`.
    ///
    /// Fails with [`Error::NotFound`] if `s` has never been written or has
    /// been trimmed.
    pub fn find(&mut self, s: SectorId) -> Result<PageIndex, Error> {
        self.trace_path(s, None)
    }

    /// Read sector `s` into `data`. A sector that is not present reads as
    /// all 0xFF, like freshly erased flash.
    pub fn read(&mut self, s: SectorId, data: &mut [u8]) -> Result<(), Error> {
        match self.trace_path(s, None) {
            Ok(p) => self.journal.nand.read(p, 0, PAGE_SIZE, data),
            Err(Error::NotFound) => {
                data.fill(0xFF);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Write `data` (one page) to sector `s`, then let the garbage
    /// collector run its per-write steps.
    pub fn write(&mut self, s: SectorId, data: &[u8]) -> Result<(), Error> {
        loop {
            let old_count = self.count;
            let mut meta = [0xFF; META_SIZE];
            self.prepare_write(s, &mut meta)?;

            match self.journal.enqueue(Some(data), Some(&meta)) {
                Ok(Outcome::Written) => break,
                Ok(Outcome::NeedsRecovery) => {
                    self.count = old_count;
                    self.store_count();
                    self.drive_recovery()?;
                }
                Err(e) => {
                    self.count = old_count;
                    self.store_count();
                    return Err(e);
                }
            }
        }

        self.run_gc()
    }

    /// Drop sector `s` from the map. Trimming an absent sector is a no-op.
    pub fn trim(&mut self, s: SectorId) -> Result<(), Error> {
        loop {
            match self.try_delete(s)? {
                Outcome::Written => break,
                Outcome::NeedsRecovery => self.drive_recovery()?,
            }
        }

        self.run_gc()
    }

    /// Push everything written so far out to flash.
    ///
    /// Advances the journal to its next checkpoint by running garbage
    /// collection steps (useful work) or, once the queue is empty, padding
    /// entries. After a successful sync, a crash or power cut loses
    /// nothing.
    pub fn sync(&mut self) -> Result<(), Error> {
        while !self.journal.is_checkpointed() {
            match self.journal.peek() {
                Some(tail) => match self.raw_gc(tail)? {
                    Outcome::Written => self.journal.dequeue()?,
                    Outcome::NeedsRecovery => self.drive_recovery()?,
                },
                None => self.pad()?,
            }
        }

        Ok(())
    }

    /// Mirror the sector count into the checkpoint cookie, to be persisted
    /// with the next checkpoint.
    fn store_count(&mut self) {
        let bytes = self.count.to_le_bytes();
        self.journal.cookie_mut().copy_from_slice(&bytes);
    }

    /// Walk the trie from the journal root towards `target`.
    ///
    /// Returns the page holding `target`'s record. When `new_meta` is
    /// given, it is filled in along the way with the alt vector a fresh
    /// record for `target` must carry: at every divergence the page being
    /// left is the newest entry of the abandoned subtree, and everywhere
    /// else the current record's own alt still names the newest entry.
    /// On `NotFound` the vector is valid up to the point the chain ended.
    fn trace_path(
        &mut self,
        target: SectorId,
        mut new_meta: Option<&mut [u8; META_SIZE]>,
    ) -> Result<PageIndex, Error> {
        let mut meta = [0xFF; META_SIZE];

        if let Some(nm) = new_meta.as_deref_mut() {
            record::set_id(nm, target);
        }

        let Some(mut p) = self.journal.root() else {
            return Err(Error::NotFound);
        };
        self.journal.read_meta(p, &mut meta)?;

        let mut depth = 0;
        while depth < record::RADIX_DEPTH {
            let id = record::id(&meta);
            if id == record::SECTOR_NONE {
                return Err(Error::NotFound);
            }

            if (target ^ id) & record::divergence_bit(depth) != 0 {
                // Diverged: this page is the newest entry on its side
                if let Some(nm) = new_meta.as_deref_mut() {
                    record::set_alt(nm, depth, Some(p));
                }

                match record::alt(&meta, depth) {
                    Some(next) => {
                        p = next;
                        depth += 1;
                        self.journal.read_meta(p, &mut meta)?;
                    }
                    None => return Err(Error::NotFound),
                }
            } else {
                if let Some(nm) = new_meta.as_deref_mut() {
                    record::set_alt(nm, depth, record::alt(&meta, depth));
                }
                depth += 1;
            }
        }

        Ok(p)
    }

    /// Build the metadata for a write of `dst` and account for it.
    fn prepare_write(&mut self, dst: SectorId, meta: &mut [u8; META_SIZE]) -> Result<(), Error> {
        match self.trace_path(dst, Some(meta)) {
            Ok(_) => {}
            Err(Error::NotFound) => {
                if self.count >= self.capacity() {
                    return Err(Error::MapFull);
                }
                self.count += 1;
            }
            Err(e) => return Err(e),
        }

        self.store_count();
        Ok(())
    }

    /// Remove `s` from the trie.
    ///
    /// An append-only trie cannot delete in place; instead the record of
    /// `s`'s closest cousin (named by the deepest filled alt of `s`'s own
    /// freshly-traced path) is re-appended as the new root, carrying the
    /// path's routing above their divergence and nothing at it. Every
    /// other sector keeps resolving; `s` stops.
    fn try_delete(&mut self, s: SectorId) -> Result<Outcome, Error> {
        let mut path = [0xFF; META_SIZE];
        match self.trace_path(s, Some(&mut path)) {
            Ok(_) => {}
            Err(Error::NotFound) => return Ok(Outcome::Written),
            Err(e) => return Err(e),
        }

        let Some((level, cousin)) = (0..record::RADIX_DEPTH)
            .rev()
            .find_map(|d| record::alt(&path, d).map(|p| (d, p)))
        else {
            // No cousin anywhere: s is the only live sector
            ftl_debug!("map: trimmed the last live sector");
            self.count = 0;
            self.store_count();
            self.journal.clear();
            return Ok(Outcome::Written);
        };

        let mut cousin_meta = [0xFF; META_SIZE];
        self.journal.read_meta(cousin, &mut cousin_meta)?;
        for d in 0..level {
            record::set_alt(&mut cousin_meta, d, record::alt(&path, d));
        }
        record::set_alt(&mut cousin_meta, level, None);

        match self.journal.copy(cousin, Some(&cousin_meta))? {
            Outcome::Written => {
                self.count -= 1;
                self.store_count();
                Ok(Outcome::Written)
            }
            Outcome::NeedsRecovery => Ok(Outcome::NeedsRecovery),
        }
    }

    /// Run the assisted recovery procedure to completion.
    ///
    /// Every pending page gets the garbage-collector treatment rather than
    /// a verbatim copy: a page that still holds the current copy of its
    /// sector is re-appended with a freshly traced alt vector, and a dead
    /// or padding page is simply acked away. Copying the old vectors
    /// instead would leave the trie routing into the block about to be
    /// retired. A pending page of `None` is answered with a padding
    /// append. A relocation that itself fails restarts the procedure on a
    /// new block, up to the usual retry limit.
    fn drive_recovery(&mut self) -> Result<(), Error> {
        let mut restarts = 0;

        ftl_trace!("map: driving journal recovery");

        while self.journal.in_recovery() {
            let outcome = match self.journal.next_recoverable() {
                Some(p) => self.raw_gc(p)?,
                None => self.journal.enqueue(None, None)?,
            };

            match outcome {
                Outcome::Written => self.journal.ack_recoverable(),
                Outcome::NeedsRecovery => {
                    restarts += 1;
                    if restarts >= MAX_RETRIES {
                        return Err(Error::TooBad);
                    }
                }
            }
        }

        Ok(())
    }

    /// One garbage collection step: retire the journal tail, relocating it
    /// first if it still holds the current copy of its sector.
    fn try_gc(&mut self) -> Result<(), Error> {
        loop {
            let Some(tail) = self.journal.peek() else {
                return Ok(());
            };

            match self.raw_gc(tail)? {
                Outcome::Written => {
                    self.journal.dequeue()?;
                    return Ok(());
                }
                Outcome::NeedsRecovery => self.drive_recovery()?,
            }
        }
    }

    /// Relocate the entry at `page` if it is live. `Written` means the
    /// slot is disposable (dead, padding, or successfully copied).
    ///
    /// Serves both the garbage collector (on the tail) and the recovery
    /// driver (on the pages of a failing block).
    fn raw_gc(&mut self, page: PageIndex) -> Result<Outcome, Error> {
        let mut meta = [0xFF; META_SIZE];
        self.journal.read_meta(page, &mut meta)?;

        let target = record::id(&meta);
        if target == record::SECTOR_NONE {
            return Ok(Outcome::Written);
        }

        // Where does the sector this entry once represented live now?
        let mut new_meta = [0xFF; META_SIZE];
        let loc = match self.trace_path(target, Some(&mut new_meta)) {
            Ok(loc) => loc,
            Err(Error::NotFound) => return Ok(Outcome::Written),
            Err(e) => return Err(e),
        };

        if loc != page {
            return Ok(Outcome::Written);
        }

        // Still the current copy: rewrite it at the head with its trie
        // linkage rebuilt
        ftl_trace!("map: gc relocating sector {} from page {}", target, page);
        self.journal.copy(page, Some(&new_meta))
    }

    /// The per-write garbage collection allowance.
    fn run_gc(&mut self) -> Result<(), Error> {
        for _ in 0..self.gc_ratio {
            self.try_gc()?;
        }
        Ok(())
    }

    /// Append one padding entry, driving recovery as needed.
    fn pad(&mut self) -> Result<(), Error> {
        loop {
            match self.journal.enqueue(None, None)? {
                Outcome::Written => return Ok(()),
                Outcome::NeedsRecovery => self.drive_recovery()?,
            }
        }
    }
}
