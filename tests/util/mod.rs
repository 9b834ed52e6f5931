//! Shared helpers for the integration tests: the test geometry, sequence
//! data, journal invariant checks, and enqueue/dequeue drivers.
#![allow(dead_code)]

use nand_ftl::journal::{Journal, MAX_RETRIES, META_SIZE};
use nand_ftl::map::Map;
use nand_ftl::nand::sim::{seq_fill, SimNand};
use nand_ftl::nand::{Geometry, Nand};
use nand_ftl::{Error, Outcome};

/// The geometry every test runs on: 512-byte pages, 8 pages per block,
/// 113 blocks. Small enough to wrap quickly, awkward enough (non-power-of-
/// two block count) to exercise the wrap arithmetic.
pub const GEOM: Geometry = Geometry {
    log2_page_size: 9,
    log2_ppb: 3,
    num_blocks: 113,
};

pub const PAGE_SIZE: usize = 512;

pub type SimJournal = Journal<PAGE_SIZE, SimNand>;
pub type SimMap = Map<PAGE_SIZE, SimNand>;

/// Check `buf` against the sequence generated by `seed`.
pub fn seq_assert(seed: u64, buf: &[u8]) {
    let mut expect = vec![0u8; buf.len()];
    seq_fill(seed, &mut expect);
    assert_eq!(buf, &expect[..], "data mismatch for sequence {seed}");
}

/// Queue-order distance from `from` to `to` on a device of `total` pages.
pub fn dist(total: u32, from: u32, to: u32) -> u32 {
    if to >= from {
        to - from
    } else {
        total - from + to
    }
}

fn check_upage(j: &SimJournal, p: u32) {
    let mask = (1u32 << j.log2_ppc()) - 1;
    assert_ne!(!p & mask, 0, "page {p} is a metapage slot");
    assert!(p < j.geometry().total_pages(), "page {p} out of bounds");
}

/// Assert the journal's structural invariants. Cheap enough to run at
/// every operation boundary.
pub fn check_journal(j: &SimJournal) {
    let total = j.geometry().total_pages();

    // Head, tail and synced tail always point at valid user-page slots
    check_upage(j, j.head());
    check_upage(j, j.tail());
    check_upage(j, j.tail_sync());

    // The head never wraps around within the tail's block
    if (j.head() ^ j.tail()) >> j.geometry().log2_ppb == 0 {
        assert!(j.head() >= j.tail());
    }

    // The current tail lies between the synced tail and the head
    assert!(dist(total, j.tail_sync(), j.head()) >= dist(total, j.tail_sync(), j.tail()));

    // The root always points at a valid user page inside a non-empty queue
    if let Some(root) = j.root() {
        check_upage(j, root);
        assert!(dist(total, j.tail(), root) < dist(total, j.tail(), j.head()));
    }
}

/// Drive the journal's assisted recovery procedure to completion, checking
/// invariants at every step.
pub fn recover(j: &mut SimJournal) {
    let mut restarts = 0;

    while j.in_recovery() {
        check_journal(j);

        let outcome = match j.next_recoverable() {
            Some(page) => {
                let mut meta = [0u8; META_SIZE];
                j.read_meta(page, &mut meta).expect("read_meta");
                j.copy(page, Some(&meta)).expect("copy")
            }
            None => j.enqueue(None, None).expect("pad"),
        };

        check_journal(j);

        match outcome {
            Outcome::Written => j.ack_recoverable(),
            Outcome::NeedsRecovery => {
                restarts += 1;
                assert!(restarts < MAX_RETRIES, "recovery kept failing");
            }
        }
    }

    check_journal(j);
}

/// Append one page whose data and metadata are both derived from `id`,
/// driving recovery as needed.
fn enqueue_one(j: &mut SimJournal, id: u32) -> Result<(), Error> {
    let mut data = [0u8; PAGE_SIZE];
    let mut meta = [0xFFu8; META_SIZE];

    seq_fill(id as u64, &mut data);
    meta[0..4].copy_from_slice(&id.to_le_bytes());

    for _ in 0..MAX_RETRIES {
        check_journal(j);
        match j.enqueue(Some(&data), Some(&meta))? {
            Outcome::Written => return Ok(()),
            Outcome::NeedsRecovery => recover(j),
        }
    }

    Err(Error::TooBad)
}

/// Append pages with sequential ids starting at `start`. `None` attempts
/// to fill the device. Returns how many appends succeeded before the
/// journal reported full.
pub fn enqueue_seq(j: &mut SimJournal, start: u32, count: Option<usize>) -> usize {
    let count = count.unwrap_or(j.geometry().total_pages() as usize);

    for i in 0..count {
        match enqueue_one(j, start + i as u32) {
            Ok(()) => {}
            Err(Error::JournalFull) => return i,
            Err(e) => panic!("enqueue {i}: {e:?}"),
        }

        assert!(j.size() >= i as u32);

        // The newest entry's metadata must read back, wherever it lives
        let root = j.root().expect("root after enqueue");
        let mut meta = [0u8; META_SIZE];
        j.read_meta(root, &mut meta).expect("read_meta");
        assert_eq!(
            u32::from_le_bytes(meta[0..4].try_into().unwrap()),
            start + i as u32
        );
    }

    count
}

/// Pop `count` data pages, verifying ids and payloads are sequential from
/// `next`. Skips garbage entries (dumped metadata, padding), but never
/// tolerates more than a period's worth in a row.
pub fn dequeue_seq(j: &mut SimJournal, next: u32, count: usize) {
    let max_garbage = 1usize << j.log2_ppc();
    let mut garbage_run = 0;
    let mut next = next;
    let mut count = count;

    while count > 0 {
        let tail = j.peek().expect("peek on a non-empty journal");
        let mut meta = [0u8; META_SIZE];

        check_journal(j);
        j.read_meta(tail, &mut meta).expect("read_meta");

        check_journal(j);
        j.dequeue().expect("dequeue");

        let id = u32::from_le_bytes(meta[0..4].try_into().unwrap());
        if id == u32::MAX {
            garbage_run += 1;
            assert!(garbage_run < max_garbage, "too much garbage in a row");
        } else {
            assert_eq!(id, next, "entries came back out of order");
            garbage_run = 0;
            next += 1;
            count -= 1;

            let mut data = [0u8; PAGE_SIZE];
            j.nand
                .read(tail, 0, PAGE_SIZE, &mut data)
                .expect("nand read");
            seq_assert(id as u64, &data);
        }

        check_journal(j);
    }
}
