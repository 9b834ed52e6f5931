//! Journal lifecycle tests: enqueue/dequeue cycling over a device with
//! factory-bad blocks, checkpoint persistence across suspend/resume, and
//! space reclamation when the journal is filled and drained repeatedly.

mod util;

use nand_ftl::nand::sim::SimNand;
use rand::rngs::StdRng;
use rand::SeedableRng;
use util::*;

#[test]
fn fresh_journal_reports_empty() {
    let j = SimJournal::new(SimNand::new(GEOM));

    // 512-byte pages carry 3 records per checkpoint period
    assert_eq!(j.log2_ppc(), 2);

    // 113 blocks, less one for the head/tail gap and one for the initial
    // bad-block guess, at 6 user pages each
    assert_eq!(j.capacity(), 666);

    assert_eq!(j.size(), 0);
    assert_eq!(j.root(), None);
    assert_eq!(j.peek(), None);
    assert!(j.is_checkpointed());
    assert!(!j.in_recovery());
}

#[test]
fn enqueue_dequeue_cycles_with_bad_blocks() {
    let mut nand = SimNand::new(GEOM);
    let mut rng = StdRng::seed_from_u64(0);
    nand.inject_bad(&mut rng, 20);

    let mut j = SimJournal::new(nand);
    let _ = j.resume(); // blank device: journal starts empty
    assert_eq!(j.size(), 0);

    for _ in 0..20 {
        let count = enqueue_seq(&mut j, 0, Some(100));
        assert_eq!(count, 100);
        dequeue_seq(&mut j, 0, count);
        assert_eq!(j.size(), 0);
    }
}

/// Clear the in-RAM state and resume from flash; everything the last
/// checkpoint covered must come back exactly.
fn suspend_resume(j: &mut SimJournal) {
    let old_root = j.root();
    let old_tail = j.tail();
    let old_head = j.head();

    j.clear();
    assert_eq!(j.root(), None);

    j.resume().expect("resume");

    assert_eq!(j.root(), old_root);
    assert_eq!(j.tail(), old_tail);
    assert_eq!(j.head(), old_head);
}

#[test]
fn checkpoints_survive_suspend_resume() {
    let mut nand = SimNand::new(GEOM);
    let mut rng = StdRng::seed_from_u64(1);
    nand.inject_bad(&mut rng, 20);

    let mut j = SimJournal::new(nand);
    let _ = j.resume();

    for rep in 0..20u8 {
        j.cookie_mut()[0] = rep;

        let mut count = enqueue_seq(&mut j, 0, Some(100));
        assert_eq!(count, 100);

        // Top up until the head reaches a checkpoint boundary, so that
        // everything above is persistent
        while !j.is_checkpointed() {
            let c = enqueue_seq(&mut j, count as u32, Some(1));
            assert_eq!(c, 1);
            count += 1;
        }

        suspend_resume(&mut j);
        dequeue_seq(&mut j, 0, count);

        // The cookie rides along in every checkpoint
        assert_eq!(j.cookie()[0], rep);
    }
}

#[test]
fn fill_and_drain_reclaims_space() {
    for seed in 0..50 {
        let mut nand = SimNand::new(GEOM);
        let mut rng = StdRng::seed_from_u64(seed);
        nand.inject_bad(&mut rng, 10);
        nand.inject_failed(&mut rng, 10);

        let mut j = SimJournal::new(nand);
        let mut counts = Vec::new();

        for _ in 0..5 {
            let n = enqueue_seq(&mut j, 0, None);
            dequeue_seq(&mut j, 0, n);
            assert_eq!(j.size(), 0, "drain must empty the journal");
            counts.push(n);
        }

        // Every fill lands in the ballpark the geometry allows (at most
        // 20 distinct compromised blocks of the 113)...
        assert!(
            counts.iter().all(|&n| n >= 350 && n <= 672),
            "implausible fill counts {counts:?} for seed {seed}"
        );

        // ...and once the first sweep has discovered the unmarked bad
        // blocks, the count settles down
        let settled = &counts[1..];
        let spread = settled.iter().max().unwrap() - settled.iter().min().unwrap();
        assert!(
            spread <= 120,
            "fill counts did not stabilize: {counts:?} for seed {seed}"
        );
    }
}
