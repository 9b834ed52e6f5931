//! Randomized whole-map workouts: write every sector in random order,
//! verify, rewrite half / trim half, verify again, across many seeds,
//! with bad blocks and timebombs injected, syncing and resuming between
//! phases. The trie structure is re-checked against the live-sector count
//! as the map mutates.

mod util;

use nand_ftl::journal::META_SIZE;
use nand_ftl::nand::sim::{seq_fill, SimNand};
use nand_ftl::nand::{Nand, PageUtil};
use nand_ftl::Error;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use util::*;

const NUM_SECTORS: u32 = 200;
const GC_RATIO: u8 = 4;

fn shuffled(seed: u64) -> Vec<u32> {
    let mut order: Vec<u32> = (0..NUM_SECTORS).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);
    order
}

fn write_sector(map: &mut SimMap, s: u32, seed: u64) {
    let mut buf = [0u8; PAGE_SIZE];
    seq_fill(seed, &mut buf);
    map.write(s, &buf).expect("map write");
}

fn assert_sector(map: &mut SimMap, s: u32, seed: u64) {
    let mut buf = [0u8; PAGE_SIZE];
    map.read(s, &mut buf).expect("map read");
    seq_assert(seed, &buf);
}

fn assert_blank(map: &mut SimMap, s: u32) {
    assert_eq!(map.find(s), Err(Error::NotFound), "sector {s} should be gone");

    // A missing sector reads as erased flash
    let mut buf = [0u8; PAGE_SIZE];
    map.read(s, &mut buf).expect("map read");
    assert!(buf.is_erased());
}

/// Walk the alt-pointer trie from the root, checking that every edge
/// points backwards in queue order, that ID prefixes match the path taken,
/// and that the number of reachable records equals the live-sector count.
fn check_trie(map: &mut SimMap) {
    map.journal.nand.freeze();
    let count = check_recurse(map, map.journal.head(), map.journal.root(), 0, 0);
    map.journal.nand.thaw();

    assert_eq!(map.size(), count, "live count disagrees with the trie");
}

fn check_recurse(
    map: &mut SimMap,
    parent: u32,
    page: Option<u32>,
    id_expect: u32,
    depth: usize,
) -> u32 {
    let Some(page) = page else { return 0 };

    let total = map.journal.geometry().total_pages();
    let tail = map.journal.tail();

    // A valid user page, older than the page pointing at it
    assert!(dist(total, tail, page) < dist(total, tail, parent));
    assert!(dist(total, tail, page) < dist(total, tail, map.journal.head()));
    assert_ne!(!page & ((1u32 << map.journal.log2_ppc()) - 1), 0);

    let mut meta = [0u8; META_SIZE];
    map.journal.read_meta(page, &mut meta).expect("read_meta");

    // The first `depth` bits of the ID are fixed by the path here
    let id = u32::from_le_bytes(meta[0..4].try_into().unwrap());
    if depth > 0 {
        assert_eq!((id ^ id_expect) >> (32 - depth), 0, "ID prefix mismatch");
    }

    let mut count = 1;
    for d in depth..32 {
        let at = 4 + d * 4;
        let child = u32::from_le_bytes(meta[at..at + 4].try_into().unwrap());
        let child = (child != u32::MAX).then_some(child);
        count += check_recurse(map, page, child, id ^ (1 << (31 - d)), d + 1);
    }

    count
}

/// Tear the map down and bring it back from flash alone.
fn reopen(map: SimMap) -> SimMap {
    let mut map = SimMap::new(map.journal.nand, GC_RATIO);
    let _ = map.resume();
    map
}

/// The longest circular run of faulty blocks in the given set.
fn longest_faulty_run(faulty: &[bool]) -> usize {
    if faulty.iter().all(|&b| b) {
        return faulty.len();
    }

    let mut longest = 0;
    let mut run = 0;
    // Doubling the scan handles runs that wrap around the end
    for i in 0..faulty.len() * 2 {
        if faulty[i % faulty.len()] {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest
}

fn run_seed(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let bad: Vec<u32> = (0..10)
        .map(|_| rng.random_range(0..GEOM.num_blocks))
        .collect();
    let bombs: Vec<(u32, u32)> = (0..30)
        .map(|_| (rng.random_range(0..GEOM.num_blocks), rng.random_range(1..=20)))
        .collect();

    // The journal skips at most eight bad blocks in a row before giving up
    // with TooBad; a fault pattern clustered harder than that is outside
    // the contract, so such seeds are not asserted on.
    let mut faulty = vec![false; GEOM.num_blocks as usize];
    for &b in &bad {
        faulty[b as usize] = true;
    }
    for &(b, _) in &bombs {
        faulty[b as usize] = true;
    }
    if longest_faulty_run(&faulty) >= 7 {
        return;
    }

    let mut nand = SimNand::new(GEOM);
    for &b in &bad {
        nand.set_failed(b);
        nand.mark_bad(b);
    }
    for &(b, ttl) in &bombs {
        nand.set_timebomb(b, ttl);
    }

    let mut map = SimMap::new(nand, GC_RATIO);
    let _ = map.resume();
    assert!(map.capacity() >= NUM_SECTORS);
    assert_eq!(map.size(), 0);

    map.sync().expect("sync");
    let mut map = reopen(map);

    // Write all sectors in random order
    for (i, &s) in shuffled(seed * 4 + 1).iter().enumerate() {
        write_sector(&mut map, s, u64::from(s));
        if i % 16 == 0 {
            check_trie(&mut map);
        }
    }
    check_trie(&mut map);

    map.sync().expect("sync");
    let mut map = reopen(map);
    assert_eq!(map.size(), NUM_SECTORS);

    // Everything written must read back after the restart
    for &s in &shuffled(seed * 4 + 2) {
        assert_sector(&mut map, s, u64::from(s));
    }

    // Rewrite half with complemented data; trim the other half
    let order = shuffled(seed * 4 + 3);
    for (i, pair) in order.chunks(2).enumerate() {
        let (keep, drop) = (pair[0], pair[1]);

        write_sector(&mut map, keep, u64::from(!keep));
        map.trim(drop).expect("trim");

        if i % 8 == 0 {
            check_trie(&mut map);
        }
    }
    check_trie(&mut map);

    map.sync().expect("sync");
    let mut map = reopen(map);
    assert_eq!(map.size(), NUM_SECTORS / 2);

    for pair in order.chunks(2) {
        assert_sector(&mut map, pair[0], u64::from(!pair[0]));
        assert_blank(&mut map, pair[1]);
    }
}

#[test]
fn random_rewrite_seeds_0_to_249() {
    for seed in 0..250 {
        run_seed(seed);
    }
}

#[test]
fn random_rewrite_seeds_250_to_499() {
    for seed in 250..500 {
        run_seed(seed);
    }
}

#[test]
fn random_rewrite_seeds_500_to_749() {
    for seed in 500..750 {
        run_seed(seed);
    }
}

#[test]
fn random_rewrite_seeds_750_to_999() {
    for seed in 750..1000 {
        run_seed(seed);
    }
}

#[test]
fn trimming_everything_empties_the_map() {
    let mut map = SimMap::new(SimNand::new(GEOM), GC_RATIO);
    let _ = map.resume();

    for s in 0..32 {
        write_sector(&mut map, s, u64::from(s));
    }
    assert_eq!(map.size(), 32);

    for s in 0..32 {
        map.trim(s).expect("trim");
        check_trie(&mut map);
    }
    assert_eq!(map.size(), 0);
    assert_blank(&mut map, 0);

    // Trimming an absent sector is a no-op
    map.trim(7).expect("trim absent");
    assert_eq!(map.size(), 0);

    // Fresh writes keep working after everything was dropped, and the
    // state survives a sync/resume cycle
    write_sector(&mut map, 5, 99);
    map.sync().expect("sync");
    let mut map = reopen(map);
    assert_eq!(map.size(), 1);
    assert_sector(&mut map, 5, 99);
    assert_blank(&mut map, 31);
}
