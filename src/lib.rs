//! A flash translation layer for raw NAND devices.
//!
//! Raw NAND can only be programmed a page at a time, erased a block at a
//! time, and ships with (and develops) bad blocks. This crate presents such
//! a device as a linear array of logical sectors that can be freely written,
//! read and trimmed, surviving both power loss and blocks failing mid-write.
//!
//! The crate is built from two layers:
//!
//! - [`journal::Journal`] maps an append-only queue of pages onto the NAND.
//!   Every 2^N pages it embeds a *metapage* carrying a checkpoint header and
//!   the metadata of the preceding pages, which is what makes crash recovery
//!   an O(log N) search instead of a device scan.
//! - [`map::Map`] stores a binary radix trie inside the journal metadata,
//!   keyed on sector ID, so the latest copy of any sector can be found by
//!   walking at most 32 journal records. An incremental garbage collector
//!   migrates live data away from the queue tail to reclaim space.
//!
//! The NAND itself sits behind the [`nand::Nand`] trait; an in-memory
//! simulator with fault injection is provided in [`nand::sim`] for testing.
//! The [`ecc`] modules carry the error-correction codecs a NAND driver
//! typically needs (Hamming, BCH, CRC-32), independent of the core.
//!
//! ```no_run
//! use nand_ftl::map::Map;
//! use nand_ftl::nand::{sim::SimNand, Geometry};
//!
//! let geom = Geometry { log2_page_size: 9, log2_ppb: 6, num_blocks: 1024 };
//! let mut map: Map<512, SimNand> = Map::new(SimNand::new(geom), 4);
//! let _ = map.resume(); // a blank device resumes empty
//!
//! let data = [0u8; 512];
//! map.write(17, &data)?;
//! # Ok::<(), nand_ftl::Error>(())
//! ```

#[macro_use]
mod macros;

pub mod ecc;
pub mod error;
pub mod journal;
pub mod map;
pub mod nand;

pub use error::{Error, Outcome};
