//! The error taxonomy shared by the NAND driver boundary and the core.

use thiserror::Error;

/// Everything that can go wrong between the NAND driver and the map.
///
/// `BadBlock` and `Ecc` originate in the NAND driver. `BadBlock` never
/// escapes the journal's append operations: it is converted into either a
/// silent skip onto the next block or an [`Outcome::NeedsRecovery`] signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// A program or erase operation failed; the block is unusable.
    #[error("block failed during program or erase")]
    BadBlock,

    /// A read could not be corrected by the driver's ECC.
    #[error("uncorrectable ECC error")]
    Ecc,

    /// Too many consecutive bad blocks while skipping forward.
    #[error("too many consecutive bad blocks")]
    TooBad,

    /// The journal has no room for another page.
    #[error("journal is full")]
    JournalFull,

    /// The requested sector has never been written, or was trimmed.
    #[error("sector not found")]
    NotFound,

    /// The map holds as many live sectors as the device can carry.
    #[error("no space left in the map")]
    MapFull,
}

/// Result of a journal append ([`enqueue`]/[`copy`]).
///
/// `NeedsRecovery` is not a failure: the page was *not* written, but the
/// journal has entered recovery mode and the caller must drive the assisted
/// recovery procedure to completion, then retry the append. See the
/// recovery protocol on [`Journal`].
///
/// [`enqueue`]: crate::journal::Journal::enqueue
/// [`copy`]: crate::journal::Journal::copy
/// [`Journal`]: crate::journal::Journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a NeedsRecovery outcome obliges the caller to run recovery"]
pub enum Outcome {
    /// The page and its metadata were accepted.
    Written,

    /// The write failed mid-block; drive recovery, then retry.
    NeedsRecovery,
}
