//! Error types shared across the filesystem core.
//!
//! Two taxonomies are exposed: [`FlashError`] for failures reported by the
//! flash driver, and [`FsError`] for failures surfaced through the public
//! filesystem API. Raw flash reads additionally report a tri-state
//! [`ReadIntegrity`] so a host ECC engine can distinguish clean, corrected
//! and uncorrectable data.

use core::fmt::Debug;

/// Return type for operations that are allowed to fail and don't need to
/// return anything.
pub type CanFail<E> = Result<(), E>;

/// Return type of the public filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Errors reported by a [`crate::nand::NandFlash`] driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashError {
    /// A page program did not complete.
    Program,

    /// A block erase did not complete. For NAND media this usually means
    /// the block is bad and must be retired.
    Erase,

    /// The driver did not answer in time.
    Timeout,

    /// The request addressed a block, page or sector outside the device
    /// geometry.
    OutOfRange,
}

/// Outcome of a raw flash read, as qualified by the driver's ECC engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadIntegrity {
    /// Data read back clean.
    Ok,

    /// Bit errors were present but corrected; the data is usable.
    Corrected,

    /// Uncorrectable bit errors; the data must not be trusted.
    Detected,
}

/// Errors surfaced by the public filesystem operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    /// The operation requires a mounted filesystem.
    NotMounted,

    /// The operation requires an unmounted filesystem.
    AlreadyMounted,

    /// No live file of that name exists.
    NotFound,

    /// The filename does not fit the fixed on-media name field.
    NameTooLong,

    /// No free block or no free inode slot is available.
    NoSpace,

    /// The file is open and the operation cannot proceed while it is.
    Busy,

    /// On-media state failed an integrity check; the affected block is
    /// quarantined for the rest of the session.
    Corrupt,

    /// The handle does not refer to an open file (stale or foreign
    /// descriptor).
    BadHandle,

    /// The flash driver reported an error.
    Flash(FlashError),
}

impl From<FlashError> for FsError {
    fn from(err: FlashError) -> Self {
        FsError::Flash(err)
    }
}
