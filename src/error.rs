use thiserror::Error;

/// Errors that can occur while constructing or driving the engine. The list is likely to stay as
/// is but marked as non-exhaustive to allow for future additions without breaking the API. The
/// configuration variants can only come out of [`WlFlash::new`](crate::WlFlash::new); at runtime
/// a caller only ever sees `FlashError` and `OutOfBounds`.
#[derive(Error, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The internal error value is returned from the underlying flash implementation. Once a
    /// mutating operation fails this way the engine stays latched and keeps returning it.
    #[error("internal flash error")]
    FlashError,

    /// The wear unit has to be a non-zero multiple of the sector size.
    #[error("invalid page size")]
    InvalidPageSize,

    /// The sector size has to match the erase granularity of the medium.
    #[error("invalid sector size")]
    InvalidSectorSize,

    /// The managed region's start address and total size have to be sector aligned.
    #[error("region misaligned")]
    RegionMisaligned,

    /// After the redundant records take their share, the region has to keep at least one data
    /// page plus the spare slot.
    #[error("region too small")]
    RegionTooSmall,

    /// The relocation buffer has to evenly divide the page size and respect the medium's write
    /// granularity.
    #[error("invalid scratch size")]
    InvalidScratchSize,

    /// The record write size has to be a multiple of the medium's minimum write size, at most
    /// one record slot (32 bytes).
    #[error("invalid write granularity")]
    InvalidWriteGranularity,

    /// The requested range does not fit inside the logical capacity.
    #[error("out of bounds")]
    OutOfBounds,
}
