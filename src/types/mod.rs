//! Shared types: the store error taxonomy, record id constants and checksums.

#![forbid(unsafe_code)]

use std::io;

use thiserror::Error;

/// Checksum helpers used by on-disk formats.
pub mod checksum;

/// Id value meaning "no record"; terminates chains and marks absent references.
pub const NULL_REFERENCE: i64 = -1;

/// The all-ones 32-bit pattern. Never handed out as a record id because
/// 32-bit readers cannot tell it apart from [`NULL_REFERENCE`].
pub const INTEGER_MINUS_ONE: i64 = 0xFFFF_FFFF;

/// Returns true when `id` is the reserved id that must never be allocated.
#[inline]
pub fn is_reserved_id(id: i64) -> bool {
    id == INTEGER_MINUS_ONE
}

/// Errors raised by the record storage core.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wrapper around I/O errors from the operating system.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The store file (or its first page) does not exist.
    #[error("store not found: {0}")]
    StoreNotFound(String),
    /// A read or write ran past the bounds of a page.
    #[error("underlying storage failure: {0}")]
    UnderlyingStorage(String),
    /// A record was not in use or could not be decoded.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    /// A negative id was passed where a record id was expected.
    #[error("negative id {0}")]
    NegativeId(i64),
    /// An id exceeded the record format's capacity.
    #[error("id {id} exceeds capacity {max}")]
    IdCapacityExceeded {
        /// Offending id.
        id: i64,
        /// Highest id the format can address.
        max: i64,
    },
    /// The reserved id was passed where a record id was expected.
    #[error("id {0} is reserved")]
    ReservedId(i64),
    /// Generic store failure (sticky id file, exhausted id space).
    #[error("store failure: {0}")]
    StoreFailure(String),
    /// Illegal argument.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// Operation on a closed or otherwise unusable component.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// On-disk structure failed validation.
    #[error("consistency violation: {0}")]
    Consistency(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Validates a record id for writing against a format capacity.
///
/// Checks run in a fixed order: negativity, capacity, then the reserved id.
pub fn assert_valid_record_id(id: i64, max_id: i64) -> Result<()> {
    if id < 0 {
        return Err(StoreError::NegativeId(id));
    }
    if id > max_id {
        return Err(StoreError::IdCapacityExceeded { id, max: max_id });
    }
    if is_reserved_id(id) {
        return Err(StoreError::ReservedId(id));
    }
    Ok(())
}
