//! Store header kept in the reserved low records of every store file.
//!
//! ```text
//! [header int u32 BE][descriptor len u8][descriptor utf8]
//! ```
//!
//! The descriptor names the record type and the format version and must match
//! exactly when a store is opened.

use crate::primitives::pager::{read_with_retry, PageCursor};
use crate::types::{Result, StoreError};

/// Version suffix shared by every store descriptor.
pub const ALL_STORES_VERSION: &str = "v0.R.1";

const FIXED_LEN: usize = 5;

/// What a store keeps in its header besides the descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreHeaderFormat {
    /// Nothing.
    NoHeader,
    /// One integer, written with `default_value` on creation.
    Int {
        /// Value written when the store is created.
        default_value: u32,
    },
}

/// Header contents decoded from a store file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreHeader {
    /// No header data.
    None,
    /// Single integer header, e.g. a dynamic store block size.
    Int(u32),
}

impl StoreHeader {
    /// The integer value, if this header carries one.
    pub fn int_value(&self) -> Option<u32> {
        match self {
            StoreHeader::None => None,
            StoreHeader::Int(value) => Some(*value),
        }
    }

    fn raw(&self) -> u32 {
        self.int_value().unwrap_or(0)
    }
}

impl StoreHeaderFormat {
    /// Header for a freshly created store.
    pub fn generate(&self) -> StoreHeader {
        match self {
            StoreHeaderFormat::NoHeader => StoreHeader::None,
            StoreHeaderFormat::Int { default_value } => StoreHeader::Int(*default_value),
        }
    }

    fn decode(&self, raw: u32) -> StoreHeader {
        match self {
            StoreHeaderFormat::NoHeader => StoreHeader::None,
            StoreHeaderFormat::Int { .. } => StoreHeader::Int(raw),
        }
    }
}

/// Full descriptor for a record type.
pub fn store_descriptor(type_descriptor: &str) -> String {
    format!("{type_descriptor} {ALL_STORES_VERSION}")
}

/// Bytes the header occupies for `descriptor`.
pub fn header_len(descriptor: &str) -> usize {
    FIXED_LEN + descriptor.len()
}

/// Writes the header at offset 0 of the pinned page.
pub(crate) fn write_header(
    cursor: &mut PageCursor,
    header: &StoreHeader,
    descriptor: &str,
) -> Result<()> {
    let len = u8::try_from(descriptor.len()).map_err(|_| {
        StoreError::Invalid(format!("store descriptor '{descriptor}' is too long"))
    })?;
    cursor.set_offset(0);
    cursor.put_u32(header.raw());
    cursor.put_u8(len);
    cursor.put_bytes(descriptor.as_bytes());
    if cursor.check_and_clear_bounds_flag() {
        return Err(StoreError::UnderlyingStorage(format!(
            "out of page bounds when writing header '{descriptor}'; page size too small: {} bytes",
            cursor.page_size()
        )));
    }
    Ok(())
}

/// Reads the header from offset 0 of the pinned page.
pub(crate) fn read_header(
    cursor: &mut PageCursor,
    format: &StoreHeaderFormat,
) -> Result<(StoreHeader, String)> {
    cursor.set_offset(0);
    let (raw, descriptor) = read_with_retry(cursor, |cursor| {
        let raw = cursor.get_u32();
        let len = cursor.get_u8() as usize;
        let mut bytes = vec![0u8; len];
        cursor.get_bytes(&mut bytes);
        Ok((raw, bytes))
    })?;
    if cursor.check_and_clear_bounds_flag() {
        return Err(StoreError::UnderlyingStorage(format!(
            "out of page bounds when reading header; page size too small: {} bytes",
            cursor.page_size()
        )));
    }
    let descriptor = String::from_utf8(descriptor)
        .map_err(|_| StoreError::Consistency("store descriptor is not valid utf-8".into()))?;
    Ok((format.decode(raw), descriptor))
}

/// Fails unless `found` matches `expected`.
pub(crate) fn verify_descriptor(expected: &str, found: &str) -> Result<()> {
    if found.is_empty() {
        return Err(StoreError::Consistency(format!(
            "store header is empty, expected '{expected}'"
        )));
    }
    if found != expected {
        return Err(StoreError::Consistency(format!(
            "store descriptor mismatch: expected '{expected}', found '{found}'"
        )));
    }
    Ok(())
}
