use std::fmt;

use crate::primitives::pager::PageCursor;
use crate::storage::header::StoreHeader;
use crate::types::{Result, StoreError, NULL_REFERENCE};

/// A fixed-size record addressed by id.
pub trait Record: Clone + fmt::Debug + Send {
    /// Record id.
    fn id(&self) -> i64;
    /// Sets the record id.
    fn set_id(&mut self, id: i64);
    /// Whether the slot holds live data.
    fn in_use(&self) -> bool;
    /// Marks the slot live or free.
    fn set_in_use(&mut self, in_use: bool);
    /// Resets every field except the id; leaves the record not in use.
    fn clear(&mut self);
    /// Whether the record was created in the current unit of work.
    fn is_created(&self) -> bool {
        false
    }
    /// Whether the record needs a second slot to hold its data.
    fn requires_secondary_unit(&self) -> bool {
        false
    }
    /// Id of the secondary slot, or [`NULL_REFERENCE`].
    fn secondary_unit_id(&self) -> i64 {
        NULL_REFERENCE
    }
    /// Whether a secondary slot has been assigned.
    fn has_secondary_unit_id(&self) -> bool {
        self.secondary_unit_id() != NULL_REFERENCE
    }
}

/// How strictly a read treats a slot that is not in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RecordLoad {
    /// Fail with [`StoreError::InvalidRecord`] unless the record is in use.
    #[default]
    Normal,
    /// Return a cleared record when not in use.
    Check,
    /// Return whatever the slot holds, in use or not.
    Force,
}

impl RecordLoad {
    /// Applies the mode to a freshly read record.
    pub fn verify<R: Record>(self, record: &mut R) -> Result<()> {
        if record.in_use() {
            return Ok(());
        }
        match self {
            RecordLoad::Normal => Err(StoreError::InvalidRecord(format!(
                "{record:?} not in use"
            ))),
            RecordLoad::Check => {
                record.clear();
                Ok(())
            }
            RecordLoad::Force => Ok(()),
        }
    }
}

/// Geometry of a store file: records never straddle a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreLayout {
    /// Bytes per record.
    pub record_size: usize,
    /// Records per file page.
    pub records_per_page: usize,
    /// Low ids occupied by the store header.
    pub reserved: i64,
}

impl StoreLayout {
    /// Derives the layout for `record_size` within cache pages of
    /// `cache_page_size`, reserving enough records for `header_len` bytes.
    pub fn new(cache_page_size: usize, record_size: usize, header_len: usize) -> Result<Self> {
        if record_size == 0 || record_size > cache_page_size {
            return Err(StoreError::Invalid(format!(
                "record size {record_size} does not fit page size {cache_page_size}"
            )));
        }
        Ok(Self {
            record_size,
            records_per_page: cache_page_size / record_size,
            reserved: header_len.div_ceil(record_size) as i64,
        })
    }

    /// File page size: the largest multiple of the record size that fits.
    pub fn file_page_size(&self) -> usize {
        self.records_per_page * self.record_size
    }

    /// Page holding `id`.
    pub fn page_id_for(&self, id: i64) -> i64 {
        id / self.records_per_page as i64
    }

    /// Byte offset of `id` within its page.
    pub fn offset_for(&self, id: i64) -> usize {
        (id % self.records_per_page as i64) as usize * self.record_size
    }

    /// First id stored on `page_id`.
    pub fn first_id_on(&self, page_id: i64) -> i64 {
        page_id * self.records_per_page as i64
    }
}

/// Encodes one record type into fixed-size slots.
pub trait RecordFormat: Send + Sync + 'static {
    /// Record type produced by this format.
    type Record: Record;

    /// Type part of the store descriptor written to the header.
    fn type_descriptor(&self) -> &'static str;

    /// A blank record.
    fn new_record(&self) -> Self::Record;

    /// Slot size for a store with `header`.
    fn record_size(&self, header: &StoreHeader) -> usize;

    /// Highest id the format can address.
    fn max_id(&self) -> i64;

    /// Whether the slot at the cursor offset is occupied. Occupied includes
    /// secondary units, which are never returned as records of their own.
    fn is_in_use(&self, cursor: &mut PageCursor) -> bool;

    /// Decodes the slot at the cursor offset. Problems that depend on the
    /// bytes read go to [`PageCursor::set_cursor_exception`] so they can be
    /// retried; only I/O failures are returned as errors.
    fn read(
        &self,
        record: &mut Self::Record,
        cursor: &mut PageCursor,
        mode: RecordLoad,
        layout: &StoreLayout,
    ) -> Result<()>;

    /// Encodes `record` at the cursor offset.
    fn write(
        &self,
        record: &Self::Record,
        cursor: &mut PageCursor,
        layout: &StoreLayout,
    ) -> Result<()>;

    /// Assigns any extra ids `record` needs before it is written.
    fn prepare(
        &self,
        _record: &mut Self::Record,
        _layout: &StoreLayout,
        _next_id: &mut dyn FnMut() -> Result<i64>,
    ) -> Result<()> {
        Ok(())
    }

    /// Id of the record that follows `record` in a chain.
    fn next_record_reference(&self, _record: &Self::Record) -> i64 {
        NULL_REFERENCE
    }
}
