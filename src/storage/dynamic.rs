//! Dynamic stores: values split across chains of fixed-size blocks.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use super::header::{StoreHeader, StoreHeaderFormat};
use super::id::{IdGeneratorFactory, IdType};
use super::options::StoreOpenOptions;
use super::record::{Record, RecordFormat, RecordLoad, StoreLayout};
use super::store::RecordStore;
use crate::primitives::pager::{PageCache, PageCursor, PageLock};
use crate::types::{Result, StoreError, NULL_REFERENCE};

/// Bytes of block header preceding the data of every dynamic record.
pub const BLOCK_HEADER_SIZE: usize = 12;

/// Bytes of value header at the front of a chain's first block.
pub const VALUE_HEADER_SIZE: usize = 5;

const IN_USE: u8 = 0x01;
const START_RECORD: u8 = 0x02;
const MAX_BLOCK_DATA: usize = (1 << 24) - 1;

/// One block of a dynamic chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DynamicRecord {
    /// Record id.
    pub id: i64,
    /// Slot holds live data.
    pub in_use: bool,
    /// First block of its chain.
    pub start_record: bool,
    /// Created in the current unit of work.
    pub created: bool,
    /// Payload carried by this block.
    pub data: Vec<u8>,
    /// Next block of the chain, or [`NULL_REFERENCE`].
    pub next_block: i64,
}

impl DynamicRecord {
    /// A blank, unused block with id `id`.
    pub fn new(id: i64) -> Self {
        Self {
            id,
            next_block: NULL_REFERENCE,
            ..Self::default()
        }
    }
}

impl Record for DynamicRecord {
    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn clear(&mut self) {
        *self = Self::new(self.id);
    }

    fn is_created(&self) -> bool {
        self.created
    }
}

/// Block layout shared by string, array and schema stores:
/// `[flags u8][data length u24][next block i64][data]`.
///
/// The next block is stored plus one so that a never written slot links to
/// [`NULL_REFERENCE`].
#[derive(Clone, Copy, Debug)]
pub struct DynamicRecordFormat {
    type_descriptor: &'static str,
}

impl DynamicRecordFormat {
    /// Format of the string store.
    pub const fn strings() -> Self {
        Self {
            type_descriptor: "StringPropertyStore",
        }
    }

    /// Format of the array store.
    pub const fn arrays() -> Self {
        Self {
            type_descriptor: "ArrayPropertyStore",
        }
    }

    /// Format of the schema store.
    pub const fn schema() -> Self {
        Self {
            type_descriptor: "SchemaStore",
        }
    }

    /// Header format recording the block size for `data_block_size` data bytes.
    pub fn header_format(data_block_size: u32) -> StoreHeaderFormat {
        StoreHeaderFormat::Int {
            default_value: data_block_size.saturating_add(BLOCK_HEADER_SIZE as u32),
        }
    }
}

impl RecordFormat for DynamicRecordFormat {
    type Record = DynamicRecord;

    fn type_descriptor(&self) -> &'static str {
        self.type_descriptor
    }

    fn new_record(&self) -> DynamicRecord {
        DynamicRecord::new(NULL_REFERENCE)
    }

    fn record_size(&self, header: &StoreHeader) -> usize {
        header.int_value().unwrap_or(0) as usize
    }

    fn max_id(&self) -> i64 {
        (1 << 36) - 1
    }

    fn is_in_use(&self, cursor: &mut PageCursor) -> bool {
        cursor.get_u8() & IN_USE != 0
    }

    fn read(
        &self,
        record: &mut DynamicRecord,
        cursor: &mut PageCursor,
        mode: RecordLoad,
        layout: &StoreLayout,
    ) -> Result<()> {
        let flags = cursor.get_u8();
        record.in_use = flags & IN_USE != 0;
        if !record.in_use && mode != RecordLoad::Force {
            return Ok(());
        }
        record.start_record = flags & START_RECORD != 0;
        let length = cursor.get_u24() as usize;
        record.next_block = cursor.get_i64().wrapping_sub(1);
        let capacity = layout.record_size.saturating_sub(BLOCK_HEADER_SIZE);
        if length > capacity {
            cursor.set_cursor_exception(format!(
                "block {} claims {length} data bytes but holds at most {capacity}",
                record.id
            ));
            return Ok(());
        }
        record.data.resize(length, 0);
        cursor.get_bytes(&mut record.data);
        Ok(())
    }

    fn write(
        &self,
        record: &DynamicRecord,
        cursor: &mut PageCursor,
        layout: &StoreLayout,
    ) -> Result<()> {
        let start = cursor.offset();
        if !record.in_use {
            let flags = cursor.get_u8_at(start);
            cursor.put_u8_at(start, flags & !IN_USE);
            return Ok(());
        }
        let capacity = layout.record_size.saturating_sub(BLOCK_HEADER_SIZE);
        if record.data.len() > capacity {
            cursor.set_cursor_exception(format!(
                "block {} carries {} data bytes but holds at most {capacity}",
                record.id,
                record.data.len()
            ));
            return Ok(());
        }
        let mut flags = IN_USE;
        if record.start_record {
            flags |= START_RECORD;
        }
        cursor.put_u8(flags);
        cursor.put_u24(record.data.len() as u32);
        cursor.put_i64(record.next_block.wrapping_add(1));
        cursor.put_bytes(&record.data);
        Ok(())
    }

    fn next_record_reference(&self, record: &DynamicRecord) -> i64 {
        record.next_block
    }
}

/// What a stored value holds; the first byte of every value header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    /// Opaque bytes.
    Bytes = 0,
    /// UTF-8 text.
    String = 1,
    /// Encoded array.
    Array = 2,
    /// Encoded schema rule.
    Schema = 3,
}

impl ValueKind {
    /// Parses a stored kind byte.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Bytes),
            1 => Some(Self::String),
            2 => Some(Self::Array),
            3 => Some(Self::Schema),
            _ => None,
        }
    }
}

/// A value reassembled from its chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DynamicValue {
    /// Kind recorded in the value header.
    pub kind: ValueKind,
    /// Value bytes without the header.
    pub bytes: Vec<u8>,
}

/// Records of one chain together with whether the chain ended cleanly.
#[derive(Clone, Debug, Default)]
pub struct ChainRead {
    /// Blocks in chain order.
    pub records: Vec<DynamicRecord>,
    /// True when the chain was followed to its end.
    pub satisfied: bool,
}

/// A record store of dynamic blocks with chain-level operations.
#[derive(Debug)]
pub struct DynamicStore {
    store: RecordStore<DynamicRecordFormat>,
}

impl DynamicStore {
    /// Opens a dynamic store whose blocks carry `data_block_size` data bytes.
    /// The block size of an existing store comes from its header.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        store_path: &Path,
        id_path: &Path,
        id_type: IdType,
        id_factory: Arc<dyn IdGeneratorFactory>,
        page_cache: &PageCache,
        format: DynamicRecordFormat,
        data_block_size: u32,
        options: &StoreOpenOptions,
    ) -> Result<Self> {
        if data_block_size == 0 || data_block_size as usize > MAX_BLOCK_DATA {
            return Err(StoreError::Invalid(format!(
                "data block size {data_block_size} out of range 1..={MAX_BLOCK_DATA}"
            )));
        }
        let store = RecordStore::open(
            store_path,
            id_path,
            id_type,
            id_factory,
            page_cache,
            format,
            DynamicRecordFormat::header_format(data_block_size),
            options,
        )?;
        if store.record_size() <= BLOCK_HEADER_SIZE {
            let size = store.record_size();
            store.close()?;
            return Err(StoreError::Consistency(format!(
                "{} block size {size} leaves no room for data",
                store_path.display()
            )));
        }
        Ok(Self { store })
    }

    /// The underlying record store.
    pub fn store(&self) -> &RecordStore<DynamicRecordFormat> {
        &self.store
    }

    /// Data bytes per block.
    pub fn data_block_size(&self) -> usize {
        self.store.record_size() - BLOCK_HEADER_SIZE
    }

    /// Splits `value` into freshly allocated blocks appended to `target`.
    /// Nothing is written; the first appended block starts the chain.
    pub fn allocate_records(
        &self,
        target: &mut Vec<DynamicRecord>,
        kind: ValueKind,
        value: &[u8],
    ) -> Result<()> {
        let length = u32::try_from(value.len()).map_err(|_| {
            StoreError::Invalid(format!("value of {} bytes is too large", value.len()))
        })?;
        let mut payload = Vec::with_capacity(VALUE_HEADER_SIZE + value.len());
        payload.push(kind as u8);
        payload.extend_from_slice(&length.to_be_bytes());
        payload.extend_from_slice(value);

        let block = self.data_block_size();
        let mut ids: SmallVec<[i64; 8]> = SmallVec::new();
        for _ in payload.chunks(block) {
            ids.push(self.store.next_id()?);
        }
        for (index, chunk) in payload.chunks(block).enumerate() {
            target.push(DynamicRecord {
                id: ids[index],
                in_use: true,
                start_record: index == 0,
                created: true,
                data: chunk.to_vec(),
                next_block: ids.get(index + 1).copied().unwrap_or(NULL_REFERENCE),
            });
        }
        trace!(
            store = self.store.type_descriptor(),
            first = ids[0],
            blocks = ids.len(),
            bytes = value.len(),
            "dynamic.allocate"
        );
        Ok(())
    }

    /// Stores `value` and returns the id of its first block.
    pub fn write_value(&self, kind: ValueKind, value: &[u8]) -> Result<i64> {
        let mut records = Vec::new();
        self.allocate_records(&mut records, kind, value)?;
        self.store.update_records(&records)?;
        Ok(records[0].id)
    }

    /// Stores a UTF-8 string.
    pub fn write_string(&self, value: &str) -> Result<i64> {
        self.write_value(ValueKind::String, value.as_bytes())
    }

    /// Walks the chain starting at `start_id`.
    ///
    /// In [`RecordLoad::Normal`] and [`RecordLoad::Check`] the walk stops
    /// before the first block not in use. Only [`RecordLoad::Normal`] reports
    /// undecodable blocks. [`RecordLoad::Force`] follows the stale pointers of
    /// deleted blocks. Block ids are reused within a session, so a forced walk
    /// over freed blocks may continue into a newer value. A link into the
    /// reserved ids ends the walk unsatisfied.
    pub fn chain(&self, start_id: i64, mode: RecordLoad) -> Result<RecordChain<'_>> {
        let file = self.store.paged_file()?;
        Ok(RecordChain {
            store: &self.store,
            cursor: file.io(0, PageLock::Read)?,
            next_id: start_id,
            mode,
            visited: HashSet::new(),
            satisfied: start_id == NULL_REFERENCE,
            done: false,
        })
    }

    /// Collects the chain starting at `start_id`.
    pub fn get_records(&self, start_id: i64, mode: RecordLoad) -> Result<ChainRead> {
        let mut chain = self.chain(start_id, mode)?;
        let mut records = Vec::new();
        for record in chain.by_ref() {
            records.push(record?);
        }
        Ok(ChainRead {
            records,
            satisfied: chain.is_satisfied(),
        })
    }

    /// Reads the value whose chain starts at `start_id`.
    pub fn read_value(&self, start_id: i64) -> Result<DynamicValue> {
        let read = self.get_records(start_id, RecordLoad::Normal)?;
        if !read.satisfied {
            return Err(StoreError::InvalidRecord(format!(
                "chain starting at {start_id} in {} is broken",
                self.store.type_descriptor()
            )));
        }
        match read.records.first() {
            Some(first) if first.start_record => {}
            _ => {
                return Err(StoreError::InvalidRecord(format!(
                    "record {start_id} in {} does not start a chain",
                    self.store.type_descriptor()
                )))
            }
        }
        let payload: Vec<u8> = read
            .records
            .iter()
            .flat_map(|record| record.data.iter().copied())
            .collect();
        decode_value(start_id, &payload)
    }

    /// Reads a string stored by [`DynamicStore::write_string`].
    pub fn read_string(&self, start_id: i64) -> Result<String> {
        let value = self.read_value(start_id)?;
        if value.kind != ValueKind::String {
            return Err(StoreError::InvalidRecord(format!(
                "value at {start_id} is {:?}, not a string",
                value.kind
            )));
        }
        String::from_utf8(value.bytes).map_err(|err| {
            StoreError::InvalidRecord(format!("value at {start_id} is not UTF-8: {err}"))
        })
    }

    /// Marks every block of the chain not in use and frees their ids.
    /// Returns the number of blocks deleted.
    pub fn delete_value(&self, start_id: i64) -> Result<usize> {
        let mut records = self.get_records(start_id, RecordLoad::Normal)?.records;
        for record in &mut records {
            record.in_use = false;
        }
        self.store.update_records(&records)?;
        Ok(records.len())
    }

    /// Flushes the store.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    /// Closes the store.
    pub fn close(&self) -> Result<()> {
        self.store.close()
    }
}

fn decode_value(start_id: i64, payload: &[u8]) -> Result<DynamicValue> {
    if payload.len() < VALUE_HEADER_SIZE {
        return Err(StoreError::InvalidRecord(format!(
            "value at {start_id} is missing its header"
        )));
    }
    let kind = ValueKind::from_u8(payload[0]).ok_or_else(|| {
        StoreError::InvalidRecord(format!("value at {start_id} has unknown kind {}", payload[0]))
    })?;
    let mut length = [0u8; 4];
    length.copy_from_slice(&payload[1..VALUE_HEADER_SIZE]);
    let length = u32::from_be_bytes(length) as usize;
    let body = &payload[VALUE_HEADER_SIZE..];
    if body.len() < length {
        return Err(StoreError::InvalidRecord(format!(
            "value at {start_id} holds {} of {length} bytes",
            body.len()
        )));
    }
    Ok(DynamicValue {
        kind,
        bytes: body[..length].to_vec(),
    })
}

/// Iterator returned by [`DynamicStore::chain`].
pub struct RecordChain<'a> {
    store: &'a RecordStore<DynamicRecordFormat>,
    cursor: PageCursor,
    next_id: i64,
    mode: RecordLoad,
    visited: HashSet<i64>,
    satisfied: bool,
    done: bool,
}

impl RecordChain<'_> {
    /// Whether the walk reached the end of the chain. Meaningful once the
    /// iterator is exhausted.
    pub fn is_satisfied(&self) -> bool {
        self.satisfied
    }
}

impl Iterator for RecordChain<'_> {
    type Item = Result<DynamicRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next_id == NULL_REFERENCE {
            self.done = true;
            return None;
        }
        let id = self.next_id;
        if id < self.store.number_of_reserved_low_ids() {
            self.done = true;
            return None;
        }
        if !self.visited.insert(id) {
            self.done = true;
            return Some(Err(StoreError::Consistency(format!(
                "chain in {} revisits record {id}",
                self.store.type_descriptor()
            ))));
        }
        let mut record = DynamicRecord::new(id);
        if let Err(err) = self
            .store
            .load_record(id, &mut record, self.mode, &mut self.cursor)
        {
            self.done = true;
            return Some(Err(err));
        }
        if !record.in_use && self.mode != RecordLoad::Force {
            self.done = true;
            return None;
        }
        self.next_id = record.next_block;
        if self.next_id == NULL_REFERENCE {
            self.satisfied = true;
        }
        Some(Ok(record))
    }
}
