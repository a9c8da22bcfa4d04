//! Node records, which spill into a secondary unit when their references do
//! not fit the compact 32-bit encoding.

use crate::primitives::pager::PageCursor;
use crate::storage::header::StoreHeader;
use crate::storage::record::{Record, RecordFormat, RecordLoad, StoreLayout};
use crate::types::{Result, NULL_REFERENCE};

/// Bytes per node slot.
pub const NODE_RECORD_SIZE: usize = 17;

const IN_USE: u8 = 0x01;
const DENSE: u8 = 0x02;
const HAS_SECONDARY: u8 = 0x04;
const SECONDARY_UNIT: u8 = 0x08;

const COMPACT_NULL: u32 = u32::MAX;

/// A node: heads of its relationship and property chains plus inline labels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    /// Record id.
    pub id: i64,
    /// Slot holds live data.
    pub in_use: bool,
    /// Created in the current unit of work.
    pub created: bool,
    /// Relationships are grouped by type.
    pub dense: bool,
    /// First relationship (or group) id.
    pub next_rel: i64,
    /// First property id.
    pub next_prop: i64,
    /// Inline label bits.
    pub labels: u32,
    /// Slot holding the wide references, or [`NULL_REFERENCE`].
    pub secondary_unit_id: i64,
}

impl NodeRecord {
    /// A blank, unused record with id `id`.
    pub fn new(id: i64) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            dense: false,
            next_rel: NULL_REFERENCE,
            next_prop: NULL_REFERENCE,
            labels: 0,
            secondary_unit_id: NULL_REFERENCE,
        }
    }

    /// A live record with the given references.
    pub fn live(id: i64, next_rel: i64, next_prop: i64) -> Self {
        Self {
            in_use: true,
            created: true,
            next_rel,
            next_prop,
            ..Self::new(id)
        }
    }
}

fn fits_compact(reference: i64) -> bool {
    reference == NULL_REFERENCE || (0..COMPACT_NULL as i64).contains(&reference)
}

fn encode_compact(reference: i64) -> u32 {
    if reference == NULL_REFERENCE {
        COMPACT_NULL
    } else {
        reference as u32
    }
}

fn decode_compact(raw: u32) -> i64 {
    if raw == COMPACT_NULL {
        NULL_REFERENCE
    } else {
        raw as i64
    }
}

impl Record for NodeRecord {
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

    fn requires_secondary_unit(&self) -> bool {
        !fits_compact(self.next_rel) || !fits_compact(self.next_prop)
    }

    fn secondary_unit_id(&self) -> i64 {
        self.secondary_unit_id
    }
}

/// Format for node stores.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeRecordFormat;

impl NodeRecordFormat {
    fn with_unit<T>(
        cursor: &mut PageCursor,
        layout: &StoreLayout,
        unit_id: i64,
        access: impl FnOnce(&mut PageCursor) -> T,
    ) -> Result<T> {
        let page_id = layout.page_id_for(unit_id);
        let offset = layout.offset_for(unit_id);
        if page_id == cursor.current_page_id() {
            let resume = cursor.offset();
            cursor.set_offset(offset);
            let value = access(cursor);
            cursor.set_offset(resume);
            Ok(value)
        } else {
            let linked = cursor.open_linked_cursor(page_id)?;
            linked.set_offset(offset);
            Ok(access(linked))
        }
    }
}

impl RecordFormat for NodeRecordFormat {
    type Record = NodeRecord;

    fn type_descriptor(&self) -> &'static str {
        "NodeStore"
    }

    fn new_record(&self) -> NodeRecord {
        NodeRecord::new(NULL_REFERENCE)
    }

    fn record_size(&self, _header: &StoreHeader) -> usize {
        NODE_RECORD_SIZE
    }

    fn max_id(&self) -> i64 {
        (1 << 35) - 1
    }

    fn is_in_use(&self, cursor: &mut PageCursor) -> bool {
        cursor.get_u8() & IN_USE != 0
    }

    fn read(
        &self,
        record: &mut NodeRecord,
        cursor: &mut PageCursor,
        mode: RecordLoad,
        layout: &StoreLayout,
    ) -> Result<()> {
        let header = cursor.get_u8();
        let id = record.id;
        *record = NodeRecord::new(id);
        if header & SECONDARY_UNIT != 0 {
            return Ok(());
        }
        record.in_use = header & IN_USE != 0;
        if !record.in_use && mode != RecordLoad::Force {
            return Ok(());
        }
        record.dense = header & DENSE != 0;
        if header & HAS_SECONDARY == 0 {
            record.next_rel = decode_compact(cursor.get_u32());
            record.next_prop = decode_compact(cursor.get_u32());
            record.labels = cursor.get_u32();
            return Ok(());
        }
        let unit_id = cursor.get_i64();
        record.labels = cursor.get_u32();
        if unit_id < 0 || unit_id > self.max_id() {
            cursor.set_cursor_exception(format!(
                "node {id} points at invalid secondary unit {unit_id}"
            ));
            return Ok(());
        }
        record.secondary_unit_id = unit_id;
        let (unit_header, next_rel, next_prop) = Self::with_unit(cursor, layout, unit_id, |unit| {
            (unit.get_u8(), unit.get_i64(), unit.get_i64())
        })?;
        if unit_header & (IN_USE | SECONDARY_UNIT) != IN_USE | SECONDARY_UNIT {
            cursor.set_cursor_exception(format!(
                "secondary unit {unit_id} of node {id} is not a live secondary unit"
            ));
            return Ok(());
        }
        record.next_rel = next_rel;
        record.next_prop = next_prop;
        Ok(())
    }

    fn write(
        &self,
        record: &NodeRecord,
        cursor: &mut PageCursor,
        layout: &StoreLayout,
    ) -> Result<()> {
        let start = cursor.offset();
        if !record.in_use {
            let header = cursor.get_u8_at(start);
            cursor.put_u8_at(start, header & !IN_USE);
            if record.has_secondary_unit_id() {
                Self::with_unit(cursor, layout, record.secondary_unit_id, |unit| {
                    unit.put_u8(0)
                })?;
            }
            return Ok(());
        }
        let mut header = IN_USE;
        if record.dense {
            header |= DENSE;
        }
        if record.requires_secondary_unit() {
            if !record.has_secondary_unit_id() {
                cursor.set_cursor_exception(format!(
                    "node {} needs a secondary unit but none was assigned",
                    record.id
                ));
                return Ok(());
            }
            cursor.put_u8(header | HAS_SECONDARY);
            cursor.put_i64(record.secondary_unit_id);
            cursor.put_u32(record.labels);
            Self::with_unit(cursor, layout, record.secondary_unit_id, |unit| {
                unit.put_u8(IN_USE | SECONDARY_UNIT);
                unit.put_i64(record.next_rel);
                unit.put_i64(record.next_prop);
            })?;
        } else {
            cursor.put_u8(header);
            cursor.put_u32(encode_compact(record.next_rel));
            cursor.put_u32(encode_compact(record.next_prop));
            cursor.put_u32(record.labels);
            if record.has_secondary_unit_id() {
                Self::with_unit(cursor, layout, record.secondary_unit_id, |unit| {
                    unit.put_u8(0)
                })?;
            }
        }
        Ok(())
    }

    fn prepare(
        &self,
        record: &mut NodeRecord,
        _layout: &StoreLayout,
        next_id: &mut dyn FnMut() -> Result<i64>,
    ) -> Result<()> {
        if record.in_use && record.requires_secondary_unit() && !record.has_secondary_unit_id() {
            record.secondary_unit_id = next_id()?;
        }
        Ok(())
    }
}
