//! Metadata store: a fixed set of 64-bit fields kept as records, with paired
//! fields written and read atomically.

#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::header::{header_len, store_descriptor, StoreHeader, StoreHeaderFormat, ALL_STORES_VERSION};
use super::id::{IdGeneratorFactory, IdType};
use super::options::StoreOpenOptions;
use super::record::{Record, RecordFormat, RecordLoad, StoreLayout};
use super::store::{probe_header, RecordStore};
use crate::primitives::concurrency::OutOfOrderSequence;
use crate::primitives::pager::{
    read_with_retry, MapOptions, PageCache, PageCursor, PageLock, PagedFile,
};
use crate::types::{Result, StoreError, NULL_REFERENCE};

/// Bytes per metadata record: `[in_use u8][value i64]`.
pub const META_RECORD_SIZE: usize = 9;
/// Cached value of a field not yet loaded from disk.
pub const FIELD_NOT_INITIALIZED: i64 = i64::MIN;
/// Value reported for a field whose record is not in use.
pub const FIELD_NOT_PRESENT: i64 = -1;
/// Id of the first transaction of a new store.
pub const BASE_TX_ID: i64 = 1;
/// Checksum of the base transaction.
pub const BASE_TX_CHECKSUM: i64 = 0;
/// Commit timestamp of the base transaction.
pub const BASE_TX_COMMIT_TIMESTAMP: i64 = 0;
/// Log version of the base transaction.
pub const BASE_TX_LOG_VERSION: i64 = 0;
/// Byte offset just past the log header.
pub const BASE_TX_LOG_BYTE_OFFSET: i64 = 16;
/// Version string reported for an absent store version.
pub const UNKNOWN_VERSION: &str = "Unknown";

const SEQUENCE_CAPACITY: usize = 200;
const MAX_VERSION_LEN: usize = 7;

/// First field of each pair read under one consistent read. Both records of a
/// pair must sit on the same page.
const PAIRED_FIELDS: [Position; 3] = [
    Position::LastTransactionId,
    Position::UpgradeTransactionId,
    Position::LastClosedTransactionLogVersion,
];

/// Fields of the metadata store, in record order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    /// Store creation time, epoch millis.
    Time,
    /// Random number identifying the store.
    RandomNumber,
    /// Current transaction log version.
    LogVersion,
    /// Last committed transaction id.
    LastTransactionId,
    /// Checksum of the last committed transaction.
    LastTransactionChecksum,
    /// Encoded store format version.
    StoreVersion,
    /// First graph property record.
    FirstGraphProperty,
    /// Last transaction that introduced a constraint.
    LastConstraintTransaction,
    /// Transaction id at the last upgrade.
    UpgradeTransactionId,
    /// Transaction checksum at the last upgrade.
    UpgradeTransactionChecksum,
    /// Time of the last upgrade.
    UpgradeTime,
    /// Log version of the last closed transaction.
    LastClosedTransactionLogVersion,
    /// Log byte offset of the last closed transaction.
    LastClosedTransactionLogByteOffset,
}

/// Number of metadata fields.
pub const POSITION_COUNT: usize = 13;

impl Position {
    /// Every position in record order.
    pub const ALL: [Position; POSITION_COUNT] = [
        Position::Time,
        Position::RandomNumber,
        Position::LogVersion,
        Position::LastTransactionId,
        Position::LastTransactionChecksum,
        Position::StoreVersion,
        Position::FirstGraphProperty,
        Position::LastConstraintTransaction,
        Position::UpgradeTransactionId,
        Position::UpgradeTransactionChecksum,
        Position::UpgradeTime,
        Position::LastClosedTransactionLogVersion,
        Position::LastClosedTransactionLogByteOffset,
    ];

    /// Record index relative to the first non-reserved record.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stable snake_case name.
    pub fn name(self) -> &'static str {
        match self {
            Position::Time => "time",
            Position::RandomNumber => "random_number",
            Position::LogVersion => "log_version",
            Position::LastTransactionId => "last_transaction_id",
            Position::LastTransactionChecksum => "last_transaction_checksum",
            Position::StoreVersion => "store_version",
            Position::FirstGraphProperty => "first_graph_property",
            Position::LastConstraintTransaction => "last_constraint_transaction",
            Position::UpgradeTransactionId => "upgrade_transaction_id",
            Position::UpgradeTransactionChecksum => "upgrade_transaction_checksum",
            Position::UpgradeTime => "upgrade_time",
            Position::LastClosedTransactionLogVersion => "last_closed_transaction_log_version",
            Position::LastClosedTransactionLogByteOffset => {
                "last_closed_transaction_log_byte_offset"
            }
        }
    }

    /// Looks a position up by [`Position::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|position| position.name() == name)
    }

    /// Human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            Position::Time => "Creation time",
            Position::RandomNumber => "Random number for store id",
            Position::LogVersion => "Current log version",
            Position::LastTransactionId => "Last committed transaction",
            Position::LastTransactionChecksum => "Checksum of last committed transaction",
            Position::StoreVersion => "Store format version",
            Position::FirstGraphProperty => "First property record containing graph properties",
            Position::LastConstraintTransaction => {
                "Last committed transaction containing constraint changes"
            }
            Position::UpgradeTransactionId => "Transaction id most recent upgrade was performed at",
            Position::UpgradeTransactionChecksum => {
                "Checksum of transaction id the most recent upgrade was performed at"
            }
            Position::UpgradeTime => "Time of last upgrade",
            Position::LastClosedTransactionLogVersion => "Log version where the last closed transaction resides",
            Position::LastClosedTransactionLogByteOffset => {
                "Byte offset in the log where the last closed transaction ends"
            }
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One metadata record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaDataRecord {
    /// Record id.
    pub id: i64,
    /// Slot holds a value.
    pub in_use: bool,
    /// Field value.
    pub value: i64,
}

impl Record for MetaDataRecord {
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
        self.in_use = false;
        self.value = FIELD_NOT_PRESENT;
    }
}

/// Format of metadata records.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetaDataRecordFormat;

impl RecordFormat for MetaDataRecordFormat {
    type Record = MetaDataRecord;

    fn type_descriptor(&self) -> &'static str {
        "MetaDataStore"
    }

    fn new_record(&self) -> MetaDataRecord {
        MetaDataRecord {
            id: NULL_REFERENCE,
            in_use: false,
            value: FIELD_NOT_PRESENT,
        }
    }

    fn record_size(&self, _header: &StoreHeader) -> usize {
        META_RECORD_SIZE
    }

    fn max_id(&self) -> i64 {
        (1 << 16) - 1
    }

    fn is_in_use(&self, cursor: &mut PageCursor) -> bool {
        cursor.get_u8() == 1
    }

    fn read(
        &self,
        record: &mut MetaDataRecord,
        cursor: &mut PageCursor,
        _mode: RecordLoad,
        _layout: &StoreLayout,
    ) -> Result<()> {
        record.in_use = cursor.get_u8() == 1;
        record.value = cursor.get_i64();
        Ok(())
    }

    fn write(
        &self,
        record: &MetaDataRecord,
        cursor: &mut PageCursor,
        _layout: &StoreLayout,
    ) -> Result<()> {
        if record.in_use {
            cursor.put_u8(1);
            cursor.put_i64(record.value);
        } else {
            cursor.put_u8(0);
        }
        Ok(())
    }
}

/// A transaction id with its checksum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TransactionId {
    /// Transaction id.
    pub id: i64,
    /// Transaction checksum.
    pub checksum: i64,
}

/// Position in the transaction log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LogPosition {
    /// Log file version.
    pub log_version: i64,
    /// Byte offset within that version.
    pub byte_offset: i64,
}

/// The last closed transaction and where it ends in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ClosedTransaction {
    /// Transaction id.
    pub id: i64,
    /// End of the transaction in the log.
    pub log_position: LogPosition,
}

/// Identity of a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StoreId {
    /// Creation time.
    pub creation_time: i64,
    /// Random number chosen at creation.
    pub random_number: i64,
    /// Encoded store version.
    pub store_version: i64,
    /// Time of the last upgrade.
    pub upgrade_time: i64,
    /// Transaction id of the last upgrade.
    pub upgrade_transaction_id: i64,
}

/// Store of metadata fields with cached values and transaction sequences.
///
/// Writers serialize on one mutex and write every record of a field through a
/// single write cursor; readers of a paired field read both records under one
/// optimistic read.
pub struct MetaDataStore {
    store: RecordStore<MetaDataRecordFormat>,
    write_lock: Mutex<()>,
    fields: RwLock<[i64; POSITION_COUNT]>,
    last_committing_tx: AtomicI64,
    last_committed_tx: OutOfOrderSequence<i64>,
    last_closed_tx: OutOfOrderSequence<[i64; 2]>,
    closed: AtomicBool,
}

impl MetaDataStore {
    /// Opens the metadata store, writing default fields when it is created.
    pub fn open(
        store_path: &Path,
        id_path: &Path,
        id_factory: Arc<dyn IdGeneratorFactory>,
        page_cache: &PageCache,
        options: &StoreOpenOptions,
    ) -> Result<Self> {
        let created = !fs::metadata(store_path)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
        let store = RecordStore::open(
            store_path,
            id_path,
            IdType::NeoStoreBlock,
            id_factory,
            page_cache,
            MetaDataRecordFormat,
            StoreHeaderFormat::NoHeader,
            options,
        )?;
        let defaults = (|| {
            check_pairs_share_a_page(&store.layout())?;
            if created {
                write_defaults(&store)?;
            }
            Ok::<_, StoreError>(())
        })();
        if let Err(err) = defaults {
            if let Err(close_err) = store.close() {
                warn!(
                    path = %store_path.display(),
                    error = %close_err,
                    "meta.open.close_failed"
                );
            }
            return Err(err);
        }

        let meta = Self {
            store,
            write_lock: Mutex::new(()),
            fields: RwLock::new([FIELD_NOT_INITIALIZED; POSITION_COUNT]),
            last_committing_tx: AtomicI64::new(BASE_TX_ID),
            last_committed_tx: OutOfOrderSequence::new(BASE_TX_ID, SEQUENCE_CAPACITY, BASE_TX_CHECKSUM),
            last_closed_tx: OutOfOrderSequence::new(
                BASE_TX_ID,
                SEQUENCE_CAPACITY,
                [BASE_TX_LOG_VERSION, BASE_TX_LOG_BYTE_OFFSET],
            ),
            closed: AtomicBool::new(false),
        };
        meta.init_transaction_sequences()?;
        info!(
            path = %store_path.display(),
            created,
            last_tx = meta.last_committing_tx.load(Ordering::SeqCst),
            "meta.open"
        );
        Ok(meta)
    }

    fn init_transaction_sequences(&self) -> Result<()> {
        let (tx_id, checksum) = self.read_field_pair_from_file(Position::LastTransactionId)?;
        let (log_version, byte_offset) =
            self.read_field_pair_from_file(Position::LastClosedTransactionLogVersion)?;
        let tx_id = present_or(tx_id, BASE_TX_ID);
        let checksum = present_or(checksum, BASE_TX_CHECKSUM);
        let log_version = present_or(log_version, BASE_TX_LOG_VERSION);
        let byte_offset = present_or(byte_offset, BASE_TX_LOG_BYTE_OFFSET);
        self.last_committing_tx.store(tx_id, Ordering::SeqCst);
        self.last_committed_tx.set(tx_id, checksum);
        self.last_closed_tx.set(tx_id, [log_version, byte_offset]);
        Ok(())
    }

    /// The underlying record store.
    pub fn store(&self) -> &RecordStore<MetaDataRecordFormat> {
        &self.store
    }

    fn record_id(&self, position: Position) -> i64 {
        self.store.number_of_reserved_low_ids() + position.index() as i64
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::IllegalState(format!(
                "metadata store at {} is closed",
                self.store.store_path().display()
            )));
        }
        Ok(())
    }

    fn ensure_fields_loaded(&self) -> Result<()> {
        self.ensure_open()?;
        if self.fields.read()[0] != FIELD_NOT_INITIALIZED {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        self.load_fields_locked()
    }

    fn load_fields_locked(&self) -> Result<()> {
        if self.fields.read()[0] != FIELD_NOT_INITIALIZED {
            return Ok(());
        }
        let values = self.read_all_fields_from_file()?;
        *self.fields.write() = values;
        debug!(path = %self.store.store_path().display(), "meta.fields.loaded");
        Ok(())
    }

    /// Reads every field, one consistent read per page.
    fn read_all_fields_from_file(&self) -> Result<[i64; POSITION_COUNT]> {
        let layout = self.store.layout();
        let ids: Vec<i64> = Position::ALL.iter().map(|p| self.record_id(*p)).collect();
        let mut values = [FIELD_NOT_PRESENT; POSITION_COUNT];
        let mut start = 0;
        for page_ids in ids.chunk_by(|a, b| layout.page_id_for(*a) == layout.page_id_for(*b)) {
            let mut records = vec![self.store.new_record(); page_ids.len()];
            self.store
                .get_records_consistent(page_ids, &mut records, RecordLoad::Check)?;
            for (value, record) in values[start..].iter_mut().zip(&records) {
                *value = field_value(record);
            }
            start += page_ids.len();
        }
        Ok(values)
    }

    fn get_field(&self, position: Position) -> Result<i64> {
        self.ensure_fields_loaded()?;
        Ok(self.fields.read()[position.index()])
    }

    fn write_fields_locked(&self, values: &[(Position, i64)]) -> Result<()> {
        let records: Vec<MetaDataRecord> = values
            .iter()
            .map(|(position, value)| MetaDataRecord {
                id: self.record_id(*position),
                in_use: true,
                value: *value,
            })
            .collect();
        self.store.update_records(&records)?;
        let mut fields = self.fields.write();
        if fields[0] != FIELD_NOT_INITIALIZED {
            for (position, value) in values {
                fields[position.index()] = *value;
            }
        }
        Ok(())
    }

    fn set_fields(&self, values: &[(Position, i64)]) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        self.write_fields_locked(values)
    }

    /// Sets one field.
    pub fn set_field(&self, position: Position, value: i64) -> Result<()> {
        self.set_fields(&[(position, value)])
    }

    /// Cached value of one field.
    pub fn field(&self, position: Position) -> Result<i64> {
        self.get_field(position)
    }

    /// Store creation time.
    pub fn creation_time(&self) -> Result<i64> {
        self.get_field(Position::Time)
    }

    /// Sets the creation time.
    pub fn set_creation_time(&self, time: i64) -> Result<()> {
        self.set_field(Position::Time, time)
    }

    /// Random number chosen at creation.
    pub fn random_number(&self) -> Result<i64> {
        self.get_field(Position::RandomNumber)
    }

    /// Sets the random number.
    pub fn set_random_number(&self, number: i64) -> Result<()> {
        self.set_field(Position::RandomNumber, number)
    }

    /// Current log version.
    pub fn current_log_version(&self) -> Result<i64> {
        self.get_field(Position::LogVersion)
    }

    /// Sets the current log version.
    pub fn set_current_log_version(&self, version: i64) -> Result<()> {
        self.set_field(Position::LogVersion, version)
    }

    /// Increments the log version, forces it to disk and returns the new value.
    pub fn increment_and_get_version(&self) -> Result<i64> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        self.load_fields_locked()?;
        let version = self.fields.read()[Position::LogVersion.index()] + 1;
        self.write_fields_locked(&[(Position::LogVersion, version)])?;
        self.store.paged_file()?.flush_and_force()?;
        Ok(version)
    }

    /// Encoded store version.
    pub fn store_version(&self) -> Result<i64> {
        self.get_field(Position::StoreVersion)
    }

    /// Sets the encoded store version.
    pub fn set_store_version(&self, version: i64) -> Result<()> {
        self.set_field(Position::StoreVersion, version)
    }

    /// First graph property record.
    pub fn graph_next_prop(&self) -> Result<i64> {
        self.get_field(Position::FirstGraphProperty)
    }

    /// Sets the first graph property record.
    pub fn set_graph_next_prop(&self, prop: i64) -> Result<()> {
        self.set_field(Position::FirstGraphProperty, prop)
    }

    /// Last transaction that introduced a constraint.
    pub fn latest_constraint_introducing_tx(&self) -> Result<i64> {
        self.get_field(Position::LastConstraintTransaction)
    }

    /// Sets the last transaction that introduced a constraint.
    pub fn set_latest_constraint_introducing_tx(&self, tx_id: i64) -> Result<()> {
        self.set_field(Position::LastConstraintTransaction, tx_id)
    }

    /// Time of the last upgrade.
    pub fn upgrade_time(&self) -> Result<i64> {
        self.get_field(Position::UpgradeTime)
    }

    /// Records the transaction an upgrade happened at. The id, checksum and
    /// time are written under one page latch.
    pub fn set_upgrade_transaction(&self, id: i64, checksum: i64, time: i64) -> Result<()> {
        self.set_fields(&[
            (Position::UpgradeTransactionId, id),
            (Position::UpgradeTransactionChecksum, checksum),
            (Position::UpgradeTime, time),
        ])
    }

    /// Cached upgrade transaction, read as one pair.
    pub fn upgrade_transaction(&self) -> Result<TransactionId> {
        self.ensure_fields_loaded()?;
        let fields = self.fields.read();
        Ok(TransactionId {
            id: fields[Position::UpgradeTransactionId.index()],
            checksum: fields[Position::UpgradeTransactionChecksum.index()],
        })
    }

    /// Hands out the next transaction id to commit.
    pub fn next_committing_transaction_id(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.last_committing_tx.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Highest transaction id handed out for committing.
    pub fn committing_transaction_id(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.last_committing_tx.load(Ordering::SeqCst))
    }

    /// Reports a committed transaction. When the gap-free prefix advances the
    /// new last committed id and checksum are written as one pair.
    pub fn transaction_committed(&self, id: i64, checksum: i64) -> Result<()> {
        self.ensure_open()?;
        if self.last_committed_tx.offer(id, checksum)? {
            let _guard = self.write_lock.lock();
            let (id, checksum) = self.last_committed_tx.get();
            self.write_fields_locked(&[
                (Position::LastTransactionId, id),
                (Position::LastTransactionChecksum, checksum),
            ])?;
        }
        Ok(())
    }

    /// Highest gap-free committed transaction.
    pub fn last_committed_transaction(&self) -> Result<TransactionId> {
        self.ensure_open()?;
        let (id, checksum) = self.last_committed_tx.get();
        Ok(TransactionId { id, checksum })
    }

    /// Id of the highest gap-free committed transaction.
    pub fn last_committed_transaction_id(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.last_committed_tx.highest_gap_free_number())
    }

    /// Reports a closed transaction and where it ends in the log.
    pub fn transaction_closed(&self, id: i64, log_version: i64, byte_offset: i64) -> Result<()> {
        self.ensure_open()?;
        if self.last_closed_tx.offer(id, [log_version, byte_offset])? {
            let _guard = self.write_lock.lock();
            let (_, [log_version, byte_offset]) = self.last_closed_tx.get();
            self.write_fields_locked(&[
                (Position::LastClosedTransactionLogVersion, log_version),
                (Position::LastClosedTransactionLogByteOffset, byte_offset),
            ])?;
        }
        Ok(())
    }

    /// Highest gap-free closed transaction.
    pub fn last_closed_transaction(&self) -> Result<ClosedTransaction> {
        self.ensure_open()?;
        let (id, [log_version, byte_offset]) = self.last_closed_tx.get();
        Ok(ClosedTransaction {
            id,
            log_position: LogPosition {
                log_version,
                byte_offset,
            },
        })
    }

    /// Id of the highest gap-free closed transaction.
    pub fn last_closed_transaction_id(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.last_closed_tx.highest_gap_free_number())
    }

    /// Blocks until transaction `id` is closed or `timeout` passes.
    pub fn await_closed_transaction_id(&self, id: i64, timeout: Duration) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.last_closed_tx.wait_for(id, timeout))
    }

    /// Resets committing, committed and closed transactions to `id`, as after
    /// recovery.
    pub fn set_last_committed_and_closed_transaction_id(
        &self,
        id: i64,
        checksum: i64,
        log_version: i64,
        byte_offset: i64,
    ) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        self.write_fields_locked(&[
            (Position::LastTransactionId, id),
            (Position::LastTransactionChecksum, checksum),
            (Position::LastClosedTransactionLogVersion, log_version),
            (Position::LastClosedTransactionLogByteOffset, byte_offset),
        ])?;
        self.last_committing_tx.store(id, Ordering::SeqCst);
        self.last_committed_tx.set(id, checksum);
        self.last_closed_tx.set(id, [log_version, byte_offset]);
        Ok(())
    }

    /// True when every transaction handed out for committing has closed.
    pub fn closed_transaction_id_is_on_par_with_opened_transaction_id(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.last_closed_tx.highest_gap_free_number()
            == self.last_committing_tx.load(Ordering::SeqCst))
    }

    /// Identity of this store.
    pub fn store_id(&self) -> Result<StoreId> {
        self.ensure_fields_loaded()?;
        let fields = self.fields.read();
        Ok(StoreId {
            creation_time: fields[Position::Time.index()],
            random_number: fields[Position::RandomNumber.index()],
            store_version: fields[Position::StoreVersion.index()],
            upgrade_time: fields[Position::UpgradeTime.index()],
            upgrade_transaction_id: fields[Position::UpgradeTransactionId.index()],
        })
    }

    /// Every field as currently stored on disk.
    pub fn scan_all_records(&self) -> Result<Vec<(Position, i64)>> {
        self.ensure_open()?;
        let values = self.read_all_fields_from_file()?;
        Ok(Position::ALL.iter().copied().zip(values).collect())
    }

    /// Reads one field from disk, bypassing the cache.
    pub fn read_field_from_file(&self, position: Position) -> Result<i64> {
        self.ensure_open()?;
        let mut record = self.store.new_record();
        self.store
            .get_record(self.record_id(position), &mut record, RecordLoad::Check)?;
        Ok(field_value(&record))
    }

    /// Reads `first` and the field after it from disk under one consistent
    /// read.
    pub fn read_field_pair_from_file(&self, first: Position) -> Result<(i64, i64)> {
        self.ensure_open()?;
        let id = self.record_id(first);
        if first.index() + 1 >= POSITION_COUNT {
            return Err(StoreError::Invalid(format!("{first} has no following field")));
        }
        let mut records = [self.store.new_record(), self.store.new_record()];
        self.store
            .get_records_consistent(&[id, id + 1], &mut records, RecordLoad::Check)?;
        Ok((field_value(&records[0]), field_value(&records[1])))
    }

    /// Reads one field of the store file at `store_path` without opening the
    /// store. Returns [`FIELD_NOT_PRESENT`] when the record is absent.
    pub fn get_record(page_cache: &PageCache, store_path: &Path, position: Position) -> Result<i64> {
        with_tooling_file(page_cache, store_path, |file, layout| {
            read_raw_field(file, layout, position)
        })
    }

    /// Overwrites one field of the store file at `store_path` without opening
    /// the store. Returns the previous value, or [`FIELD_NOT_PRESENT`].
    pub fn set_record(
        page_cache: &PageCache,
        store_path: &Path,
        position: Position,
        value: i64,
    ) -> Result<i64> {
        with_tooling_file(page_cache, store_path, |file, layout| {
            let previous = read_raw_field(file, layout, position)?;
            let id = layout.reserved + position.index() as i64;
            {
                let mut cursor = file.io(layout.page_id_for(id), PageLock::Write)?;
                cursor.next()?;
                cursor.set_offset(layout.offset_for(id));
                cursor.put_u8(1);
                cursor.put_i64(value);
                if cursor.check_and_clear_bounds_flag() {
                    return Err(StoreError::UnderlyingStorage(format!(
                        "metadata record {id} overflows its page"
                    )));
                }
            }
            file.flush_and_force()?;
            info!(
                path = %store_path.display(),
                %position,
                previous,
                value,
                "meta.set_record"
            );
            Ok(previous)
        })
    }

    /// Flushes the store.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.store.flush()
    }

    /// Closes the store. Later field access fails with `IllegalState`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        self.store.close()
    }
}

impl fmt::Debug for MetaDataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaDataStore")
            .field("store", &self.store)
            .field("last_committing_tx", &self.last_committing_tx)
            .field("closed", &self.closed)
            .finish()
    }
}

fn present_or(value: i64, default: i64) -> i64 {
    if value == FIELD_NOT_PRESENT {
        default
    } else {
        value
    }
}

fn field_value(record: &MetaDataRecord) -> i64 {
    if record.in_use {
        record.value
    } else {
        FIELD_NOT_PRESENT
    }
}

/// Rejects layouts whose pages would split a paired field.
fn check_pairs_share_a_page(layout: &StoreLayout) -> Result<()> {
    for first in PAIRED_FIELDS {
        let id = layout.reserved + first.index() as i64;
        if layout.page_id_for(id) != layout.page_id_for(id + 1) {
            return Err(StoreError::Invalid(format!(
                "{} records per page split {first} from the field after it",
                layout.records_per_page
            )));
        }
    }
    Ok(())
}

fn write_defaults(store: &RecordStore<MetaDataRecordFormat>) -> Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0);
    let random = rand::thread_rng().gen_range(0..i64::MAX);
    let values = [
        (Position::Time, now),
        (Position::RandomNumber, random),
        (Position::LogVersion, 0),
        (Position::LastTransactionId, BASE_TX_ID),
        (Position::LastTransactionChecksum, BASE_TX_CHECKSUM),
        (Position::StoreVersion, version_string_to_long(ALL_STORES_VERSION)?),
        (Position::FirstGraphProperty, NULL_REFERENCE),
        (Position::LastConstraintTransaction, 0),
        (Position::UpgradeTransactionId, BASE_TX_ID),
        (Position::UpgradeTransactionChecksum, BASE_TX_CHECKSUM),
        (Position::UpgradeTime, BASE_TX_COMMIT_TIMESTAMP),
        (Position::LastClosedTransactionLogVersion, BASE_TX_LOG_VERSION),
        (Position::LastClosedTransactionLogByteOffset, BASE_TX_LOG_BYTE_OFFSET),
    ];
    let reserved = store.number_of_reserved_low_ids();
    let records: Vec<MetaDataRecord> = values
        .iter()
        .map(|(position, value)| MetaDataRecord {
            id: reserved + position.index() as i64,
            in_use: true,
            value: *value,
        })
        .collect();
    store.update_records(&records)?;
    store.flush()
}

fn with_tooling_file<T>(
    page_cache: &PageCache,
    store_path: &Path,
    body: impl FnOnce(&Arc<PagedFile>, &StoreLayout) -> Result<T>,
) -> Result<T> {
    let descriptor = store_descriptor(MetaDataRecordFormat.type_descriptor());
    probe_header(page_cache, store_path, &StoreHeaderFormat::NoHeader, &descriptor)?;
    let layout = StoreLayout::new(page_cache.page_size(), META_RECORD_SIZE, header_len(&descriptor))?;
    let file = page_cache.map(store_path, layout.file_page_size(), MapOptions::default())?;
    let result = body(&file, &layout);
    let closed = file.close();
    let value = result?;
    closed?;
    Ok(value)
}

fn read_raw_field(file: &Arc<PagedFile>, layout: &StoreLayout, position: Position) -> Result<i64> {
    let id = layout.reserved + position.index() as i64;
    let mut cursor = file.io(layout.page_id_for(id), PageLock::Read)?;
    if !cursor.next()? {
        return Ok(FIELD_NOT_PRESENT);
    }
    cursor.set_offset(layout.offset_for(id));
    let (in_use, value) = read_with_retry(&mut cursor, |cursor| {
        Ok((cursor.get_u8() == 1, cursor.get_i64()))
    })?;
    if cursor.check_and_clear_bounds_flag() {
        return Err(StoreError::UnderlyingStorage(format!(
            "metadata record {id} overflows its page"
        )));
    }
    Ok(if in_use { value } else { FIELD_NOT_PRESENT })
}

/// Packs a version string of at most seven single-byte characters into an
/// i64: the length in the top byte, then the characters. [`UNKNOWN_VERSION`]
/// maps to -1.
pub fn version_string_to_long(version: &str) -> Result<i64> {
    if version == UNKNOWN_VERSION {
        return Ok(-1);
    }
    let chars: Vec<char> = version.chars().collect();
    if chars.is_empty() || chars.len() > MAX_VERSION_LEN {
        return Err(StoreError::Invalid(format!(
            "version {version:?} must have 1 to {MAX_VERSION_LEN} characters"
        )));
    }
    let mut packed = (chars.len() as u64) << 56;
    for (index, ch) in chars.iter().enumerate() {
        let code = *ch as u32;
        if code > 0xFF {
            return Err(StoreError::Invalid(format!(
                "version {version:?} has a character outside one byte"
            )));
        }
        packed |= (code as u64) << (48 - 8 * index);
    }
    Ok(packed as i64)
}

/// Inverse of [`version_string_to_long`].
pub fn version_long_to_string(packed: i64) -> Result<String> {
    if packed == -1 {
        return Ok(UNKNOWN_VERSION.to_string());
    }
    let raw = packed as u64;
    let length = (raw >> 56) as usize;
    if length == 0 || length > MAX_VERSION_LEN {
        return Err(StoreError::Invalid(format!(
            "{packed:#x} does not encode a version string"
        )));
    }
    Ok((0..length)
        .map(|index| ((raw >> (48 - 8 * index)) & 0xFF) as u8 as char)
        .collect())
}
