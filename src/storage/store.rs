//! Fixed-slot record store over a paged file.

#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::header::{
    header_len, read_header, store_descriptor, verify_descriptor, write_header, StoreHeader,
    StoreHeaderFormat,
};
use super::id::{IdGenerator, IdGeneratorFactory, IdType};
use super::metrics::{default_metrics, StoreMetrics};
use super::options::StoreOpenOptions;
use super::record::{Record, RecordFormat, RecordLoad, StoreLayout};
use crate::primitives::io::remove_if_exists;
use crate::primitives::pager::{
    read_with_retry, MapOptions, PageCache, PageCursor, PageLock, PagedFile, PagedFileStats,
};
use crate::types::{assert_valid_record_id, Result, StoreError};

/// A store of fixed-size records addressed by id.
///
/// The store owns its paged file and its id generator. Reads are optimistic
/// and retried until consistent; writes take the page latch through a write
/// cursor. Callers coordinate so that a single writer updates any one record.
pub struct RecordStore<F: RecordFormat> {
    store_path: PathBuf,
    id_path: PathBuf,
    id_type: IdType,
    format: F,
    header: StoreHeader,
    layout: StoreLayout,
    id_factory: Arc<dyn IdGeneratorFactory>,
    paged_file: RwLock<Option<Arc<PagedFile>>>,
    id_generator: RwLock<Option<Arc<IdGenerator>>>,
    delete_on_close: bool,
    metrics: Arc<dyn StoreMetrics>,
}

impl<F: RecordFormat> RecordStore<F> {
    /// Opens the store at `store_path`, creating it when allowed and absent.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        store_path: &Path,
        id_path: &Path,
        id_type: IdType,
        id_factory: Arc<dyn IdGeneratorFactory>,
        page_cache: &PageCache,
        format: F,
        header_format: StoreHeaderFormat,
        options: &StoreOpenOptions,
    ) -> Result<Self> {
        let descriptor = store_descriptor(format.type_descriptor());
        let has_data = fs::metadata(store_path)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
        let map_options = MapOptions {
            create: false,
            delete_on_close: options.delete_on_close,
        };

        let (header, layout, paged_file) = if has_data {
            let header = probe_header(page_cache, store_path, &header_format, &descriptor)?;
            let layout = StoreLayout::new(
                page_cache.page_size(),
                format.record_size(&header),
                header_len(&descriptor),
            )?;
            let file = page_cache.map(store_path, layout.file_page_size(), map_options)?;
            (header, layout, file)
        } else {
            if !options.create {
                return Err(StoreError::StoreNotFound(store_path.display().to_string()));
            }
            let header = header_format.generate();
            let layout = StoreLayout::new(
                page_cache.page_size(),
                format.record_size(&header),
                header_len(&descriptor),
            )?;
            let file = page_cache.map(
                store_path,
                layout.file_page_size(),
                MapOptions {
                    create: true,
                    ..map_options
                },
            )?;
            if let Err(err) = initialize_file(&file, &header, &descriptor) {
                close_after_failure(&file, store_path);
                return Err(err);
            }
            remove_if_exists(id_path)?;
            info!(
                store = format.type_descriptor(),
                path = %store_path.display(),
                record_size = layout.record_size,
                reserved = layout.reserved,
                "store.create"
            );
            (header, layout, file)
        };

        let store = Self {
            store_path: store_path.to_path_buf(),
            id_path: id_path.to_path_buf(),
            id_type,
            format,
            header,
            layout,
            id_factory,
            paged_file: RwLock::new(Some(Arc::clone(&paged_file))),
            id_generator: RwLock::new(None),
            delete_on_close: options.delete_on_close,
            metrics: options.metrics.clone().unwrap_or_else(default_metrics),
        };
        if let Err(err) = store.init_id_generator(options.rebuild_idgenerators_fast) {
            store.paged_file.write().take();
            close_after_failure(&paged_file, store_path);
            return Err(err);
        }
        debug!(
            store = store.format.type_descriptor(),
            path = %store_path.display(),
            high_id = store.high_id().unwrap_or(-1),
            "store.open"
        );
        Ok(store)
    }

    fn init_id_generator(&self, fast: bool) -> Result<()> {
        let max_id = self.format.max_id();
        let mut supplier = || self.scan_for_high_id();
        match self
            .id_factory
            .open(&self.id_path, self.id_type, &mut supplier, max_id)
        {
            Ok(generator) => {
                *self.id_generator.write() = Some(generator);
                Ok(())
            }
            Err(err @ (StoreError::StoreFailure(_) | StoreError::Consistency(_))) => {
                warn!(
                    store = self.format.type_descriptor(),
                    id_file = %self.id_path.display(),
                    error = %err,
                    fast,
                    "store.id_generator.rebuild_required"
                );
                if fast {
                    self.rebuild_id_generator_fast()
                } else {
                    self.rebuild_id_generator()
                }
            }
            Err(err) => Err(err),
        }
    }

    fn rebuild_id_generator_fast(&self) -> Result<()> {
        let high_id = self.scan_for_high_id()?;
        let generator = self.id_factory.create(
            &self.id_path,
            self.id_type,
            high_id,
            false,
            self.format.max_id(),
        )?;
        *self.id_generator.write() = Some(generator);
        self.metrics
            .id_generator_rebuilt(self.format.type_descriptor(), false);
        info!(
            store = self.format.type_descriptor(),
            high_id,
            "store.rebuild_id_generator_fast.complete"
        );
        Ok(())
    }

    /// Recreates the id file by scanning every slot below the high id and
    /// freeing the ones not in use.
    pub fn rebuild_id_generator(&self) -> Result<()> {
        if let Some(previous) = self.id_generator.write().take() {
            previous.close()?;
        }
        remove_if_exists(&self.id_path)?;
        let high_id = self.scan_for_high_id()?;
        let generator = self.id_factory.create(
            &self.id_path,
            self.id_type,
            high_id,
            true,
            self.format.max_id(),
        )?;
        let file = self.paged_file()?;
        let layout = self.layout;
        let mut freed = 0u64;
        if high_id > layout.reserved {
            let last_page = layout.page_id_for(high_id - 1);
            let mut cursor = file.io(0, PageLock::Read)?;
            for page_id in 0..=last_page {
                if !cursor.next_to(page_id)? {
                    break;
                }
                let first = layout.first_id_on(page_id).max(layout.reserved);
                let end = layout.first_id_on(page_id + 1).min(high_id);
                let free = read_with_retry(&mut cursor, |cursor| {
                    let mut free = Vec::new();
                    for id in first..end {
                        cursor.set_offset(layout.offset_for(id));
                        if !self.format.is_in_use(cursor) {
                            free.push(id);
                        }
                    }
                    Ok(free)
                })?;
                self.check_bounds(&mut cursor, first)?;
                for id in free {
                    generator.free_id(id)?;
                    freed += 1;
                }
            }
        }
        generator.checkpoint()?;
        *self.id_generator.write() = Some(generator);
        self.metrics
            .id_generator_rebuilt(self.format.type_descriptor(), true);
        info!(
            store = self.format.type_descriptor(),
            high_id,
            freed,
            "store.rebuild_id_generator.complete"
        );
        Ok(())
    }

    /// Scans pages backwards for the highest slot in use; returns one past it,
    /// or the reserved record count for an empty store.
    pub fn scan_for_high_id(&self) -> Result<i64> {
        let file = self.paged_file()?;
        let layout = self.layout;
        let last_page = file.last_page_id();
        let mut cursor = file.io(last_page, PageLock::Read)?;
        for page_id in (0..=last_page).rev() {
            if !cursor.next_to(page_id)? {
                continue;
            }
            let first = layout.first_id_on(page_id).max(layout.reserved);
            let end = layout.first_id_on(page_id + 1);
            let highest = read_with_retry(&mut cursor, |cursor| {
                for id in (first..end).rev() {
                    cursor.set_offset(layout.offset_for(id));
                    if self.format.is_in_use(cursor) {
                        return Ok(Some(id));
                    }
                }
                Ok(None)
            })?;
            self.check_bounds(&mut cursor, first)?;
            if let Some(id) = highest {
                return Ok(id + 1);
            }
        }
        Ok(layout.reserved)
    }

    /// A blank record of this store's type.
    pub fn new_record(&self) -> F::Record {
        self.format.new_record()
    }

    /// Reads record `id` into `record` according to `mode`.
    pub fn get_record(&self, id: i64, record: &mut F::Record, mode: RecordLoad) -> Result<()> {
        let file = self.paged_file()?;
        let mut cursor = file.io(self.page_id_for(id), PageLock::Read)?;
        self.get_record_by_cursor(id, record, mode, &mut cursor)
    }

    /// Like [`RecordStore::get_record`] but reuses `cursor`, which must be a
    /// read cursor on this store's file.
    pub fn get_record_by_cursor(
        &self,
        id: i64,
        record: &mut F::Record,
        mode: RecordLoad,
        cursor: &mut PageCursor,
    ) -> Result<()> {
        self.load_record(id, record, mode, cursor)?;
        mode.verify(record)
    }

    /// Decodes slot `id` into `record` without judging whether it is in use.
    ///
    /// Negative ids and slots past the end of the file load as blank records.
    /// Decoding problems raise [`StoreError::InvalidRecord`] only in
    /// [`RecordLoad::Normal`].
    pub(crate) fn load_record(
        &self,
        id: i64,
        record: &mut F::Record,
        mode: RecordLoad,
        cursor: &mut PageCursor,
    ) -> Result<()> {
        record.set_id(id);
        if id < 0 || !cursor.next_to(self.page_id_for(id))? {
            record.clear();
            return Ok(());
        }
        cursor.set_offset(self.layout.offset_for(id));
        read_with_retry(cursor, |cursor| {
            record.set_in_use(false);
            self.format.read(record, cursor, mode, &self.layout)
        })?;
        self.check_for_decoding_errors(cursor, id, mode)?;
        self.metrics.record_read(self.format.type_descriptor());
        Ok(())
    }

    /// Reads several records of one page under a single consistent read.
    pub fn get_records_consistent(
        &self,
        ids: &[i64],
        records: &mut [F::Record],
        mode: RecordLoad,
    ) -> Result<()> {
        if ids.len() != records.len() {
            return Err(StoreError::Invalid(format!(
                "{} ids for {} records",
                ids.len(),
                records.len()
            )));
        }
        let Some(first) = ids.first() else {
            return Ok(());
        };
        if let Some(negative) = ids.iter().find(|id| **id < 0) {
            return Err(StoreError::NegativeId(*negative));
        }
        let page_id = self.page_id_for(*first);
        if ids.iter().any(|id| self.page_id_for(*id) != page_id) {
            return Err(StoreError::Invalid(
                "records read together must share a page".into(),
            ));
        }
        let file = self.paged_file()?;
        let mut cursor = file.io(page_id, PageLock::Read)?;
        if !cursor.next()? {
            for (id, record) in ids.iter().zip(records.iter_mut()) {
                record.set_id(*id);
                record.clear();
                mode.verify(record)?;
            }
            return Ok(());
        }
        read_with_retry(&mut cursor, |cursor| {
            for (id, record) in ids.iter().zip(records.iter_mut()) {
                record.set_id(*id);
                record.set_in_use(false);
                cursor.set_offset(self.layout.offset_for(*id));
                self.format.read(record, cursor, mode, &self.layout)?;
            }
            Ok(())
        })?;
        self.check_for_decoding_errors(&mut cursor, *first, mode)?;
        for record in records.iter_mut() {
            self.metrics.record_read(self.format.type_descriptor());
            mode.verify(record)?;
        }
        Ok(())
    }

    fn check_bounds(&self, cursor: &mut PageCursor, id: i64) -> Result<()> {
        if cursor.check_and_clear_bounds_flag() {
            return Err(StoreError::UnderlyingStorage(format!(
                "access to record {id} of {} went out of page bounds; record size {} bytes, page size {} bytes",
                self.format.type_descriptor(),
                self.layout.record_size,
                cursor.page_size()
            )));
        }
        Ok(())
    }

    fn check_for_decoding_errors(
        &self,
        cursor: &mut PageCursor,
        id: i64,
        mode: RecordLoad,
    ) -> Result<()> {
        self.check_bounds(cursor, id)?;
        if let Some(message) = cursor.take_cursor_exception() {
            if mode == RecordLoad::Normal {
                return Err(StoreError::InvalidRecord(format!(
                    "record {id} of {}: {message}",
                    self.format.type_descriptor()
                )));
            }
        }
        Ok(())
    }

    fn validate_for_write(&self, record: &F::Record, high_id: i64) -> Result<()> {
        let max_id = self.format.max_id();
        assert_valid_record_id(record.id(), max_id)?;
        if record.has_secondary_unit_id() {
            assert_valid_record_id(record.secondary_unit_id(), max_id)?;
        }
        if !record.in_use() && record.id() >= high_id {
            return Err(StoreError::Invalid(format!(
                "cannot delete record {} at or above high id {high_id}",
                record.id()
            )));
        }
        Ok(())
    }

    /// Writes `record` to its slot.
    ///
    /// Ids are validated before anything is written. A record written as not
    /// in use has its id freed, and so does a secondary unit it no longer
    /// needs. Each change must be applied once: writing the same deletion
    /// twice frees the id twice.
    pub fn update_record(&self, record: &F::Record) -> Result<()> {
        self.update_records(std::slice::from_ref(record))
    }

    /// Writes `records` through one write cursor, validating all of them first.
    /// Records that share a page are written under a single page latch.
    pub fn update_records(&self, records: &[F::Record]) -> Result<()> {
        let generator = self.id_generator()?;
        let high_id = generator.high_id();
        for record in records {
            self.validate_for_write(record, high_id)?;
        }
        let Some(first) = records.first() else {
            return Ok(());
        };
        let file = self.paged_file()?;
        let mut written = 0;
        let outcome = (|| -> Result<()> {
            let mut cursor = file.io(self.layout.page_id_for(first.id()), PageLock::Write)?;
            for record in records {
                let id = record.id();
                cursor.next_to(self.layout.page_id_for(id))?;
                cursor.set_offset(self.layout.offset_for(id));
                self.format.write(record, &mut cursor, &self.layout)?;
                self.check_for_decoding_errors(&mut cursor, id, RecordLoad::Normal)?;
                written += 1;
            }
            Ok(())
        })();
        // Records that reached the page keep their id bookkeeping even when a
        // later record of the batch is rejected.
        for record in &records[..written] {
            self.after_write(record, &generator)?;
        }
        outcome
    }

    fn after_write(&self, record: &F::Record, generator: &IdGenerator) -> Result<()> {
        let store = self.format.type_descriptor();
        self.metrics.record_written(store, record.in_use());
        if record.in_use() {
            generator.mark_id_in_use(record.id())?;
            if record.has_secondary_unit_id() {
                if record.requires_secondary_unit() {
                    generator.mark_id_in_use(record.secondary_unit_id())?;
                } else {
                    generator.free_id(record.secondary_unit_id())?;
                    self.metrics.id_freed(store);
                }
            }
        } else {
            generator.free_id(record.id())?;
            self.metrics.id_freed(store);
            if record.has_secondary_unit_id() {
                generator.free_id(record.secondary_unit_id())?;
                self.metrics.id_freed(store);
            }
        }
        Ok(())
    }

    /// Lets the format allocate any extra ids `record` needs before writing.
    pub fn prepare_for_commit(&self, record: &mut F::Record) -> Result<()> {
        let generator = self.id_generator()?;
        let store = self.format.type_descriptor();
        let metrics = &self.metrics;
        self.format.prepare(record, &self.layout, &mut || {
            let id = generator.next_id()?;
            metrics.id_allocated(store);
            Ok(id)
        })
    }

    /// Visits every in-use record from the first non-reserved id up to the
    /// high id. The visitor returns false to stop early.
    pub fn scan_all_records(
        &self,
        mut visitor: impl FnMut(&F::Record) -> Result<bool>,
    ) -> Result<()> {
        for record in self.records()? {
            if !visitor(&record?)? {
                break;
            }
        }
        Ok(())
    }

    /// Lazy forward iterator over in-use records below the current high id.
    pub fn records(&self) -> Result<RecordScan<'_, F>> {
        let file = self.paged_file()?;
        let high_id = self.high_id()?;
        Ok(RecordScan {
            store: self,
            cursor: file.io(0, PageLock::Read)?,
            next_id: self.layout.reserved,
            high_id,
            record: self.format.new_record(),
            done: false,
        })
    }

    /// Whether slot `id` is occupied.
    pub fn is_in_use(&self, id: i64) -> Result<bool> {
        let file = self.paged_file()?;
        let mut cursor = file.io(self.page_id_for(id), PageLock::Read)?;
        if !cursor.next()? {
            return Ok(false);
        }
        cursor.set_offset(self.layout.offset_for(id));
        let in_use = read_with_retry(&mut cursor, |cursor| Ok(self.format.is_in_use(cursor)))?;
        self.check_bounds(&mut cursor, id)?;
        Ok(in_use)
    }

    /// Raw bytes of slot `id`, zeroes past the end of the file.
    pub fn get_raw_record_data(&self, id: i64) -> Result<Vec<u8>> {
        let file = self.paged_file()?;
        let mut data = vec![0u8; self.layout.record_size];
        let mut cursor = file.io(self.page_id_for(id), PageLock::Read)?;
        if cursor.next()? {
            cursor.set_offset(self.layout.offset_for(id));
            read_with_retry(&mut cursor, |cursor| {
                cursor.get_bytes(&mut data);
                Ok(())
            })?;
            self.check_bounds(&mut cursor, id)?;
        }
        Ok(data)
    }

    /// Allocates an id.
    pub fn next_id(&self) -> Result<i64> {
        let id = self.id_generator()?.next_id()?;
        self.metrics.id_allocated(self.format.type_descriptor());
        Ok(id)
    }

    /// Returns an id to the free list without touching its slot.
    pub fn free_id(&self, id: i64) -> Result<()> {
        self.id_generator()?.free_id(id)?;
        self.metrics.id_freed(self.format.type_descriptor());
        Ok(())
    }

    /// Smallest id never allocated.
    pub fn high_id(&self) -> Result<i64> {
        Ok(self.id_generator()?.high_id())
    }

    /// Overrides the high id.
    pub fn set_high_id(&self, high_id: i64) -> Result<()> {
        self.id_generator()?.set_high_id(high_id)
    }

    /// `high_id - 1`.
    pub fn highest_possible_id_in_use(&self) -> Result<i64> {
        Ok(self.id_generator()?.highest_possible_id_in_use())
    }

    /// Sets the high id to one past `id`.
    pub fn set_highest_possible_id_in_use(&self, id: i64) -> Result<()> {
        self.set_high_id(id + 1)
    }

    /// Ids below the high id not on the free list.
    pub fn number_of_ids_in_use(&self) -> Result<i64> {
        Ok(self.id_generator()?.number_of_ids_in_use())
    }

    /// Low ids occupied by the store header.
    pub fn number_of_reserved_low_ids(&self) -> i64 {
        self.layout.reserved
    }

    /// Bytes per record.
    pub fn record_size(&self) -> usize {
        self.layout.record_size
    }

    /// Records per file page.
    pub fn records_per_page(&self) -> usize {
        self.layout.records_per_page
    }

    /// File geometry.
    pub fn layout(&self) -> StoreLayout {
        self.layout
    }

    /// Header read (or written) when the store was opened.
    pub fn store_header(&self) -> StoreHeader {
        self.header
    }

    /// Record format.
    pub fn format(&self) -> &F {
        &self.format
    }

    /// Type part of the descriptor.
    pub fn type_descriptor(&self) -> &'static str {
        self.format.type_descriptor()
    }

    /// Id type of this store.
    pub fn id_type(&self) -> IdType {
        self.id_type
    }

    /// Store file path.
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Id file path.
    pub fn id_path(&self) -> &Path {
        &self.id_path
    }

    /// The mapped file, while the store is open.
    pub fn paged_file(&self) -> Result<Arc<PagedFile>> {
        self.paged_file.read().clone().ok_or_else(|| self.closed_error())
    }

    /// The id generator, while the store is open.
    pub fn id_generator(&self) -> Result<Arc<IdGenerator>> {
        self.id_generator.read().clone().ok_or_else(|| self.closed_error())
    }

    /// Paged file counters.
    pub fn paged_file_stats(&self) -> Result<PagedFileStats> {
        Ok(self.paged_file()?.stats())
    }

    /// Writes dirty pages back and checkpoints the id file.
    pub fn flush(&self) -> Result<()> {
        self.paged_file()?.flush_and_force()?;
        self.id_generator()?.checkpoint()
    }

    /// Closes the paged file, then the id generator. Both are attempted and
    /// every failure is reported. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let file = self.paged_file.write().take();
        let generator = self.id_generator.write().take();
        let file_result = file.map_or(Ok(()), |file| file.close());
        let id_result = generator.map_or(Ok(()), |generator| {
            if self.delete_on_close {
                generator.delete()
            } else {
                generator.close()
            }
        });
        debug!(
            store = self.format.type_descriptor(),
            path = %self.store_path.display(),
            "store.close"
        );
        match (file_result, id_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Err(file_err), Err(id_err)) => Err(StoreError::StoreFailure(format!(
                "closing {} failed: {file_err}; closing its id generator also failed: {id_err}",
                self.format.type_descriptor()
            ))),
        }
    }

    fn page_id_for(&self, id: i64) -> i64 {
        if id < 0 {
            -1
        } else {
            self.layout.page_id_for(id)
        }
    }

    fn closed_error(&self) -> StoreError {
        StoreError::IllegalState(format!(
            "{} at {} is closed",
            self.format.type_descriptor(),
            self.store_path.display()
        ))
    }
}

impl<F: RecordFormat> fmt::Debug for RecordStore<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStore")
            .field("type", &self.format.type_descriptor())
            .field("path", &self.store_path)
            .field("layout", &self.layout)
            .field("header", &self.header)
            .finish()
    }
}

/// Iterator returned by [`RecordStore::records`].
pub struct RecordScan<'a, F: RecordFormat> {
    store: &'a RecordStore<F>,
    cursor: PageCursor,
    next_id: i64,
    high_id: i64,
    record: F::Record,
    done: bool,
}

impl<F: RecordFormat> Iterator for RecordScan<'_, F> {
    type Item = Result<F::Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.next_id < self.high_id {
            let id = self.next_id;
            self.next_id += 1;
            match self.store.get_record_by_cursor(
                id,
                &mut self.record,
                RecordLoad::Check,
                &mut self.cursor,
            ) {
                Ok(()) if self.record.in_use() => return Some(Ok(self.record.clone())),
                Ok(()) => continue,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

pub(crate) fn probe_header(
    page_cache: &PageCache,
    store_path: &Path,
    header_format: &StoreHeaderFormat,
    descriptor: &str,
) -> Result<StoreHeader> {
    let probe = page_cache.map(store_path, page_cache.page_size(), MapOptions::default())?;
    let read = (|| {
        let mut cursor = probe.io(0, PageLock::Read)?;
        if !cursor.next()? {
            return Err(StoreError::StoreNotFound(format!(
                "{} has no header page",
                store_path.display()
            )));
        }
        read_header(&mut cursor, header_format)
    })();
    let closed = probe.close();
    let (header, found) = read?;
    closed?;
    verify_descriptor(descriptor, &found)?;
    Ok(header)
}

fn initialize_file(file: &Arc<PagedFile>, header: &StoreHeader, descriptor: &str) -> Result<()> {
    {
        let mut cursor = file.io(0, PageLock::Write)?;
        cursor.next()?;
        write_header(&mut cursor, header, descriptor)?;
    }
    file.flush_and_force()
}

fn close_after_failure(file: &PagedFile, path: &Path) {
    if let Err(err) = file.close() {
        warn!(path = %path.display(), error = %err, "store.open.close_failed");
    }
}
