use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::cursor::{PageCursor, PageLock};
use super::frame::PageFrame;
use crate::primitives::io::{remove_if_exists, FileIo, StdFileIo};
use crate::types::{Result, StoreError};

/// Default page size used by [`PageCacheOptions::default`].
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Configuration for a [`PageCache`].
#[derive(Clone, Debug)]
pub struct PageCacheOptions {
    /// Size of a cache page in bytes. Mapped files may use a smaller page.
    pub page_size: usize,
    /// Number of pages each mapped file keeps resident before evicting.
    pub cache_pages: usize,
}

impl Default for PageCacheOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
        }
    }
}

/// Per-mapping flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct MapOptions {
    /// Create the file when it does not exist.
    pub create: bool,
    /// Remove the file once the last mapping closes.
    pub delete_on_close: bool,
}

/// Hands out [`PagedFile`] mappings. Mapping the same path twice with the same
/// page size returns the live mapping.
pub struct PageCache {
    options: PageCacheOptions,
    mapped: Mutex<HashMap<PathBuf, Weak<PagedFile>>>,
}

impl PageCache {
    /// Creates a cache; the page size must be non-zero.
    pub fn new(options: PageCacheOptions) -> Result<Self> {
        if options.page_size == 0 {
            return Err(StoreError::Invalid("page size must be non-zero".into()));
        }
        if options.cache_pages == 0 {
            return Err(StoreError::Invalid("cache must hold at least one page".into()));
        }
        Ok(Self {
            options,
            mapped: Mutex::new(HashMap::new()),
        })
    }

    /// Cache page size in bytes.
    pub fn page_size(&self) -> usize {
        self.options.page_size
    }

    /// Maps `path` with pages of `file_page_size` bytes.
    pub fn map(
        &self,
        path: &Path,
        file_page_size: usize,
        options: MapOptions,
    ) -> Result<Arc<PagedFile>> {
        if file_page_size == 0 || file_page_size > self.options.page_size {
            return Err(StoreError::Invalid(format!(
                "file page size {file_page_size} outside 1..={}",
                self.options.page_size
            )));
        }
        let mut mapped = self.mapped.lock();
        mapped.retain(|_, weak| weak.strong_count() > 0);
        if let Some(existing) = mapped.get(path).and_then(Weak::upgrade) {
            if !existing.is_closed() {
                if existing.page_size != file_page_size {
                    return Err(StoreError::Invalid(format!(
                        "{} already mapped with page size {}",
                        path.display(),
                        existing.page_size
                    )));
                }
                existing.mappings.fetch_add(1, Ordering::AcqRel);
                return Ok(existing);
            }
        }
        let file = Arc::new(PagedFile::open(
            path,
            file_page_size,
            self.options.cache_pages,
            options,
        )?);
        mapped.insert(path.to_path_buf(), Arc::downgrade(&file));
        Ok(file)
    }
}

/// Snapshot of paged file counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PagedFileStats {
    /// Pages pinned by cursors.
    pub pins: u64,
    /// Pages loaded from disk (or zero-filled past the end of file).
    pub faults: u64,
    /// Pages evicted from the cache.
    pub evictions: u64,
    /// Dirty pages written back.
    pub flushes: u64,
    /// Read attempts repeated because of a concurrent write.
    pub read_retries: u64,
}

#[derive(Default)]
struct Counters {
    pins: AtomicU64,
    faults: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
    read_retries: AtomicU64,
}

/// A file viewed as a sequence of fixed-size pages.
pub struct PagedFile {
    path: PathBuf,
    io: StdFileIo,
    page_size: usize,
    max_resident: usize,
    frames: Mutex<LruCache<i64, Arc<PageFrame>>>,
    last_page_id: AtomicI64,
    mappings: AtomicUsize,
    closed: AtomicBool,
    delete_on_close: bool,
    torn_reads: AtomicU32,
    counters: Counters,
}

impl PagedFile {
    fn open(path: &Path, page_size: usize, max_resident: usize, options: MapOptions) -> Result<Self> {
        let io = StdFileIo::open(path, options.create)?;
        let len = io.len()?;
        let last_page_id = (len.div_ceil(page_size as u64) as i64) - 1;
        debug!(
            path = %path.display(),
            page_size,
            last_page_id,
            "paged_file.map"
        );
        Ok(Self {
            path: path.to_path_buf(),
            io,
            page_size,
            max_resident,
            frames: Mutex::new(LruCache::unbounded()),
            last_page_id: AtomicI64::new(last_page_id),
            mappings: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
            delete_on_close: options.delete_on_close,
            torn_reads: AtomicU32::new(0),
            counters: Counters::default(),
        })
    }

    /// Opens a cursor positioned so that the first `next()` pins `page_id`.
    pub fn io(self: &Arc<Self>, page_id: i64, lock: PageLock) -> Result<PageCursor> {
        self.ensure_open()?;
        Ok(PageCursor::new(Arc::clone(self), page_id, lock))
    }

    /// Page size of this mapping in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Highest page id that holds data, or -1 for an empty file.
    pub fn last_page_id(&self) -> i64 {
        self.last_page_id.load(Ordering::Acquire)
    }

    /// Logical size of the file, including pages not yet written back.
    pub fn file_size(&self) -> u64 {
        ((self.last_page_id() + 1) as u64) * self.page_size as u64
    }

    /// Path of the mapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true once the final mapping has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Forces the next `count` read validations to report a torn read.
    pub fn inject_torn_reads(&self, count: u32) {
        self.torn_reads.fetch_add(count, Ordering::AcqRel);
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PagedFileStats {
        PagedFileStats {
            pins: self.counters.pins.load(Ordering::Relaxed),
            faults: self.counters.faults.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            read_retries: self.counters.read_retries.load(Ordering::Relaxed),
        }
    }

    /// Writes every dirty page back and syncs the file.
    ///
    /// Waits for write cursors on each page to unpin, so it must not be called
    /// while the current thread holds a write cursor on this file.
    pub fn flush_and_force(&self) -> Result<()> {
        self.ensure_open()?;
        self.flush_dirty()?;
        self.io.sync_all()
    }

    /// Releases one mapping. The last release flushes and closes the file.
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let remaining = self.mappings.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if remaining > 0 {
            return self.flush_and_force();
        }
        let result = self.flush_dirty().and_then(|_| self.io.sync_all());
        self.closed.store(true, Ordering::Release);
        self.frames.lock().clear();
        debug!(path = %self.path.display(), "paged_file.close");
        if self.delete_on_close {
            remove_if_exists(&self.path)?;
        }
        result
    }

    fn flush_dirty(&self) -> Result<()> {
        let dirty: Vec<Arc<PageFrame>> = self
            .frames
            .lock()
            .iter()
            .filter(|(_, frame)| frame.is_dirty())
            .map(|(_, frame)| Arc::clone(frame))
            .collect();
        for frame in dirty {
            let _latch = frame.latch.lock();
            if frame.is_dirty() {
                self.write_back(&frame)?;
            }
        }
        let logical = self.file_size();
        if self.io.len()? < logical {
            self.io.truncate(logical)?;
        }
        Ok(())
    }

    fn write_back(&self, frame: &PageFrame) -> Result<()> {
        let offset = frame.page_id as u64 * self.page_size as u64;
        {
            let data = frame.data.read();
            self.io.write_at(offset, &data)?;
        }
        frame.mark_clean();
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        trace!(page = frame.page_id, "paged_file.write_back");
        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::IllegalState(format!(
                "paged file {} is closed",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Returns the frame for `page_id`, faulting it in when absent.
    pub(crate) fn pin(&self, page_id: i64) -> Result<Arc<PageFrame>> {
        self.ensure_open()?;
        let mut frames = self.frames.lock();
        self.counters.pins.fetch_add(1, Ordering::Relaxed);
        if let Some(frame) = frames.get(&page_id) {
            return Ok(Arc::clone(frame));
        }
        if frames.len() >= self.max_resident {
            self.evict_one(&mut frames)?;
        }
        let mut buf = vec![0u8; self.page_size].into_boxed_slice();
        self.io
            .read_at_or_zero(page_id as u64 * self.page_size as u64, &mut buf)?;
        self.counters.faults.fetch_add(1, Ordering::Relaxed);
        let frame = Arc::new(PageFrame::new(page_id, buf));
        frames.put(page_id, Arc::clone(&frame));
        Ok(frame)
    }

    fn evict_one(&self, frames: &mut LruCache<i64, Arc<PageFrame>>) -> Result<()> {
        // Only the cache holds unpinned frames, so a strong count of one means
        // no cursor can observe the eviction.
        let victim = frames
            .iter()
            .rev()
            .find(|(_, frame)| Arc::strong_count(frame) == 1)
            .map(|(id, _)| *id);
        let Some(victim) = victim else {
            return Ok(());
        };
        if let Some(frame) = frames.pop(&victim) {
            if frame.is_dirty() {
                self.write_back(&frame)?;
            }
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub(crate) fn grow_to(&self, page_id: i64) {
        self.last_page_id.fetch_max(page_id, Ordering::AcqRel);
    }

    pub(crate) fn take_injected_torn_read(&self) -> bool {
        self.torn_reads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn record_retry(&self) {
        self.counters.read_retries.fetch_add(1, Ordering::Relaxed);
    }
}
