use std::sync::Arc;

use parking_lot::{lock_api::ArcMutexGuard, RawMutex};

use super::frame::PageFrame;
use super::paged_file::PagedFile;
use crate::types::Result;

/// Lock mode requested when opening a cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageLock {
    /// Optimistic read; validate with [`PageCursor::should_retry`].
    Read,
    /// Exclusive write; holds the page latch while pinned.
    Write,
}

struct Pinned {
    frame: Arc<PageFrame>,
    stamp: u64,
    latch: Option<ArcMutexGuard<RawMutex, ()>>,
}

/// Cursor over the pages of a [`PagedFile`].
///
/// Accessors never panic on out-of-range offsets. They return zero (or skip
/// the write) and raise a bounds flag that callers must check with
/// [`PageCursor::check_and_clear_bounds_flag`].
pub struct PageCursor {
    file: Arc<PagedFile>,
    lock: PageLock,
    next_page_id: i64,
    current: Option<Pinned>,
    linked: Option<Box<PageCursor>>,
    offset: usize,
    mark: usize,
    out_of_bounds: bool,
    cursor_exception: Option<String>,
}

impl PageCursor {
    pub(crate) fn new(file: Arc<PagedFile>, page_id: i64, lock: PageLock) -> Self {
        Self {
            file,
            lock,
            next_page_id: page_id,
            current: None,
            linked: None,
            offset: 0,
            mark: 0,
            out_of_bounds: false,
            cursor_exception: None,
        }
    }

    /// Pins the next page. Read cursors return false past the last page;
    /// write cursors grow the file.
    pub fn next(&mut self) -> Result<bool> {
        let page_id = self.next_page_id;
        let pinned = self.pin(page_id)?;
        if pinned {
            self.next_page_id = page_id + 1;
        }
        Ok(pinned)
    }

    /// Pins `page_id`, keeping the current pin when it is already that page.
    /// Negative page ids unpin and return false.
    pub fn next_to(&mut self, page_id: i64) -> Result<bool> {
        if page_id >= 0 && self.current_page_id() == page_id {
            self.offset = 0;
            return Ok(true);
        }
        self.next_page_id = page_id;
        self.next()
    }

    fn pin(&mut self, page_id: i64) -> Result<bool> {
        self.unpin();
        self.linked = None;
        self.offset = 0;
        self.mark = 0;
        if page_id < 0 {
            return Ok(false);
        }
        if self.lock == PageLock::Read && page_id > self.file.last_page_id() {
            return Ok(false);
        }
        let frame = self.file.pin(page_id)?;
        let pinned = match self.lock {
            PageLock::Read => Pinned {
                stamp: frame.stamp(),
                frame,
                latch: None,
            },
            PageLock::Write => {
                let latch = frame.latch.lock_arc();
                frame.begin_write();
                self.file.grow_to(page_id);
                Pinned {
                    stamp: 0,
                    frame,
                    latch: Some(latch),
                }
            }
        };
        self.current = Some(pinned);
        Ok(true)
    }

    fn unpin(&mut self) {
        if let Some(pinned) = self.current.take() {
            if let Some(latch) = pinned.latch {
                pinned.frame.end_write();
                drop(latch);
            }
        }
    }

    /// Id of the pinned page, or -1.
    pub fn current_page_id(&self) -> i64 {
        self.current
            .as_ref()
            .map(|pinned| pinned.frame.page_id)
            .unwrap_or(-1)
    }

    /// Lock mode of this cursor.
    pub fn lock(&self) -> PageLock {
        self.lock
    }

    /// Page size of the underlying file.
    pub fn page_size(&self) -> usize {
        self.file.page_size()
    }

    /// Opens a cursor with the same lock mode on another page of this file.
    /// It stays attached until this cursor moves, and takes part in
    /// `should_retry` and the bounds flag.
    pub fn open_linked_cursor(&mut self, page_id: i64) -> Result<&mut PageCursor> {
        let mut linked = PageCursor::new(Arc::clone(&self.file), page_id, self.lock);
        if !linked.next()? {
            linked.out_of_bounds = true;
        }
        let linked = self.linked.insert(Box::new(linked));
        Ok(&mut **linked)
    }

    /// Current offset within the page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Moves the relative offset.
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// Remembers the current offset.
    pub fn mark(&mut self) {
        self.mark = self.offset;
    }

    /// Returns to the remembered offset.
    pub fn set_offset_to_mark(&mut self) {
        self.offset = self.mark;
    }

    /// Returns and clears the bounds flag of this cursor and its linked cursor.
    pub fn check_and_clear_bounds_flag(&mut self) -> bool {
        let linked = self
            .linked
            .as_mut()
            .map(|linked| linked.check_and_clear_bounds_flag())
            .unwrap_or(false);
        std::mem::replace(&mut self.out_of_bounds, false) || linked
    }

    /// Records a decoding problem to be surfaced after the read loop.
    pub fn set_cursor_exception(&mut self, message: impl Into<String>) {
        self.cursor_exception = Some(message.into());
    }

    /// Takes any recorded decoding problem.
    pub fn take_cursor_exception(&mut self) -> Option<String> {
        let linked = self
            .linked
            .as_mut()
            .and_then(|linked| linked.take_cursor_exception());
        self.cursor_exception.take().or(linked)
    }

    /// Discards any recorded decoding problem.
    pub fn clear_cursor_exception(&mut self) {
        self.take_cursor_exception();
    }

    /// Returns true when the data read since pinning (or since the last call)
    /// may be inconsistent. On true the bounds flag and cursor exception are
    /// cleared and the caller must read again. Write cursors never retry.
    pub fn should_retry(&mut self) -> bool {
        let mut retry = false;
        if self.lock == PageLock::Read {
            if let Some(pinned) = self.current.as_mut() {
                if self.file.take_injected_torn_read() || pinned.frame.changed_since(pinned.stamp) {
                    pinned.stamp = pinned.frame.stable_stamp();
                    retry = true;
                }
            }
        }
        if let Some(linked) = self.linked.as_mut() {
            retry |= linked.should_retry();
        }
        if retry {
            self.file.record_retry();
            self.out_of_bounds = false;
            self.cursor_exception = None;
        }
        retry
    }

    fn in_bounds(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.file.page_size())
    }

    fn read_into(&mut self, offset: usize, dst: &mut [u8]) {
        if self.in_bounds(offset, dst.len()) {
            if let Some(pinned) = self.current.as_ref() {
                let data = pinned.frame.data.read();
                dst.copy_from_slice(&data[offset..offset + dst.len()]);
                return;
            }
        }
        dst.fill(0);
        self.out_of_bounds = true;
    }

    fn write_from(&mut self, offset: usize, src: &[u8]) {
        if self.lock != PageLock::Write {
            self.cursor_exception = Some("write through a read cursor".into());
            return;
        }
        if self.in_bounds(offset, src.len()) {
            if let Some(pinned) = self.current.as_ref() {
                let mut data = pinned.frame.data.write();
                data[offset..offset + src.len()].copy_from_slice(src);
                return;
            }
        }
        self.out_of_bounds = true;
    }

    fn read_array<const N: usize>(&mut self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        self.read_into(offset, &mut out);
        out
    }

    fn advance(&mut self, len: usize) -> usize {
        let at = self.offset;
        self.offset = self.offset.saturating_add(len);
        at
    }

    /// Reads a byte at the relative offset.
    pub fn get_u8(&mut self) -> u8 {
        let at = self.advance(1);
        self.get_u8_at(at)
    }

    /// Reads a byte at `offset`.
    pub fn get_u8_at(&mut self, offset: usize) -> u8 {
        self.read_array::<1>(offset)[0]
    }

    /// Reads a big-endian 24-bit unsigned value.
    pub fn get_u24(&mut self) -> u32 {
        let at = self.advance(3);
        let [a, b, c] = self.read_array::<3>(at);
        u32::from_be_bytes([0, a, b, c])
    }

    /// Reads a big-endian u32.
    pub fn get_u32(&mut self) -> u32 {
        let at = self.advance(4);
        u32::from_be_bytes(self.read_array(at))
    }

    /// Reads a big-endian i64.
    pub fn get_i64(&mut self) -> i64 {
        let at = self.advance(8);
        self.get_i64_at(at)
    }

    /// Reads a big-endian i64 at `offset`.
    pub fn get_i64_at(&mut self, offset: usize) -> i64 {
        i64::from_be_bytes(self.read_array(offset))
    }

    /// Fills `dst` from the relative offset.
    pub fn get_bytes(&mut self, dst: &mut [u8]) {
        let at = self.advance(dst.len());
        self.read_into(at, dst);
    }

    /// Writes a byte at the relative offset.
    pub fn put_u8(&mut self, value: u8) {
        let at = self.advance(1);
        self.put_u8_at(at, value);
    }

    /// Writes a byte at `offset`.
    pub fn put_u8_at(&mut self, offset: usize, value: u8) {
        self.write_from(offset, &[value]);
    }

    /// Writes the low 24 bits of `value` big-endian.
    pub fn put_u24(&mut self, value: u32) {
        let at = self.advance(3);
        let [_, a, b, c] = value.to_be_bytes();
        self.write_from(at, &[a, b, c]);
    }

    /// Writes a big-endian u32.
    pub fn put_u32(&mut self, value: u32) {
        let at = self.advance(4);
        self.write_from(at, &value.to_be_bytes());
    }

    /// Writes a big-endian i64.
    pub fn put_i64(&mut self, value: i64) {
        let at = self.advance(8);
        self.put_i64_at(at, value);
    }

    /// Writes a big-endian i64 at `offset`.
    pub fn put_i64_at(&mut self, offset: usize, value: i64) {
        self.write_from(offset, &value.to_be_bytes());
    }

    /// Writes `src` at the relative offset.
    pub fn put_bytes(&mut self, src: &[u8]) {
        let at = self.advance(src.len());
        self.write_from(at, src);
    }
}

impl Drop for PageCursor {
    fn drop(&mut self) {
        self.linked = None;
        self.unpin();
    }
}

/// Runs `read` until the cursor reports a consistent read.
///
/// The offset is marked on entry and restored before every attempt, so `read`
/// always starts from the same position.
pub fn read_with_retry<T>(
    cursor: &mut PageCursor,
    mut read: impl FnMut(&mut PageCursor) -> Result<T>,
) -> Result<T> {
    cursor.mark();
    loop {
        cursor.set_offset_to_mark();
        let value = read(cursor)?;
        if !cursor.should_retry() {
            return Ok(value);
        }
    }
}
