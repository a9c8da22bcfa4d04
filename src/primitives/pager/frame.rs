use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, RwLock};

/// One cached page image.
///
/// `seq` is a sequence lock: even while the page is stable, odd while a write
/// cursor holds it. Read cursors capture the value when they pin and compare
/// it again in `should_retry`. `latch` serializes write cursors.
pub(crate) struct PageFrame {
    pub(crate) page_id: i64,
    pub(crate) data: RwLock<Box<[u8]>>,
    pub(crate) latch: Arc<Mutex<()>>,
    seq: AtomicU64,
    dirty: AtomicBool,
}

const SPINS_BEFORE_YIELD: u32 = 64;

impl PageFrame {
    pub(crate) fn new(page_id: i64, data: Box<[u8]>) -> Self {
        Self {
            page_id,
            data: RwLock::new(data),
            latch: Arc::new(Mutex::new(())),
            seq: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// Stamp observed by a reader when it pins the page.
    pub(crate) fn stamp(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Waits until no writer holds the page and returns the stable stamp.
    pub(crate) fn stable_stamp(&self) -> u64 {
        let mut spins = 0u32;
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            if seq & 1 == 0 {
                return seq;
            }
            if spins < SPINS_BEFORE_YIELD {
                hint::spin_loop();
                spins += 1;
            } else {
                thread::yield_now();
            }
        }
    }

    /// True when a read that started at `stamp` may have observed a write.
    pub(crate) fn changed_since(&self, stamp: u64) -> bool {
        stamp & 1 == 1 || self.seq.load(Ordering::Acquire) != stamp
    }

    /// Must be called with `latch` held.
    pub(crate) fn begin_write(&self) {
        let prev = self.seq.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(prev & 1, 0, "page {} already being written", self.page_id);
    }

    /// Must be called with `latch` held, before releasing it.
    pub(crate) fn end_write(&self) {
        self.dirty.store(true, Ordering::Release);
        self.seq.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}
