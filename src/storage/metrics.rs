use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hooks for counting record store activity.
///
/// Every store of a process may share one implementation; the `store` argument
/// is the store's type descriptor.
pub trait StoreMetrics: Send + Sync {
    /// A record was read from a page.
    fn record_read(&self, store: &'static str);

    /// A record was written to a page.
    ///
    /// # Parameters
    /// * `in_use` - whether the written record is live (`false` for deletions).
    fn record_written(&self, store: &'static str, in_use: bool);

    /// An id was handed out by the store's generator.
    fn id_allocated(&self, store: &'static str);

    /// An id was returned to the store's generator.
    fn id_freed(&self, store: &'static str);

    /// The id file was rebuilt while opening a store.
    fn id_generator_rebuilt(&self, store: &'static str, slow: bool);
}

/// A no-op implementation of [`StoreMetrics`].
#[derive(Default)]
pub struct NoopMetrics;

impl StoreMetrics for NoopMetrics {
    fn record_read(&self, _store: &'static str) {}
    fn record_written(&self, _store: &'static str, _in_use: bool) {}
    fn id_allocated(&self, _store: &'static str) {}
    fn id_freed(&self, _store: &'static str) {}
    fn id_generator_rebuilt(&self, _store: &'static str, _slow: bool) {}
}

/// Atomic counters across every store that shares the instance.
#[derive(Default)]
pub struct CounterMetrics {
    /// Records read.
    pub records_read: AtomicU64,
    /// In-use records written.
    pub records_written: AtomicU64,
    /// Not-in-use records written.
    pub records_deleted: AtomicU64,
    /// Ids handed out.
    pub ids_allocated: AtomicU64,
    /// Ids freed.
    pub ids_freed: AtomicU64,
    /// Fast id file rebuilds.
    pub fast_rebuilds: AtomicU64,
    /// Slow (scanning) id file rebuilds.
    pub slow_rebuilds: AtomicU64,
}

impl StoreMetrics for CounterMetrics {
    fn record_read(&self, _store: &'static str) {
        self.records_read.fetch_add(1, Ordering::Relaxed);
    }

    fn record_written(&self, _store: &'static str, in_use: bool) {
        if in_use {
            self.records_written.fetch_add(1, Ordering::Relaxed);
        } else {
            self.records_deleted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn id_allocated(&self, _store: &'static str) {
        self.ids_allocated.fetch_add(1, Ordering::Relaxed);
    }

    fn id_freed(&self, _store: &'static str) {
        self.ids_freed.fetch_add(1, Ordering::Relaxed);
    }

    fn id_generator_rebuilt(&self, _store: &'static str, slow: bool) {
        if slow {
            self.slow_rebuilds.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fast_rebuilds.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Returns the default metrics implementation, [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn StoreMetrics> {
    Arc::new(NoopMetrics)
}
