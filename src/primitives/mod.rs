//! Low-level primitives underneath the record stores.
//!
//! Includes positional file I/O, the page cache with its cursors, and the
//! out-of-order sequence used for transaction bookkeeping.

/// Ordering primitives shared between threads.
pub mod concurrency;

/// Positional file I/O.
pub mod io;

/// Page cache, paged files and page cursors.
///
/// Write cursors latch pages; read cursors validate optimistically.
pub mod pager;
