//! Paged file access through a small page cache.
//!
//! A [`PageCache`] maps files as sequences of fixed-size pages. Access goes
//! through [`PageCursor`]s: write cursors latch their page exclusively, read
//! cursors are optimistic and must validate with
//! [`PageCursor::should_retry`] (or use [`read_with_retry`]).

mod cursor;
mod frame;
mod paged_file;

pub use cursor::{read_with_retry, PageCursor, PageLock};
pub use paged_file::{
    MapOptions, PageCache, PageCacheOptions, PagedFile, PagedFileStats, DEFAULT_PAGE_SIZE,
};
