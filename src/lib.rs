//! Native record storage for a graph database: fixed-size record stores over
//! a page cache, chained dynamic records, persistent id generators and a
//! metadata store with atomically updated paired fields.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{
    DynamicStore, IdGenerator, IdType, MetaDataStore, RecordLoad, RecordStore, StoreConfig,
    StoreFactory,
};
pub use types::{Result, StoreError};
