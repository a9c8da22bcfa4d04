//! Record storage: fixed-slot stores, dynamic record chains, id allocation
//! and the metadata store.

/// Identifier generators and their free-list files.
pub mod id;

/// Dynamic stores of chained blocks.
pub mod dynamic;

/// Metadata store with atomic paired fields.
pub mod meta;

mod factory;
mod header;
mod metrics;
mod node;
mod options;
mod record;
mod store;

pub use dynamic::{
    ChainRead, DynamicRecord, DynamicRecordFormat, DynamicStore, DynamicValue, RecordChain,
    ValueKind, BLOCK_HEADER_SIZE,
};
pub use factory::{
    StoreFactory, ARRAY_STORE_NAME, META_DATA_STORE_NAME, NODE_STORE_NAME, SCHEMA_STORE_NAME,
    STRING_STORE_NAME,
};
pub use header::{store_descriptor, StoreHeader, StoreHeaderFormat, ALL_STORES_VERSION};
pub use id::{DefaultIdGeneratorFactory, IdGenerator, IdGeneratorFactory, IdType};
pub use meta::{
    version_long_to_string, version_string_to_long, ClosedTransaction, LogPosition, MetaDataRecord,
    MetaDataRecordFormat, MetaDataStore, Position, StoreId, TransactionId, FIELD_NOT_INITIALIZED,
    FIELD_NOT_PRESENT,
};
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, StoreMetrics};
pub use node::{NodeRecord, NodeRecordFormat, NODE_RECORD_SIZE};
pub use options::{
    StoreConfig, StoreOpenOptions, DEFAULT_ARRAY_BLOCK_SIZE, DEFAULT_ID_GRAB_SIZE,
    DEFAULT_SCHEMA_BLOCK_SIZE, DEFAULT_STRING_BLOCK_SIZE,
};
pub use record::{Record, RecordFormat, RecordLoad, StoreLayout};
pub use store::{RecordScan, RecordStore};
