use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::dynamic::{DynamicRecordFormat, DynamicStore};
use super::header::StoreHeaderFormat;
use super::id::{IdGeneratorFactory, IdType};
use super::meta::MetaDataStore;
use super::metrics::StoreMetrics;
use super::node::NodeRecordFormat;
use super::options::{StoreConfig, StoreOpenOptions};
use super::store::RecordStore;
use crate::primitives::pager::PageCache;
use crate::types::Result;

/// File name of the metadata store.
pub const META_DATA_STORE_NAME: &str = "neostore";
/// File name of the node store.
pub const NODE_STORE_NAME: &str = "neostore.nodestore.db";
/// File name of the string store.
pub const STRING_STORE_NAME: &str = "neostore.propertystore.db.strings";
/// File name of the array store.
pub const ARRAY_STORE_NAME: &str = "neostore.propertystore.db.arrays";
/// File name of the schema store.
pub const SCHEMA_STORE_NAME: &str = "neostore.schemastore.db";

const ID_FILE_SUFFIX: &str = ".id";

/// Opens the stores of one database directory with shared configuration,
/// page cache and id generator factory.
pub struct StoreFactory {
    dir: PathBuf,
    config: StoreConfig,
    page_cache: PageCache,
    id_factory: Arc<dyn IdGeneratorFactory>,
    metrics: Option<Arc<dyn StoreMetrics>>,
}

impl StoreFactory {
    /// Validates `config` and prepares a factory for stores under `dir`.
    pub fn new(dir: impl Into<PathBuf>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let page_cache = PageCache::new(config.page_cache_options())?;
        let id_factory: Arc<dyn IdGeneratorFactory> = Arc::new(config.id_generator_factory());
        debug!(dir = %dir.display(), page_size = config.page_size, "store_factory.new");
        Ok(Self {
            dir,
            config,
            page_cache,
            id_factory,
            metrics: None,
        })
    }

    /// Shares `metrics` with every store opened afterwards.
    pub fn with_metrics(mut self, metrics: Arc<dyn StoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Database directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Active configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Page cache shared by the stores.
    pub fn page_cache(&self) -> &PageCache {
        &self.page_cache
    }

    /// Id generator factory shared by the stores.
    pub fn id_factory(&self) -> Arc<dyn IdGeneratorFactory> {
        Arc::clone(&self.id_factory)
    }

    /// Path of the store file `name`.
    pub fn store_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Path of the id file belonging to store `name`.
    pub fn id_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{ID_FILE_SUFFIX}"))
    }

    fn open_options(&self, create: bool) -> StoreOpenOptions {
        let options = self.config.open_options(create);
        match &self.metrics {
            Some(metrics) => options.metrics(Arc::clone(metrics)),
            None => options,
        }
    }

    /// Opens the metadata store.
    pub fn open_meta_data_store(&self, create: bool) -> Result<MetaDataStore> {
        MetaDataStore::open(
            &self.store_path(META_DATA_STORE_NAME),
            &self.id_path(META_DATA_STORE_NAME),
            self.id_factory(),
            &self.page_cache,
            &self.open_options(create),
        )
    }

    /// Opens the node store.
    pub fn open_node_store(&self, create: bool) -> Result<RecordStore<NodeRecordFormat>> {
        RecordStore::open(
            &self.store_path(NODE_STORE_NAME),
            &self.id_path(NODE_STORE_NAME),
            IdType::Node,
            self.id_factory(),
            &self.page_cache,
            NodeRecordFormat,
            StoreHeaderFormat::NoHeader,
            &self.open_options(create),
        )
    }

    /// Opens the string store.
    pub fn open_string_store(&self, create: bool) -> Result<DynamicStore> {
        self.open_dynamic_store(
            STRING_STORE_NAME,
            IdType::StringBlock,
            DynamicRecordFormat::strings(),
            self.config.string_block_size,
            create,
        )
    }

    /// Opens the array store.
    pub fn open_array_store(&self, create: bool) -> Result<DynamicStore> {
        self.open_dynamic_store(
            ARRAY_STORE_NAME,
            IdType::ArrayBlock,
            DynamicRecordFormat::arrays(),
            self.config.array_block_size,
            create,
        )
    }

    /// Opens the schema store.
    pub fn open_schema_store(&self, create: bool) -> Result<DynamicStore> {
        self.open_dynamic_store(
            SCHEMA_STORE_NAME,
            IdType::Schema,
            DynamicRecordFormat::schema(),
            self.config.schema_block_size,
            create,
        )
    }

    fn open_dynamic_store(
        &self,
        name: &str,
        id_type: IdType,
        format: DynamicRecordFormat,
        data_block_size: u32,
        create: bool,
    ) -> Result<DynamicStore> {
        DynamicStore::open(
            &self.store_path(name),
            &self.id_path(name),
            id_type,
            self.id_factory(),
            &self.page_cache,
            format,
            data_block_size,
            &self.open_options(create),
        )
    }
}
