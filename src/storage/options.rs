use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::id::{DefaultIdGeneratorFactory, IdType};
use super::metrics::StoreMetrics;
use crate::primitives::pager::{PageCacheOptions, DEFAULT_PAGE_SIZE};
use crate::types::{Result, StoreError};

/// Data bytes per dynamic string block.
pub const DEFAULT_STRING_BLOCK_SIZE: u32 = 120;
/// Data bytes per dynamic array block.
pub const DEFAULT_ARRAY_BLOCK_SIZE: u32 = 120;
/// Data bytes per schema rule block.
pub const DEFAULT_SCHEMA_BLOCK_SIZE: u32 = 56;
/// Ids per free-list batch unless overridden per id type.
pub const DEFAULT_ID_GRAB_SIZE: usize = 1024;

/// Process-wide storage configuration, loadable from TOML.
///
/// ```toml
/// page_size = 8192
/// id_grab_size = 1024
/// rebuild_idgenerators_fast = false
///
/// [grab_sizes]
/// property = 2048
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Page cache page size in bytes.
    pub page_size: usize,
    /// Resident pages per mapped file.
    pub cache_pages: usize,
    /// Default id grab size.
    pub id_grab_size: usize,
    /// Per id type grab size overrides.
    pub grab_sizes: BTreeMap<IdType, usize>,
    /// Recreate sticky id files from the high id instead of scanning stores.
    pub rebuild_idgenerators_fast: bool,
    /// Data bytes per string block.
    pub string_block_size: u32,
    /// Data bytes per array block.
    pub array_block_size: u32,
    /// Data bytes per schema block.
    pub schema_block_size: u32,
    /// Remove store and id files when stores close.
    pub delete_on_close: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
            id_grab_size: DEFAULT_ID_GRAB_SIZE,
            grab_sizes: BTreeMap::new(),
            rebuild_idgenerators_fast: true,
            string_block_size: DEFAULT_STRING_BLOCK_SIZE,
            array_block_size: DEFAULT_ARRAY_BLOCK_SIZE,
            schema_block_size: DEFAULT_SCHEMA_BLOCK_SIZE,
            delete_on_close: false,
        }
    }
}

impl StoreConfig {
    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|err| StoreError::Invalid(format!("invalid store config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Serializes the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|err| StoreError::Invalid(format!("cannot serialize store config: {err}")))
    }

    /// Rejects settings no store could open with.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.cache_pages == 0 {
            return Err(StoreError::Invalid(
                "page_size and cache_pages must be positive".into(),
            ));
        }
        if self.id_grab_size == 0 || self.grab_sizes.values().any(|size| *size == 0) {
            return Err(StoreError::Invalid("grab sizes must be positive".into()));
        }
        for (name, size) in [
            ("string_block_size", self.string_block_size),
            ("array_block_size", self.array_block_size),
            ("schema_block_size", self.schema_block_size),
        ] {
            if size == 0 {
                return Err(StoreError::Invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Sets the page size.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the resident page budget per file.
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Sets the default grab size.
    pub fn id_grab_size(mut self, size: usize) -> Self {
        self.id_grab_size = size;
        self
    }

    /// Overrides the grab size of one id type.
    pub fn grab_size_for(mut self, id_type: IdType, size: usize) -> Self {
        self.grab_sizes.insert(id_type, size);
        self
    }

    /// Chooses between fast and scanning id rebuilds.
    pub fn rebuild_idgenerators_fast(mut self, fast: bool) -> Self {
        self.rebuild_idgenerators_fast = fast;
        self
    }

    /// Sets the string block data size.
    pub fn string_block_size(mut self, bytes: u32) -> Self {
        self.string_block_size = bytes;
        self
    }

    /// Sets the array block data size.
    pub fn array_block_size(mut self, bytes: u32) -> Self {
        self.array_block_size = bytes;
        self
    }

    /// Removes store files on close.
    pub fn delete_on_close(mut self, delete: bool) -> Self {
        self.delete_on_close = delete;
        self
    }

    /// Page cache settings.
    pub fn page_cache_options(&self) -> PageCacheOptions {
        PageCacheOptions {
            page_size: self.page_size,
            cache_pages: self.cache_pages,
        }
    }

    /// Id generator factory honouring the configured grab sizes.
    pub fn id_generator_factory(&self) -> DefaultIdGeneratorFactory {
        self.grab_sizes
            .iter()
            .fold(DefaultIdGeneratorFactory::new(self.id_grab_size), |factory, (id_type, size)| {
                factory.with_grab_size(*id_type, *size)
            })
    }

    /// Options for opening one store.
    pub fn open_options(&self, create: bool) -> StoreOpenOptions {
        StoreOpenOptions::default()
            .create(create)
            .rebuild_idgenerators_fast(self.rebuild_idgenerators_fast)
            .delete_on_close(self.delete_on_close)
    }
}

/// Options supplied when opening a single record store.
#[derive(Clone)]
pub struct StoreOpenOptions {
    /// Create the store when its file is absent or empty.
    pub create: bool,
    /// Rebuild sticky id files from the high id alone.
    pub rebuild_idgenerators_fast: bool,
    /// Remove the store and id files on close.
    pub delete_on_close: bool,
    /// Optional metrics sink.
    pub metrics: Option<Arc<dyn StoreMetrics>>,
}

impl Default for StoreOpenOptions {
    fn default() -> Self {
        Self {
            create: false,
            rebuild_idgenerators_fast: true,
            delete_on_close: false,
            metrics: None,
        }
    }
}

impl fmt::Debug for StoreOpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOpenOptions")
            .field("create", &self.create)
            .field("rebuild_idgenerators_fast", &self.rebuild_idgenerators_fast)
            .field("delete_on_close", &self.delete_on_close)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl StoreOpenOptions {
    /// Sets whether a missing store is created.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Chooses between fast and scanning id rebuilds.
    pub fn rebuild_idgenerators_fast(mut self, fast: bool) -> Self {
        self.rebuild_idgenerators_fast = fast;
        self
    }

    /// Removes the store files on close.
    pub fn delete_on_close(mut self, delete: bool) -> Self {
        self.delete_on_close = delete;
        self
    }

    /// Installs a metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn StoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}
