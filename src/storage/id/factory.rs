use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{IdGenerator, IdType};
use crate::types::Result;

/// Creates and opens id generators for stores.
pub trait IdGeneratorFactory: Send + Sync {
    /// Writes a fresh id file at `high_id` and opens it.
    fn create(
        &self,
        path: &Path,
        id_type: IdType,
        high_id: i64,
        throw_if_exists: bool,
        max_id: i64,
    ) -> Result<Arc<IdGenerator>>;

    /// Opens the id file at `path`. A missing file is created first, using
    /// `high_id_supplier` to learn the store's high id.
    fn open(
        &self,
        path: &Path,
        id_type: IdType,
        high_id_supplier: &mut dyn FnMut() -> Result<i64>,
        max_id: i64,
    ) -> Result<Arc<IdGenerator>>;

    /// The most recently opened generator of `id_type`, while it is alive.
    fn get(&self, id_type: IdType) -> Option<Arc<IdGenerator>>;
}

/// Factory backed by [`IdGenerator`] files with per-type grab sizes.
pub struct DefaultIdGeneratorFactory {
    default_grab_size: usize,
    grab_sizes: HashMap<IdType, usize>,
    opened: Mutex<HashMap<IdType, Weak<IdGenerator>>>,
}

impl DefaultIdGeneratorFactory {
    /// Factory using `default_grab_size` for every id type.
    pub fn new(default_grab_size: usize) -> Self {
        Self {
            default_grab_size,
            grab_sizes: HashMap::new(),
            opened: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the grab size for one id type.
    pub fn with_grab_size(mut self, id_type: IdType, grab_size: usize) -> Self {
        self.grab_sizes.insert(id_type, grab_size);
        self
    }

    /// Grab size applied to `id_type`.
    pub fn grab_size(&self, id_type: IdType) -> usize {
        self.grab_sizes
            .get(&id_type)
            .copied()
            .unwrap_or(self.default_grab_size)
    }

    fn open_existing(&self, path: &Path, id_type: IdType, max_id: i64) -> Result<Arc<IdGenerator>> {
        let generator = Arc::new(IdGenerator::open(
            path,
            self.grab_size(id_type),
            id_type,
            max_id,
        )?);
        self.opened
            .lock()
            .insert(id_type, Arc::downgrade(&generator));
        Ok(generator)
    }
}

impl IdGeneratorFactory for DefaultIdGeneratorFactory {
    fn create(
        &self,
        path: &Path,
        id_type: IdType,
        high_id: i64,
        throw_if_exists: bool,
        max_id: i64,
    ) -> Result<Arc<IdGenerator>> {
        IdGenerator::create(path, high_id, throw_if_exists)?;
        self.open_existing(path, id_type, max_id)
    }

    fn open(
        &self,
        path: &Path,
        id_type: IdType,
        high_id_supplier: &mut dyn FnMut() -> Result<i64>,
        max_id: i64,
    ) -> Result<Arc<IdGenerator>> {
        if !path.exists() {
            let high_id = high_id_supplier()?;
            IdGenerator::create(path, high_id, false)?;
        }
        self.open_existing(path, id_type, max_id)
    }

    fn get(&self, id_type: IdType) -> Option<Arc<IdGenerator>> {
        self.opened.lock().get(&id_type).and_then(Weak::upgrade)
    }
}
