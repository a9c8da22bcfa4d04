//! Identifier allocation with persistent free lists.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::primitives::io::{remove_if_exists, FileIo, StdFileIo};
use crate::types::{is_reserved_id, Result, StoreError};

mod factory;
pub(crate) mod freelist;

pub use factory::{DefaultIdGeneratorFactory, IdGeneratorFactory};

use freelist::{count_ids, encode_batch, read_batch, read_prelude, write_prelude, Prelude, PRELUDE_LEN};

/// Kind of record an id space belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    /// Node records.
    Node,
    /// Relationship records.
    Relationship,
    /// Property records.
    Property,
    /// Dynamic string blocks.
    StringBlock,
    /// Dynamic array blocks.
    ArrayBlock,
    /// Schema rule blocks.
    Schema,
    /// Metadata store records.
    NeoStoreBlock,
    /// Label tokens.
    LabelToken,
    /// Property key tokens.
    PropertyKeyToken,
    /// Relationship type tokens.
    RelationshipTypeToken,
}

impl IdType {
    /// Every id type, in declaration order.
    pub const ALL: [IdType; 10] = [
        IdType::Node,
        IdType::Relationship,
        IdType::Property,
        IdType::StringBlock,
        IdType::ArrayBlock,
        IdType::Schema,
        IdType::NeoStoreBlock,
        IdType::LabelToken,
        IdType::PropertyKeyToken,
        IdType::RelationshipTypeToken,
    ];

    /// Whether freed ids may be handed out again before they reach the id file.
    ///
    /// Dynamic block ids are reused within the session that freed them, so a
    /// forced walk over a deleted chain can run into blocks of a newer value.
    pub fn allows_aggressive_reuse(self) -> bool {
        matches!(
            self,
            IdType::Property | IdType::StringBlock | IdType::ArrayBlock
        )
    }

    /// Stable lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            IdType::Node => "node",
            IdType::Relationship => "relationship",
            IdType::Property => "property",
            IdType::StringBlock => "string_block",
            IdType::ArrayBlock => "array_block",
            IdType::Schema => "schema",
            IdType::NeoStoreBlock => "neostore_block",
            IdType::LabelToken => "label_token",
            IdType::PropertyKeyToken => "property_key_token",
            IdType::RelationshipTypeToken => "relationship_type_token",
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hands out ids for one store, recycling freed ids through an id file.
///
/// While open the file is marked sticky; a clean close compacts every unused
/// freed id to the front of the file so that reopening reproduces the same
/// `next_id` sequence.
pub struct IdGenerator {
    path: PathBuf,
    io: StdFileIo,
    id_type: IdType,
    grab_size: usize,
    max_id: i64,
    aggressive_reuse: bool,
    state: Mutex<IdState>,
}

struct IdState {
    high_id: i64,
    ids_read: VecDeque<i64>,
    released: VecDeque<i64>,
    read_position: u64,
    write_position: u64,
    defragged: u64,
    closed: bool,
}

impl IdState {
    fn ensure_open(&self, path: &Path) -> Result<()> {
        if self.closed {
            return Err(StoreError::IllegalState(format!(
                "id generator {} is closed",
                path.display()
            )));
        }
        Ok(())
    }
}

impl IdGenerator {
    /// Writes a fresh id file with no free ids.
    pub fn create(path: &Path, high_id: i64, throw_if_exists: bool) -> Result<()> {
        if high_id < 0 {
            return Err(StoreError::Invalid(format!("high id {high_id} is negative")));
        }
        if path.exists() {
            if throw_if_exists {
                return Err(StoreError::IllegalState(format!(
                    "id file {} already exists",
                    path.display()
                )));
            }
            remove_if_exists(path)?;
        }
        let io = StdFileIo::open(path, true)?;
        write_prelude(
            &io,
            Prelude {
                sticky: false,
                high_id,
            },
        )?;
        io.truncate(PRELUDE_LEN)?;
        io.sync_all()?;
        debug!(path = %path.display(), high_id, "idgen.create");
        Ok(())
    }

    /// Opens an existing id file and marks it sticky.
    pub fn open(path: &Path, grab_size: usize, id_type: IdType, max_id: i64) -> Result<Self> {
        if grab_size == 0 {
            return Err(StoreError::Invalid("grab size must be positive".into()));
        }
        let io = StdFileIo::open(path, false)?;
        let prelude = read_prelude(&io)?;
        if prelude.sticky {
            return Err(StoreError::StoreFailure(format!(
                "id file {} is sticky: already open or not cleanly shut down",
                path.display()
            )));
        }
        let end = io.len()?;
        let defragged = count_ids(&io, PRELUDE_LEN, end)?;
        write_prelude(
            &io,
            Prelude {
                sticky: true,
                high_id: prelude.high_id,
            },
        )?;
        io.sync_all()?;
        debug!(
            path = %path.display(),
            id_type = %id_type,
            high_id = prelude.high_id,
            free = defragged,
            "idgen.open"
        );
        Ok(Self {
            path: path.to_path_buf(),
            io,
            id_type,
            grab_size,
            max_id,
            aggressive_reuse: id_type.allows_aggressive_reuse(),
            state: Mutex::new(IdState {
                high_id: prelude.high_id,
                ids_read: VecDeque::new(),
                released: VecDeque::new(),
                read_position: PRELUDE_LEN,
                write_position: end,
                defragged,
                closed: false,
            }),
        })
    }

    /// Id type this generator serves.
    pub fn id_type(&self) -> IdType {
        self.id_type
    }

    /// Highest id this generator may hand out.
    pub fn max_id(&self) -> i64 {
        self.max_id
    }

    /// Path of the id file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a recycled id when one is available, else the high id.
    pub fn next_id(&self) -> Result<i64> {
        let mut state = self.state.lock();
        state.ensure_open(&self.path)?;
        if self.aggressive_reuse {
            if let Some(id) = state.released.pop_front() {
                state.defragged -= 1;
                return Ok(id);
            }
        }
        if state.ids_read.is_empty() && state.read_position < state.write_position {
            let (ids, next) = read_batch(&self.io, state.read_position, state.write_position)?;
            state.read_position = next;
            state.ids_read.extend(ids);
        }
        if let Some(id) = state.ids_read.pop_front() {
            state.defragged -= 1;
            return Ok(id);
        }
        let mut id = state.high_id;
        if is_reserved_id(id) {
            id += 1;
        }
        if id > self.max_id {
            return Err(StoreError::StoreFailure(format!(
                "Id capacity exceeded: {id} > {} for {}",
                self.max_id, self.id_type
            )));
        }
        state.high_id = id + 1;
        Ok(id)
    }

    /// Returns `id` to the free list.
    pub fn free_id(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open(&self.path)?;
        if is_reserved_id(id) {
            return Ok(());
        }
        if id < 0 || id >= state.high_id {
            return Err(StoreError::Invalid(format!(
                "cannot free id {id}, high id is {}",
                state.high_id
            )));
        }
        state.released.push_back(id);
        state.defragged += 1;
        if state.released.len() >= self.grab_size {
            self.write_released(&mut state)?;
        }
        Ok(())
    }

    fn write_released(&self, state: &mut IdState) -> Result<()> {
        if state.released.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = state.released.drain(..).collect();
        let buf = encode_batch(&ids);
        self.io.write_at(state.write_position, &buf)?;
        state.write_position += buf.len() as u64;
        Ok(())
    }

    /// Smallest id never handed out.
    pub fn high_id(&self) -> i64 {
        self.state.lock().high_id
    }

    /// Overrides the high id.
    pub fn set_high_id(&self, high_id: i64) -> Result<()> {
        if high_id < 0 || high_id > self.max_id.saturating_add(1) {
            return Err(StoreError::Invalid(format!(
                "high id {high_id} outside 0..={}",
                self.max_id.saturating_add(1)
            )));
        }
        let mut state = self.state.lock();
        state.ensure_open(&self.path)?;
        state.high_id = high_id;
        Ok(())
    }

    /// Raises the high id past `id` if needed.
    pub fn mark_id_in_use(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open(&self.path)?;
        if id >= state.high_id {
            state.high_id = id + 1;
        }
        Ok(())
    }

    /// `high_id - 1`.
    pub fn highest_possible_id_in_use(&self) -> i64 {
        self.high_id() - 1
    }

    /// Ids below the high id that are not on the free list.
    pub fn number_of_ids_in_use(&self) -> i64 {
        let state = self.state.lock();
        state.high_id - state.defragged as i64
    }

    /// Free ids waiting to be reused.
    pub fn defrag_count(&self) -> u64 {
        self.state.lock().defragged
    }

    /// Persists released ids and the current high id without closing.
    pub fn checkpoint(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open(&self.path)?;
        self.write_released(&mut state)?;
        write_prelude(
            &self.io,
            Prelude {
                sticky: true,
                high_id: state.high_id,
            },
        )?;
        self.io.sync_all()
    }

    /// Compacts unused free ids to the front of the file and marks it clean.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        let mut remaining: Vec<i64> = state.ids_read.drain(..).collect();
        while state.read_position < state.write_position {
            let (ids, next) = read_batch(&self.io, state.read_position, state.write_position)?;
            remaining.extend(ids);
            state.read_position = next;
        }
        remaining.extend(state.released.drain(..));

        let mut position = PRELUDE_LEN;
        for chunk in remaining.chunks(self.grab_size) {
            let buf = encode_batch(chunk);
            self.io.write_at(position, &buf)?;
            position += buf.len() as u64;
        }
        self.io.truncate(position)?;
        write_prelude(
            &self.io,
            Prelude {
                sticky: false,
                high_id: state.high_id,
            },
        )?;
        self.io.sync_all()?;
        state.closed = true;
        info!(
            path = %self.path.display(),
            id_type = %self.id_type,
            high_id = state.high_id,
            free = remaining.len(),
            "idgen.close"
        );
        Ok(())
    }

    /// Closes the generator and removes its file.
    pub fn delete(&self) -> Result<()> {
        self.close()?;
        remove_if_exists(&self.path)?;
        Ok(())
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("IdGenerator")
            .field("path", &self.path)
            .field("id_type", &self.id_type)
            .field("high_id", &state.high_id)
            .field("defragged", &state.defragged)
            .field("closed", &state.closed)
            .finish()
    }
}
