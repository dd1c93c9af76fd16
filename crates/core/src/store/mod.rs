use crate::row::{Row, RowId, SearchKey};
use crate::schema::IndexId;
use crate::tx::Transaction;
use crate::Result;
use std::sync::Arc;

mod mem;
pub use mem::MemoryStore;

/// Name of the backing map for an index.
pub fn index_map_name(id: IndexId) -> String {
    format!("index.{id}")
}

/// What an ordered map stores: the primary index keeps full rows, secondary
/// indexes keep the owning row's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapValue {
    Row(Row),
    RowId(RowId),
}

impl MapValue {
    pub fn as_row_id(&self) -> RowId {
        match self {
            MapValue::Row(row) => row.id,
            MapValue::RowId(id) => *id,
        }
    }
}

/// A named ordered map provided by the key-value store.
///
/// Mutations take the session's [`Transaction`] and log inverse operations
/// into its undo log; the store is responsible for intra-entry atomicity and
/// its own synchronization. Reads see all applied writes - isolation between
/// sessions comes from the table's lock manager, not from the map.
pub trait OrderedMap: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &SearchKey) -> Option<MapValue>;

    fn put(&self, tx: &Transaction, key: SearchKey, value: MapValue) -> Result<Option<MapValue>>;

    fn remove(&self, tx: &Transaction, key: &SearchKey) -> Result<Option<MapValue>>;

    /// Removes every entry, undoable as one operation.
    fn clear(&self, tx: &Transaction) -> Result<()>;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte-size estimate for disk-usage accounting.
    fn byte_size(&self) -> u64;

    /// Bounded snapshot of `[first, last]`, both bounds inclusive when given.
    fn range(&self, first: Option<&SearchKey>, last: Option<&SearchKey>) -> Vec<(SearchKey, MapValue)>;

    /// Id of the transaction that wrote `key`, if the entry exists.
    fn writer_of(&self, key: &SearchKey) -> Option<u64>;
}

/// The disk-backed key-value store consumed by the table core.
///
/// The core only dictates map *names* (`index.<id>` for index backing maps,
/// [`KeyValueStore::next_temporary_map_name`] for builder scratch space);
/// the persisted layout is whatever the store chooses.
pub trait KeyValueStore: Send + Sync {
    fn open_map(&self, name: &str) -> Arc<dyn OrderedMap>;

    /// Opens a map that only needs point lookups. A store may serve it from
    /// the same structure as [`KeyValueStore::open_map`].
    fn open_hash_map(&self, name: &str) -> Arc<dyn OrderedMap>;

    fn has_map(&self, name: &str) -> bool;

    fn remove_map(&self, name: &str) -> Result<()>;

    /// A fresh name for a temporary map; never collides with index maps.
    fn next_temporary_map_name(&self) -> String;

    /// Whether the store is disk-backed. Selects the index build strategy:
    /// disk-backed stores rebuild through the external block merge.
    fn is_persistent(&self) -> bool;
}
