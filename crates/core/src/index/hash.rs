use super::{Cursor, PrimaryIndex};
use crate::context::Context;
use crate::error::{DbError, IndexError, TxError};
use crate::row::{Row, RowId, SearchKey, Value};
use crate::schema::{IndexSchema, TableSchema};
use crate::session::Session;
use crate::tx::TxRegistry;
use crate::Result;
use indexmap::IndexMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Clone, Copy)]
struct HashSlot {
    row_id: RowId,
    writer: u64,
}

enum HashIdx {
    // If we know the key is unique, we can reduce the size of the index by
    // always storing just one slot.
    Unique(IndexMap<Value, HashSlot>),
    // Otherwise we store a SmallVec of slots to avoid allocation for the
    // common case of still having just one row with a given key.
    MaybeUnique(IndexMap<Value, SmallVec<[HashSlot; 1]>>),
}

/// An in-memory single-column equality index.
///
/// Contents do not survive a restart; the index is rebuilt from the table's
/// data when created over existing rows. Range scans fail with
/// `UnsupportedScan`.
pub struct HashIndex {
    schema: IndexSchema,
    table_name: String,
    primary: Arc<PrimaryIndex>,
    state: RwLock<HashIdx>,
    needs_rebuild: AtomicBool,
    registry: Arc<TxRegistry>,
    me: Weak<HashIndex>,
}

impl std::fmt::Debug for HashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIndex")
            .field("table_name", &self.table_name)
            .finish_non_exhaustive()
    }
}

impl HashIndex {
    pub(crate) fn new(
        ctx: &Context,
        table: &TableSchema,
        schema: IndexSchema,
        primary: Arc<PrimaryIndex>,
        needs_rebuild: bool,
    ) -> Arc<Self> {
        let state = if schema.is_unique {
            HashIdx::Unique(IndexMap::new())
        } else {
            HashIdx::MaybeUnique(IndexMap::new())
        };
        Arc::new_cyclic(|me| Self {
            schema,
            table_name: table.table_name.clone(),
            primary,
            state: RwLock::new(state),
            needs_rebuild: AtomicBool::new(needs_rebuild),
            registry: ctx.registry.clone(),
            me: me.clone(),
        })
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub fn is_unique(&self) -> bool {
        matches!(&*self.state.read(), HashIdx::Unique(_))
    }

    pub(crate) fn needs_rebuild(&self) -> bool {
        self.needs_rebuild.load(Ordering::Acquire)
    }

    pub(crate) fn mark_built(&self) {
        self.needs_rebuild.store(false, Ordering::Release);
    }

    fn owned(&self) -> Result<Arc<Self>> {
        self.me
            .upgrade()
            .ok_or_else(|| DbError::Internal(format!("index `{}` dropped while in use", self.schema.index_name)))
    }

    /// The single indexed column's value.
    fn hash_key(&self, row: &Row) -> Result<Value> {
        row.value(*self.schema.cols.first()).cloned()
    }

    pub(crate) fn key_of(&self, row: &Row) -> Result<SearchKey> {
        Ok(SearchKey::new(
            vec![self.hash_key(row)?, Value::Long(row.id.0)],
            0,
            false,
        ))
    }

    pub fn search_key(&self, values: Vec<Value>) -> SearchKey {
        SearchKey::new(values, 0, false)
    }

    fn conflict(&self, slot: &HashSlot, me: u64, value: &Value) -> DbError {
        if self.registry.is_concurrent(slot.writer, me) {
            return TxError::ConcurrentUpdate {
                index_name: self.schema.index_name.clone(),
                writer: slot.writer,
            }
            .into();
        }
        IndexError::UniqueConstraintViolation {
            index_name: self.schema.index_name.clone(),
            table_name: self.table_name.clone(),
            value: value.to_string(),
        }
        .into()
    }

    #[tracing::instrument(skip_all)]
    pub(crate) fn add(&self, session: &Session, row: &Row) -> Result<()> {
        let tx = session.transaction();
        tx.ensure_open()?;
        let key = self.hash_key(row)?;
        let slot = HashSlot {
            row_id: row.id,
            writer: tx.id(),
        };
        {
            let mut state = self.state.write();
            match &mut *state {
                HashIdx::Unique(map) => {
                    if let Some(existing) = map.get(&key) {
                        if existing.row_id != row.id {
                            return Err(self.conflict(existing, tx.id(), &key));
                        }
                    }
                    map.insert(key.clone(), slot);
                }
                HashIdx::MaybeUnique(map) => {
                    map.entry(key.clone()).or_default().push(slot);
                }
            }
        }
        let index = self.owned()?;
        let row_id = row.id;
        tx.log_undo(Box::new(move || index.revert_add(&key, row_id)));
        Ok(())
    }

    fn revert_add(&self, key: &Value, row_id: RowId) {
        let mut state = self.state.write();
        match &mut *state {
            HashIdx::Unique(map) => {
                map.swap_remove(key);
            }
            HashIdx::MaybeUnique(map) => {
                if let Some(slots) = map.get_mut(key) {
                    if let Some(at) = slots.iter().position(|s| s.row_id == row_id) {
                        slots.swap_remove(at);
                    }
                }
            }
        }
    }

    #[tracing::instrument(skip_all)]
    pub(crate) fn remove(&self, session: &Session, row: &Row) -> Result<()> {
        let tx = session.transaction();
        tx.ensure_open()?;
        let key = self.hash_key(row)?;
        let removed = {
            let mut state = self.state.write();
            match &mut *state {
                HashIdx::Unique(map) => {
                    let owned_by_row = map.get(&key).map_or(false, |slot| slot.row_id == row.id);
                    if owned_by_row {
                        map.swap_remove(&key)
                    } else {
                        None
                    }
                }
                HashIdx::MaybeUnique(map) => map.get_mut(&key).and_then(|slots| {
                    slots
                        .iter()
                        .position(|s| s.row_id == row.id)
                        .map(|at| slots.swap_remove(at))
                }),
            }
        };
        let removed = removed.ok_or_else(|| {
            DbError::Internal(format!(
                "row {} missing from `{}` on delete",
                row.id, self.schema.index_name
            ))
        })?;
        let index = self.owned()?;
        tx.log_undo(Box::new(move || index.revert_remove(key, removed)));
        Ok(())
    }

    fn revert_remove(&self, key: Value, slot: HashSlot) {
        let mut state = self.state.write();
        match &mut *state {
            HashIdx::Unique(map) => {
                map.insert(key, slot);
            }
            HashIdx::MaybeUnique(map) => {
                map.entry(key).or_default().push(slot);
            }
        }
    }

    pub(crate) fn truncate(&self, session: &Session) -> Result<()> {
        let tx = session.transaction();
        tx.ensure_open()?;
        let empty = if self.is_unique() {
            HashIdx::Unique(IndexMap::new())
        } else {
            HashIdx::MaybeUnique(IndexMap::new())
        };
        let snapshot = std::mem::replace(&mut *self.state.write(), empty);
        let index = self.owned()?;
        tx.log_undo(Box::new(move || {
            *index.state.write() = snapshot;
        }));
        Ok(())
    }

    /// Equality lookup. Anything else is not answerable from a hash.
    #[tracing::instrument(skip_all)]
    pub(crate) fn find(&self, session: &Session, first: Option<&SearchKey>, last: Option<&SearchKey>) -> Result<Cursor> {
        let tx = session.transaction();
        tx.ensure_open()?;
        let (Some(first), Some(last)) = (first, last) else {
            return Err(IndexError::UnsupportedScan {
                index_name: self.schema.index_name.clone(),
            }
            .into());
        };
        if first.values() != last.values() {
            return Err(IndexError::UnsupportedScan {
                index_name: self.schema.index_name.clone(),
            }
            .into());
        }
        let key = first
            .values()
            .first()
            .ok_or_else(|| DbError::Internal(format!("empty search key on `{}`", self.schema.index_name)))?;

        let row_ids: SmallVec<[RowId; 1]> = {
            let state = self.state.read();
            match &*state {
                HashIdx::Unique(map) => map.get(key).map(|s| s.row_id).into_iter().collect(),
                HashIdx::MaybeUnique(map) => map
                    .get(key)
                    .map(|slots| slots.iter().map(|s| s.row_id).collect())
                    .unwrap_or_default(),
            }
        };
        let primary = self.primary.clone();
        let name = self.schema.index_name.clone();
        let iter = row_ids.into_iter().map(move |id| {
            primary
                .row_by_id(id)
                .ok_or_else(|| DbError::Internal(format!("`{name}` points at missing row {id}")))
        });
        Ok(Cursor::new(tx, Box::new(iter)))
    }

    pub(crate) fn row_count(&self, session: &Session) -> Result<u64> {
        session.transaction().ensure_open()?;
        Ok(self.row_count_approximation())
    }

    pub(crate) fn row_count_approximation(&self) -> u64 {
        let state = self.state.read();
        match &*state {
            HashIdx::Unique(map) => map.len() as u64,
            HashIdx::MaybeUnique(map) => map.values().map(|slots| slots.len() as u64).sum(),
        }
    }
}
