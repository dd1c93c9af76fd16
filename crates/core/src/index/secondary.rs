use super::{Cursor, PrimaryIndex};
use crate::context::Context;
use crate::error::{DbError, IndexError, TxError};
use crate::row::{Row, SearchKey, Value};
use crate::schema::{IndexSchema, TableSchema};
use crate::session::Session;
use crate::store::{index_map_name, MapValue, OrderedMap};
use crate::tx::TxRegistry;
use crate::Result;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A persistent sorted secondary index: `composite key -> row id`.
///
/// The stored key is the projection of the indexed columns, with the row id
/// appended so non-unique indexes still have distinct map keys. Composite
/// order is the lexicographic combination of the per-column ASC/DESC
/// directions with NULLs placed per the engine's NULL policy.
pub struct SecondaryIndex {
    schema: IndexSchema,
    table_name: String,
    map: Arc<dyn OrderedMap>,
    primary: Arc<PrimaryIndex>,
    nulls_last: bool,
    needs_rebuild: AtomicBool,
    registry: Arc<TxRegistry>,
}

impl std::fmt::Debug for SecondaryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryIndex")
            .field("table_name", &self.table_name)
            .finish_non_exhaustive()
    }
}

impl SecondaryIndex {
    pub(crate) fn open(
        ctx: &Context,
        table: &TableSchema,
        schema: IndexSchema,
        primary: Arc<PrimaryIndex>,
    ) -> Arc<Self> {
        let map = ctx.store.open_map(&index_map_name(schema.index_id));
        // A map that already has content was built before (the table is
        // being reopened); a fresh map must be populated from the table.
        let needs_rebuild = map.is_empty();
        Arc::new(Self {
            schema,
            table_name: table.table_name.clone(),
            map,
            primary,
            nulls_last: ctx.settings.nulls_last,
            needs_rebuild: AtomicBool::new(needs_rebuild),
            registry: ctx.registry.clone(),
        })
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub fn map_name(&self) -> &str {
        self.map.name()
    }

    pub(crate) fn needs_rebuild(&self) -> bool {
        self.needs_rebuild.load(Ordering::Acquire)
    }

    pub(crate) fn mark_built(&self) {
        self.needs_rebuild.store(false, Ordering::Release);
    }

    pub fn search_key(&self, values: Vec<Value>) -> SearchKey {
        SearchKey::new(values, self.schema.desc_mask, self.nulls_last)
    }

    pub(crate) fn key_of(&self, row: &Row) -> Result<SearchKey> {
        let mut key = self.search_key(row.project(&self.schema.cols)?);
        key.push(Value::Long(row.id.0));
        Ok(key)
    }

    fn conflict(&self, writer: Option<u64>, me: u64, values: &[Value]) -> DbError {
        if let Some(writer) = writer {
            if self.registry.is_concurrent(writer, me) {
                return TxError::ConcurrentUpdate {
                    index_name: self.schema.index_name.clone(),
                    writer,
                }
                .into();
            }
        }
        let value = values.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        IndexError::UniqueConstraintViolation {
            index_name: self.schema.index_name.clone(),
            table_name: self.table_name.clone(),
            value,
        }
        .into()
    }

    #[tracing::instrument(skip_all)]
    pub(crate) fn add(&self, session: &Session, row: &Row) -> Result<()> {
        let tx = session.transaction();
        tx.ensure_open()?;
        let values = row.project(&self.schema.cols)?;
        // A unique index may hold any number of NULL duplicates, so
        // NULL-bearing keys skip the clash scan.
        if self.schema.is_unique && !values.iter().any(Value::is_null) {
            let prefix = self.search_key(values.clone());
            let mut upper = prefix.clone();
            upper.push(Value::Long(i64::MAX));
            for (key, value) in self.map.range(Some(&prefix), Some(&upper)) {
                if key.cmp_prefix(&prefix) != CmpOrdering::Equal {
                    break;
                }
                if value.as_row_id() != row.id {
                    let writer = self.map.writer_of(&key);
                    return Err(self.conflict(writer, tx.id(), &values));
                }
            }
        }
        let key = self.key_of(row)?;
        self.map.put(&tx, key, MapValue::RowId(row.id))?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub(crate) fn remove(&self, session: &Session, row: &Row) -> Result<()> {
        let tx = session.transaction();
        let key = self.key_of(row)?;
        self.map.remove(&tx, &key)?.ok_or_else(|| {
            DbError::Internal(format!("row {} missing from `{}` on delete", row.id, self.schema.index_name))
        })?;
        Ok(())
    }

    pub(crate) fn truncate(&self, session: &Session) -> Result<()> {
        let tx = session.transaction();
        self.map.clear(&tx)
    }

    /// Range scan over `[first, last]`. Bounds may cover a prefix of the
    /// indexed columns; the upper bound is applied by prefix comparison so
    /// it stays inclusive for partial keys.
    #[tracing::instrument(skip_all)]
    pub(crate) fn find(&self, session: &Session, first: Option<&SearchKey>, last: Option<&SearchKey>) -> Result<Cursor> {
        let tx = session.transaction();
        tx.ensure_open()?;
        let last = last.cloned();
        let entries = self.map.range(first, None);
        let primary = self.primary.clone();
        let name = self.schema.index_name.clone();
        let iter = entries
            .into_iter()
            .take_while(move |(key, _)| match &last {
                Some(bound) => key.cmp_prefix(bound) != CmpOrdering::Greater,
                None => true,
            })
            .map(move |(_, value)| {
                let id = value.as_row_id();
                primary
                    .row_by_id(id)
                    .ok_or_else(|| DbError::Internal(format!("`{name}` points at missing row {id}")))
            });
        Ok(Cursor::new(tx, Box::new(iter)))
    }

    pub(crate) fn row_count(&self, session: &Session) -> Result<u64> {
        session.transaction().ensure_open()?;
        Ok(self.map.len())
    }

    pub(crate) fn row_count_approximation(&self) -> u64 {
        self.map.len()
    }

    pub fn byte_size(&self) -> u64 {
        self.map.byte_size()
    }
}
