use super::Cursor;
use crate::context::Context;
use crate::error::{DbError, IndexError, TxError};
use crate::row::{Row, RowId, SearchKey, Value};
use crate::schema::{ColId, IndexId, IndexSchema, IndexType, TableSchema};
use crate::session::Session;
use crate::store::{index_map_name, MapValue, OrderedMap};
use crate::tx::TxRegistry;
use crate::Result;
use nonempty::NonEmpty;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

const NO_MAIN_COLUMN: i64 = -1;

/// The clustered primary index: `row id -> full row` in an ordered map.
///
/// When a "main index column" is designated (a single integral ascending
/// primary key), the column's value *is* the row id, and lookups on that
/// column skip a level of indirection; the delegate index is a view over
/// this fast path. It doubles as the scan index: a full-table scan is a
/// range scan over all row ids.
pub struct PrimaryIndex {
    schema: IndexSchema,
    table_name: String,
    map: Arc<dyn OrderedMap>,
    /// Promoted column position, `-1` when none. Promotion is decided at
    /// creation time and never revoked while the table is live.
    main_index_column: AtomicI64,
    next_row_id: AtomicI64,
    registry: Arc<TxRegistry>,
}

impl std::fmt::Debug for PrimaryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryIndex")
            .field("table_name", &self.table_name)
            .finish_non_exhaustive()
    }
}

impl PrimaryIndex {
    pub(crate) fn open(ctx: &Context, table: &TableSchema, index_id: IndexId) -> Arc<Self> {
        let map = ctx.store.open_map(&index_map_name(index_id));
        // Resume row-id allocation after the largest stored key.
        let next_row_id = map
            .range(None, None)
            .last()
            .and_then(|(key, _)| key.values().first().and_then(Value::as_long))
            .map_or(1, |last| last + 1);
        let schema = IndexSchema {
            index_id,
            table_id: table.table_id,
            index_name: format!("{}.data", table.table_name),
            index_type: IndexType::Primary,
            cols: NonEmpty::new(ColId(0)),
            desc_mask: 0,
            is_unique: true,
        };
        Arc::new(Self {
            schema,
            table_name: table.table_name.clone(),
            map,
            main_index_column: AtomicI64::new(NO_MAIN_COLUMN),
            next_row_id: AtomicI64::new(next_row_id),
            registry: ctx.registry.clone(),
        })
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub fn map_name(&self) -> &str {
        self.map.name()
    }

    pub fn main_index_column(&self) -> Option<ColId> {
        match self.main_index_column.load(Ordering::Acquire) {
            NO_MAIN_COLUMN => None,
            col => Some(ColId(col as u32)),
        }
    }

    pub(crate) fn set_main_index_column(&self, col: ColId) {
        self.main_index_column.store(i64::from(col.0), Ordering::Release);
    }

    /// Demotes the primary when its delegate index is dropped; later rows
    /// go back to allocator-assigned ids.
    pub(crate) fn reset_main_index_column(&self) {
        self.main_index_column.store(NO_MAIN_COLUMN, Ordering::Release);
    }

    fn key(&self, id: RowId) -> SearchKey {
        SearchKey::row_id(id)
    }

    pub(crate) fn key_of(&self, row: &Row) -> SearchKey {
        self.key(row.id)
    }

    pub fn search_key(&self, values: Vec<Value>) -> SearchKey {
        SearchKey::new(values, 0, false)
    }

    /// Assigns the row its id: the main column's value when promoted,
    /// otherwise the next value of the allocation counter.
    pub(crate) fn prepare_row(&self, row: &mut Row) -> Result<()> {
        if let Some(col) = self.main_index_column() {
            let id = row.value(col)?.as_long().ok_or_else(|| {
                DbError::Internal(format!(
                    "main index column {col} of `{}` holds a non-integral value",
                    self.table_name
                ))
            })?;
            row.id = RowId(id);
            self.next_row_id.fetch_max(id + 1, Ordering::AcqRel);
        } else if row.id == RowId::UNSET {
            row.id = RowId(self.next_row_id.fetch_add(1, Ordering::AcqRel));
        } else {
            self.next_row_id.fetch_max(row.id.0 + 1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn conflict(&self, writer: Option<u64>, me: u64, value: &Value) -> DbError {
        if let Some(writer) = writer {
            if self.registry.is_concurrent(writer, me) {
                return TxError::ConcurrentUpdate {
                    index_name: self.schema.index_name.clone(),
                    writer,
                }
                .into();
            }
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
        let key = self.key(row.id);
        if self.map.get(&key).is_some() {
            let writer = self.map.writer_of(&key);
            return Err(self.conflict(writer, tx.id(), &Value::Long(row.id.0)));
        }
        self.map.put(&tx, key, MapValue::Row(row.clone()))?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub(crate) fn remove(&self, session: &Session, row: &Row) -> Result<()> {
        let tx = session.transaction();
        self.map.remove(&tx, &self.key(row.id))?.ok_or_else(|| {
            DbError::Internal(format!("row {} missing from `{}` on delete", row.id, self.schema.index_name))
        })?;
        Ok(())
    }

    pub(crate) fn truncate(&self, session: &Session) -> Result<()> {
        let tx = session.transaction();
        self.map.clear(&tx)
    }

    /// Point lookup by row id.
    pub fn get_row(&self, session: &Session, id: RowId) -> Result<Option<Row>> {
        session.transaction().ensure_open()?;
        Ok(self.row_by_id(id))
    }

    /// Map-level lookup without a transaction check; cursors guard the
    /// transaction themselves.
    pub(crate) fn row_by_id(&self, id: RowId) -> Option<Row> {
        match self.map.get(&self.key(id)) {
            Some(MapValue::Row(row)) => Some(row),
            Some(MapValue::RowId(_)) | None => None,
        }
    }

    #[tracing::instrument(skip_all)]
    pub(crate) fn find(&self, session: &Session, first: Option<&SearchKey>, last: Option<&SearchKey>) -> Result<Cursor> {
        let tx = session.transaction();
        tx.ensure_open()?;
        let name = self.schema.index_name.clone();
        let iter = self.map.range(first, last).into_iter().map(move |(_, value)| match value {
            MapValue::Row(row) => Ok(row),
            MapValue::RowId(_) => Err(DbError::Internal(format!("`{name}` holds a bare row id"))),
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
