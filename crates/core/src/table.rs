use crate::context::Context;
use crate::error::{DbError, IndexError, TableError};
use crate::index::{build, DelegateIndex, HashIndex, PrimaryIndex, SecondaryIndex, TableIndex};
use crate::lock::TableLock;
use crate::row::{Row, RowId, Value};
use crate::schema::{IndexDef, IndexRequest, IndexSchema, IndexType, TableId, TableSchema};
use crate::session::Session;
use crate::store::index_map_name;
use crate::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Column statistics from the analyze pass, consumed by the query planner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    /// How many analyze passes have run on this table.
    pub runs: u32,
    /// Rows read by the most recent pass.
    pub sampled_rows: u64,
    /// Per-column distinct percentage over the sample.
    pub selectivity: Vec<u8>,
}

/// One on-disk table: its schema, its index set, its lock state, and the
/// counters behind the adaptive analyze trigger.
///
/// DML goes through [`Table::add_row`] / [`Table::remove_row`] /
/// [`Table::truncate`], which acquire the table lock and route the mutation
/// through every index under one transaction savepoint. DDL goes through
/// [`Table::add_index`] / [`Table::remove_index`].
pub struct Table {
    ctx: Arc<Context>,
    schema: TableSchema,
    locking: TableLock,
    primary: OnceLock<Arc<PrimaryIndex>>,
    /// All indexes in creation order; the primary sits at slot 0 once the
    /// table is initialized.
    indexes: RwLock<Vec<TableIndex>>,
    last_modification_id: AtomicU64,
    changes_since_analyze: AtomicU32,
    next_analyze: AtomicU32,
    stats: Mutex<TableStats>,
    me: Weak<Table>,
}

impl Table {
    pub fn new(ctx: &Arc<Context>, schema: TableSchema) -> Arc<Self> {
        let locking = TableLock::new(ctx, schema.table_id, &schema.table_name);
        Arc::new_cyclic(|me| Self {
            ctx: ctx.clone(),
            locking,
            primary: OnceLock::new(),
            indexes: RwLock::new(Vec::new()),
            last_modification_id: AtomicU64::new(0),
            changes_since_analyze: AtomicU32::new(0),
            next_analyze: AtomicU32::new(ctx.settings.analyze_auto),
            stats: Mutex::new(TableStats::default()),
            me: me.clone(),
            schema,
        })
    }

    /// Creates the clustered primary index over `index.<primary_index_id>`.
    /// Must run before any row or index operation.
    pub fn init(&self, primary_index_id: crate::schema::IndexId) -> Result<()> {
        let primary = PrimaryIndex::open(&self.ctx, &self.schema, primary_index_id);
        self.primary
            .set(primary.clone())
            .map_err(|_| DbError::Internal(format!("table `{}` initialized twice", self.schema.table_name)))?;
        self.indexes.write().push(TableIndex::Primary(primary));
        log::trace!("TABLE CREATED: {}, table_id: {}", self.schema.table_name, self.schema.table_id);
        Ok(())
    }

    pub fn id(&self) -> TableId {
        self.schema.table_id
    }

    pub fn name(&self) -> &str {
        &self.schema.table_name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn primary(&self) -> Result<Arc<PrimaryIndex>> {
        self.primary
            .get()
            .cloned()
            .ok_or_else(|| TableError::NotInitialized(self.schema.table_name.clone()).into())
    }

    /// Acquires the table lock for `session`; see the lock manager for the
    /// MVCC and read-committed fast paths.
    pub fn lock(&self, session: &Arc<Session>, exclusive: bool, force: bool) -> Result<()> {
        if self.locking.lock(&self.ctx, session, exclusive, force)? {
            if let Some(me) = self.me.upgrade() {
                session.add_lock(me);
            }
        }
        Ok(())
    }

    /// Releases whatever lock `session` holds on this table.
    pub fn unlock(&self, session: &Session) {
        self.locking.unlock(session);
        session.remove_lock(self);
    }

    /// Called when the session's transaction ends; releases this table's
    /// lock.
    pub fn commit(&self, session: &Session) {
        self.locking.unlock(session);
        session.remove_lock(self);
    }

    pub fn is_locked_exclusively_by(&self, session: &Session) -> bool {
        self.locking.is_locked_exclusively_by(session.id())
    }

    /// Inserts `row` into every index under one savepoint; returns the row
    /// with its assigned row id. Any index failure rolls the whole insert
    /// back and re-raises.
    #[tracing::instrument(skip_all, fields(table = %self.schema.table_name))]
    pub fn add_row(&self, session: &Arc<Session>, mut row: Row) -> Result<Row> {
        self.lock(session, true, false)?;
        let tx = session.transaction();
        self.last_modification_id
            .store(self.ctx.next_modification_id(), Ordering::Release);

        let savepoint = tx.set_savepoint();
        let primary = self.primary()?;
        primary.prepare_row(&mut row)?;
        let indexes = self.indexes.read().clone();
        for index in &indexes {
            if let Err(cause) = index.add(session, &row) {
                if let Err(inner) = tx.rollback_to_savepoint(savepoint) {
                    log::warn!("rollback to savepoint failed after insert error: {inner}");
                }
                return Err(cause);
            }
        }
        self.analyze_if_required(session)?;
        Ok(row)
    }

    /// Deletes `row` from every index, iterating in reverse creation order,
    /// under one savepoint.
    #[tracing::instrument(skip_all, fields(table = %self.schema.table_name))]
    pub fn remove_row(&self, session: &Arc<Session>, row: &Row) -> Result<()> {
        self.lock(session, true, false)?;
        let tx = session.transaction();
        self.last_modification_id
            .store(self.ctx.next_modification_id(), Ordering::Release);

        let mut row = row.clone();
        if row.id == RowId::UNSET {
            let primary = self.primary()?;
            if primary.main_index_column().is_some() {
                primary.prepare_row(&mut row)?;
            } else {
                return Err(DbError::Internal(format!(
                    "remove_row on `{}` requires a row id",
                    self.schema.table_name
                )));
            }
        }

        let savepoint = tx.set_savepoint();
        let indexes = self.indexes.read().clone();
        for index in indexes.iter().rev() {
            if let Err(cause) = index.remove(session, &row) {
                if let Err(inner) = tx.rollback_to_savepoint(savepoint) {
                    log::warn!("rollback to savepoint failed after delete error: {inner}");
                }
                return Err(cause);
            }
        }
        self.analyze_if_required(session)?;
        Ok(())
    }

    /// Empties the table and every index, newest index first.
    #[tracing::instrument(skip_all, fields(table = %self.schema.table_name))]
    pub fn truncate(&self, session: &Arc<Session>) -> Result<()> {
        self.lock(session, true, true)?;
        self.last_modification_id
            .store(self.ctx.next_modification_id(), Ordering::Release);
        let indexes = self.indexes.read().clone();
        for index in indexes.iter().rev() {
            index.truncate(session)?;
        }
        self.changes_since_analyze.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Point lookup by row id (or by the main index column's value, which is
    /// the same thing on a promoted primary).
    pub fn get_row(&self, session: &Arc<Session>, key: RowId) -> Result<Option<Row>> {
        self.lock(session, false, false)?;
        self.primary()?.get_row(session, key)
    }

    /// The clustered index, used as the full-table-scan source.
    pub fn get_scan_index(&self) -> Result<TableIndex> {
        Ok(TableIndex::Primary(self.primary()?))
    }

    /// The first unique index covering exactly `col`, if any.
    pub fn get_unique_index(&self, col: crate::schema::ColId) -> Option<TableIndex> {
        let indexes = self.indexes.read();
        indexes
            .iter()
            .find(|index| match index {
                // The primary counts only through its promoted column.
                TableIndex::Primary(p) => p.main_index_column() == Some(col),
                _ => {
                    index.is_unique() && index.schema().cols.len() == 1 && *index.schema().cols.first() == col
                }
            })
            .cloned()
    }

    pub fn get_indexes(&self) -> Vec<TableIndex> {
        self.indexes.read().clone()
    }

    pub fn get_row_count(&self, session: &Arc<Session>) -> Result<u64> {
        self.primary()?.row_count(session)
    }

    pub fn get_row_count_approximation(&self) -> u64 {
        self.primary.get().map_or(0, |p| p.row_count_approximation())
    }

    pub fn get_max_data_modification_id(&self) -> u64 {
        self.last_modification_id.load(Ordering::Acquire)
    }

    /// False iff some referential constraint points *to* this table.
    pub fn can_truncate(&self) -> bool {
        self.ctx.catalog.constraints_referencing(self.schema.table_id).is_empty()
    }

    pub fn can_drop(&self) -> bool {
        !self.schema.hidden
    }

    /// Creates an index per the selection policy:
    /// - primary-key over a single promotable integral ascending column
    ///   becomes a delegate over the promoted primary,
    /// - hash-typed requests over at most one column become hash indexes,
    /// - everything else becomes a sorted secondary index.
    ///
    /// A failed build removes the partial index and releases its name back
    /// to the schema before re-raising the cause.
    #[tracing::instrument(skip_all, fields(table = %self.schema.table_name, index = %def.index_name))]
    pub fn add_index(&self, session: &Arc<Session>, def: IndexDef) -> Result<TableIndex> {
        self.lock(session, true, true)?;
        let primary = self.primary()?;
        for &col in def.cols.iter() {
            let column = self.schema.column(col)?;
            if def.request == IndexRequest::PrimaryKey && column.nullable {
                return Err(IndexError::ColumnNotNullable {
                    table_name: self.schema.table_name.clone(),
                    col_name: column.col_name.clone(),
                }
                .into());
            }
        }
        log::trace!(
            "INDEX CREATING: {} for table: {} and col(s): {:?}",
            def.index_name,
            self.schema.table_name,
            def.cols
        );

        self.ctx.catalog.add_schema_object(&def.index_name)?;
        let index = match self.create_physical(&def, &primary) {
            Ok(index) => index,
            Err(cause) => {
                self.ctx.catalog.free_unique_name(&def.index_name);
                return Err(cause);
            }
        };

        if index.needs_rebuild() {
            if primary.row_count_approximation() == 0 {
                index.mark_built();
            } else if let Err(cause) =
                build::rebuild_index(&self.ctx, session, &self.schema.table_name, &primary, &index)
            {
                // The partially built index must not survive; the original
                // cause is what the caller sees.
                if let Err(inner) = self.drop_index_storage(&index) {
                    log::warn!("failed to drop partially built index `{}`: {inner}", def.index_name);
                }
                self.ctx.catalog.free_unique_name(&def.index_name);
                return Err(cause);
            }
        }

        self.indexes.write().push(index.clone());
        log::trace!("INDEX CREATED: {}", def.index_name);
        Ok(index)
    }

    fn create_physical(&self, def: &IndexDef, primary: &Arc<PrimaryIndex>) -> Result<TableIndex> {
        let promotable = def.request == IndexRequest::PrimaryKey
            && def.cols.len() == 1
            && def.desc_mask == 0
            && self.schema.column(*def.cols.first())?.col_type.is_integral()
            && primary.main_index_column().is_none();
        if promotable
            && (primary.row_count_approximation() == 0 || !self.ctx.store.has_map(&index_map_name(def.index_id)))
        {
            let col = *def.cols.first();
            primary.set_main_index_column(col);
            let schema = IndexSchema::from_def(self.schema.table_id, def, IndexType::Delegate);
            return Ok(TableIndex::Delegate(DelegateIndex::new(schema, primary.clone())));
        }
        if def.request == IndexRequest::Hash && def.cols.len() <= 1 {
            let schema = IndexSchema::from_def(self.schema.table_id, def, IndexType::Hash);
            return Ok(TableIndex::Hash(HashIndex::new(
                &self.ctx,
                &self.schema,
                schema,
                primary.clone(),
                true,
            )));
        }
        let mut schema = IndexSchema::from_def(self.schema.table_id, def, IndexType::Secondary);
        // A primary key that could not be promoted still enforces uniqueness.
        schema.is_unique = schema.is_unique || def.request == IndexRequest::PrimaryKey;
        Ok(TableIndex::Secondary(SecondaryIndex::open(
            &self.ctx,
            &self.schema,
            schema,
            primary.clone(),
        )))
    }

    fn drop_index_storage(&self, index: &TableIndex) -> Result<()> {
        if let Some(map) = index.map_name() {
            self.ctx.store.remove_map(&map)?;
        }
        Ok(())
    }

    /// Drops a secondary/hash/delegate index, releasing its schema name and
    /// backing storage.
    pub fn remove_index(&self, session: &Arc<Session>, index_id: crate::schema::IndexId) -> Result<()> {
        self.lock(session, true, true)?;
        let removed = {
            let mut indexes = self.indexes.write();
            let at = indexes
                .iter()
                .position(|index| index.id() == index_id && !matches!(index, TableIndex::Primary(_)))
                .ok_or_else(|| IndexError::NotFound(index_id.to_string()))?;
            indexes.remove(at)
        };
        log::trace!("INDEX DROPPING: {}", removed.name());
        if matches!(removed, TableIndex::Delegate(_)) {
            // The promoted fast path dies with its delegate; otherwise
            // `get_unique_index` would keep reporting an index the schema
            // has already forgotten.
            self.primary()?.reset_main_index_column();
        }
        self.ctx.catalog.remove_schema_object(removed.name())?;
        self.drop_index_storage(&removed)?;
        log::trace!("INDEX DROPPED: {}", removed.name());
        Ok(())
    }

    /// Drops every child object and backing resource: schema-visible
    /// secondaries first (so the catalog stays consistent), the primary
    /// last, then the table's own meta entry.
    pub fn remove_children_and_resources(&self, session: &Arc<Session>) -> Result<()> {
        self.lock(session, true, true)?;
        let drained: Vec<TableIndex> = std::mem::take(&mut *self.indexes.write());
        for index in drained.iter().rev() {
            if matches!(index, TableIndex::Primary(_)) {
                continue;
            }
            self.ctx.catalog.remove_schema_object(index.name())?;
            self.drop_index_storage(index)?;
        }
        if let Some(primary) = drained.iter().find(|i| matches!(i, TableIndex::Primary(_))) {
            if let Some(map) = primary.map_name() {
                self.ctx.store.remove_map(&map)?;
            }
        }
        self.ctx.catalog.free_unique_name(&self.schema.table_name);
        log::trace!("TABLE DROPPED: {}", self.schema.table_name);
        Ok(())
    }

    pub fn stats(&self) -> TableStats {
        self.stats.lock().clone()
    }

    /// Current `next_analyze` threshold, exposed for the planner's cost
    /// bookkeeping.
    pub fn analyze_threshold(&self) -> u32 {
        self.next_analyze.load(Ordering::Relaxed)
    }

    /// After every mutation: once the number of changes strictly exceeds
    /// the threshold, sample the table, refresh statistics, and double the
    /// threshold (left unchanged when doubling would overflow).
    fn analyze_if_required(&self, session: &Arc<Session>) -> Result<()> {
        let next = self.next_analyze.load(Ordering::Relaxed);
        if next == 0 {
            return Ok(());
        }
        let changes = self.changes_since_analyze.fetch_add(1, Ordering::Relaxed) + 1;
        if changes <= next {
            return Ok(());
        }
        self.changes_since_analyze.store(0, Ordering::Relaxed);
        self.next_analyze
            .store(next.checked_mul(2).unwrap_or(next), Ordering::Relaxed);
        self.analyze(session)
    }

    fn analyze(&self, session: &Arc<Session>) -> Result<()> {
        let sample = (self.ctx.settings.analyze_sample / 10).max(1) as u64;
        let mut cursor = self.primary()?.find(session, None, None)?;
        let mut distinct: Vec<HashSet<Value>> = vec![HashSet::new(); self.schema.columns.len()];
        let mut sampled = 0u64;
        while sampled < sample && cursor.next()? {
            let Some(row) = cursor.get() else { break };
            for (col, value) in row.values.iter().enumerate() {
                if let Some(set) = distinct.get_mut(col) {
                    set.insert(value.clone());
                }
            }
            sampled += 1;
        }
        let selectivity = distinct
            .iter()
            .map(|set| {
                if sampled == 0 {
                    0
                } else {
                    ((set.len() as u64 * 100) / sampled).min(100) as u8
                }
            })
            .collect();
        let mut stats = self.stats.lock();
        stats.runs += 1;
        stats.sampled_rows = sampled;
        stats.selectivity = selectivity;
        log::trace!("ANALYZE: {} sampled {} rows", self.schema.table_name, sampled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineSettings;
    use crate::error::TxError;
    use crate::schema::{
        Catalog, ColId, ColType, ColumnSchema, ConstraintSchema, IndexId, MemoryCatalog,
    };
    use crate::store::{KeyValueStore, MemoryStore};
    use nonempty::NonEmpty;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicU64;

    fn columns() -> Vec<ColumnSchema> {
        vec![
            ColumnSchema {
                col_pos: ColId(0),
                col_name: "id".into(),
                col_type: ColType::Long,
                nullable: false,
                primary_key: true,
            },
            ColumnSchema {
                col_pos: ColId(1),
                col_name: "name".into(),
                col_type: ColType::Text,
                nullable: true,
                primary_key: false,
            },
        ]
    }

    fn setup_full(
        settings: EngineSettings,
    ) -> (Arc<Context>, Arc<MemoryStore>, Arc<MemoryCatalog>, Arc<Table>, Arc<Session>) {
        let store = MemoryStore::new(settings.persistent);
        let catalog = Arc::new(MemoryCatalog::new());
        let ctx = Context::with_store(settings, store.clone(), catalog.clone());
        let table = Table::new(&ctx, TableSchema::new(TableId(1), "accounts", columns()));
        table.init(IndexId(1)).unwrap();
        let session = Session::new(&ctx);
        (ctx, store, catalog, table, session)
    }

    fn setup() -> (Arc<Context>, Arc<Table>, Arc<Session>) {
        let (ctx, _, _, table, session) = setup_full(EngineSettings::default());
        (ctx, table, session)
    }

    fn row(id: i64, name: &str) -> Row {
        Row::new(vec![Value::Long(id), Value::Text(name.into())])
    }

    fn index_def(id: u32, name: &str, request: IndexRequest, col: u32, unique: bool) -> IndexDef {
        IndexDef {
            index_id: IndexId(id),
            index_name: name.into(),
            request,
            cols: NonEmpty::new(ColId(col)),
            desc_mask: 0,
            is_unique: unique,
        }
    }

    #[test]
    fn add_row_round_trips_through_the_primary() {
        let (_ctx, table, session) = setup();
        let before = table.get_max_data_modification_id();
        let stored = table.add_row(&session, row(7, "alice")).unwrap();
        assert_ne!(stored.id, RowId::UNSET);

        let found = table.get_row(&session, stored.id).unwrap().unwrap();
        assert_eq!(found, stored);
        assert_eq!(table.get_row_count(&session).unwrap(), 1);
        assert!(table.get_max_data_modification_id() > before);
    }

    #[test]
    fn unique_secondary_violation_rolls_the_statement_back() {
        let (_ctx, table, session) = setup();
        table.add_row(&session, row(1, "a")).unwrap();
        table.add_row(&session, row(2, "b")).unwrap();
        let idx = table
            .add_index(&session, index_def(2, "accounts_name_key", IndexRequest::Standard, 1, true))
            .unwrap();
        assert_eq!(idx.row_count(&session).unwrap(), 2);

        let err = table.add_row(&session, row(3, "a")).unwrap_err();
        assert!(err.is_duplicate_key(), "unexpected error: {err}");
        assert_eq!(table.get_row_count(&session).unwrap(), 2);
        assert_eq!(idx.row_count(&session).unwrap(), 2);
    }

    #[test]
    fn failed_insert_restores_every_index_including_hash() {
        let (_ctx, table, session) = setup();
        table.add_row(&session, row(1, "a")).unwrap();
        table.add_row(&session, row(2, "b")).unwrap();
        // The hash index sits before the unique secondary in insertion
        // order, so the failing insert has already touched it.
        let hash = table
            .add_index(&session, index_def(2, "accounts_id_hash", IndexRequest::Hash, 0, false))
            .unwrap();
        let unique = table
            .add_index(&session, index_def(3, "accounts_name_key", IndexRequest::Standard, 1, true))
            .unwrap();

        let err = table.add_row(&session, row(3, "a")).unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(hash.row_count(&session).unwrap(), 2);
        assert_eq!(unique.row_count(&session).unwrap(), 2);
        assert_eq!(table.get_row_count(&session).unwrap(), 2);
    }

    #[test]
    fn nullable_primary_key_column_fails_at_index_creation() {
        let (_ctx, table, session) = setup();
        let err = table
            .add_index(&session, index_def(2, "accounts_pk", IndexRequest::PrimaryKey, 1, true))
            .unwrap_err();
        assert!(
            matches!(err, DbError::Index(IndexError::ColumnNotNullable { .. })),
            "unexpected error: {err}"
        );
        // The failed creation left no index behind.
        assert_eq!(table.get_indexes().len(), 1);
    }

    #[test]
    fn promotable_primary_key_becomes_a_delegate_without_storage() {
        let (_ctx, store, _catalog, table, session) = setup_full(EngineSettings::default());
        let idx = table
            .add_index(&session, index_def(5, "accounts_pk", IndexRequest::PrimaryKey, 0, true))
            .unwrap();
        assert!(matches!(idx, TableIndex::Delegate(_)));
        // No new backing map was allocated for the delegate.
        assert!(!store.has_map("index.5"));

        for id in [1, 2, 3] {
            let stored = table.add_row(&session, row(id, "x")).unwrap();
            // The main column's value is the internal row id.
            assert_eq!(stored.id, RowId(id));
        }
        let key = idx.search_key(vec![Value::Long(2)]);
        let rows = idx.find(&session, Some(&key), Some(&key)).unwrap().collect_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values[0], Value::Long(2));

        // The promoted primary serves as the unique index on the column.
        assert!(table.get_unique_index(ColId(0)).is_some());
    }

    #[test]
    fn hash_index_supports_equality_only() {
        let (_ctx, table, session) = setup();
        table.add_row(&session, row(1, "a")).unwrap();
        table.add_row(&session, row(2, "b")).unwrap();
        let idx = table
            .add_index(&session, index_def(2, "accounts_id_hash", IndexRequest::Hash, 0, true))
            .unwrap();
        assert!(matches!(idx, TableIndex::Hash(_)));

        let key = idx.search_key(vec![Value::Long(2)]);
        let rows = idx.find(&session, Some(&key), Some(&key)).unwrap().collect_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values[1], Value::Text("b".into()));

        let err = idx.find(&session, None, None).unwrap_err();
        assert!(
            matches!(err, DbError::Index(IndexError::UnsupportedScan { .. })),
            "unexpected error: {err}"
        );
        let hi = idx.search_key(vec![Value::Long(9)]);
        assert!(idx.find(&session, Some(&key), Some(&hi)).is_err());
    }

    #[test]
    fn unique_hash_rejects_duplicates() {
        let (_ctx, table, session) = setup();
        table
            .add_index(&session, index_def(2, "accounts_id_hash", IndexRequest::Hash, 0, true))
            .unwrap();
        table.add_row(&session, row(1, "a")).unwrap();
        let err = table.add_row(&session, row(1, "b")).unwrap_err();
        assert!(err.is_duplicate_key(), "unexpected error: {err}");
        assert_eq!(table.get_row_count(&session).unwrap(), 1);
    }

    #[test]
    fn cursor_fails_once_its_transaction_ends() {
        let (_ctx, table, session) = setup();
        for id in 1..=3 {
            table.add_row(&session, row(id, "x")).unwrap();
        }
        let scan = table.get_scan_index().unwrap();
        let mut cursor = scan.find(&session, None, None).unwrap();
        assert!(cursor.next().unwrap());

        session.commit().unwrap();
        let err = cursor.next().unwrap_err();
        assert!(matches!(err, DbError::Tx(TxError::Closed)), "unexpected error: {err}");
    }

    #[test]
    fn truncate_is_idempotent() {
        let (_ctx, table, session) = setup();
        let idx = table
            .add_index(&session, index_def(2, "accounts_name_idx", IndexRequest::Standard, 1, false))
            .unwrap();
        for id in 1..=5 {
            table.add_row(&session, row(id, "x")).unwrap();
        }
        table.truncate(&session).unwrap();
        table.truncate(&session).unwrap();
        assert_eq!(table.get_row_count(&session).unwrap(), 0);
        assert_eq!(idx.row_count(&session).unwrap(), 0);

        // The table stays usable after truncation.
        table.add_row(&session, row(9, "y")).unwrap();
        assert_eq!(table.get_row_count(&session).unwrap(), 1);
        assert_eq!(idx.row_count(&session).unwrap(), 1);
    }

    #[test]
    fn analyze_runs_on_the_documented_cadence() {
        let mut settings = EngineSettings::default();
        settings.analyze_auto = 100;
        let (_ctx, _, _, table, session) = setup_full(settings);

        // The 101st insert is the first to strictly exceed the threshold.
        for id in 1..=100 {
            table.add_row(&session, row(id, &format!("n{id}"))).unwrap();
        }
        assert_eq!(table.stats().runs, 0);
        table.add_row(&session, row(101, "n101")).unwrap();
        assert_eq!(table.stats().runs, 1, "analyze runs exactly once in the first 101 inserts");
        assert_eq!(table.analyze_threshold(), 200);

        // The doubled threshold needs 201 further changes before it trips.
        for id in 102..=302 {
            table.add_row(&session, row(id, &format!("n{id}"))).unwrap();
        }
        assert_eq!(table.stats().runs, 2);
        assert_eq!(table.analyze_threshold(), 400);
        assert!(table.stats().sampled_rows > 0);
    }

    #[test]
    fn block_merge_rebuild_spills_and_cleans_temporary_maps() {
        let mut settings = EngineSettings::default();
        settings.persistent = true;
        settings.max_memory_rows = 1000;
        settings.analyze_auto = 0;
        let (ctx, store, _catalog, table, session) = setup_full(settings);

        for id in 0..10_000i64 {
            // Repeating names keep the new index non-unique.
            table.add_row(&session, row(id, &format!("n{}", id % 97))).unwrap();
        }

        let reported = Arc::new(AtomicU64::new(0));
        let seen = reported.clone();
        ctx.set_progress_listener(Arc::new(move |key: &str, current: u64, _total: u64| {
            assert_eq!(key, "accounts:accounts_name_idx");
            seen.store(current, Ordering::Relaxed);
        }));

        let idx = table
            .add_index(&session, index_def(2, "accounts_name_idx", IndexRequest::Standard, 1, false))
            .unwrap();

        // 10k rows with 500-row blocks must have spilled at least 10 blocks.
        let allocated = store.temporary_maps_allocated();
        assert!(allocated >= 10, "expected >= 10 temporary maps, got {allocated}");
        for block in 0..allocated {
            assert!(!store.has_map(&format!("temp.{block}")), "temp.{block} not removed");
        }
        assert_eq!(idx.row_count(&session).unwrap(), 10_000);
        assert_eq!(reported.load(Ordering::Relaxed), 10_000);
    }

    #[test]
    fn failed_rebuild_cleans_up_and_frees_the_name() {
        let mut settings = EngineSettings::default();
        settings.persistent = true;
        settings.max_memory_rows = 8;
        settings.analyze_auto = 0;
        let (_ctx, store, catalog, table, session) = setup_full(settings);

        // Duplicate names doom a unique rebuild.
        for id in 0..50i64 {
            table.add_row(&session, row(id, &format!("n{}", id % 5))).unwrap();
        }
        let err = table
            .add_index(&session, index_def(2, "accounts_name_key", IndexRequest::Standard, 1, true))
            .unwrap_err();
        assert!(err.is_duplicate_key(), "unexpected error: {err}");

        // The partial index is gone, its name is free, the scratch maps too.
        assert_eq!(table.get_indexes().len(), 1);
        assert!(!store.has_map("index.2"));
        for block in 0..store.temporary_maps_allocated() {
            assert!(!store.has_map(&format!("temp.{block}")));
        }
        catalog.add_schema_object("accounts_name_key").unwrap();
    }

    #[test]
    fn mvcc_classifies_uncommitted_conflicts_as_concurrent_update() {
        let mut settings = EngineSettings::default();
        settings.mvcc = true;
        let (ctx, _, _, table, s1) = setup_full(settings);
        table
            .add_index(&s1, index_def(5, "accounts_pk", IndexRequest::PrimaryKey, 0, true))
            .unwrap();
        let s2 = Session::new(&ctx);

        s1.commit().unwrap();
        table.add_row(&s1, row(1, "a")).unwrap();

        // S1's insert is uncommitted: S2's clash is a concurrency conflict.
        let err = table.add_row(&s2, row(1, "b")).unwrap_err();
        assert!(
            matches!(err, DbError::Tx(TxError::ConcurrentUpdate { .. })),
            "unexpected error: {err}"
        );

        // Once S1 commits, the same clash is a plain duplicate key.
        s1.commit().unwrap();
        let err = table.add_row(&s2, row(1, "b")).unwrap_err();
        assert!(err.is_duplicate_key(), "unexpected error: {err}");
    }

    #[test]
    fn remove_row_deletes_from_every_index() {
        let (_ctx, table, session) = setup();
        let idx = table
            .add_index(&session, index_def(2, "accounts_name_idx", IndexRequest::Standard, 1, false))
            .unwrap();
        let rows: Vec<Row> = (1..=3).map(|id| table.add_row(&session, row(id, "x")).unwrap()).collect();

        table.remove_row(&session, &rows[1]).unwrap();
        assert_eq!(table.get_row_count(&session).unwrap(), 2);
        assert_eq!(idx.row_count(&session).unwrap(), 2);
        assert!(table.get_row(&session, rows[1].id).unwrap().is_none());
    }

    #[test]
    fn remove_index_releases_name_and_storage() {
        let (_ctx, store, catalog, table, session) = setup_full(EngineSettings::default());
        table
            .add_index(&session, index_def(2, "accounts_name_idx", IndexRequest::Standard, 1, false))
            .unwrap();
        assert!(store.has_map("index.2"));

        table.remove_index(&session, IndexId(2)).unwrap();
        assert!(!store.has_map("index.2"));
        assert_eq!(table.get_indexes().len(), 1);
        // The name went back to the schema.
        catalog.add_schema_object("accounts_name_idx").unwrap();
    }

    #[test]
    fn removing_a_delegate_demotes_the_primary() {
        let (_ctx, _store, catalog, table, session) = setup_full(EngineSettings::default());
        table
            .add_index(&session, index_def(5, "accounts_pk", IndexRequest::PrimaryKey, 0, true))
            .unwrap();
        assert!(table.get_unique_index(ColId(0)).is_some());

        table.remove_index(&session, IndexId(5)).unwrap();
        assert!(table.get_unique_index(ColId(0)).is_none());
        catalog.add_schema_object("accounts_pk").unwrap();

        // Rows inserted after the demotion get allocator-assigned ids again.
        let stored = table.add_row(&session, row(42, "x")).unwrap();
        assert_eq!(stored.id, RowId(1));
    }

    #[test]
    fn remove_children_and_resources_drops_secondaries_then_primary() {
        let (_ctx, store, catalog, table, session) = setup_full(EngineSettings::default());
        table
            .add_index(&session, index_def(2, "accounts_name_idx", IndexRequest::Standard, 1, false))
            .unwrap();
        table.add_row(&session, row(1, "a")).unwrap();

        table.remove_children_and_resources(&session).unwrap();
        assert!(!store.has_map("index.2"));
        assert!(!store.has_map("index.1"));
        catalog.add_schema_object("accounts_name_idx").unwrap();
    }

    #[test]
    fn can_truncate_consults_the_constraint_graph() {
        let (_ctx, _store, catalog, table, _session) = setup_full(EngineSettings::default());
        assert!(table.can_truncate());
        catalog.add_constraint(ConstraintSchema {
            constraint_name: "fk_orders_account".into(),
            table_id: TableId(2),
            referenced_table_id: table.id(),
        });
        assert!(!table.can_truncate());
    }

    #[test]
    fn secondary_range_scan_honors_bounds() {
        let (_ctx, table, session) = setup();
        let idx = table
            .add_index(&session, index_def(2, "accounts_name_idx", IndexRequest::Standard, 1, false))
            .unwrap();
        for (id, name) in [(1, "ant"), (2, "bee"), (3, "cat"), (4, "dog")] {
            table.add_row(&session, row(id, name)).unwrap();
        }
        let lo = idx.search_key(vec![Value::Text("bee".into())]);
        let hi = idx.search_key(vec![Value::Text("cat".into())]);
        let rows = idx.find(&session, Some(&lo), Some(&hi)).unwrap().collect_rows().unwrap();
        let names: Vec<Value> = rows.iter().map(|r| r.values[1].clone()).collect();
        assert_eq!(names, vec![Value::Text("bee".into()), Value::Text("cat".into())]);
        // The cursor yields rows in the index's own order.
        assert_eq!(idx.compare_rows(&rows[0], &rows[1]).unwrap(), std::cmp::Ordering::Less);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        /// Rebuild equivalence: for any input, a buffered rebuild and a
        /// block-merge rebuild produce the same index content.
        #[test]
        fn rebuild_strategies_are_equivalent(names in prop::collection::vec(0u8..20, 1..300)) {
            let mut buffered = EngineSettings::default();
            buffered.analyze_auto = 0;
            buffered.max_memory_rows = 32;
            let mut merged = buffered.clone();
            merged.persistent = true;

            let mut contents = Vec::new();
            for settings in [buffered, merged] {
                let (_ctx, _, _, table, session) = setup_full(settings);
                for (id, name) in names.iter().enumerate() {
                    table.add_row(&session, row(id as i64, &format!("n{name}"))).unwrap();
                }
                let idx = table
                    .add_index(&session, index_def(2, "accounts_name_idx", IndexRequest::Standard, 1, false))
                    .unwrap();
                let rows: Vec<(Value, RowId)> = idx
                    .find(&session, None, None)
                    .unwrap()
                    .collect_rows()
                    .unwrap()
                    .into_iter()
                    .map(|r| (r.values[1].clone(), r.id))
                    .collect();
                prop_assert_eq!(idx.row_count(&session).unwrap() as usize, names.len());
                contents.push(rows);
            }
            prop_assert_eq!(&contents[0], &contents[1]);
        }
    }
}
