use super::{Cursor, PrimaryIndex};
use crate::error::DbError;
use crate::row::{Row, RowId, SearchKey, Value};
use crate::schema::IndexSchema;
use crate::session::Session;
use crate::Result;
use std::sync::Arc;

/// A logical index over the primary's main index column.
///
/// It owns no storage: the main column's value equals the row id, so every
/// operation translates into a row-id lookup on the primary. Mutation and
/// truncation are no-ops (the primary already stores the data).
pub struct DelegateIndex {
    schema: IndexSchema,
    primary: Arc<PrimaryIndex>,
}

impl std::fmt::Debug for DelegateIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateIndex").finish_non_exhaustive()
    }
}

impl DelegateIndex {
    pub(crate) fn new(schema: IndexSchema, primary: Arc<PrimaryIndex>) -> Arc<Self> {
        Arc::new(Self { schema, primary })
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub(crate) fn key_of(&self, row: &Row) -> Result<SearchKey> {
        Ok(SearchKey::row_id(row.id))
    }

    pub fn search_key(&self, values: Vec<Value>) -> SearchKey {
        SearchKey::new(values, 0, false)
    }

    /// Translates a bound over the main column into a row-id bound.
    fn translate(&self, bound: &SearchKey) -> Result<SearchKey> {
        let value = bound
            .values()
            .first()
            .ok_or_else(|| DbError::Internal(format!("empty search key on `{}`", self.schema.index_name)))?;
        let id = value.as_long().ok_or_else(|| {
            DbError::Internal(format!(
                "non-integral bound on main index column of `{}`",
                self.schema.index_name
            ))
        })?;
        Ok(SearchKey::row_id(RowId(id)))
    }

    pub(crate) fn find(&self, session: &Session, first: Option<&SearchKey>, last: Option<&SearchKey>) -> Result<Cursor> {
        let first = first.map(|b| self.translate(b)).transpose()?;
        let last = last.map(|b| self.translate(b)).transpose()?;
        self.primary.find(session, first.as_ref(), last.as_ref())
    }

    pub(crate) fn row_count(&self, session: &Session) -> Result<u64> {
        self.primary.row_count(session)
    }

    pub(crate) fn row_count_approximation(&self) -> u64 {
        self.primary.row_count_approximation()
    }
}
