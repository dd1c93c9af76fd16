use crate::row::{Row, SearchKey, Value};
use crate::schema::{IndexId, IndexSchema, IndexType};
use crate::session::Session;
use crate::tx::Transaction;
use crate::Result;
use std::cmp::Ordering;
use std::sync::Arc;

pub(crate) mod build;
mod delegate;
mod hash;
mod primary;
mod secondary;

pub use delegate::DelegateIndex;
pub use hash::HashIndex;
pub use primary::PrimaryIndex;
pub use secondary::SecondaryIndex;

/// A lazy, single-direction sequence of rows matching a search-key range.
///
/// Callers drive it with [`Cursor::next`] / [`Cursor::get`]; it is restarted
/// by reissuing the lookup. Every step re-checks the owning transaction, so
/// iteration past the transaction's end fails with `TransactionClosed`.
pub struct Cursor {
    tx: Arc<Transaction>,
    iter: Box<dyn Iterator<Item = Result<Row>> + Send>,
    current: Option<Row>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl Cursor {
    pub(crate) fn new(tx: Arc<Transaction>, iter: Box<dyn Iterator<Item = Result<Row>> + Send>) -> Self {
        Self {
            tx,
            iter,
            current: None,
        }
    }

    /// Advances to the next row; `Ok(false)` when exhausted.
    pub fn next(&mut self) -> Result<bool> {
        self.tx.ensure_open()?;
        match self.iter.next() {
            Some(row) => {
                self.current = Some(row?);
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }

    /// The row the cursor is positioned on.
    pub fn get(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    /// Drains the cursor; test and builder convenience.
    pub fn collect_rows(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while self.next()? {
            if let Some(row) = self.current.take() {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

/// The polymorphic surface every physical index implements, as a tagged
/// variant rather than an inheritance hierarchy.
#[derive(Clone, Debug)]
pub enum TableIndex {
    Primary(Arc<PrimaryIndex>),
    Delegate(Arc<DelegateIndex>),
    Hash(Arc<HashIndex>),
    Secondary(Arc<SecondaryIndex>),
}

impl TableIndex {
    pub fn schema(&self) -> &IndexSchema {
        match self {
            TableIndex::Primary(i) => i.schema(),
            TableIndex::Delegate(i) => i.schema(),
            TableIndex::Hash(i) => i.schema(),
            TableIndex::Secondary(i) => i.schema(),
        }
    }

    pub fn id(&self) -> IndexId {
        self.schema().index_id
    }

    pub fn name(&self) -> &str {
        &self.schema().index_name
    }

    pub fn index_type(&self) -> IndexType {
        self.schema().index_type
    }

    pub fn is_unique(&self) -> bool {
        self.schema().is_unique
    }

    pub fn add(&self, session: &Session, row: &Row) -> Result<()> {
        match self {
            TableIndex::Primary(i) => i.add(session, row),
            TableIndex::Delegate(_) => Ok(()),
            TableIndex::Hash(i) => i.add(session, row),
            TableIndex::Secondary(i) => i.add(session, row),
        }
    }

    pub fn remove(&self, session: &Session, row: &Row) -> Result<()> {
        match self {
            TableIndex::Primary(i) => i.remove(session, row),
            TableIndex::Delegate(_) => Ok(()),
            TableIndex::Hash(i) => i.remove(session, row),
            TableIndex::Secondary(i) => i.remove(session, row),
        }
    }

    pub fn truncate(&self, session: &Session) -> Result<()> {
        match self {
            TableIndex::Primary(i) => i.truncate(session),
            TableIndex::Delegate(_) => Ok(()),
            TableIndex::Hash(i) => i.truncate(session),
            TableIndex::Secondary(i) => i.truncate(session),
        }
    }

    /// Rows whose index key falls in `[first, last]`, both bounds inclusive
    /// when present. Hash indexes only accept `first == last`.
    pub fn find(&self, session: &Session, first: Option<&SearchKey>, last: Option<&SearchKey>) -> Result<Cursor> {
        match self {
            TableIndex::Primary(i) => i.find(session, first, last),
            TableIndex::Delegate(i) => i.find(session, first, last),
            TableIndex::Hash(i) => i.find(session, first, last),
            TableIndex::Secondary(i) => i.find(session, first, last),
        }
    }

    pub fn row_count(&self, session: &Session) -> Result<u64> {
        match self {
            TableIndex::Primary(i) => i.row_count(session),
            TableIndex::Delegate(i) => i.row_count(session),
            TableIndex::Hash(i) => i.row_count(session),
            TableIndex::Secondary(i) => i.row_count(session),
        }
    }

    pub fn row_count_approximation(&self) -> u64 {
        match self {
            TableIndex::Primary(i) => i.row_count_approximation(),
            TableIndex::Delegate(i) => i.row_count_approximation(),
            TableIndex::Hash(i) => i.row_count_approximation(),
            TableIndex::Secondary(i) => i.row_count_approximation(),
        }
    }

    /// Whether the index must be (re)built from the table's data before use.
    pub fn needs_rebuild(&self) -> bool {
        match self {
            TableIndex::Primary(_) | TableIndex::Delegate(_) => false,
            TableIndex::Hash(i) => i.needs_rebuild(),
            TableIndex::Secondary(i) => i.needs_rebuild(),
        }
    }

    pub(crate) fn mark_built(&self) {
        match self {
            TableIndex::Primary(_) | TableIndex::Delegate(_) => {}
            TableIndex::Hash(i) => i.mark_built(),
            TableIndex::Secondary(i) => i.mark_built(),
        }
    }

    /// The key this index would store for `row`; defines the index's total
    /// order over rows.
    pub(crate) fn key_of(&self, row: &Row) -> Result<SearchKey> {
        match self {
            TableIndex::Primary(i) => Ok(i.key_of(row)),
            TableIndex::Delegate(i) => i.key_of(row),
            TableIndex::Hash(i) => i.key_of(row),
            TableIndex::Secondary(i) => i.key_of(row),
        }
    }

    /// Total order over the index's key columns.
    pub fn compare_rows(&self, a: &Row, b: &Row) -> Result<Ordering> {
        Ok(self.key_of(a)?.cmp(&self.key_of(b)?))
    }

    /// Builds a search key over this index's columns, applying its sort
    /// directions and the engine's NULL policy.
    pub fn search_key(&self, values: Vec<Value>) -> SearchKey {
        match self {
            TableIndex::Primary(i) => i.search_key(values),
            TableIndex::Delegate(i) => i.search_key(values),
            TableIndex::Hash(i) => i.search_key(values),
            TableIndex::Secondary(i) => i.search_key(values),
        }
    }

    /// Name of the backing map, for indexes that own storage.
    pub fn map_name(&self) -> Option<String> {
        match self {
            TableIndex::Primary(i) => Some(i.map_name().to_owned()),
            TableIndex::Delegate(_) | TableIndex::Hash(_) => None,
            TableIndex::Secondary(i) => Some(i.map_name().to_owned()),
        }
    }
}
