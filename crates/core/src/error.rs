use crate::schema::{SessionId, TableId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock timeout on table `{table}` for session {session}; holders: [{holders}]")]
    Timeout {
        table: String,
        session: SessionId,
        holders: String,
    },
    #[error("deadlock detected: {ring}")]
    Deadlock { ring: String },
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("unique index or primary key violation: `{index_name}` on table `{table_name}`, value {value}")]
    UniqueConstraintViolation {
        index_name: String,
        table_name: String,
        value: String,
    },
    #[error("hash index `{index_name}` supports equality lookups only")]
    UnsupportedScan { index_name: String },
    #[error("column `{table_name}.{col_name}` must not be nullable to be part of the primary key")]
    ColumnNotNullable { table_name: String, col_name: String },
    #[error("index `{0}` not found")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum TableError {
    #[error("table `{0}` not found")]
    NotFound(String),
    #[error("table `{0}` has not been initialized")]
    NotInitialized(String),
    #[error("table with id {0} is referenced by a constraint and cannot be truncated")]
    CannotTruncate(TableId),
}

#[derive(Error, Debug)]
pub enum TxError {
    #[error("the transaction is closed")]
    Closed,
    #[error("concurrent update on `{index_name}`: conflicting uncommitted write by transaction {writer}")]
    ConcurrentUpdate { index_name: String, writer: u64 },
}

/// The umbrella error for the table core.
///
/// `Internal` is the `InternalCheck` kind: an invariant of the core itself
/// was violated (row-count mismatch, index not dropped, missing row on
/// delete). It is always fatal to the statement and never retried.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("LockError: {0}")]
    Lock(#[from] LockError),
    #[error("IndexError: {0}")]
    Index(#[from] IndexError),
    #[error("TableError: {0}")]
    Table(#[from] TableError),
    #[error("TxError: {0}")]
    Tx(#[from] TxError),
    #[error("internal check failed: {0}")]
    Internal(String),
}

impl DbError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, DbError::Index(IndexError::UniqueConstraintViolation { .. }))
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, DbError::Lock(LockError::Deadlock { .. }))
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, DbError::Lock(LockError::Timeout { .. }))
    }
}
