//! Transactional table core of the tablerock storage engine.
//!
//! This crate mediates concurrent read/write access to a single on-disk
//! table: it coordinates the table's primary and secondary indexes, enforces
//! lock-based isolation with deadlock detection, routes row mutations through
//! all indexes under one transaction savepoint, and rebuilds indexes from
//! bulk data.
//!
//! The SQL layer, query planner and DDL executor live above this crate; the
//! key-value store and schema catalog below it are consumed through the
//! [`store::KeyValueStore`] and [`schema::Catalog`] traits. In-memory
//! reference implementations of both ship in-tree so the crate is testable
//! stand-alone.

pub mod context;
pub mod error;
pub mod index;
pub mod lock;
pub mod row;
pub mod schema;
pub mod session;
pub mod store;
pub mod table;
pub mod tx;

pub use context::{Context, EngineSettings, IsolationLevel};
pub use error::DbError;
pub use row::{Row, RowId, SearchKey, Value};
pub use session::Session;
pub use table::Table;

pub type Result<T> = std::result::Result<T, DbError>;
