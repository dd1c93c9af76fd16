use crate::error::{DbError, IndexError};
use crate::Result;
use nonempty::NonEmpty;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;

macro_rules! id_type {
    ($name:ident, $prim:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub $prim);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$prim> for $name {
            fn from(v: $prim) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(TableId, u32);
id_type!(ColId, u32);
id_type!(IndexId, u32);
id_type!(SessionId, u64);

impl ColId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColType {
    Bool,
    Int,
    Long,
    Double,
    Text,
    Bytes,
}

impl ColType {
    pub fn is_integral(self) -> bool {
        matches!(self, ColType::Int | ColType::Long)
    }
}

#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub col_pos: ColId,
    pub col_name: String,
    pub col_type: ColType,
    pub nullable: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table_id: TableId,
    pub table_name: String,
    pub columns: Vec<ColumnSchema>,
    pub hidden: bool,
    pub temporary: bool,
    pub session_local: bool,
}

impl TableSchema {
    pub fn new(table_id: TableId, table_name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            table_id,
            table_name: table_name.into(),
            columns,
            hidden: false,
            temporary: false,
            session_local: false,
        }
    }

    pub fn column(&self, col: ColId) -> Result<&ColumnSchema> {
        self.columns
            .get(col.idx())
            .ok_or_else(|| DbError::Internal(format!("table `{}` has no column {col}", self.table_name)))
    }
}

/// The index type requested by DDL. The physical variant is chosen by the
/// table's selection policy (see `Table::add_index`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexRequest {
    PrimaryKey,
    Hash,
    Standard,
}

/// The physical index variant actually built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    Primary,
    Delegate,
    Hash,
    Secondary,
}

/// What DDL hands to `Table::add_index`.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub index_id: IndexId,
    pub index_name: String,
    pub request: IndexRequest,
    pub cols: NonEmpty<ColId>,
    /// Bit `i` set means the `i`-th indexed column sorts descending.
    pub desc_mask: u32,
    pub is_unique: bool,
}

#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub index_id: IndexId,
    pub table_id: TableId,
    pub index_name: String,
    pub index_type: IndexType,
    pub cols: NonEmpty<ColId>,
    pub desc_mask: u32,
    pub is_unique: bool,
}

impl IndexSchema {
    pub(crate) fn from_def(table_id: TableId, def: &IndexDef, index_type: IndexType) -> Self {
        Self {
            index_id: def.index_id,
            table_id,
            index_name: def.index_name.clone(),
            index_type,
            cols: def.cols.clone(),
            desc_mask: def.desc_mask,
            is_unique: def.is_unique,
        }
    }
}

/// A referential constraint edge: rows of `table_id` reference rows of
/// `referenced_table_id`.
#[derive(Debug, Clone)]
pub struct ConstraintSchema {
    pub constraint_name: String,
    pub table_id: TableId,
    pub referenced_table_id: TableId,
}

/// Read-only window onto the schema layer, plus index-name lifecycle.
///
/// The table core never creates or resolves schema objects on its own; DDL
/// owns the catalog and the core only reserves/releases index names and
/// consults the constraint graph for truncate/drop gating.
pub trait Catalog: Send + Sync {
    /// Reserves a unique schema name for a new object.
    fn add_schema_object(&self, name: &str) -> Result<()>;

    /// Removes a previously added schema object.
    fn remove_schema_object(&self, name: &str) -> Result<()>;

    /// Releases a name reserved by [`Catalog::add_schema_object`] without
    /// requiring the object to exist.
    fn free_unique_name(&self, name: &str);

    /// Every referential constraint whose *referenced* side is `table_id`.
    fn constraints_referencing(&self, table_id: TableId) -> Vec<ConstraintSchema>;
}

/// Map-backed catalog used by tests and stand-alone embedding.
#[derive(Default)]
pub struct MemoryCatalog {
    names: Mutex<HashSet<String>>,
    constraints: Mutex<Vec<ConstraintSchema>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_constraint(&self, constraint: ConstraintSchema) {
        self.constraints.lock().push(constraint);
    }
}

impl Catalog for MemoryCatalog {
    fn add_schema_object(&self, name: &str) -> Result<()> {
        if !self.names.lock().insert(name.to_owned()) {
            return Err(DbError::Internal(format!("schema object `{name}` already exists")));
        }
        Ok(())
    }

    fn remove_schema_object(&self, name: &str) -> Result<()> {
        if !self.names.lock().remove(name) {
            return Err(IndexError::NotFound(name.to_owned()).into());
        }
        Ok(())
    }

    fn free_unique_name(&self, name: &str) {
        self.names.lock().remove(name);
    }

    fn constraints_referencing(&self, table_id: TableId) -> Vec<ConstraintSchema> {
        self.constraints
            .lock()
            .iter()
            .filter(|c| c.referenced_table_id == table_id && c.table_id != table_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_rejects_duplicate_names() {
        let catalog = MemoryCatalog::new();
        catalog.add_schema_object("idx_a").unwrap();
        assert!(catalog.add_schema_object("idx_a").is_err());
        catalog.free_unique_name("idx_a");
        catalog.add_schema_object("idx_a").unwrap();
    }

    #[test]
    fn constraint_graph_ignores_self_references() {
        let catalog = MemoryCatalog::new();
        catalog.add_constraint(ConstraintSchema {
            constraint_name: "fk_self".into(),
            table_id: TableId(1),
            referenced_table_id: TableId(1),
        });
        catalog.add_constraint(ConstraintSchema {
            constraint_name: "fk_other".into(),
            table_id: TableId(2),
            referenced_table_id: TableId(1),
        });
        let refs = catalog.constraints_referencing(TableId(1));
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].constraint_name, "fk_other");
    }
}
