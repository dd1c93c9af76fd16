use crate::error::DbError;
use crate::schema::ColId;
use crate::Result;
use nonempty::NonEmpty;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single column value.
///
/// The total order compares the type tag first and the payload second, so
/// values of mixed types still sort deterministically. Columns are typed, so
/// in practice a map only ever compares values of one variant (plus `Null`).
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Long(_) => 3,
            Value::Double(_) => 4,
            Value::Text(_) => 5,
            Value::Bytes(_) => 6,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Widening read of the integral variants.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Long(a), Long(b)) => a.cmp(b),
            // Compare the integral variants against each other widened, so a
            // promoted main-index column can mix `Int` keys with `Long` ones.
            (Int(a), Long(b)) => i64::from(*a).cmp(b),
            (Long(a), Int(b)) => a.cmp(&i64::from(*b)),
            (Double(a), Double(b)) => a.total_cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Bool(v) => v.hash(state),
            Value::Int(v) => i64::from(*v).hash(state),
            Value::Long(v) => v.hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::Text(v) => v.hash(state),
            Value::Bytes(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "'{v}'"),
            Value::Bytes(v) => write!(f, "({} bytes)", v.len()),
        }
    }
}

/// Internal row identifier, assigned by the primary index and stable for the
/// row's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RowId(pub i64);

impl RowId {
    /// Sentinel for "not yet assigned".
    pub const UNSET: RowId = RowId(0);
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tuple of values aligned with the table's columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub id: RowId,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            id: RowId::UNSET,
            values,
        }
    }

    pub fn with_id(id: RowId, values: Vec<Value>) -> Self {
        Self { id, values }
    }

    pub fn value(&self, col: ColId) -> Result<&Value> {
        self.values
            .get(col.idx())
            .ok_or_else(|| DbError::Internal(format!("row has no column at position {col}")))
    }

    /// Projects the values of `cols`, in order.
    pub fn project(&self, cols: &NonEmpty<ColId>) -> Result<Vec<Value>> {
        cols.iter().map(|&col| self.value(col).cloned()).collect()
    }
}

/// A composite search key over one or more column values.
///
/// The per-column descending directions and the engine's NULL policy are
/// baked into the key, so the natural `Ord` of keys *is* the index order and
/// a plain ordered map stores them correctly. All keys within one map share
/// the same `desc_mask`/`nulls_last` configuration.
#[derive(Debug, Clone)]
pub struct SearchKey {
    values: Vec<Value>,
    desc_mask: u32,
    nulls_last: bool,
}

impl PartialEq for SearchKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SearchKey {}

impl SearchKey {
    pub fn new(values: Vec<Value>, desc_mask: u32, nulls_last: bool) -> Self {
        Self {
            values,
            desc_mask,
            nulls_last,
        }
    }

    /// An ascending single-column key over a row id.
    pub fn row_id(id: RowId) -> Self {
        Self::new(vec![Value::Long(id.0)], 0, false)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Compares this key against a bound that may cover only a prefix of the
    /// key's columns. Equal means "within the bound's prefix"; range scans
    /// use it for inclusive upper bounds over partial keys.
    pub(crate) fn cmp_prefix(&self, bound: &SearchKey) -> Ordering {
        for (i, b) in bound.values.iter().enumerate() {
            let a = self.values.get(i).unwrap_or(&Value::Null);
            match bound.cmp_column(i, a, b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }

    fn cmp_column(&self, i: usize, a: &Value, b: &Value) -> Ordering {
        let base = match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => {
                if self.nulls_last {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, true) => {
                if self.nulls_last {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, false) => a.cmp(b),
        };
        if self.desc_mask & (1 << i) != 0 {
            base.reverse()
        } else {
            base
        }
    }
}

impl PartialOrd for SearchKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (i, (a, b)) in self.values.iter().zip(other.values.iter()).enumerate() {
            match self.cmp_column(i, a, b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        // A key that is a strict prefix of another sorts before it, so range
        // scans over a partial prefix see every extension of that prefix.
        self.values.len().cmp(&other.values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(values: Vec<Value>, desc_mask: u32) -> SearchKey {
        SearchKey::new(values, desc_mask, false)
    }

    #[test]
    fn value_order_is_total_across_types() {
        let mut vals = vec![
            Value::Text("a".into()),
            Value::Long(1),
            Value::Null,
            Value::Bool(true),
            Value::Double(0.5),
        ];
        vals.sort();
        assert_eq!(
            vals,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Long(1),
                Value::Double(0.5),
                Value::Text("a".into()),
            ]
        );
    }

    #[test]
    fn integral_variants_compare_widened() {
        assert_eq!(Value::Int(7), Value::Long(7));
        assert!(Value::Int(7) < Value::Long(8));
        assert!(Value::Long(9) > Value::Int(8));
    }

    #[test]
    fn descending_column_reverses_order() {
        let a = key(vec![Value::Long(1), Value::Long(10)], 0b10);
        let b = key(vec![Value::Long(1), Value::Long(20)], 0b10);
        // Second column is descending, so the larger value sorts first.
        assert!(b < a);
    }

    #[test]
    fn nulls_sort_low_by_default_and_high_when_configured() {
        let null_first = SearchKey::new(vec![Value::Null], 0, false);
        let one_first = SearchKey::new(vec![Value::Long(1)], 0, false);
        assert!(null_first < one_first);

        let null_last = SearchKey::new(vec![Value::Null], 0, true);
        let one_last = SearchKey::new(vec![Value::Long(1)], 0, true);
        assert!(null_last > one_last);
    }

    #[test]
    fn prefix_sorts_before_its_extensions() {
        let prefix = key(vec![Value::Long(5)], 0);
        let extended = key(vec![Value::Long(5), Value::Long(i64::MIN)], 0);
        assert!(prefix < extended);
    }

    #[test]
    fn project_follows_column_order() {
        let row = Row::new(vec![Value::Long(1), Value::Text("x".into()), Value::Bool(false)]);
        let cols = NonEmpty {
            head: ColId(2),
            tail: vec![ColId(0)],
        };
        let projected = row.project(&cols).unwrap();
        assert_eq!(projected, vec![Value::Bool(false), Value::Long(1)]);
    }
}
