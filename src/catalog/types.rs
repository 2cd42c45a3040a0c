use crate::error::{Result, TxnError};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a schema, table, column or index. Globally unique and never
/// reassigned.
pub type ObjectId = i64;
pub type SchemaId = ObjectId;
pub type TableId = ObjectId;
pub type ColumnId = ObjectId;
pub type IndexId = ObjectId;
pub type RoleId = i64;
pub type TxnId = u64;
pub type CommandId = u32;

/// Physical identifier of one version of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl RecordId {
    pub const INVALID: RecordId = RecordId(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Case-insensitive identifier, stored uppercased. An empty name marks a
/// tombstoned object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct UpperName(CompactString);

impl UpperName {
    pub fn new(name: &str) -> Self {
        Self(CompactString::from(name.trim().to_uppercase()))
    }

    pub fn tombstone() -> Self {
        Self(CompactString::default())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for UpperName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl From<&str> for UpperName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Text,
    Blob,
    Boolean,
}

impl ColumnType {
    pub fn code(self) -> i64 {
        match self {
            ColumnType::Integer => 1,
            ColumnType::Text => 2,
            ColumnType::Blob => 3,
            ColumnType::Boolean => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ColumnType::Integer),
            2 => Some(ColumnType::Text),
            3 => Some(ColumnType::Blob),
            4 => Some(ColumnType::Boolean),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
            ColumnType::Boolean => "BOOLEAN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Text(CompactString),
    Blob(Vec<u8>),
    /// Blob written in the pre-upgrade short-length encoding. Compares equal
    /// to a `Blob` with the same bytes; the next version of the row rewrites
    /// it as a `Blob`.
    LegacyBlob(Vec<u8>),
}

static NULL_VALUE: Value = Value::Null;

impl Value {
    pub fn text(value: &str) -> Self {
        Value::Text(CompactString::from(value))
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) => 2,
            Value::Text(_) => 3,
            Value::Blob(_) | Value::LegacyBlob(_) => 4,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Values a NOUPDATE column may still be filled from once.
    pub fn is_null_like(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.is_empty(),
            Value::Blob(b) | Value::LegacyBlob(b) => b.is_empty(),
            _ => false,
        }
    }

    pub fn needs_blob_upgrade(&self) -> bool {
        matches!(self, Value::LegacyBlob(_))
    }

    /// The value in its current storage encoding.
    pub fn upgraded(self) -> Value {
        match self {
            Value::LegacyBlob(bytes) => Value::Blob(bytes),
            other => other,
        }
    }

    pub fn byte_len(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) => 8,
            Value::Text(s) => s.len(),
            Value::Blob(b) | Value::LegacyBlob(b) => b.len(),
        }
    }

    pub fn matches_type(&self, col_type: ColumnType) -> bool {
        matches!(
            (self, col_type),
            (Value::Null, _)
                | (Value::Boolean(_), ColumnType::Boolean)
                | (Value::Integer(_), ColumnType::Integer)
                | (Value::Text(_), ColumnType::Text)
                | (Value::Blob(_) | Value::LegacyBlob(_), ColumnType::Blob)
        )
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) | Value::LegacyBlob(b) => Some(b.as_slice()),
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
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (
                Value::Blob(a) | Value::LegacyBlob(a),
                Value::Blob(b) | Value::LegacyBlob(b),
            ) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| TxnError::Internal(format!("encode value: {e}")))
}

pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    rmp_serde::from_slice(bytes).map_err(|e| TxnError::MetadataBad(format!("decode value: {e}")))
}

/// One physical row version, keyed by column id. Absent cells read as NULL.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Row {
    cells: BTreeMap<ColumnId, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cells(cells: impl IntoIterator<Item = (ColumnId, Value)>) -> Self {
        let mut row = Self::new();
        for (column, value) in cells {
            row.set(column, value);
        }
        row
    }

    pub fn get(&self, column: ColumnId) -> &Value {
        self.cells.get(&column).unwrap_or(&NULL_VALUE)
    }

    pub fn set(&mut self, column: ColumnId, value: Value) {
        if value.is_null() {
            self.cells.remove(&column);
        } else {
            self.cells.insert(column, value);
        }
    }

    pub fn with(mut self, column: ColumnId, value: Value) -> Self {
        self.set(column, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (ColumnId, &Value)> {
        self.cells.iter().map(|(c, v)| (*c, v))
    }
}
