use crate::catalog::types::{
    ColumnId, ColumnType, IndexId, ObjectId, RoleId, SchemaId, TableId, UpperName, Value,
    decode_value,
};
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Schema,
    Table,
    Column,
    Index,
}

impl ObjectKind {
    pub fn code(self) -> i64 {
        match self {
            ObjectKind::Schema => 1,
            ObjectKind::Table => 2,
            ObjectKind::Column => 3,
            ObjectKind::Index => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ObjectKind::Schema),
            2 => Some(ObjectKind::Table),
            3 => Some(ObjectKind::Column),
            4 => Some(ObjectKind::Index),
            _ => None,
        }
    }
}

/// A node of the object tree. Parent links are ids resolved against the
/// snapshot that owns the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDef {
    pub object_id: ObjectId,
    pub name: UpperName,
    pub parent: Option<ObjectId>,
    pub kind: ObjectKind,
    pub owner: RoleId,
}

impl ObjectDef {
    pub fn is_tombstone(&self) -> bool {
        self.name.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDef {
    pub schema_id: SchemaId,
    pub system: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OnDelete {
    /// Deleting a referenced key while references remain is a constraint
    /// violation.
    #[default]
    Illegal,
    SetDefault,
    Cascade,
}

impl OnDelete {
    pub fn code(self) -> i64 {
        match self {
            OnDelete::Illegal => 0,
            OnDelete::SetDefault => 1,
            OnDelete::Cascade => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(OnDelete::Illegal),
            1 => Some(OnDelete::SetDefault),
            2 => Some(OnDelete::Cascade),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub column_id: ColumnId,
    pub table_id: TableId,
    pub position: u32,
    pub col_type: ColumnType,
    pub max_size: Option<u32>,
    /// References the primary key of this table.
    pub foreign_reference: Option<TableId>,
    /// References this column (unique, NOUPDATE) of another table.
    pub foreign_reference_by_column: Option<ColumnId>,
    pub on_delete: OnDelete,
    pub unique: bool,
    pub not_null: bool,
    pub no_update: bool,
    pub autonumber_start: Option<i32>,
    /// MessagePack-encoded default; empty means NULL.
    pub default_value: Vec<u8>,
}

impl ColumnDef {
    pub fn new(column_id: ColumnId, table_id: TableId, position: u32, col_type: ColumnType) -> Self {
        Self {
            column_id,
            table_id,
            position,
            col_type,
            max_size: None,
            foreign_reference: None,
            foreign_reference_by_column: None,
            on_delete: OnDelete::Illegal,
            unique: false,
            not_null: false,
            no_update: false,
            autonumber_start: None,
            default_value: Vec::new(),
        }
    }

    pub fn default_value(&self) -> Result<Value> {
        decode_value(&self.default_value)
    }

    pub fn has_non_null_default(&self) -> bool {
        self.default_value()
            .map(|value| !value.is_null())
            .unwrap_or(false)
    }

    pub fn has_reference(&self) -> bool {
        self.foreign_reference.is_some() || self.foreign_reference_by_column.is_some()
    }

    pub fn is_autonumber(&self) -> bool {
        self.autonumber_start.is_some()
    }

    /// Whether a SetDefault reference from this column has effects beyond
    /// rewriting the referencing cell.
    pub fn set_default_has_side_effects(&self) -> bool {
        self.not_null || self.unique || self.no_update || self.has_non_null_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub index_id: IndexId,
    pub table_id: TableId,
    pub columns: Vec<ColumnId>,
    pub unique: bool,
}

impl IndexDef {
    pub fn single_column(&self) -> Option<ColumnId> {
        match self.columns.as_slice() {
            [column] => Some(*column),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub table_id: TableId,
    pub schema_id: SchemaId,
    /// Column ids in declaration order.
    pub columns: Vec<ColumnId>,
    pub primary_key: Option<ColumnId>,
    pub indexes: Vec<IndexId>,
    pub is_hard_referenced: bool,
    /// Direct writes go through the table's access handler.
    pub access_checked: bool,
}

impl TableDef {
    pub fn new(table_id: TableId, schema_id: SchemaId) -> Self {
        Self {
            table_id,
            schema_id,
            columns: Vec::new(),
            primary_key: None,
            indexes: Vec::new(),
            is_hard_referenced: false,
            access_checked: false,
        }
    }
}
