//! Built-in system schema, catalog tables and roles, plus the row layout of
//! each catalog table.
//!
//! Built-in objects are never stored as rows; every snapshot starts from
//! [`base_metadata`] and layers stored rows on top.

use crate::catalog::schema::{ColumnDef, IndexDef, ObjectKind, OnDelete};
use crate::catalog::types::ColumnType::{Blob, Boolean, Integer, Text};
use crate::catalog::types::{ColumnId, ColumnType, IndexId, ObjectId, RoleId, Row, SchemaId, TableId, Value};
use crate::catalog::HotMetadata;
use crate::error::{Result, TxnError};
use crate::privilege::{Grantability, PrivilegeDescriptor, PrivilegeKind, PUBLIC_ROLE, ROOT_ROLE};

pub const SYSTEM_SCHEMA: SchemaId = 10;
pub const PUBLIC_SCHEMA: SchemaId = 11;

pub const FIRST_USER_OBJECT_ID: i32 = 1000;
pub const FIRST_USER_ROLE_ID: i32 = 100;

pub mod objects {
    pub const TABLE: i64 = 20;
    pub const ID: i64 = 21;
    pub const NAME: i64 = 22;
    pub const PARENT: i64 = 23;
    pub const KIND: i64 = 24;
    pub const OWNER: i64 = 25;
    pub const ID_INDEX: i64 = 29;
}

pub mod tables {
    pub const TABLE: i64 = 30;
    pub const ID: i64 = 31;
    pub const PRIMARY_KEY: i64 = 32;
    pub const ACCESS_CHECKED: i64 = 33;
}

pub mod columns {
    pub const TABLE: i64 = 40;
    pub const ID: i64 = 41;
    pub const TABLE_ID: i64 = 42;
    pub const POSITION: i64 = 43;
    pub const TYPE: i64 = 44;
    pub const MAX_SIZE: i64 = 45;
    pub const REF_TABLE: i64 = 46;
    pub const REF_COLUMN: i64 = 47;
    pub const ON_DELETE: i64 = 48;
    pub const UNIQUE: i64 = 49;
    pub const NOT_NULL: i64 = 50;
    pub const NO_UPDATE: i64 = 51;
    pub const AUTONUMBER_START: i64 = 52;
    pub const DEFAULT_VALUE: i64 = 53;
}

pub mod indexes {
    pub const TABLE: i64 = 60;
    pub const ID: i64 = 61;
    pub const TABLE_ID: i64 = 62;
    pub const COLUMNS: i64 = 63;
    pub const UNIQUE: i64 = 64;
}

pub mod roles {
    pub const TABLE: i64 = 70;
    pub const ID: i64 = 71;
    pub const NAME: i64 = 72;
    pub const SCHEMA_ID: i64 = 73;
    pub const ID_INDEX: i64 = 79;
}

pub mod role_grants {
    pub const TABLE: i64 = 80;
    pub const GRANTOR: i64 = 81;
    pub const GRANTEE: i64 = 82;
    pub const ROLE_ID: i64 = 83;
    pub const WITH_ADMIN: i64 = 84;
}

pub mod grants {
    pub const TABLE: i64 = 90;
    pub const GRANTOR: i64 = 91;
    pub const GRANTEE: i64 = 92;
    pub const OBJECT_ID: i64 = 93;
    pub const PRIVILEGES: i64 = 94;
}

struct SystemColumn {
    id: ColumnId,
    name: &'static str,
    col_type: ColumnType,
    key: bool,
}

const fn col(id: ColumnId, name: &'static str, col_type: ColumnType) -> SystemColumn {
    SystemColumn {
        id,
        name,
        col_type,
        key: false,
    }
}

const fn key(id: ColumnId, name: &'static str) -> SystemColumn {
    SystemColumn {
        id,
        name,
        col_type: ColumnType::Integer,
        key: true,
    }
}

struct SystemTable {
    id: TableId,
    name: &'static str,
    columns: &'static [SystemColumn],
    autonumber_start: Option<i32>,
    index: Option<(IndexId, &'static str)>,
}

const SYSTEM_TABLES: &[SystemTable] = &[
    SystemTable {
        id: objects::TABLE,
        name: "OBJECTS",
        columns: &[
            key(objects::ID, "ID"),
            col(objects::NAME, "NAME", Text),
            col(objects::PARENT, "PARENT", Integer),
            col(objects::KIND, "KIND", Integer),
            col(objects::OWNER, "OWNER", Integer),
        ],
        autonumber_start: Some(FIRST_USER_OBJECT_ID),
        index: Some((objects::ID_INDEX, "OBJECTS_ID")),
    },
    SystemTable {
        id: tables::TABLE,
        name: "TABLES",
        columns: &[
            key(tables::ID, "ID"),
            col(tables::PRIMARY_KEY, "PRIMARY_KEY", Integer),
            col(tables::ACCESS_CHECKED, "ACCESS_CHECKED", Boolean),
        ],
        autonumber_start: None,
        index: None,
    },
    SystemTable {
        id: columns::TABLE,
        name: "COLUMNS",
        columns: &[
            key(columns::ID, "ID"),
            col(columns::TABLE_ID, "TABLE_ID", Integer),
            col(columns::POSITION, "POSITION", Integer),
            col(columns::TYPE, "TYPE", Integer),
            col(columns::MAX_SIZE, "MAX_SIZE", Integer),
            col(columns::REF_TABLE, "REF_TABLE", Integer),
            col(columns::REF_COLUMN, "REF_COLUMN", Integer),
            col(columns::ON_DELETE, "ON_DELETE", Integer),
            col(columns::UNIQUE, "IS_UNIQUE", Boolean),
            col(columns::NOT_NULL, "NOT_NULL", Boolean),
            col(columns::NO_UPDATE, "NO_UPDATE", Boolean),
            col(columns::AUTONUMBER_START, "AUTONUMBER_START", Integer),
            col(columns::DEFAULT_VALUE, "DEFAULT_VALUE", Blob),
        ],
        autonumber_start: None,
        index: None,
    },
    SystemTable {
        id: indexes::TABLE,
        name: "INDEXES",
        columns: &[
            key(indexes::ID, "ID"),
            col(indexes::TABLE_ID, "TABLE_ID", Integer),
            col(indexes::COLUMNS, "COLUMNS", Blob),
            col(indexes::UNIQUE, "IS_UNIQUE", Boolean),
        ],
        autonumber_start: None,
        index: None,
    },
    SystemTable {
        id: roles::TABLE,
        name: "ROLES",
        columns: &[
            key(roles::ID, "ID"),
            col(roles::NAME, "NAME", Text),
            col(roles::SCHEMA_ID, "SCHEMA_ID", Integer),
        ],
        autonumber_start: Some(FIRST_USER_ROLE_ID),
        index: Some((roles::ID_INDEX, "ROLES_ID")),
    },
    SystemTable {
        id: role_grants::TABLE,
        name: "ROLE_GRANTS",
        columns: &[
            col(role_grants::GRANTOR, "GRANTOR", Integer),
            col(role_grants::GRANTEE, "GRANTEE", Integer),
            col(role_grants::ROLE_ID, "ROLE_ID", Integer),
            col(role_grants::WITH_ADMIN, "WITH_ADMIN", Boolean),
        ],
        autonumber_start: None,
        index: None,
    },
    SystemTable {
        id: grants::TABLE,
        name: "GRANTS",
        columns: &[
            col(grants::GRANTOR, "GRANTOR", Integer),
            col(grants::GRANTEE, "GRANTEE", Integer),
            col(grants::OBJECT_ID, "OBJECT_ID", Integer),
            col(grants::PRIVILEGES, "PRIVILEGES", Integer),
        ],
        autonumber_start: None,
        index: None,
    },
];

fn bootstrap_error(issue: crate::catalog::CatalogIssue) -> TxnError {
    TxnError::Internal(format!("bootstrap catalog is inconsistent: {issue}"))
}

/// A snapshot holding only built-in objects, unvalidated.
pub fn base_metadata(version_id: u32) -> Result<HotMetadata> {
    let mut meta = HotMetadata::new(version_id);
    meta.insert_schema(SYSTEM_SCHEMA, "SYSTEM", ROOT_ROLE, true)
        .map_err(bootstrap_error)?;
    meta.insert_schema(PUBLIC_SCHEMA, "PUBLIC", ROOT_ROLE, false)
        .map_err(bootstrap_error)?;
    for table in SYSTEM_TABLES {
        meta.insert_table(table.id, SYSTEM_SCHEMA, table.name, ROOT_ROLE, true)
            .map_err(bootstrap_error)?;
        for (position, column) in table.columns.iter().enumerate() {
            let mut def = ColumnDef::new(column.id, table.id, position as u32, column.col_type);
            if column.key {
                def.not_null = true;
                def.no_update = true;
                def.unique = true;
                def.autonumber_start = table.autonumber_start;
            }
            meta.insert_column(def, column.name)
                .map_err(bootstrap_error)?;
            if column.key {
                meta.set_primary_key(table.id, column.id)
                    .map_err(bootstrap_error)?;
            }
        }
        if let Some((index_id, name)) = table.index
            && let Some(first) = table.columns.first()
        {
            meta.insert_index(
                IndexDef {
                    index_id,
                    table_id: table.id,
                    columns: vec![first.id],
                    unique: true,
                },
                name,
            )
            .map_err(bootstrap_error)?;
        }
    }
    let graph = meta.privileges_mut();
    graph.add_grant(
        ROOT_ROLE,
        PUBLIC_ROLE,
        SYSTEM_SCHEMA,
        PrivilegeDescriptor::of(&[PrivilegeKind::ColumnSelect], Grantability::Granted),
    );
    graph.add_grant(
        ROOT_ROLE,
        PUBLIC_ROLE,
        PUBLIC_SCHEMA,
        PrivilegeDescriptor::of(&[PrivilegeKind::ColumnSelect], Grantability::Granted),
    );
    Ok(meta)
}

/// Storage indexes every database needs before the first write.
pub fn system_indexes() -> impl Iterator<Item = (IndexId, TableId, ColumnId)> {
    SYSTEM_TABLES.iter().filter_map(|table| {
        let (index_id, _) = table.index?;
        let first = table.columns.first()?;
        Some((index_id, table.id, first.id))
    })
}

pub fn is_builtin_object(object_id: ObjectId) -> bool {
    object_id < FIRST_USER_OBJECT_ID as ObjectId
}

fn opt_int(value: Option<i64>) -> Value {
    value.map(Value::Integer).unwrap_or(Value::Null)
}

pub fn object_row(
    object_id: Option<ObjectId>,
    name: &str,
    parent: Option<ObjectId>,
    kind: ObjectKind,
    owner: RoleId,
) -> Row {
    Row::new()
        .with(objects::ID, opt_int(object_id))
        .with(objects::NAME, Value::text(name))
        .with(objects::PARENT, opt_int(parent))
        .with(objects::KIND, Value::Integer(kind.code()))
        .with(objects::OWNER, Value::Integer(owner))
}

pub fn table_row(table_id: TableId, primary_key: Option<ColumnId>, access_checked: bool) -> Row {
    Row::new()
        .with(tables::ID, Value::Integer(table_id))
        .with(tables::PRIMARY_KEY, opt_int(primary_key))
        .with(tables::ACCESS_CHECKED, Value::Boolean(access_checked))
}

pub fn column_row(column: &ColumnDef) -> Row {
    let default = if column.default_value.is_empty() {
        Value::Null
    } else {
        Value::Blob(column.default_value.clone())
    };
    Row::new()
        .with(columns::ID, Value::Integer(column.column_id))
        .with(columns::TABLE_ID, Value::Integer(column.table_id))
        .with(columns::POSITION, Value::Integer(i64::from(column.position)))
        .with(columns::TYPE, Value::Integer(column.col_type.code()))
        .with(columns::MAX_SIZE, opt_int(column.max_size.map(i64::from)))
        .with(columns::REF_TABLE, opt_int(column.foreign_reference))
        .with(columns::REF_COLUMN, opt_int(column.foreign_reference_by_column))
        .with(columns::ON_DELETE, Value::Integer(column.on_delete.code()))
        .with(columns::UNIQUE, Value::Boolean(column.unique))
        .with(columns::NOT_NULL, Value::Boolean(column.not_null))
        .with(columns::NO_UPDATE, Value::Boolean(column.no_update))
        .with(columns::AUTONUMBER_START, opt_int(column.autonumber_start.map(i64::from)))
        .with(columns::DEFAULT_VALUE, default)
}

pub fn index_row(index: &IndexDef) -> Result<Row> {
    let encoded = rmp_serde::to_vec(&index.columns)
        .map_err(|e| TxnError::Internal(format!("encode index columns: {e}")))?;
    Ok(Row::new()
        .with(indexes::ID, Value::Integer(index.index_id))
        .with(indexes::TABLE_ID, Value::Integer(index.table_id))
        .with(indexes::COLUMNS, Value::Blob(encoded))
        .with(indexes::UNIQUE, Value::Boolean(index.unique)))
}

pub fn role_row(role_id: Option<RoleId>, name: &str, schema: Option<SchemaId>) -> Row {
    Row::new()
        .with(roles::ID, opt_int(role_id))
        .with(roles::NAME, Value::text(name))
        .with(roles::SCHEMA_ID, opt_int(schema))
}

pub fn role_grant_row(grantor: RoleId, grantee: RoleId, role: RoleId, with_admin: bool) -> Row {
    Row::new()
        .with(role_grants::GRANTOR, Value::Integer(grantor))
        .with(role_grants::GRANTEE, Value::Integer(grantee))
        .with(role_grants::ROLE_ID, Value::Integer(role))
        .with(role_grants::WITH_ADMIN, Value::Boolean(with_admin))
}

pub fn grant_row(grantor: RoleId, grantee: RoleId, object: ObjectId, privileges: &PrivilegeDescriptor) -> Row {
    Row::new()
        .with(grants::GRANTOR, Value::Integer(grantor))
        .with(grants::GRANTEE, Value::Integer(grantee))
        .with(grants::OBJECT_ID, Value::Integer(object))
        .with(grants::PRIVILEGES, Value::Integer(privileges.to_bits()))
}

pub(crate) fn on_delete_from_cell(value: &Value) -> Option<OnDelete> {
    match value {
        Value::Null => Some(OnDelete::Illegal),
        other => other.as_i64().and_then(OnDelete::from_code),
    }
}

#[cfg(test)]
mod tests {
    use super::{base_metadata, columns, objects, roles, system_indexes, SYSTEM_SCHEMA};
    use crate::privilege::{PrivilegeKind, PUBLIC_ROLE};

    #[test]
    fn base_metadata_validates_cleanly() {
        let mut meta = base_metadata(1).expect("bootstrap");
        let report = meta
            .privileges_mut()
            .validate_and_process(false)
            .expect("valid");
        assert!(report.is_clean());
        assert_eq!(meta.table_by_name("system", "objects"), Some(objects::TABLE));
        let id = meta.column(objects::ID).expect("id column");
        assert_eq!(id.autonumber_start, Some(1000));
        assert_eq!(meta.column(roles::ID).and_then(|c| c.autonumber_start), Some(100));
        assert!(meta.table(columns::TABLE).expect("columns").access_checked);
        assert!(
            meta.privileges()
                .get_privileges_for_object(PUBLIC_ROLE, columns::DEFAULT_VALUE)
                .has(PrivilegeKind::ColumnSelect)
        );
        assert!(meta.schema(SYSTEM_SCHEMA).expect("schema").system);
    }

    #[test]
    fn autonumber_tables_carry_an_index() {
        let meta = base_metadata(1).expect("bootstrap");
        let found: Vec<_> = system_indexes().collect();
        assert_eq!(found.len(), 2);
        for (index_id, table, column) in found {
            assert_eq!(
                meta.single_column_index(table, column).map(|i| i.index_id),
                Some(index_id)
            );
        }
    }
}
