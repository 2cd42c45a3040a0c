use crate::catalog::bootstrap::{
    self, base_metadata, columns, grants, indexes, objects, on_delete_from_cell, role_grants, roles,
    tables,
};
use crate::catalog::schema::{ColumnDef, IndexDef, ObjectKind, OnDelete};
use crate::catalog::types::{ColumnId, ColumnType, ObjectId, RoleId, Row, TableId};
use crate::catalog::{CatalogIssue, CatalogIssueKind, HotMetadata};
use crate::config::RecoveryMode;
use crate::error::Result;
use crate::privilege::PrivilegeDescriptor;
use crate::storage::{ReadView, ScanRequest, StorageEngine};
use std::collections::BTreeMap;
use tracing::{info, warn};

fn int(row: &Row, column: ColumnId) -> Option<i64> {
    row.get(column).as_i64()
}

fn flag(row: &Row, column: ColumnId) -> bool {
    row.get(column).as_bool().unwrap_or(false)
}

fn rows_by_id(
    storage: &dyn StorageEngine,
    view: ReadView,
    table: TableId,
    id_column: ColumnId,
) -> Result<BTreeMap<ObjectId, Row>> {
    let mut out = BTreeMap::new();
    for scanned in storage.scan(view, &ScanRequest::new(table))? {
        if let Some(id) = int(&scanned.row, id_column) {
            out.insert(id, scanned.row);
        }
    }
    Ok(out)
}

fn decode_column(
    column_id: ColumnId,
    row: &Row,
    issues: &mut Vec<CatalogIssue>,
) -> Option<ColumnDef> {
    let table_id = int(row, columns::TABLE_ID)?;
    let type_code = int(row, columns::TYPE).unwrap_or_default();
    let col_type = ColumnType::from_code(type_code).unwrap_or_else(|| {
        issues.push(CatalogIssue::new(
            column_id,
            CatalogIssueKind::UnknownType,
            format!("type code {type_code} downgraded to TEXT"),
        ));
        ColumnType::Text
    });
    let position = int(row, columns::POSITION)
        .and_then(|p| u32::try_from(p).ok())
        .unwrap_or(u32::MAX);
    let mut def = ColumnDef::new(column_id, table_id, position, col_type);
    def.max_size = int(row, columns::MAX_SIZE).and_then(|m| u32::try_from(m).ok());
    def.foreign_reference = int(row, columns::REF_TABLE);
    def.foreign_reference_by_column = int(row, columns::REF_COLUMN);
    def.on_delete = on_delete_from_cell(row.get(columns::ON_DELETE)).unwrap_or_else(|| {
        issues.push(CatalogIssue::new(
            column_id,
            CatalogIssueKind::ReferenceShape,
            "unknown ON DELETE action, using restrict",
        ));
        OnDelete::Illegal
    });
    def.unique = flag(row, columns::UNIQUE);
    def.not_null = flag(row, columns::NOT_NULL);
    def.no_update = flag(row, columns::NO_UPDATE);
    def.autonumber_start = int(row, columns::AUTONUMBER_START).and_then(|s| i32::try_from(s).ok());
    def.default_value = row
        .get(columns::DEFAULT_VALUE)
        .as_bytes()
        .map(<[u8]>::to_vec)
        .unwrap_or_default();
    Some(def)
}

fn decode_index(index_id: ObjectId, row: &Row) -> std::result::Result<IndexDef, CatalogIssue> {
    let malformed = |what: String| CatalogIssue::new(index_id, CatalogIssueKind::MissingDefinition, what);
    let table_id = int(row, indexes::TABLE_ID).ok_or_else(|| malformed("index has no table".into()))?;
    let bytes = row
        .get(indexes::COLUMNS)
        .as_bytes()
        .ok_or_else(|| malformed("index has no column list".into()))?;
    let columns: Vec<ColumnId> =
        rmp_serde::from_slice(bytes).map_err(|e| malformed(format!("index column list: {e}")))?;
    Ok(IndexDef {
        index_id,
        table_id,
        columns,
        unique: flag(row, indexes::UNIQUE),
    })
}

struct StoredObject {
    object_id: ObjectId,
    name: String,
    parent: Option<ObjectId>,
    kind: ObjectKind,
    owner: RoleId,
}

/// Builds a snapshot from the catalog tables as seen through `view`.
///
/// Catalog issues are collected; outside recovery mode the first one fails
/// the read. `tolerant` only governs privilege graph validation.
pub fn read_from_storage(
    storage: &dyn StorageEngine,
    view: ReadView,
    tolerant: bool,
    recovery_mode: RecoveryMode,
    version_id: u32,
) -> Result<HotMetadata> {
    let mut meta = base_metadata(version_id)?;
    let mut issues = Vec::new();

    let mut stored = Vec::new();
    for (object_id, row) in rows_by_id(storage, view, objects::TABLE, objects::ID)? {
        let kind_code = int(&row, objects::KIND).unwrap_or_default();
        let Some(kind) = ObjectKind::from_code(kind_code) else {
            issues.push(CatalogIssue::new(
                object_id,
                CatalogIssueKind::UnknownType,
                format!("unknown object kind {kind_code}"),
            ));
            continue;
        };
        stored.push(StoredObject {
            object_id,
            name: row.get(objects::NAME).as_str().unwrap_or_default().to_string(),
            parent: int(&row, objects::PARENT),
            kind,
            owner: int(&row, objects::OWNER).unwrap_or(crate::privilege::ROOT_ROLE),
        });
    }
    // Parents always sort before their children.
    stored.sort_by_key(|o| (o.kind.code(), o.object_id));

    let table_rows = rows_by_id(storage, view, tables::TABLE, tables::ID)?;
    let column_rows = rows_by_id(storage, view, columns::TABLE, columns::ID)?;
    let index_rows = rows_by_id(storage, view, indexes::TABLE, indexes::ID)?;

    for object in &stored {
        let missing = |what: &str| {
            CatalogIssue::new(
                object.object_id,
                CatalogIssueKind::MissingDefinition,
                format!("{what} row is missing"),
            )
        };
        let inserted = match object.kind {
            ObjectKind::Schema => meta.insert_schema(object.object_id, &object.name, object.owner, false),
            ObjectKind::Table => {
                let access_checked = table_rows
                    .get(&object.object_id)
                    .map(|row| flag(row, tables::ACCESS_CHECKED));
                match (access_checked, object.parent) {
                    (Some(access_checked), Some(schema)) => meta.insert_table(
                        object.object_id,
                        schema,
                        &object.name,
                        object.owner,
                        access_checked,
                    ),
                    _ => Err(missing("table")),
                }
            }
            ObjectKind::Column => {
                match column_rows
                    .get(&object.object_id)
                    .and_then(|row| decode_column(object.object_id, row, &mut issues))
                {
                    Some(def) if Some(def.table_id) == object.parent => {
                        meta.insert_column(def, &object.name)
                    }
                    Some(_) => Err(CatalogIssue::new(
                        object.object_id,
                        CatalogIssueKind::MissingParent,
                        "column row names a different table",
                    )),
                    None => Err(missing("column")),
                }
            }
            ObjectKind::Index => match index_rows.get(&object.object_id) {
                Some(row) => {
                    decode_index(object.object_id, row).and_then(|def| meta.insert_index(def, &object.name))
                }
                None => Err(missing("index")),
            },
        };
        if let Err(issue) = inserted {
            issues.push(issue);
        }
    }

    for (table_id, row) in &table_rows {
        if let Some(primary_key) = int(row, tables::PRIMARY_KEY)
            && meta.table(*table_id).is_some()
            && let Err(issue) = meta.set_primary_key(*table_id, primary_key)
        {
            issues.push(issue);
        }
    }

    for scanned in storage.scan(view, &ScanRequest::new(roles::TABLE))? {
        let row = &scanned.row;
        let (Some(role_id), Some(name)) = (int(row, roles::ID), row.get(roles::NAME).as_str()) else {
            continue;
        };
        meta.privileges_mut()
            .add_role(role_id, name, int(row, roles::SCHEMA_ID));
    }
    for scanned in storage.scan(view, &ScanRequest::new(role_grants::TABLE))? {
        let row = &scanned.row;
        if let (Some(grantor), Some(grantee), Some(role)) = (
            int(row, role_grants::GRANTOR),
            int(row, role_grants::GRANTEE),
            int(row, role_grants::ROLE_ID),
        ) {
            meta.privileges_mut().add_role_grant(
                grantor,
                grantee,
                role,
                flag(row, role_grants::WITH_ADMIN),
            );
        }
    }
    for scanned in storage.scan(view, &ScanRequest::new(grants::TABLE))? {
        let row = &scanned.row;
        let (Some(grantor), Some(grantee), Some(object)) = (
            int(row, grants::GRANTOR),
            int(row, grants::GRANTEE),
            int(row, grants::OBJECT_ID),
        ) else {
            continue;
        };
        match int(row, grants::PRIVILEGES).and_then(PrivilegeDescriptor::from_bits) {
            Some(privileges) => meta
                .privileges_mut()
                .add_grant(grantor, grantee, object, privileges),
            None => issues.push(CatalogIssue::new(
                object,
                CatalogIssueKind::BadGrant,
                format!("grant by {grantor} to {grantee} has an unreadable privilege mask"),
            )),
        }
    }

    issues.extend(meta.validate_references());
    let report = meta.privileges_mut().validate_and_process(tolerant)?;
    meta.compute_hard_references();
    meta.compute_reference_drops();

    if let Some(first) = issues.first()
        && recovery_mode == RecoveryMode::Strict
    {
        return Err(first.clone().into());
    }
    for issue in &issues {
        warn!(object_id = issue.object_id, kind = ?issue.kind, detail = %issue.message, "catalog issue");
    }
    info!(
        version_id,
        objects = stored.len(),
        builtin = stored.iter().filter(|o| bootstrap::is_builtin_object(o.object_id)).count(),
        abandoned_grants = report.invalid_grants.len() + report.invalid_role_grants.len(),
        reference_drops = meta.reference_drops().len(),
        "metadata snapshot read"
    );
    meta.set_issues(issues);
    Ok(meta)
}
