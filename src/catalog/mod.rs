pub mod bootstrap;
pub mod reader;
pub mod schema;
pub mod types;

use crate::catalog::schema::{
    ColumnDef, IndexDef, ObjectDef, ObjectKind, OnDelete, SchemaDef, TableDef,
};
use crate::catalog::types::{
    ColumnId, ColumnType, IndexId, ObjectId, RoleId, SchemaId, TableId, UpperName,
};
use crate::error::{Result, TxnError};
use crate::privilege::{PrivilegeGraph, PrivilegeKind};
use im::OrdMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogIssueKind {
    DuplicateName,
    MissingParent,
    UnknownType,
    BadDefault,
    BadAutonumber,
    BadPrimaryKey,
    DanglingReference,
    ReferenceShape,
    MissingDefinition,
    BadGrant,
}

/// A catalog inconsistency found while reading metadata. Collected in
/// recovery mode, raised as `MetadataBad` otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogIssue {
    pub object_id: ObjectId,
    pub kind: CatalogIssueKind,
    pub message: String,
}

impl CatalogIssue {
    pub fn new(object_id: ObjectId, kind: CatalogIssueKind, message: impl Into<String>) -> Self {
        Self {
            object_id,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for CatalogIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object {}: {:?}: {}", self.object_id, self.kind, self.message)
    }
}

impl From<CatalogIssue> for TxnError {
    fn from(issue: CatalogIssue) -> Self {
        TxnError::MetadataBad(issue.to_string())
    }
}

/// One consistent, versioned view of the schema catalog and the privilege
/// graph. Readers share it behind an `Arc`; see [`crate::snapshot`].
#[derive(Debug, Clone, Default)]
pub struct HotMetadata {
    version_id: u32,
    objects: OrdMap<ObjectId, ObjectDef>,
    /// `(parent, name) -> id` for live objects; parent 0 is the root.
    children: OrdMap<(ObjectId, UpperName), ObjectId>,
    schemas: OrdMap<SchemaId, SchemaDef>,
    tables: OrdMap<TableId, TableDef>,
    columns: OrdMap<ColumnId, ColumnDef>,
    indexes: OrdMap<IndexId, IndexDef>,
    privileges: PrivilegeGraph,
    issues: Vec<CatalogIssue>,
    reference_drops: Vec<ColumnId>,
}

impl HotMetadata {
    pub fn new(version_id: u32) -> Self {
        Self {
            version_id,
            privileges: PrivilegeGraph::new(),
            ..Self::default()
        }
    }

    pub fn version_id(&self) -> u32 {
        self.version_id
    }

    pub fn set_version_id(&mut self, version_id: u32) {
        self.version_id = version_id;
    }

    fn insert_object(
        &mut self,
        object_id: ObjectId,
        name: &str,
        parent: Option<ObjectId>,
        kind: ObjectKind,
        owner: RoleId,
    ) -> Result<(), CatalogIssue> {
        if self.objects.contains_key(&object_id) {
            return Err(CatalogIssue::new(
                object_id,
                CatalogIssueKind::DuplicateName,
                "object id assigned twice",
            ));
        }
        let name = UpperName::new(name);
        let def = ObjectDef {
            object_id,
            name: name.clone(),
            parent,
            kind,
            owner,
        };
        if name.is_empty() {
            // Tombstones keep their id but are unreachable by name.
            self.objects.insert(object_id, def);
            return Ok(());
        }
        let expected_parent = match kind {
            ObjectKind::Schema => None,
            ObjectKind::Table => Some(ObjectKind::Schema),
            ObjectKind::Column | ObjectKind::Index => Some(ObjectKind::Table),
        };
        // Children of a tombstone are kept; they are simply never live.
        let parent_kind = parent.and_then(|p| self.objects.get(&p)).map(|o| o.kind);
        if parent_kind != expected_parent {
            return Err(CatalogIssue::new(
                object_id,
                CatalogIssueKind::MissingParent,
                format!("{kind:?} {name} has no {expected_parent:?} parent"),
            ));
        }
        let key = (parent.unwrap_or(0), name.clone());
        if self.children.contains_key(&key) {
            return Err(CatalogIssue::new(
                object_id,
                CatalogIssueKind::DuplicateName,
                format!("name {name} already used under {}", parent.unwrap_or(0)),
            ));
        }
        self.children.insert(key, object_id);
        self.objects.insert(object_id, def);
        self.privileges.register_object(object_id, parent);
        Ok(())
    }

    pub fn insert_schema(
        &mut self,
        schema_id: SchemaId,
        name: &str,
        owner: RoleId,
        system: bool,
    ) -> Result<(), CatalogIssue> {
        self.insert_object(schema_id, name, None, ObjectKind::Schema, owner)?;
        self.schemas.insert(schema_id, SchemaDef { schema_id, system });
        Ok(())
    }

    pub fn insert_table(
        &mut self,
        table_id: TableId,
        schema_id: SchemaId,
        name: &str,
        owner: RoleId,
        access_checked: bool,
    ) -> Result<(), CatalogIssue> {
        self.insert_object(table_id, name, Some(schema_id), ObjectKind::Table, owner)?;
        let mut table = TableDef::new(table_id, schema_id);
        table.access_checked = access_checked;
        self.tables.insert(table_id, table);
        Ok(())
    }

    /// Inserts a column; its table must already be present.
    pub fn insert_column(&mut self, column: ColumnDef, name: &str) -> Result<(), CatalogIssue> {
        let Some(owner) = self
            .tables
            .contains_key(&column.table_id)
            .then(|| self.owner_of(column.table_id))
            .flatten()
        else {
            return Err(CatalogIssue::new(
                column.column_id,
                CatalogIssueKind::MissingParent,
                format!("table {} does not exist", column.table_id),
            ));
        };
        self.insert_object(
            column.column_id,
            name,
            Some(column.table_id),
            ObjectKind::Column,
            owner,
        )?;
        let mut ordered: Vec<(u32, ColumnId)> = self
            .tables
            .get(&column.table_id)
            .map(|t| {
                t.columns
                    .iter()
                    .filter_map(|id| self.columns.get(id).map(|c| (c.position, *id)))
                    .collect()
            })
            .unwrap_or_default();
        ordered.push((column.position, column.column_id));
        ordered.sort();
        if let Some(table) = self.tables.get_mut(&column.table_id) {
            table.columns = ordered.into_iter().map(|(_, id)| id).collect();
        }
        self.columns.insert(column.column_id, column);
        Ok(())
    }

    pub fn insert_index(&mut self, index: IndexDef, name: &str) -> Result<(), CatalogIssue> {
        let Some(owner) = self
            .tables
            .contains_key(&index.table_id)
            .then(|| self.owner_of(index.table_id))
            .flatten()
        else {
            return Err(CatalogIssue::new(
                index.index_id,
                CatalogIssueKind::MissingParent,
                format!("table {} does not exist", index.table_id),
            ));
        };
        if let Some(missing) = index
            .columns
            .iter()
            .find(|c| self.columns.get(*c).is_none_or(|col| col.table_id != index.table_id))
        {
            return Err(CatalogIssue::new(
                index.index_id,
                CatalogIssueKind::MissingParent,
                format!("indexed column {missing} is not a column of the table"),
            ));
        }
        self.insert_object(index.index_id, name, Some(index.table_id), ObjectKind::Index, owner)?;
        if let Some(table) = self.tables.get_mut(&index.table_id) {
            table.indexes.push(index.index_id);
        }
        self.indexes.insert(index.index_id, index);
        Ok(())
    }

    pub fn set_primary_key(&mut self, table_id: TableId, column_id: ColumnId) -> Result<(), CatalogIssue> {
        let fits = self
            .columns
            .get(&column_id)
            .is_some_and(|c| c.table_id == table_id && c.no_update && c.not_null);
        let Some(table) = self.tables.get_mut(&table_id).filter(|_| fits) else {
            return Err(CatalogIssue::new(
                table_id,
                CatalogIssueKind::BadPrimaryKey,
                format!("column {column_id} cannot be the primary key"),
            ));
        };
        table.primary_key = Some(column_id);
        Ok(())
    }

    /// Marks an object deleted. The id stays resolvable; the name is freed.
    pub fn tombstone(&mut self, object_id: ObjectId) {
        if let Some(object) = self.objects.get_mut(&object_id) {
            let key = (object.parent.unwrap_or(0), object.name.clone());
            object.name = UpperName::tombstone();
            self.children.remove(&key);
        }
    }

    pub fn object(&self, object_id: ObjectId) -> Option<&ObjectDef> {
        self.objects.get(&object_id)
    }

    pub fn is_live(&self, object_id: ObjectId) -> bool {
        let mut current = Some(object_id);
        while let Some(id) = current {
            match self.objects.get(&id) {
                Some(object) if !object.is_tombstone() => current = object.parent,
                _ => return false,
            }
        }
        true
    }

    pub fn find_child(&self, parent: Option<ObjectId>, name: &str) -> Option<ObjectId> {
        self.children
            .get(&(parent.unwrap_or(0), UpperName::new(name)))
            .copied()
    }

    pub fn schema(&self, schema_id: SchemaId) -> Option<&SchemaDef> {
        self.schemas.get(&schema_id)
    }

    pub fn schema_by_name(&self, name: &str) -> Option<SchemaId> {
        self.find_child(None, name)
            .filter(|id| self.schemas.contains_key(id))
    }

    pub fn table(&self, table_id: TableId) -> Option<&TableDef> {
        self.tables.get(&table_id)
    }

    pub fn live_table(&self, table_id: TableId) -> Result<&TableDef> {
        match self.tables.get(&table_id) {
            Some(table) if self.is_live(table_id) => Ok(table),
            Some(_) => Err(TxnError::InvalidArg(format!("table {table_id} was dropped"))),
            None => Err(TxnError::InvalidArg(format!("table {table_id} does not exist"))),
        }
    }

    pub fn table_by_name(&self, schema: &str, table: &str) -> Option<TableId> {
        let schema_id = self.schema_by_name(schema)?;
        self.find_child(Some(schema_id), table)
            .filter(|id| self.tables.contains_key(id))
    }

    pub fn column(&self, column_id: ColumnId) -> Option<&ColumnDef> {
        self.columns.get(&column_id)
    }

    pub fn column_by_name(&self, table_id: TableId, name: &str) -> Option<&ColumnDef> {
        self.find_child(Some(table_id), name)
            .and_then(|id| self.columns.get(&id))
    }

    pub fn columns_of(&self, table_id: TableId) -> Vec<&ColumnDef> {
        self.tables
            .get(&table_id)
            .map(|t| {
                t.columns
                    .iter()
                    .filter(|id| self.is_live(**id))
                    .filter_map(|id| self.columns.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn index(&self, index_id: IndexId) -> Option<&IndexDef> {
        self.indexes.get(&index_id)
    }

    pub fn single_column_index(&self, table_id: TableId, column_id: ColumnId) -> Option<&IndexDef> {
        let table = self.tables.get(&table_id)?;
        table
            .indexes
            .iter()
            .filter(|id| self.is_live(**id))
            .filter_map(|id| self.indexes.get(id))
            .find(|index| index.single_column() == Some(column_id))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    pub fn live_tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values().filter(|t| self.is_live(t.table_id))
    }

    pub fn live_indexes(&self) -> impl Iterator<Item = &IndexDef> {
        self.indexes.values().filter(|i| self.is_live(i.index_id))
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.values()
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectDef> {
        self.objects.values()
    }

    pub fn privileges(&self) -> &PrivilegeGraph {
        &self.privileges
    }

    pub fn privileges_mut(&mut self) -> &mut PrivilegeGraph {
        &mut self.privileges
    }

    pub fn issues(&self) -> &[CatalogIssue] {
        &self.issues
    }

    /// Columns whose reference privilege vanished; their references must be
    /// dropped.
    pub fn reference_drops(&self) -> &[ColumnId] {
        &self.reference_drops
    }

    pub fn owner_of(&self, object_id: ObjectId) -> Option<RoleId> {
        self.objects.get(&object_id).map(|o| o.owner)
    }

    pub fn qualified_name(&self, object_id: ObjectId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(object_id);
        while let Some(id) = current {
            match self.objects.get(&id) {
                Some(object) => {
                    parts.push(if object.is_tombstone() {
                        format!("<dropped {id}>")
                    } else {
                        object.name.to_string()
                    });
                    current = object.parent;
                }
                None => {
                    parts.push(format!("<{id}>"));
                    break;
                }
            }
        }
        parts.reverse();
        parts.join(".")
    }

    /// The key column a referencing column points at: the target table's
    /// primary key, or the explicitly referenced column.
    pub fn referenced_key_column(&self, column: &ColumnDef) -> Option<ColumnId> {
        if let Some(column_id) = column.foreign_reference_by_column {
            return Some(column_id);
        }
        column
            .foreign_reference
            .and_then(|table_id| self.tables.get(&table_id))
            .and_then(|t| t.primary_key)
    }

    pub fn referenced_table(&self, column: &ColumnDef) -> Option<TableId> {
        if let Some(table_id) = column.foreign_reference {
            return Some(table_id);
        }
        column
            .foreign_reference_by_column
            .and_then(|c| self.columns.get(&c))
            .map(|c| c.table_id)
    }

    /// Live columns whose reference resolves into `table_id`.
    pub fn referencing_columns(&self, table_id: TableId) -> Vec<&ColumnDef> {
        self.columns
            .values()
            .filter(|c| c.has_reference() && self.is_live(c.column_id))
            .filter(|c| self.referenced_table(c) == Some(table_id))
            .collect()
    }

    /// A soft reference cannot by itself make its target hard-referenced.
    pub fn is_soft_reference(&self, column: &ColumnDef) -> bool {
        match column.on_delete {
            OnDelete::Cascade => !self
                .tables
                .get(&column.table_id)
                .is_some_and(|t| t.is_hard_referenced),
            OnDelete::SetDefault => !column.set_default_has_side_effects(),
            OnDelete::Illegal => false,
        }
    }

    /// Drops dangling references and downgrades malformed columns, returning
    /// what was found.
    pub(crate) fn validate_references(&mut self) -> Vec<CatalogIssue> {
        let mut issues = Vec::new();
        let column_ids: Vec<ColumnId> = self.columns.keys().copied().collect();
        for column_id in column_ids {
            if !self.is_live(column_id) {
                continue;
            }
            let Some(column) = self.columns.get(&column_id).cloned() else {
                continue;
            };
            let mut fixed = column.clone();

            if column.is_autonumber() && column.col_type != ColumnType::Integer {
                issues.push(CatalogIssue::new(
                    column_id,
                    CatalogIssueKind::BadAutonumber,
                    format!("autonumber on {} column", column.col_type),
                ));
                fixed.autonumber_start = None;
            }

            match column.default_value() {
                Ok(value) => {
                    let too_long = column
                        .max_size
                        .is_some_and(|max| value.byte_len() > max as usize);
                    if !value.matches_type(column.col_type) || too_long {
                        issues.push(CatalogIssue::new(
                            column_id,
                            CatalogIssueKind::BadDefault,
                            format!("default does not fit {}", column.col_type),
                        ));
                        fixed.default_value.clear();
                    }
                }
                Err(e) => {
                    issues.push(CatalogIssue::new(
                        column_id,
                        CatalogIssueKind::BadDefault,
                        e.to_string(),
                    ));
                    fixed.default_value.clear();
                }
            }

            if column.foreign_reference.is_some() && column.foreign_reference_by_column.is_some() {
                issues.push(CatalogIssue::new(
                    column_id,
                    CatalogIssueKind::ReferenceShape,
                    "column has both a table and a column reference",
                ));
                fixed.foreign_reference = None;
                fixed.foreign_reference_by_column = None;
            } else if column.has_reference()
                && let Err(issue) = self.check_reference_target(&column)
            {
                issues.push(issue);
                fixed.foreign_reference = None;
                fixed.foreign_reference_by_column = None;
            }

            if fixed != column {
                self.columns.insert(column_id, fixed);
            }
        }
        issues
    }

    fn check_reference_target(&self, column: &ColumnDef) -> Result<(), CatalogIssue> {
        let dangling = |what: String| {
            CatalogIssue::new(column.column_id, CatalogIssueKind::DanglingReference, what)
        };
        let key_id = if let Some(target) = column.foreign_reference {
            let table = self
                .tables
                .get(&target)
                .filter(|_| self.is_live(target))
                .ok_or_else(|| dangling(format!("referenced table {target} does not exist")))?;
            table
                .primary_key
                .ok_or_else(|| dangling(format!("referenced table {target} has no primary key")))?
        } else {
            let target = column.foreign_reference_by_column.unwrap_or_default();
            if !self.is_live(target) {
                return Err(dangling(format!("referenced column {target} does not exist")));
            }
            target
        };
        let key = self
            .columns
            .get(&key_id)
            .ok_or_else(|| dangling(format!("key column {key_id} does not exist")))?;
        let shape = |what: String| {
            CatalogIssue::new(column.column_id, CatalogIssueKind::ReferenceShape, what)
        };
        if !key.no_update {
            return Err(shape(format!("key column {key_id} is not NOUPDATE")));
        }
        if column.foreign_reference_by_column.is_some() && !key.unique {
            return Err(shape(format!("key column {key_id} is not UNIQUE")));
        }
        if key.col_type != column.col_type || key.max_size != column.max_size {
            return Err(shape(format!(
                "type {} does not match key column {key_id} of type {}",
                column.col_type, key.col_type
            )));
        }
        Ok(())
    }

    /// Seeds every target of a non-soft reference as hard-referenced, then
    /// propagates until no table gains the flag.
    pub(crate) fn compute_hard_references(&mut self) {
        let table_ids: Vec<TableId> = self.tables.keys().copied().collect();
        for table_id in table_ids {
            if let Some(table) = self.tables.get_mut(&table_id) {
                table.is_hard_referenced = false;
            }
        }
        loop {
            let mut gained = Vec::new();
            for column in self.columns.values() {
                if !column.has_reference() || !self.is_live(column.column_id) {
                    continue;
                }
                let Some(target) = self.referenced_table(column) else {
                    continue;
                };
                let already = self
                    .tables
                    .get(&target)
                    .is_none_or(|t| t.is_hard_referenced);
                if !already && !self.is_soft_reference(column) {
                    gained.push(target);
                }
            }
            if gained.is_empty() {
                break;
            }
            for target in gained {
                if let Some(table) = self.tables.get_mut(&target) {
                    table.is_hard_referenced = true;
                }
            }
        }
    }

    /// Columns whose table owner no longer holds the privilege its reference
    /// needs: REFERENCES for a hard reference, SELECT for a soft one.
    pub(crate) fn compute_reference_drops(&mut self) {
        let mut drops = Vec::new();
        for column in self.columns.values() {
            if !column.has_reference() || !self.is_live(column.column_id) {
                continue;
            }
            let Some(key_column) = self.referenced_key_column(column) else {
                continue;
            };
            let owner = self
                .objects
                .get(&column.table_id)
                .map(|o| o.owner)
                .unwrap_or(crate::privilege::ROOT_ROLE);
            let needed = if self.is_soft_reference(column) {
                PrivilegeKind::ColumnSelect
            } else {
                PrivilegeKind::ColumnReferences
            };
            if !self
                .privileges
                .get_privileges_for_object(owner, key_column)
                .has(needed)
            {
                drops.push(column.column_id);
            }
        }
        self.reference_drops = drops;
    }

    pub(crate) fn set_issues(&mut self, issues: Vec<CatalogIssue>) {
        self.issues = issues;
    }
}
