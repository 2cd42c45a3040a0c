//! Catalog changes made from inside a transaction.
//!
//! Every operation writes catalog rows as ordinary versions, closes its
//! command and re-reads the catalog through the transaction's own view, so
//! the pinned snapshot always reflects what the transaction has done. Grants
//! that lose their authorization along the way are reconciled before the
//! operation returns.

use super::chain::{WriteChecks, WrittenVersion};
use super::tx::{Transaction, TxnState};
use crate::catalog::bootstrap::{
    SYSTEM_SCHEMA, column_row, columns, grant_row, grants, index_row, indexes, is_builtin_object,
    object_row, objects, role_grant_row, role_grants, role_row, roles, table_row, tables,
};
use crate::catalog::schema::{ColumnDef, IndexDef, ObjectKind, OnDelete};
use crate::catalog::types::{
    ColumnId, ColumnType, IndexId, ObjectId, RoleId, Row, SchemaId, TableId, UpperName, Value,
    encode_value,
};
use crate::error::{Result, TxnError};
use crate::privilege::{
    Grantability, PUBLIC_ROLE, PrivilegeDescriptor, PrivilegeKind, ROOT_ROLE,
};
use crate::storage::{ReadView, ScanRequest, ScannedRow};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Target of a foreign reference. Without a column the reference points at
/// the table's primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSpec {
    pub schema: String,
    pub table: String,
    pub column: Option<String>,
    pub on_delete: OnDelete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub col_type: ColumnType,
    pub max_size: Option<u32>,
    pub not_null: bool,
    pub unique: bool,
    pub no_update: bool,
    pub autonumber_start: Option<i32>,
    pub default: Value,
    pub references: Option<ReferenceSpec>,
}

impl ColumnSpec {
    pub fn new(name: &str, col_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            col_type,
            max_size: None,
            not_null: false,
            unique: false,
            no_update: false,
            autonumber_start: None,
            default: Value::Null,
            references: None,
        }
    }

    pub fn max_size(mut self, max: u32) -> Self {
        self.max_size = Some(max);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn no_update(mut self) -> Self {
        self.no_update = true;
        self
    }

    pub fn autonumber(mut self, start: i32) -> Self {
        self.autonumber_start = Some(start);
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = value;
        self
    }

    /// References the primary key of `schema.table`.
    pub fn references(mut self, schema: &str, table: &str, on_delete: OnDelete) -> Self {
        self.references = Some(ReferenceSpec {
            schema: schema.to_string(),
            table: table.to_string(),
            column: None,
            on_delete,
        });
        self
    }

    pub fn references_column(mut self, schema: &str, table: &str, column: &str, on_delete: OnDelete) -> Self {
        self.references = Some(ReferenceSpec {
            schema: schema.to_string(),
            table: table.to_string(),
            column: Some(column.to_string()),
            on_delete,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    /// Name of the primary key column. It is made NOT NULL, NOUPDATE and
    /// UNIQUE and gets a unique index.
    pub primary_key: Option<String>,
    pub access_checked: bool,
}

impl TableSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            primary_key: None,
            access_checked: false,
        }
    }

    pub fn column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key(mut self, column: &str) -> Self {
        self.primary_key = Some(column.to_string());
        self
    }

    pub fn access_checked(mut self) -> Self {
        self.access_checked = true;
        self
    }
}

/// A reference resolved against the pinned snapshot.
#[derive(Debug, Clone, Copy)]
struct ResolvedReference {
    table: Option<TableId>,
    column: Option<ColumnId>,
    on_delete: OnDelete,
}

fn checked_name(name: &str) -> Result<UpperName> {
    let upper = UpperName::new(name);
    if upper.is_empty() {
        return Err(TxnError::InvalidArg("name must not be empty".into()));
    }
    Ok(upper)
}

fn opt_int(value: Option<i64>) -> Value {
    value.map(Value::Integer).unwrap_or(Value::Null)
}

fn new_object_id(written: &WrittenVersion, id_column: ColumnId) -> Result<ObjectId> {
    written
        .row
        .get(id_column)
        .as_i64()
        .ok_or_else(|| TxnError::Internal("catalog row was written without an id".into()))
}

impl Transaction {
    /// Catalog changes fail outright in both read-only states.
    fn ddl_writable(&self) -> Result<()> {
        match self.state() {
            TxnState::Normal => Ok(()),
            TxnState::ReadOnly | TxnState::ReadOnlyAfterError => Err(TxnError::ReadOnlyTransaction),
        }
    }

    fn catalog_rows(&self, request: &ScanRequest) -> Result<Vec<ScannedRow>> {
        Ok(self.ctx.storage.scan(self.current_view(), request)?.collect())
    }

    fn catalog_row(&self, request: &ScanRequest) -> Result<Option<ScannedRow>> {
        Ok(self.ctx.storage.scan(self.current_view(), request)?.next())
    }

    fn object_catalog_row(&self, object: ObjectId) -> Result<ScannedRow> {
        let request = ScanRequest::new(objects::TABLE).add_eq_search(objects::ID, Value::Integer(object));
        self.catalog_row(&request)?
            .ok_or_else(|| TxnError::Internal(format!("object {object} has no catalog row")))
    }

    fn insert_catalog_row(&mut self, table: TableId, row: &Row) -> Result<WrittenVersion> {
        let cells: Vec<(ColumnId, Value)> = row.iter().map(|(c, v)| (c, v.clone())).collect();
        self.write_version(table, None, &Row::new(), &cells, WriteChecks::SYSTEM)
    }

    fn update_catalog_row(
        &mut self,
        table: TableId,
        current: &ScannedRow,
        updates: &[(ColumnId, Value)],
    ) -> Result<WrittenVersion> {
        self.write_version(table, Some(current.id), &current.row, updates, WriteChecks::SYSTEM)
    }

    fn delete_catalog_rows(&mut self, table: TableId, request: &ScanRequest) -> Result<usize> {
        let found = self.catalog_rows(request)?;
        for row in &found {
            self.delete_version(table, row.id, WriteChecks::SYSTEM)?;
        }
        Ok(found.len())
    }

    /// Fails when a visible row matches `request`, or when another open
    /// transaction holds an uncommitted row that does. Must run under
    /// `name_lock` up to the insert of the named row.
    fn check_name_free(&self, table: TableId, request: &ScanRequest, what: &str) -> Result<()> {
        if self.catalog_row(request)?.is_some() {
            return Err(TxnError::Constraint(format!("{what} already exists")));
        }
        for scanned in self.ctx.storage.scan(ReadView::Present, request)? {
            if self.visibility_override(table, scanned.id).is_none() {
                return Err(TxnError::Conflict(format!(
                    "{what} is being created by a concurrent transaction"
                )));
            }
        }
        Ok(())
    }

    fn insert_object(
        &mut self,
        name: &UpperName,
        parent: Option<ObjectId>,
        kind: ObjectKind,
        owner: RoleId,
    ) -> Result<ObjectId> {
        let ctx = Arc::clone(&self.ctx);
        let _names = ctx.name_lock.lock();
        let request = ScanRequest::new(objects::TABLE)
            .add_eq_search(objects::NAME, Value::text(name.as_str()))
            .add_eq_search(objects::PARENT, opt_int(parent));
        self.check_name_free(objects::TABLE, &request, &format!("{kind:?} {name}"))?;
        let written = self.insert_catalog_row(
            objects::TABLE,
            &object_row(None, name.as_str(), parent, kind, owner),
        )?;
        new_object_id(&written, objects::ID)
    }

    /// The creator of an object holds every privilege on it, granted by the
    /// root identity.
    fn grant_to_owner(&mut self, owner: RoleId, object: ObjectId) -> Result<()> {
        if owner == ROOT_ROLE {
            return Ok(());
        }
        self.insert_catalog_row(
            grants::TABLE,
            &grant_row(
                ROOT_ROLE,
                owner,
                object,
                &PrivilegeDescriptor::all(Grantability::WithGrantOption),
            ),
        )?;
        Ok(())
    }

    fn enabled_roles(&self) -> impl Iterator<Item = RoleId> + '_ {
        let effective = self.effective_role();
        std::iter::once(self.base_role()).chain((effective != self.base_role()).then_some(effective))
    }

    /// Root, the owner, and roles holding the owner may change an object.
    fn require_owner(&self, object: ObjectId) -> Result<()> {
        if self.is_root() {
            return Ok(());
        }
        let meta = self.metadata();
        let owner = meta
            .owner_of(object)
            .ok_or_else(|| TxnError::InvalidArg(format!("object {object} does not exist")))?;
        let graph = meta.privileges();
        let owns = self
            .enabled_roles()
            .any(|role| role == owner || graph.applicable_roles(role).contains_key(&owner));
        if owns {
            Ok(())
        } else {
            Err(TxnError::WriteAccessDenied {
                table: meta.qualified_name(object),
            })
        }
    }

    fn live_object(&self, object: ObjectId) -> Result<ObjectKind> {
        self.metadata()
            .object(object)
            .filter(|_| self.metadata().is_live(object))
            .map(|o| o.kind)
            .ok_or_else(|| TxnError::InvalidArg(format!("object {object} does not exist")))
    }

    fn role_id(&self, name: &str) -> Result<RoleId> {
        self.metadata()
            .privileges()
            .role_by_name(name)
            .map(|r| r.role_id)
            .ok_or_else(|| TxnError::InvalidArg(format!("role {name} does not exist")))
    }

    fn resolve_reference(
        &self,
        owner: RoleId,
        spec: &ColumnSpec,
        reference: &ReferenceSpec,
        referencing_hard: bool,
    ) -> Result<ResolvedReference> {
        let meta = self.metadata();
        let target = meta
            .table_by_name(&reference.schema, &reference.table)
            .filter(|t| meta.is_live(*t))
            .ok_or_else(|| {
                TxnError::InvalidArg(format!(
                    "referenced table {}.{} does not exist",
                    reference.schema, reference.table
                ))
            })?;
        let key = match &reference.column {
            Some(name) => meta.column_by_name(target, name).filter(|c| meta.is_live(c.column_id)),
            None => meta
                .live_table(target)?
                .primary_key
                .and_then(|pk| meta.column(pk)),
        }
        .ok_or_else(|| {
            TxnError::InvalidArg(format!("{} has no such key column", meta.qualified_name(target)))
        })?;
        if !key.no_update || (reference.column.is_some() && !key.unique) {
            return Err(TxnError::InvalidArg(format!(
                "{} is not a unique NOUPDATE column",
                meta.qualified_name(key.column_id)
            )));
        }
        if key.col_type != spec.col_type || key.max_size != spec.max_size {
            return Err(TxnError::InvalidArg(format!(
                "{} does not match the type of {}",
                spec.name,
                meta.qualified_name(key.column_id)
            )));
        }
        let soft = match reference.on_delete {
            OnDelete::Cascade => !referencing_hard,
            OnDelete::SetDefault => {
                !(spec.not_null || spec.unique || spec.no_update || !spec.default.is_null())
            }
            OnDelete::Illegal => false,
        };
        let needed = if soft {
            PrivilegeKind::ColumnSelect
        } else {
            PrivilegeKind::ColumnReferences
        };
        if !meta
            .privileges()
            .get_privileges_for_object(owner, key.column_id)
            .has(needed)
        {
            return Err(TxnError::WriteAccessDenied {
                table: meta.qualified_name(target),
            });
        }
        Ok(ResolvedReference {
            table: reference.column.is_none().then_some(target),
            column: reference.column.is_some().then_some(key.column_id),
            on_delete: reference.on_delete,
        })
    }

    fn column_def(
        spec: &ColumnSpec,
        column_id: ColumnId,
        table_id: TableId,
        position: u32,
        reference: Option<ResolvedReference>,
    ) -> Result<ColumnDef> {
        if spec.autonumber_start.is_some() && spec.col_type != ColumnType::Integer {
            return Err(TxnError::InvalidArg(format!(
                "autonumber column {} must be INTEGER",
                spec.name
            )));
        }
        if !spec.default.matches_type(spec.col_type) {
            return Err(TxnError::InvalidArg(format!(
                "default of {} does not fit {}",
                spec.name, spec.col_type
            )));
        }
        let mut def = ColumnDef::new(column_id, table_id, position, spec.col_type);
        def.max_size = spec.max_size;
        def.not_null = spec.not_null;
        def.unique = spec.unique;
        def.no_update = spec.no_update;
        def.autonumber_start = spec.autonumber_start;
        if !spec.default.is_null() {
            def.default_value = encode_value(&spec.default)?;
        }
        if let Some(reference) = reference {
            def.foreign_reference = reference.table;
            def.foreign_reference_by_column = reference.column;
            def.on_delete = reference.on_delete;
        }
        Ok(def)
    }

    /// Closes the DDL command and brings the pinned snapshot up to date.
    fn complete_ddl(&mut self) -> Result<()> {
        self.finish_command()?;
        self.mark_metadata_modified();
        self.refresh_metadata(true)?;
        self.reconcile_catalog()
    }

    /// Deletes grants the privilege graph no longer authorizes and clears
    /// references whose owner lost the privilege they need, refreshing after
    /// each round until nothing is left to fix.
    fn reconcile_catalog(&mut self) -> Result<()> {
        for round in 1..=self.ctx.config.max_reconcile_rounds {
            let fixes = self.guarded(Self::apply_reconciliation)?;
            if fixes == 0 {
                return Ok(());
            }
            warn!(txn_id = self.txn_id, round, fixes, "catalog reconciled");
            self.finish_command()?;
            self.refresh_metadata(true)?;
        }
        if self.reconciliation_pending() {
            return Err(TxnError::MetadataBad(format!(
                "catalog still inconsistent after {} reconcile rounds",
                self.ctx.config.max_reconcile_rounds
            )));
        }
        Ok(())
    }

    fn reconciliation_pending(&self) -> bool {
        let meta = self.metadata();
        meta.privileges().abandoned_grants().next().is_some()
            || meta.privileges().abandoned_role_grants().next().is_some()
            || !meta.reference_drops().is_empty()
    }

    fn apply_reconciliation(&mut self) -> Result<usize> {
        let meta = self.metadata_ref().shared();
        let graph = meta.privileges();
        let mut fixes = 0;
        for grant in graph.abandoned_grants() {
            let request = ScanRequest::new(grants::TABLE)
                .add_eq_search(grants::GRANTOR, Value::Integer(grant.grantor))
                .add_eq_search(grants::GRANTEE, Value::Integer(grant.grantee))
                .add_eq_search(grants::OBJECT_ID, Value::Integer(grant.object));
            let deleted = self.delete_catalog_rows(grants::TABLE, &request)?;
            if deleted > 0 {
                warn!(
                    grantor = grant.grantor,
                    grantee = grant.grantee,
                    object = grant.object,
                    "abandoned grant dropped"
                );
            }
            fixes += deleted;
        }
        for grant in graph.abandoned_role_grants() {
            let request = ScanRequest::new(role_grants::TABLE)
                .add_eq_search(role_grants::GRANTOR, Value::Integer(grant.grantor))
                .add_eq_search(role_grants::GRANTEE, Value::Integer(grant.grantee))
                .add_eq_search(role_grants::ROLE_ID, Value::Integer(grant.role));
            let deleted = self.delete_catalog_rows(role_grants::TABLE, &request)?;
            if deleted > 0 {
                warn!(
                    grantor = grant.grantor,
                    grantee = grant.grantee,
                    role = grant.role,
                    "abandoned role grant dropped"
                );
            }
            fixes += deleted;
        }
        for column in meta.reference_drops() {
            let request = ScanRequest::new(columns::TABLE).add_eq_search(columns::ID, Value::Integer(*column));
            let Some(row) = self.catalog_row(&request)? else {
                continue;
            };
            let written = self.update_catalog_row(
                columns::TABLE,
                &row,
                &[(columns::REF_TABLE, Value::Null), (columns::REF_COLUMN, Value::Null)],
            )?;
            if written.changed {
                warn!(column, "reference dropped after its privilege was revoked");
                fixes += 1;
            }
        }
        Ok(fixes)
    }

    pub fn create_schema(&mut self, name: &str) -> Result<SchemaId> {
        self.ddl_writable()?;
        let name = checked_name(name)?;
        let owner = self.effective_role();
        let schema_id = self.guarded(|tx| {
            let id = tx.insert_object(&name, None, ObjectKind::Schema, owner)?;
            tx.grant_to_owner(owner, id)?;
            Ok(id)
        })?;
        self.complete_ddl()?;
        info!(txn_id = self.txn_id, schema_id, name = %name, owner, "schema created");
        Ok(schema_id)
    }

    pub fn create_table(&mut self, schema: &str, spec: &TableSpec) -> Result<TableId> {
        self.ddl_writable()?;
        let name = checked_name(&spec.name)?;
        let schema_id = self
            .metadata()
            .schema_by_name(schema)
            .filter(|s| self.metadata().is_live(*s))
            .ok_or_else(|| TxnError::InvalidArg(format!("schema {schema} does not exist")))?;
        if schema_id == SYSTEM_SCHEMA && !self.is_root() {
            return Err(TxnError::WriteAccessDenied {
                table: format!("SYSTEM.{name}"),
            });
        }
        self.require_owner(schema_id)?;
        if spec.columns.is_empty() {
            return Err(TxnError::InvalidArg(format!("table {name} has no columns")));
        }
        let mut seen = BTreeSet::new();
        for column in &spec.columns {
            if !seen.insert(checked_name(&column.name)?) {
                return Err(TxnError::InvalidArg(format!(
                    "column {} is declared twice",
                    column.name
                )));
            }
        }
        let primary_key = match &spec.primary_key {
            Some(pk) => {
                let pk = UpperName::new(pk);
                if !seen.contains(&pk) {
                    return Err(TxnError::InvalidArg(format!(
                        "primary key {pk} is not a column of {name}"
                    )));
                }
                Some(pk)
            }
            None => None,
        };
        let owner = self.effective_role();
        let references = spec
            .columns
            .iter()
            .map(|column| {
                column
                    .references
                    .as_ref()
                    .map(|r| self.resolve_reference(owner, column, r, false))
                    .transpose()
            })
            .collect::<Result<Vec<_>>>()?;

        let table_id = self.guarded(|tx| {
            let table_id = tx.insert_object(&name, Some(schema_id), ObjectKind::Table, owner)?;
            tx.ledger.report_table_create(table_id);
            let mut defs = Vec::with_capacity(spec.columns.len());
            let mut pk_id = None;
            for (position, (column, reference)) in spec.columns.iter().zip(&references).enumerate() {
                let column_name = UpperName::new(&column.name);
                let column_id = tx.insert_object(&column_name, Some(table_id), ObjectKind::Column, owner)?;
                let mut def = Self::column_def(column, column_id, table_id, position as u32, *reference)?;
                if primary_key.as_ref() == Some(&column_name) {
                    def.not_null = true;
                    def.no_update = true;
                    def.unique = true;
                    pk_id = Some(column_id);
                }
                defs.push(def);
            }
            tx.insert_catalog_row(
                tables::TABLE,
                &table_row(table_id, pk_id, spec.access_checked),
            )?;
            for def in &defs {
                tx.insert_catalog_row(columns::TABLE, &column_row(def))?;
            }
            if let Some(pk) = pk_id {
                let index_name = UpperName::new(&format!("{name}_PK"));
                tx.add_index(table_id, &index_name, vec![pk], true, owner)?;
            }
            tx.grant_to_owner(owner, table_id)?;
            Ok(table_id)
        })?;
        self.complete_ddl()?;
        info!(txn_id = self.txn_id, table_id, name = %self.metadata().qualified_name(table_id), "table created");
        Ok(table_id)
    }

    fn add_index(
        &mut self,
        table_id: TableId,
        name: &UpperName,
        columns: Vec<ColumnId>,
        unique: bool,
        owner: RoleId,
    ) -> Result<IndexId> {
        let index_id = self.insert_object(name, Some(table_id), ObjectKind::Index, owner)?;
        let def = IndexDef {
            index_id,
            table_id,
            columns,
            unique,
        };
        self.insert_catalog_row(indexes::TABLE, &index_row(&def)?)?;
        self.ctx.storage.create_index(index_id, table_id, &def.columns)?;
        self.created_indexes.push(index_id);
        Ok(index_id)
    }

    pub fn add_column(&mut self, table: TableId, spec: &ColumnSpec) -> Result<ColumnId> {
        self.ddl_writable()?;
        let name = checked_name(&spec.name)?;
        let table_def = self.metadata().live_table(table)?.clone();
        self.require_owner(table)?;
        if spec.not_null && spec.default.is_null() && spec.autonumber_start.is_none() {
            let any_row = self
                .ctx
                .storage
                .scan(self.current_view(), &ScanRequest::new(table))?
                .next()
                .is_some();
            if any_row {
                return Err(TxnError::InvalidArg(format!(
                    "NOT NULL column {name} needs a default on a table with rows"
                )));
            }
        }
        let owner = self.metadata().owner_of(table).unwrap_or(ROOT_ROLE);
        let reference = spec
            .references
            .as_ref()
            .map(|r| self.resolve_reference(owner, spec, r, table_def.is_hard_referenced))
            .transpose()?;
        let position = self
            .metadata()
            .columns_of(table)
            .iter()
            .map(|c| c.position + 1)
            .max()
            .unwrap_or(0);
        let column_id = self.guarded(|tx| {
            let column_id = tx.insert_object(&name, Some(table), ObjectKind::Column, owner)?;
            let def = Self::column_def(spec, column_id, table, position, reference)?;
            tx.insert_catalog_row(columns::TABLE, &column_row(&def))?;
            Ok(column_id)
        })?;
        self.complete_ddl()?;
        debug!(txn_id = self.txn_id, table, column_id, "column added");
        Ok(column_id)
    }

    pub fn create_index(&mut self, table: TableId, name: &str, column_names: &[&str], unique: bool) -> Result<IndexId> {
        self.ddl_writable()?;
        let name = checked_name(name)?;
        self.metadata().live_table(table)?;
        self.require_owner(table)?;
        let mut column_ids = Vec::with_capacity(column_names.len());
        for column in column_names {
            let def = self
                .metadata()
                .column_by_name(table, column)
                .filter(|c| self.metadata().is_live(c.column_id))
                .ok_or_else(|| TxnError::InvalidArg(format!("column {column} does not exist")))?;
            column_ids.push(def.column_id);
        }
        if column_ids.is_empty() {
            return Err(TxnError::InvalidArg(format!("index {name} has no columns")));
        }
        if unique {
            let mut keys = BTreeSet::new();
            for scanned in self.ctx.storage.scan(self.current_view(), &ScanRequest::new(table))? {
                let key: Vec<Value> = column_ids.iter().map(|c| scanned.row.get(*c).clone()).collect();
                if key.iter().all(|v| !v.is_null()) && !keys.insert(key) {
                    return Err(TxnError::Constraint(format!(
                        "existing rows of {} are not unique on {name}",
                        self.metadata().qualified_name(table)
                    )));
                }
            }
        }
        let owner = self.metadata().owner_of(table).unwrap_or(ROOT_ROLE);
        let index_id = self.guarded(|tx| tx.add_index(table, &name, column_ids, unique, owner))?;
        self.complete_ddl()?;
        debug!(txn_id = self.txn_id, table, index_id, "index created");
        Ok(index_id)
    }

    fn is_within(&self, object: ObjectId, ancestor: ObjectId) -> bool {
        let mut current = Some(object);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.metadata().object(id).and_then(|o| o.parent);
        }
        false
    }

    /// Fails if a live reference from outside the dropped subtree points into
    /// it.
    fn check_not_referenced(&self, object: ObjectId) -> Result<()> {
        let meta = self.metadata();
        for column in meta.columns() {
            if !column.has_reference() || !meta.is_live(column.column_id) {
                continue;
            }
            let hits = meta
                .referenced_table(column)
                .is_some_and(|t| self.is_within(t, object))
                || meta
                    .referenced_key_column(column)
                    .is_some_and(|k| self.is_within(k, object));
            if hits && !self.is_within(column.column_id, object) {
                return Err(TxnError::Constraint(format!(
                    "{} is referenced by {}",
                    meta.qualified_name(object),
                    meta.qualified_name(column.column_id)
                )));
            }
        }
        Ok(())
    }

    /// Tombstones a schema, table, column or index together with everything
    /// below it, and deletes the grants on it.
    pub fn drop_object(&mut self, object: ObjectId) -> Result<()> {
        self.ddl_writable()?;
        let kind = self.live_object(object)?;
        if is_builtin_object(object) {
            return Err(TxnError::InvalidArg(format!(
                "built-in object {} cannot be dropped",
                self.metadata().qualified_name(object)
            )));
        }
        self.require_owner(object)?;
        if kind == ObjectKind::Column
            && let Some(column) = self.metadata().column(object)
            && self
                .metadata()
                .table(column.table_id)
                .is_some_and(|t| t.primary_key == Some(object))
        {
            return Err(TxnError::InvalidArg(format!(
                "primary key {} cannot be dropped",
                self.metadata().qualified_name(object)
            )));
        }
        self.check_not_referenced(object)?;

        let meta = self.metadata_ref().shared();
        let name = meta.qualified_name(object);
        let dropped_tables: Vec<TableId> = meta
            .live_tables()
            .filter(|t| self.is_within(t.table_id, object))
            .map(|t| t.table_id)
            .collect();
        let dropped_columns: Vec<ColumnId> = meta
            .columns()
            .filter(|c| meta.is_live(c.column_id) && self.is_within(c.column_id, object))
            .map(|c| c.column_id)
            .collect();
        let mut dropped_indexes: Vec<IndexId> = dropped_tables
            .iter()
            .filter_map(|t| meta.table(*t))
            .flat_map(|t| t.indexes.iter().copied())
            .collect();
        if kind == ObjectKind::Index {
            dropped_indexes.push(object);
        }

        self.guarded(|tx| {
            let row = tx.object_catalog_row(object)?;
            tx.update_catalog_row(objects::TABLE, &row, &[(objects::NAME, Value::text(""))])?;
            let request = ScanRequest::new(grants::TABLE).add_eq_search(grants::OBJECT_ID, Value::Integer(object));
            tx.delete_catalog_rows(grants::TABLE, &request)?;
            for table in &dropped_tables {
                tx.ledger.report_table_drop(*table);
            }
            Ok(())
        })?;
        self.dropped_indexes.extend(dropped_indexes);
        self.dropped_columns.extend(dropped_columns);
        self.complete_ddl()?;
        info!(txn_id = self.txn_id, object, ?kind, name = %name, "object dropped");
        Ok(())
    }

    pub fn drop_table(&mut self, schema: &str, table: &str) -> Result<()> {
        let table_id = self
            .metadata()
            .table_by_name(schema, table)
            .filter(|t| self.metadata().is_live(*t))
            .ok_or_else(|| TxnError::InvalidArg(format!("table {schema}.{table} does not exist")))?;
        self.drop_object(table_id)
    }

    /// Creates a role. A creator other than the root identity receives it
    /// with admin option.
    pub fn create_role(&mut self, name: &str) -> Result<RoleId> {
        self.ddl_writable()?;
        let name = checked_name(name)?;
        if self.metadata().privileges().role_by_name(name.as_str()).is_some() {
            return Err(TxnError::Constraint(format!("role {name} already exists")));
        }
        let creator = self.effective_role();
        let role_id = self.guarded(|tx| {
            let ctx = Arc::clone(&tx.ctx);
            let _names = ctx.name_lock.lock();
            let request = ScanRequest::new(roles::TABLE).add_eq_search(roles::NAME, Value::text(name.as_str()));
            tx.check_name_free(roles::TABLE, &request, &format!("role {name}"))?;
            let written = tx.insert_catalog_row(roles::TABLE, &role_row(None, name.as_str(), None))?;
            let role_id = new_object_id(&written, roles::ID)?;
            if creator != ROOT_ROLE {
                tx.insert_catalog_row(role_grants::TABLE, &role_grant_row(ROOT_ROLE, creator, role_id, true))?;
            }
            Ok(role_id)
        })?;
        self.complete_ddl()?;
        info!(txn_id = self.txn_id, role_id, name = %name, "role created");
        Ok(role_id)
    }

    /// Drops a role and every grant it holds. Grants it made become
    /// unauthorized and are reconciled away.
    pub fn drop_role(&mut self, name: &str) -> Result<()> {
        self.ddl_writable()?;
        let role = self.role_id(name)?;
        if role == ROOT_ROLE || role == PUBLIC_ROLE {
            return Err(TxnError::InvalidArg(format!("built-in role {name} cannot be dropped")));
        }
        let meta = self.metadata_ref().shared();
        if !self.is_root() && !self.enabled_roles().any(|r| meta.privileges().is_role_grantable_by(role, r)) {
            return Err(TxnError::WriteAccessDenied {
                table: format!("role {name}"),
            });
        }
        if let Some(owned) = meta
            .objects()
            .find(|o| o.owner == role && meta.is_live(o.object_id))
        {
            return Err(TxnError::Constraint(format!(
                "role {name} still owns {}",
                meta.qualified_name(owned.object_id)
            )));
        }
        self.guarded(|tx| {
            let id = Value::Integer(role);
            tx.delete_catalog_rows(roles::TABLE, &ScanRequest::new(roles::TABLE).add_eq_search(roles::ID, id.clone()))?;
            tx.delete_catalog_rows(
                role_grants::TABLE,
                &ScanRequest::new(role_grants::TABLE).add_eq_search(role_grants::ROLE_ID, id.clone()),
            )?;
            tx.delete_catalog_rows(
                role_grants::TABLE,
                &ScanRequest::new(role_grants::TABLE).add_eq_search(role_grants::GRANTEE, id.clone()),
            )?;
            tx.delete_catalog_rows(
                grants::TABLE,
                &ScanRequest::new(grants::TABLE).add_eq_search(grants::GRANTEE, id),
            )?;
            Ok(())
        })?;
        self.complete_ddl()?;
        info!(txn_id = self.txn_id, role, name, "role dropped");
        Ok(())
    }

    fn grant_request(grantor: RoleId, grantee: RoleId, object: ObjectId) -> ScanRequest {
        ScanRequest::new(grants::TABLE)
            .add_eq_search(grants::GRANTOR, Value::Integer(grantor))
            .add_eq_search(grants::GRANTEE, Value::Integer(grantee))
            .add_eq_search(grants::OBJECT_ID, Value::Integer(object))
    }

    fn stored_privileges(row: &ScannedRow) -> PrivilegeDescriptor {
        row.row
            .get(grants::PRIVILEGES)
            .as_i64()
            .and_then(PrivilegeDescriptor::from_bits)
            .unwrap_or_else(PrivilegeDescriptor::empty)
    }

    /// Grants `privileges` on `object` to `grantee`, with the effective role
    /// as grantor. The grantor must hold each privilege with grant option.
    pub fn grant_privileges(&mut self, object: ObjectId, grantee: &str, privileges: PrivilegeDescriptor) -> Result<()> {
        self.ddl_writable()?;
        self.live_object(object)?;
        let grantee = self.role_id(grantee)?;
        if privileges.is_empty() {
            return Err(TxnError::InvalidArg("nothing to grant".into()));
        }
        let grantor = self.effective_role();
        let held = self
            .metadata()
            .privileges()
            .get_privileges_for_object(grantor, object);
        if !held.allows_granting(&privileges) {
            return Err(TxnError::WriteAccessDenied {
                table: self.metadata().qualified_name(object),
            });
        }
        self.guarded(|tx| {
            match tx.catalog_row(&Self::grant_request(grantor, grantee, object))? {
                Some(row) => {
                    let merged = Self::stored_privileges(&row).merged(&privileges);
                    tx.update_catalog_row(grants::TABLE, &row, &[(grants::PRIVILEGES, Value::Integer(merged.to_bits()))])?;
                }
                None => {
                    tx.insert_catalog_row(grants::TABLE, &grant_row(grantor, grantee, object, &privileges))?;
                }
            }
            Ok(())
        })?;
        self.complete_ddl()?;
        debug!(txn_id = self.txn_id, grantor, grantee, object, "privileges granted");
        Ok(())
    }

    /// Withdraws privileges the effective role granted. Grants that depended
    /// on them are reconciled away.
    pub fn revoke_privileges(&mut self, object: ObjectId, grantee: &str, privileges: PrivilegeDescriptor) -> Result<()> {
        self.ddl_writable()?;
        let grantee = self.role_id(grantee)?;
        let grantor = self.effective_role();
        self.guarded(|tx| {
            let row = tx
                .catalog_row(&Self::grant_request(grantor, grantee, object))?
                .ok_or_else(|| TxnError::InvalidArg(format!("role {grantor} granted nothing on {object} to {grantee}")))?;
            let remaining = Self::stored_privileges(&row).without(&privileges);
            if remaining.is_empty() {
                tx.delete_version(grants::TABLE, row.id, WriteChecks::SYSTEM)?;
            } else {
                tx.update_catalog_row(grants::TABLE, &row, &[(grants::PRIVILEGES, Value::Integer(remaining.to_bits()))])?;
            }
            Ok(())
        })?;
        self.complete_ddl()?;
        debug!(txn_id = self.txn_id, grantor, grantee, object, "privileges revoked");
        Ok(())
    }

    fn role_grant_request(grantor: RoleId, grantee: RoleId, role: RoleId) -> ScanRequest {
        ScanRequest::new(role_grants::TABLE)
            .add_eq_search(role_grants::GRANTOR, Value::Integer(grantor))
            .add_eq_search(role_grants::GRANTEE, Value::Integer(grantee))
            .add_eq_search(role_grants::ROLE_ID, Value::Integer(role))
    }

    pub fn grant_role(&mut self, role: &str, grantee: &str, with_admin: bool) -> Result<()> {
        self.ddl_writable()?;
        let role_id = self.role_id(role)?;
        let grantee_id = self.role_id(grantee)?;
        let grantor = self.effective_role();
        let graph = self.metadata().privileges();
        if !graph.is_role_grantable_by(role_id, grantor) {
            return Err(TxnError::WriteAccessDenied {
                table: format!("role {role}"),
            });
        }
        if graph.would_close_cycle(grantee_id, role_id) {
            return Err(TxnError::Constraint(format!(
                "granting {role} to {grantee} would make a role contain itself"
            )));
        }
        self.guarded(|tx| {
            match tx.catalog_row(&Self::role_grant_request(grantor, grantee_id, role_id))? {
                Some(row) => {
                    if with_admin {
                        tx.update_catalog_row(role_grants::TABLE, &row, &[(role_grants::WITH_ADMIN, Value::Boolean(true))])?;
                    }
                }
                None => {
                    tx.insert_catalog_row(
                        role_grants::TABLE,
                        &role_grant_row(grantor, grantee_id, role_id, with_admin),
                    )?;
                }
            }
            Ok(())
        })?;
        self.complete_ddl()?;
        debug!(txn_id = self.txn_id, grantor, grantee = grantee_id, role = role_id, with_admin, "role granted");
        Ok(())
    }

    pub fn revoke_role(&mut self, role: &str, grantee: &str) -> Result<()> {
        self.ddl_writable()?;
        let role_id = self.role_id(role)?;
        let grantee_id = self.role_id(grantee)?;
        let grantor = self.effective_role();
        self.guarded(|tx| {
            let deleted = tx.delete_catalog_rows(
                role_grants::TABLE,
                &Self::role_grant_request(grantor, grantee_id, role_id),
            )?;
            if deleted == 0 {
                return Err(TxnError::InvalidArg(format!("{role} was not granted to {grantee}")));
            }
            Ok(())
        })?;
        self.complete_ddl()?;
        debug!(txn_id = self.txn_id, grantor, grantee = grantee_id, role = role_id, "role revoked");
        Ok(())
    }

    /// Enables `name` alongside the base role. The role must be granted to
    /// the base role, directly or through other roles.
    pub fn set_role(&mut self, name: &str) -> Result<()> {
        let role = self.role_id(name)?;
        let base = self.base_role();
        let allowed = base == ROOT_ROLE
            || base == role
            || self.metadata().privileges().applicable_roles(base).contains_key(&role);
        if !allowed {
            return Err(TxnError::InvalidArg(format!("role {name} is not granted to this session")));
        }
        self.set_current_role((role != base).then_some(role));
        debug!(txn_id = self.txn_id, role, "role enabled");
        Ok(())
    }

    pub fn reset_role(&mut self) {
        self.set_current_role(None);
    }
}
