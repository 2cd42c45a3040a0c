//! Version chain writes: every update produces a new physical version linked
//! from the one it supersedes.

use super::VisibilityOverride;
use super::tx::Transaction;
use crate::access::WriteAction;
use crate::catalog::schema::ColumnDef;
use crate::catalog::types::{ColumnId, RecordId, Row, TableId, Value};
use crate::error::{Result, TxnError};
use crate::privilege::PrivilegeKind;
use crate::storage::{LockOutcome, ScanRequest};
use smallvec::SmallVec;

type ColumnList = SmallVec<[ColumnId; 8]>;

/// Which checks a write bypasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteChecks {
    pub skip_priv: bool,
    pub skip_access: bool,
}

impl WriteChecks {
    pub const USER: WriteChecks = WriteChecks {
        skip_priv: false,
        skip_access: false,
    };
    /// Catalog maintenance and referential actions.
    pub const SYSTEM: WriteChecks = WriteChecks {
        skip_priv: true,
        skip_access: true,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WrittenVersion {
    pub changed: bool,
    pub id: RecordId,
    pub row: Row,
}

/// Cell-level outcome of building the next version.
struct Prepared {
    row: Row,
    user_modified: ColumnList,
    modified: ColumnList,
    /// Autonumber columns still waiting for a key.
    pending_keys: ColumnList,
}

fn lock_conflict(table: &str, id: RecordId, outcome: LockOutcome) -> TxnError {
    TxnError::Conflict(format!("record {id} of {table} could not be locked: {outcome:?}"))
}

impl Transaction {
    /// Writes the next version of a row, or the first version of a new one
    /// when `old_id` is `None`. Returns whether a version was written and
    /// the id of the row's current version.
    pub fn update_record(
        &mut self,
        table: TableId,
        old_id: Option<RecordId>,
        old_row: &Row,
        updates: &[(ColumnId, Value)],
        skip_priv: bool,
        skip_access: bool,
    ) -> Result<(bool, RecordId)> {
        if !self.writable()? {
            return Ok((false, old_id.unwrap_or(RecordId::INVALID)));
        }
        let checks = WriteChecks {
            skip_priv,
            skip_access,
        };
        self.guarded(|tx| tx.write_version(table, old_id, old_row, updates, checks))
            .map(|written| (written.changed, written.id))
    }

    pub fn insert_record(&mut self, table: TableId, values: &[(ColumnId, Value)]) -> Result<RecordId> {
        let (_, id) = self.update_record(table, None, &Row::new(), values, false, false)?;
        Ok(id)
    }

    pub fn delete_record(&mut self, table: TableId, id: RecordId, skip_priv: bool, skip_access: bool) -> Result<()> {
        if !self.writable()? {
            return Ok(());
        }
        let checks = WriteChecks {
            skip_priv,
            skip_access,
        };
        self.guarded(|tx| tx.delete_version(table, id, checks))
    }

    pub(crate) fn write_version(
        &mut self,
        table: TableId,
        old_id: Option<RecordId>,
        old_row: &Row,
        updates: &[(ColumnId, Value)],
        checks: WriteChecks,
    ) -> Result<WrittenVersion> {
        self.check_abort_flag()?;
        let meta = self.metadata.clone();
        let table_def = meta.live_table(table)?;
        self.ledger.check_writable(table)?;
        let table_name = meta.qualified_name(table);
        let columns = meta.columns_of(table);

        let mut prepared = self.prepare_row(&table_name, &columns, old_id.is_none(), old_row, updates)?;

        if !checks.skip_priv {
            let kind = if old_id.is_some() {
                PrivilegeKind::ColumnUpdate
            } else {
                PrivilegeKind::ColumnInsert
            };
            let denied = if prepared.user_modified.is_empty() {
                old_id.is_none() && !self.has_privilege(table, kind)
            } else {
                prepared
                    .user_modified
                    .iter()
                    .any(|column| !self.has_privilege(*column, kind))
            };
            if denied {
                return Err(TxnError::WriteAccessDenied { table: table_name });
            }
        }
        for column in std::mem::take(&mut prepared.pending_keys) {
            let key = self.get_autonumber_key(table, column)?;
            prepared.row.set(column, Value::Integer(i64::from(key)));
        }

        if let Some(old) = old_id
            && prepared.modified.is_empty()
            && !self.ctx.config.clustering_updates
        {
            return Ok(WrittenVersion {
                changed: false,
                id: old,
                row: old_row.clone(),
            });
        }

        for column in &columns {
            let unique = column.unique
                || meta
                    .single_column_index(table, column.column_id)
                    .is_some_and(|i| i.unique);
            if unique && prepared.user_modified.contains(&column.column_id) {
                self.check_unique(table, &table_name, column, prepared.row.get(column.column_id), old_id)?;
            }
        }

        if table_def.access_checked && !checks.skip_access {
            let action = if old_id.is_some() {
                WriteAction::Update
            } else {
                WriteAction::Insert
            };
            self.ctx.access.check_write(
                self.txn_id,
                table,
                &table_name,
                action,
                old_id.map(|_| old_row),
                Some(&prepared.row),
            )?;
        }

        if let Some(old) = old_id {
            match self.ctx.storage.lock_row(self.txn_id, table, old)? {
                LockOutcome::NoChange => {}
                outcome => return Err(lock_conflict(&table_name, old, outcome)),
            }
        }
        let new_id = self.ctx.storage.write_new_record(
            self.txn_id,
            self.command,
            table,
            &prepared.row,
            old_id,
            self.ctx.config.clustering_updates,
        )?;
        match old_id {
            Some(old) => {
                self.ctx
                    .storage
                    .register_update(self.txn_id, self.command, table, old, new_id)?;
                self.new_overrides
                    .insert((table, old), VisibilityOverride::Expired);
                prepared.modified.sort_unstable();
                self.ledger
                    .report_update(table, old, new_id, &prepared.modified)?;
            }
            None => self.ledger.report_insert(table, new_id)?,
        }
        Ok(WrittenVersion {
            changed: true,
            id: new_id,
            row: prepared.row,
        })
    }

    fn prepare_row(
        &self,
        table_name: &str,
        columns: &[&ColumnDef],
        inserting: bool,
        old_row: &Row,
        updates: &[(ColumnId, Value)],
    ) -> Result<Prepared> {
        let mut row = if inserting { Row::new() } else { old_row.clone() };
        for (column_id, value) in updates {
            let column = columns
                .iter()
                .find(|c| c.column_id == *column_id)
                .ok_or_else(|| {
                    TxnError::InvalidArg(format!("column {column_id} is not a column of {table_name}"))
                })?;
            if !value.matches_type(column.col_type) {
                return Err(TxnError::InvalidArg(format!(
                    "{} expects {}",
                    self.metadata.qualified_name(*column_id),
                    column.col_type
                )));
            }
            row.set(*column_id, value.clone());
        }
        if inserting {
            for column in columns {
                if updates.iter().any(|(c, _)| *c == column.column_id) {
                    continue;
                }
                row.set(column.column_id, column.default_value()?);
            }
        }
        let pending_keys: ColumnList = columns
            .iter()
            .filter(|column| inserting && column.is_autonumber() && row.get(column.column_id).is_null())
            .map(|column| column.column_id)
            .collect();

        let mut user_modified = ColumnList::new();
        let mut modified = ColumnList::new();
        for column in columns {
            let id = column.column_id;
            let old = if inserting { &Value::Null } else { old_row.get(id) };
            let new = row.get(id).clone();
            let pending = pending_keys.contains(&id);
            let user_change = new != *old || pending;
            let migrating = new.needs_blob_upgrade();
            if migrating {
                row.set(id, new.clone().upgraded());
            }
            if user_change {
                user_modified.push(id);
            }
            if user_change || (migrating && !inserting) {
                modified.push(id);
            }

            if column.no_update && !inserting && user_change && !old.is_null_like() {
                return Err(TxnError::Constraint(format!(
                    "{} cannot be updated",
                    self.metadata.qualified_name(id)
                )));
            }
            if column.not_null && !pending && row.get(id).is_null() {
                return Err(TxnError::ConstraintNotNull {
                    table: table_name.to_string(),
                    column: self
                        .metadata
                        .object(id)
                        .map(|o| o.name.to_string())
                        .unwrap_or_else(|| id.to_string()),
                });
            }
            if let Some(max) = column.max_size
                && new.byte_len() > max as usize
            {
                return Err(TxnError::Constraint(format!(
                    "value of {} bytes exceeds the {max} byte limit of {}",
                    new.byte_len(),
                    self.metadata.qualified_name(id)
                )));
            }
        }
        Ok(Prepared {
            row,
            user_modified,
            modified,
            pending_keys,
        })
    }

    fn check_unique(
        &self,
        table: TableId,
        table_name: &str,
        column: &ColumnDef,
        value: &Value,
        old_id: Option<RecordId>,
    ) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        let request = ScanRequest::new(table).add_eq_search(column.column_id, value.clone());
        let clash = self
            .ctx
            .storage
            .scan(self.current_view(), &request)?
            .any(|scanned| Some(scanned.id) != old_id);
        if clash {
            return Err(TxnError::Constraint(format!(
                "duplicate value in unique column {} of {table_name}",
                self.metadata.qualified_name(column.column_id)
            )));
        }
        Ok(())
    }

    pub(crate) fn delete_version(&mut self, table: TableId, id: RecordId, checks: WriteChecks) -> Result<()> {
        self.check_abort_flag()?;
        let access_checked = self.metadata.live_table(table)?.access_checked;
        self.ledger.check_writable(table)?;
        let table_name = self.metadata.qualified_name(table);
        if !checks.skip_priv && !self.has_privilege(table, PrivilegeKind::TableDelete) {
            return Err(TxnError::WriteAccessDenied { table: table_name });
        }
        let old_row = self
            .ctx
            .storage
            .read_version(table, id)?
            .ok_or_else(|| TxnError::InvalidArg(format!("record {id} does not exist in {table_name}")))?;
        if access_checked && !checks.skip_access {
            self.ctx.access.check_write(
                self.txn_id,
                table,
                &table_name,
                WriteAction::Delete,
                Some(&old_row),
                None,
            )?;
        }
        match self.ctx.storage.lock_row(self.txn_id, table, id)? {
            LockOutcome::NoChange => {}
            outcome => return Err(lock_conflict(&table_name, id, outcome)),
        }
        self.ctx
            .storage
            .delete_locked_row(self.txn_id, self.command, table, id)?;
        self.new_overrides
            .insert((table, id), VisibilityOverride::Expired);
        self.ledger.report_delete(table, id)
    }
}
