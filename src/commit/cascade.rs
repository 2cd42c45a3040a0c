//! Referential actions run when a command finishes.
//!
//! Deleted originals drained from the ledger are turned into the key values
//! they took with them. Referencing rows are then deleted (cascade) or reset
//! to their default (set default); those writes feed the ledger again, so the
//! loop runs until no new deletes appear.

use super::chain::WriteChecks;
use super::tx::Transaction;
use crate::catalog::schema::{ColumnDef, OnDelete};
use crate::catalog::types::{ColumnId, RecordId, Row, TableId, Value};
use crate::error::{Result, TxnError};
use crate::storage::ScanRequest;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Deleted originals per table, accumulated over every cascade round.
pub(crate) type DeletedRows = BTreeMap<TableId, BTreeSet<RecordId>>;

/// A referencing column resolved against the pinned snapshot.
#[derive(Debug, Clone)]
struct Referrer {
    column: ColumnDef,
    key_column: ColumnId,
}

impl Transaction {
    fn referrers(&self, table: TableId) -> Vec<Referrer> {
        self.metadata
            .referencing_columns(table)
            .into_iter()
            .filter_map(|column| {
                let key_column = self.metadata.referenced_key_column(column)?;
                Some(Referrer {
                    column: column.clone(),
                    key_column,
                })
            })
            .collect()
    }

    /// Key values carried away by `deleted` that no visible row of `table`
    /// still holds.
    fn vanished_keys(
        &self,
        table: TableId,
        key_column: ColumnId,
        deleted: &BTreeSet<RecordId>,
    ) -> Result<BTreeSet<Value>> {
        let mut keys = BTreeSet::new();
        for id in deleted {
            if let Some(row) = self.ctx.storage.read_version(table, *id)? {
                let value = row.get(key_column);
                if !value.is_null() {
                    keys.insert(value.clone());
                }
            }
        }
        if keys.is_empty() {
            return Ok(keys);
        }
        let request = ScanRequest::new(table).add_in_search(key_column, keys.clone());
        for scanned in self.ctx.storage.scan(self.current_view(), &request)? {
            keys.remove(scanned.row.get(key_column));
        }
        Ok(keys)
    }

    fn referencing_rows(&self, referrer: &Referrer, keys: &BTreeSet<Value>) -> Result<Vec<(RecordId, Row)>> {
        let request = ScanRequest::new(referrer.column.table_id)
            .add_in_search(referrer.column.column_id, keys.clone());
        Ok(self
            .ctx
            .storage
            .scan(self.current_view(), &request)?
            .map(|scanned| (scanned.id, scanned.row))
            .collect())
    }

    /// Drains the ledger's new deletes until none are left, applying
    /// cascade and set-default actions when enabled. Returns every deleted
    /// original seen.
    pub(crate) fn run_cascades(&mut self) -> Result<DeletedRows> {
        let mut seen = DeletedRows::new();
        loop {
            let batch = self.ledger.get_new_deletes();
            if batch.is_empty() {
                return Ok(seen);
            }
            for (table, ids) in batch {
                self.check_abort_flag()?;
                if self.ctx.config.cascade_enabled {
                    self.apply_referential_actions(table, &ids)?;
                }
                seen.entry(table).or_default().extend(ids);
            }
        }
    }

    fn apply_referential_actions(&mut self, table: TableId, ids: &BTreeSet<RecordId>) -> Result<()> {
        let referrers = self.referrers(table);
        for action in [OnDelete::Cascade, OnDelete::SetDefault] {
            for referrer in referrers.iter().filter(|r| r.column.on_delete == action) {
                let keys = self.vanished_keys(table, referrer.key_column, ids)?;
                if keys.is_empty() {
                    continue;
                }
                let rows = self.referencing_rows(referrer, &keys)?;
                debug!(
                    txn_id = self.txn_id,
                    table,
                    referencing = referrer.column.column_id,
                    ?action,
                    rows = rows.len(),
                    "referential action"
                );
                for (id, row) in rows {
                    self.check_abort_flag()?;
                    match action {
                        OnDelete::Cascade => {
                            self.delete_version(referrer.column.table_id, id, WriteChecks::SYSTEM)?;
                        }
                        _ => {
                            let default = referrer.column.default_value()?;
                            self.write_version(
                                referrer.column.table_id,
                                Some(id),
                                &row,
                                &[(referrer.column.column_id, default)],
                                WriteChecks::SYSTEM,
                            )?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Fails if a deleted key is still referenced by a row no action
    /// removed.
    pub(crate) fn check_restrict(&self, deleted: &DeletedRows) -> Result<()> {
        for (table, ids) in deleted {
            for referrer in self.referrers(*table) {
                if self.ctx.config.cascade_enabled && referrer.column.on_delete != OnDelete::Illegal {
                    continue;
                }
                let keys = self.vanished_keys(*table, referrer.key_column, ids)?;
                if keys.is_empty() {
                    continue;
                }
                if let Some((id, _)) = self.referencing_rows(&referrer, &keys)?.first() {
                    return Err(TxnError::Constraint(format!(
                        "row {id} of {} still references a deleted key of {}",
                        self.metadata.qualified_name(referrer.column.table_id),
                        self.metadata.qualified_name(*table)
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every reference cell written by this transaction must point at an
    /// existing key.
    pub(crate) fn check_foreign_keys(&self) -> Result<()> {
        let tables: Vec<TableId> = self.ledger.touched_tables().collect();
        for table in tables {
            for column in self.metadata.columns_of(table) {
                if !column.has_reference() {
                    continue;
                }
                let (Some(target), Some(key_column)) = (
                    self.metadata.referenced_table(column),
                    self.metadata.referenced_key_column(column),
                ) else {
                    continue;
                };
                let mut wanted = BTreeSet::new();
                for id in self.ledger.get_added_cells(table, column.column_id) {
                    if let Some(row) = self.ctx.storage.read_version(table, id)? {
                        let value = row.get(column.column_id);
                        if !value.is_null() {
                            wanted.insert(value.clone());
                        }
                    }
                }
                if wanted.is_empty() {
                    continue;
                }
                let request = ScanRequest::new(target).add_in_search(key_column, wanted.clone());
                for scanned in self.ctx.storage.scan(self.current_view(), &request)? {
                    wanted.remove(scanned.row.get(key_column));
                }
                if let Some(missing) = wanted.first() {
                    return Err(TxnError::Constraint(format!(
                        "{} references missing key {missing:?} in {}",
                        self.metadata.qualified_name(column.column_id),
                        self.metadata.qualified_name(target)
                    )));
                }
            }
        }
        Ok(())
    }
}
