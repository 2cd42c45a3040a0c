//! Per-transaction record of row effects.
//!
//! Same-transaction chains are collapsed as they are reported: the ledger
//! only ever knows the oldest original version of a logical row and its
//! latest version, never the versions in between.

use crate::catalog::types::{ColumnId, RecordId, TableId};
use crate::error::{Result, TxnError};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TableLedger {
    /// Current version -> the original it replaces, `None` for inserts.
    additions: BTreeMap<RecordId, Option<RecordId>>,
    /// Original -> its current version, `None` once deleted.
    removals: BTreeMap<RecordId, Option<RecordId>>,
    /// Column -> (current version -> original) for updates touching it.
    cell_updates: BTreeMap<ColumnId, BTreeMap<RecordId, RecordId>>,
    new_deletes: BTreeSet<RecordId>,
}

impl TableLedger {
    fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    fn forget_cells(&mut self, id: RecordId) {
        for cells in self.cell_updates.values_mut() {
            cells.remove(&id);
        }
        self.cell_updates.retain(|_, cells| !cells.is_empty());
    }

    fn rekey_cells(&mut self, from: RecordId, to: RecordId) {
        for cells in self.cell_updates.values_mut() {
            if let Some(origin) = cells.remove(&from) {
                cells.insert(to, origin);
            }
        }
    }
}

/// Per-table change counts for notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableChangeSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub modified_columns: BTreeSet<ColumnId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModificationLedger {
    tables: BTreeMap<TableId, TableLedger>,
    created_tables: BTreeSet<TableId>,
    dropped_tables: BTreeSet<TableId>,
}

impl ModificationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(TableLedger::is_empty)
    }

    /// Fails for tables dropped earlier in this transaction and not created
    /// again since.
    pub fn check_writable(&self, table: TableId) -> Result<()> {
        if self.dropped_tables.contains(&table) && !self.created_tables.contains(&table) {
            return Err(TxnError::InvalidArg(format!(
                "table {table} was dropped in this transaction"
            )));
        }
        Ok(())
    }

    fn table_mut(&mut self, table: TableId) -> Result<&mut TableLedger> {
        self.check_writable(table)?;
        Ok(self.tables.entry(table).or_default())
    }

    pub fn report_insert(&mut self, table: TableId, new_id: RecordId) -> Result<()> {
        self.table_mut(table)?.additions.insert(new_id, None);
        Ok(())
    }

    pub fn report_update(
        &mut self,
        table: TableId,
        old_id: RecordId,
        new_id: RecordId,
        modified_columns: &[ColumnId],
    ) -> Result<()> {
        let ledger = self.table_mut(table)?;
        match ledger.additions.remove(&old_id) {
            Some(origin) => {
                ledger.additions.insert(new_id, origin);
                ledger.rekey_cells(old_id, new_id);
                if let Some(origin) = origin {
                    ledger.removals.insert(origin, Some(new_id));
                    for column in modified_columns {
                        ledger
                            .cell_updates
                            .entry(*column)
                            .or_default()
                            .entry(new_id)
                            .or_insert(origin);
                    }
                }
            }
            None => {
                ledger.additions.insert(new_id, Some(old_id));
                ledger.removals.insert(old_id, Some(new_id));
                for column in modified_columns {
                    ledger
                        .cell_updates
                        .entry(*column)
                        .or_default()
                        .insert(new_id, old_id);
                }
            }
        }
        Ok(())
    }

    pub fn report_delete(&mut self, table: TableId, old_id: RecordId) -> Result<()> {
        let ledger = self.table_mut(table)?;
        match ledger.additions.remove(&old_id) {
            Some(origin) => {
                ledger.forget_cells(old_id);
                match origin {
                    Some(origin) => {
                        ledger.removals.insert(origin, None);
                        ledger.new_deletes.insert(origin);
                    }
                    // Rows referencing an own insert still need their actions.
                    None => {
                        ledger.new_deletes.insert(old_id);
                    }
                }
            }
            None => {
                ledger.removals.insert(old_id, None);
                ledger.new_deletes.insert(old_id);
            }
        }
        Ok(())
    }

    pub fn report_table_create(&mut self, table: TableId) {
        self.created_tables.insert(table);
        self.dropped_tables.remove(&table);
    }

    pub fn report_table_drop(&mut self, table: TableId) {
        self.tables.remove(&table);
        self.created_tables.remove(&table);
        self.dropped_tables.insert(table);
    }

    pub fn is_created(&self, table: TableId) -> bool {
        self.created_tables.contains(&table)
    }

    /// Drains the rows deleted since the last call: the original version,
    /// or the last version for rows this transaction inserted.
    pub fn get_new_deletes(&mut self) -> BTreeMap<TableId, BTreeSet<RecordId>> {
        let mut out = BTreeMap::new();
        for (table, ledger) in &mut self.tables {
            if !ledger.new_deletes.is_empty() {
                out.insert(*table, std::mem::take(&mut ledger.new_deletes));
            }
        }
        out
    }

    /// Current versions whose `column` cell was written by this transaction:
    /// inserted rows and updates that modified the column.
    pub fn get_added_cells(&self, table: TableId, column: ColumnId) -> Vec<RecordId> {
        let Some(ledger) = self.tables.get(&table) else {
            return Vec::new();
        };
        let mut out: BTreeSet<RecordId> = ledger
            .additions
            .iter()
            .filter(|(_, origin)| origin.is_none())
            .map(|(id, _)| *id)
            .collect();
        if let Some(cells) = ledger.cell_updates.get(&column) {
            out.extend(cells.keys().copied());
        }
        out.into_iter().collect()
    }

    /// Original versions whose `column` cell this transaction removed:
    /// deleted rows and updates that modified the column.
    pub fn get_deleted_cells(&self, table: TableId, column: ColumnId) -> Vec<RecordId> {
        let Some(ledger) = self.tables.get(&table) else {
            return Vec::new();
        };
        let mut out: BTreeSet<RecordId> = ledger
            .removals
            .iter()
            .filter(|(_, current)| current.is_none())
            .map(|(id, _)| *id)
            .collect();
        if let Some(cells) = ledger.cell_updates.get(&column) {
            out.extend(cells.values().copied());
        }
        out.into_iter().collect()
    }

    /// The original a current version replaces, if it is an addition.
    pub fn origin_of(&self, table: TableId, id: RecordId) -> Option<Option<RecordId>> {
        self.tables.get(&table)?.additions.get(&id).copied()
    }

    pub fn current_of(&self, table: TableId, original: RecordId) -> Option<Option<RecordId>> {
        self.tables.get(&table)?.removals.get(&original).copied()
    }

    pub fn additions(&self, table: TableId) -> Vec<(RecordId, Option<RecordId>)> {
        self.tables
            .get(&table)
            .map(|l| l.additions.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default()
    }

    pub fn touched_tables(&self) -> impl Iterator<Item = TableId> + '_ {
        self.tables
            .iter()
            .filter(|(_, l)| !l.is_empty())
            .map(|(t, _)| *t)
    }

    pub fn summary(&self) -> BTreeMap<TableId, TableChangeSummary> {
        self.tables
            .iter()
            .filter(|(_, l)| !l.is_empty())
            .map(|(table, ledger)| {
                let summary = TableChangeSummary {
                    inserted: ledger.additions.values().filter(|o| o.is_none()).count(),
                    updated: ledger.additions.values().filter(|o| o.is_some()).count(),
                    deleted: ledger.removals.values().filter(|c| c.is_none()).count(),
                    modified_columns: ledger.cell_updates.keys().copied().collect(),
                };
                (*table, summary)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::ModificationLedger;
    use crate::catalog::types::RecordId;
    use crate::error::TxnError;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    const T: i64 = 7;

    fn r(id: u64) -> RecordId {
        RecordId(id)
    }

    #[test]
    fn deleting_an_insert_leaves_no_changes() {
        let mut ledger = ModificationLedger::new();
        ledger.report_insert(T, r(10)).expect("insert");
        ledger.report_update(T, r(10), r(11), &[1]).expect("update");
        ledger.report_delete(T, r(11)).expect("delete");
        assert!(ledger.is_empty());
        assert!(ledger.summary().is_empty());
        assert!(ledger.get_added_cells(T, 1).is_empty());
        assert!(ledger.get_deleted_cells(T, 1).is_empty());
    }

    #[test]
    fn deleting_an_insert_still_queues_its_last_version() {
        let mut ledger = ModificationLedger::new();
        ledger.report_insert(T, r(10)).expect("insert");
        ledger.report_update(T, r(10), r(11), &[1]).expect("update");
        ledger.report_delete(T, r(11)).expect("delete");
        let deletes = ledger.get_new_deletes();
        assert_eq!(deletes.get(&T), Some(&BTreeSet::from([r(11)])));
        assert!(ledger.get_new_deletes().is_empty(), "drained");
        assert!(ledger.is_empty());
    }

    #[test]
    fn deleting_an_updated_row_reports_the_original() {
        let mut ledger = ModificationLedger::new();
        ledger.report_update(T, r(1), r(2), &[5]).expect("update");
        ledger.report_update(T, r(2), r(3), &[6]).expect("update");
        ledger.report_delete(T, r(3)).expect("delete");
        let deletes = ledger.get_new_deletes();
        assert_eq!(deletes.get(&T), Some(&BTreeSet::from([r(1)])));
        assert!(ledger.get_new_deletes().is_empty(), "drained");
        assert_eq!(ledger.get_deleted_cells(T, 5), vec![r(1)]);
        assert_eq!(ledger.current_of(T, r(1)), Some(None));
    }

    #[test]
    fn inserted_rows_count_as_added_cells_for_every_column() {
        let mut ledger = ModificationLedger::new();
        ledger.report_insert(T, r(4)).expect("insert");
        ledger.report_update(T, r(1), r(2), &[5]).expect("update");
        assert_eq!(ledger.get_added_cells(T, 5), vec![r(2), r(4)]);
        assert_eq!(ledger.get_added_cells(T, 9), vec![r(4)]);
        assert_eq!(ledger.get_deleted_cells(T, 5), vec![r(1)]);
        let summary = ledger.summary();
        let table = summary.get(&T).expect("summary");
        assert_eq!((table.inserted, table.updated, table.deleted), (1, 1, 0));
        assert_eq!(table.modified_columns, BTreeSet::from([5]));
    }

    #[test]
    fn dropped_table_is_purged_and_rejects_writes() {
        let mut ledger = ModificationLedger::new();
        ledger.report_update(T, r(1), r(2), &[5]).expect("update");
        ledger.report_delete(T, r(3)).expect("delete");
        ledger.report_table_drop(T);
        assert!(ledger.get_new_deletes().is_empty());
        assert!(matches!(ledger.report_insert(T, r(9)), Err(TxnError::InvalidArg(_))));
        ledger.report_table_create(T);
        ledger.report_insert(T, r(9)).expect("recreated");
    }

    proptest! {
        #[test]
        fn update_chains_collapse_to_one_pair(
            columns in prop::collection::vec(prop::collection::vec(0i64..6, 0..3), 1..12)
        ) {
            let mut ledger = ModificationLedger::new();
            let original = r(1);
            let mut current = original;
            let mut touched = BTreeSet::new();
            for (step, cols) in columns.iter().enumerate() {
                let next = r(100 + step as u64);
                ledger.report_update(T, current, next, cols).expect("update");
                touched.extend(cols.iter().copied());
                current = next;
            }
            prop_assert_eq!(ledger.additions(T), vec![(current, Some(original))]);
            prop_assert_eq!(ledger.current_of(T, original), Some(Some(current)));
            for column in 0i64..6 {
                let added = ledger.get_added_cells(T, column);
                let deleted = ledger.get_deleted_cells(T, column);
                if touched.contains(&column) {
                    prop_assert_eq!(added, vec![current]);
                    prop_assert_eq!(deleted, vec![original]);
                } else {
                    prop_assert!(added.is_empty());
                    prop_assert!(deleted.is_empty());
                }
            }
        }
    }
}
