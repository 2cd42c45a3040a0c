//! Gap-filling autonumber allocation.
//!
//! Each autonumber column has its own slot remembering the last value handed
//! out. Allocation holds only that slot's mutex.

use crate::catalog::schema::ColumnDef;
use crate::catalog::types::{ColumnId, IndexId, TableId, Value};
use crate::error::{Result, TxnError};
use crate::storage::{Direction, ReadView, ScanRequest, StorageEngine};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct AutonumberSlot {
    top: Option<i32>,
}

#[derive(Debug, Default)]
pub struct AutonumberRegistry {
    slots: Mutex<HashMap<ColumnId, Arc<Mutex<AutonumberSlot>>>>,
}

/// Where to look for values already taken.
#[derive(Debug, Clone, Copy)]
pub struct AutonumberSource {
    pub table: TableId,
    pub column: ColumnId,
    pub start: i32,
    pub index: Option<IndexId>,
}

impl AutonumberSource {
    pub fn for_column(column: &ColumnDef, index: Option<IndexId>) -> Result<Self> {
        let start = column.autonumber_start.ok_or_else(|| {
            TxnError::InvalidArg(format!("column {} is not an autonumber column", column.column_id))
        })?;
        Ok(Self {
            table: column.table_id,
            column: column.column_id,
            start,
            index,
        })
    }
}

/// Candidate after `value`, wrapping from `i32::MAX` to the column start.
fn successor(value: i32, start: i32) -> (i32, bool) {
    if value == i32::MAX {
        (start, true)
    } else {
        (value + 1, false)
    }
}

struct Search {
    start: i32,
    origin: i32,
    candidate: i32,
    wrapped: bool,
}

impl Search {
    /// Begins after the last issued value, or at `start` for a fresh column.
    fn new(top: Option<i32>, start: i32) -> Self {
        let (candidate, wrapped) = top.map_or((start, false), |top| successor(top, start));
        Self {
            start,
            origin: candidate,
            candidate,
            wrapped,
        }
    }

    /// Moves past a taken candidate. Fails once the search comes back round
    /// to where it began.
    fn bump(&mut self) -> Result<()> {
        let (next, wrapped) = successor(self.candidate, self.start);
        if wrapped {
            if self.wrapped {
                return Err(self.exhausted());
            }
            self.wrapped = true;
            debug!(start = self.start, "autonumber wrapped");
        }
        if self.wrapped && next == self.origin {
            return Err(self.exhausted());
        }
        self.candidate = next;
        Ok(())
    }

    fn exhausted(&self) -> TxnError {
        TxnError::Conflict(format!(
            "autonumber sequence starting at {} is exhausted",
            self.start
        ))
    }
}

fn taken_value(value: &Value) -> Option<i32> {
    value.as_i64().and_then(|v| i32::try_from(v).ok())
}

impl AutonumberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, column: ColumnId) -> Arc<Mutex<AutonumberSlot>> {
        Arc::clone(self.slots.lock().entry(column).or_default())
    }

    /// Forgets the last issued value, e.g. after the column was dropped.
    pub fn reset(&self, column: ColumnId) {
        self.slots.lock().remove(&column);
    }

    /// Lowest value at or after `top + 1` that no live version of the column
    /// holds.
    pub fn get_autonumber_key(&self, storage: &dyn StorageEngine, source: AutonumberSource) -> Result<i32> {
        let slot = self.slot(source.column);
        let mut slot = slot.lock();
        let mut search = Search::new(slot.top, source.start);
        match source.index {
            Some(index) => find_with_index(storage, index, source.column, &mut search)?,
            None => find_with_scan(storage, source, &mut search)?,
        }
        slot.top = Some(search.candidate);
        Ok(search.candidate)
    }
}

fn find_with_index(
    storage: &dyn StorageEngine,
    index: IndexId,
    column: ColumnId,
    search: &mut Search,
) -> Result<()> {
    loop {
        let wrapped_before = search.wrapped;
        let cursor = storage.range_query(
            ReadView::Present,
            index,
            &Value::Integer(i64::from(search.candidate)),
            Direction::Ascending,
        )?;
        let mut restarted = false;
        for scanned in cursor {
            let Some(value) = taken_value(scanned.row.get(column)) else {
                continue;
            };
            if value < search.candidate {
                continue;
            }
            if value > search.candidate {
                break;
            }
            search.bump()?;
            if search.wrapped != wrapped_before {
                // Values below the wrap point were never part of this cursor.
                restarted = true;
                break;
            }
        }
        if !restarted {
            return Ok(());
        }
    }
}

fn find_with_scan(storage: &dyn StorageEngine, source: AutonumberSource, search: &mut Search) -> Result<()> {
    let request = ScanRequest::new(source.table).add_not_null_search(source.column);
    loop {
        let mut bumped = false;
        for scanned in storage.scan(ReadView::Present, &request)? {
            if taken_value(scanned.row.get(source.column)) == Some(search.candidate) {
                search.bump()?;
                bumped = true;
            }
        }
        if !bumped {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AutonumberRegistry, AutonumberSource};
    use crate::catalog::types::{Row, Value};
    use crate::error::TxnError;
    use crate::storage::{MemoryStorage, StorageEngine};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    const TABLE: i64 = 300;
    const COL: i64 = 301;
    const INDEX: i64 = 309;

    fn source(start: i32, indexed: bool) -> AutonumberSource {
        AutonumberSource {
            table: TABLE,
            column: COL,
            start,
            index: indexed.then_some(INDEX),
        }
    }

    fn storage_with(values: &[i64]) -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage.create_index(INDEX, TABLE, &[COL]).expect("index");
        let txn = storage.begin();
        for v in values {
            storage
                .write_new_record(txn, 0, TABLE, &Row::new().with(COL, Value::Integer(*v)), None, false)
                .expect("write");
        }
        storage.commit(txn).expect("commit");
        storage
    }

    #[test]
    fn index_and_scan_paths_agree() {
        for indexed in [true, false] {
            // Adversarial order for the scan path: each pass finds one more.
            let storage = storage_with(&[5, 4, 3, 2, 1]);
            let registry = AutonumberRegistry::new();
            assert_eq!(registry.get_autonumber_key(&storage, source(1, indexed)).expect("key"), 6);
            assert_eq!(registry.get_autonumber_key(&storage, source(1, indexed)).expect("key"), 7);
        }
    }

    #[test]
    fn skips_values_taken_by_uncommitted_writers() {
        let storage = storage_with(&[1]);
        let writer = storage.begin();
        storage
            .write_new_record(writer, 0, TABLE, &Row::new().with(COL, Value::Integer(2)), None, false)
            .expect("write");
        let registry = AutonumberRegistry::new();
        assert_eq!(registry.get_autonumber_key(&storage, source(1, true)).expect("key"), 3);
    }

    #[test]
    fn wraps_to_start_and_fills_gaps() {
        let max = i64::from(i32::MAX);
        for indexed in [true, false] {
            let storage = storage_with(&[max - 1, max, 10, 12]);
            let registry = AutonumberRegistry::new();
            assert_eq!(registry.get_autonumber_key(&storage, source(10, indexed)).expect("key"), 11);
            // Advance the slot to just below the top.
            let registry = AutonumberRegistry::new();
            let high = source(i32::MAX - 1, indexed);
            let key = registry.get_autonumber_key(&storage, high);
            assert!(matches!(key, Err(TxnError::Conflict(_))), "{indexed}: {key:?}");
        }
    }

    #[test]
    fn exhausted_sequence_is_a_conflict() {
        let max = i64::from(i32::MAX);
        let storage = storage_with(&[max - 2, max - 1, max]);
        let registry = AutonumberRegistry::new();
        let err = registry
            .get_autonumber_key(&storage, source(i32::MAX - 2, true))
            .expect_err("exhausted");
        assert!(matches!(err, TxnError::Conflict(_)));
    }

    #[test]
    fn wrap_reuses_freed_low_values() {
        let max = i64::from(i32::MAX);
        let storage = storage_with(&[1, max]);
        let registry = AutonumberRegistry::new();
        let first = registry.get_autonumber_key(&storage, source(1, true)).expect("key");
        assert_eq!(first, 2);
        // Pretend every value up to the top has been issued.
        let registry = AutonumberRegistry::new();
        registry.slot(COL).lock().top = Some(i32::MAX - 1);
        assert_eq!(registry.get_autonumber_key(&storage, source(1, true)).expect("key"), 2);
    }

    #[test]
    fn sequence_starting_at_the_minimum_issues_it_first() {
        let min = i64::from(i32::MIN);
        for indexed in [true, false] {
            let storage = storage_with(&[]);
            let registry = AutonumberRegistry::new();
            assert_eq!(registry.get_autonumber_key(&storage, source(i32::MIN, indexed)).expect("key"), i32::MIN);
            assert_eq!(
                registry.get_autonumber_key(&storage, source(i32::MIN, indexed)).expect("key"),
                i32::MIN + 1
            );

            let storage = storage_with(&[min]);
            let registry = AutonumberRegistry::new();
            assert_eq!(
                registry.get_autonumber_key(&storage, source(i32::MIN, indexed)).expect("key"),
                i32::MIN + 1
            );
        }
    }

    proptest! {
        #[test]
        fn keys_are_the_ascending_free_values(
            taken in prop::collection::btree_set(1i64..48, 0..24),
            indexed in any::<bool>(),
        ) {
            let values: Vec<i64> = taken.iter().copied().collect();
            let storage = storage_with(&values);
            let registry = AutonumberRegistry::new();
            let expected: Vec<i32> = (1i32..).filter(|v| !taken.contains(&i64::from(*v))).take(8).collect();
            let mut issued = BTreeSet::new();
            for want in expected {
                let key = registry.get_autonumber_key(&storage, source(1, indexed)).expect("key");
                prop_assert_eq!(key, want);
                prop_assert!(issued.insert(key));
            }
        }
    }
}
