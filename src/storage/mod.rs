//! Row storage the transactional core runs on top of.
//!
//! The core never looks at pages or on-disk structures. It asks a
//! [`StorageEngine`] for visible versions, writes new versions, links
//! superseded ones to their successors and takes row locks.

pub mod index;
pub mod memory;

use crate::catalog::types::{ColumnId, CommandId, IndexId, RecordId, Row, TableId, TxnId, Value};
use crate::error::Result;
use std::collections::BTreeSet;
use std::ops::Bound;

pub use memory::MemoryStorage;

/// Which versions a read sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadView {
    /// Committed state only.
    Committed,
    /// Committed state plus the transaction's own writes from commands
    /// before `command_limit`.
    Txn {
        txn: TxnId,
        command_limit: CommandId,
    },
    /// Every version whose removal has not committed, whoever wrote it.
    Present,
}

impl ReadView {
    pub fn as_of_commit() -> Self {
        ReadView::Committed
    }

    pub fn txn(txn: TxnId, command_limit: CommandId) -> Self {
        ReadView::Txn { txn, command_limit }
    }

    /// The transaction's view including writes of the running command.
    pub fn txn_current(txn: TxnId) -> Self {
        ReadView::Txn {
            txn,
            command_limit: CommandId::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Eq(ColumnId, Value),
    In(ColumnId, BTreeSet<Value>),
    Range(ColumnId, Bound<Value>, Bound<Value>),
    NotNull(ColumnId),
    Records(BTreeSet<RecordId>),
}

impl Predicate {
    pub fn matches(&self, id: RecordId, row: &Row) -> bool {
        match self {
            Predicate::Eq(column, value) => row.get(*column) == value,
            Predicate::In(column, values) => values.contains(row.get(*column)),
            Predicate::Range(column, lower, upper) => {
                let value = row.get(*column);
                if value.is_null() {
                    return false;
                }
                let above = match lower {
                    Bound::Included(l) => value >= l,
                    Bound::Excluded(l) => value > l,
                    Bound::Unbounded => true,
                };
                let below = match upper {
                    Bound::Included(u) => value <= u,
                    Bound::Excluded(u) => value < u,
                    Bound::Unbounded => true,
                };
                above && below
            }
            Predicate::NotNull(column) => !row.get(*column).is_null(),
            Predicate::Records(ids) => ids.contains(&id),
        }
    }
}

/// A table scan with conjunctive search predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub table: TableId,
    pub predicates: Vec<Predicate>,
    /// Return invisible versions too, flagged as such.
    pub all_versions: bool,
}

impl ScanRequest {
    pub fn new(table: TableId) -> Self {
        Self {
            table,
            predicates: Vec::new(),
            all_versions: false,
        }
    }

    pub fn add_eq_search(mut self, column: ColumnId, value: Value) -> Self {
        self.predicates.push(Predicate::Eq(column, value));
        self
    }

    pub fn add_in_search(mut self, column: ColumnId, values: BTreeSet<Value>) -> Self {
        self.predicates.push(Predicate::In(column, values));
        self
    }

    pub fn add_range_search(mut self, column: ColumnId, lower: Bound<Value>, upper: Bound<Value>) -> Self {
        self.predicates.push(Predicate::Range(column, lower, upper));
        self
    }

    pub fn add_not_null_search(mut self, column: ColumnId) -> Self {
        self.predicates.push(Predicate::NotNull(column));
        self
    }

    pub fn add_record_search(mut self, ids: impl IntoIterator<Item = RecordId>) -> Self {
        self.predicates
            .push(Predicate::Records(ids.into_iter().collect()));
        self
    }

    pub fn with_all_versions(mut self) -> Self {
        self.all_versions = true;
        self
    }

    pub fn matches(&self, id: RecordId, row: &Row) -> bool {
        self.predicates.iter().all(|p| p.matches(id, row))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedRow {
    pub id: RecordId,
    pub row: Row,
    pub visible: bool,
}

/// Materialized cursor over scan or index results.
#[derive(Debug, Default)]
pub struct RowCursor {
    rows: std::vec::IntoIter<ScannedRow>,
}

impl RowCursor {
    pub fn new(rows: Vec<ScannedRow>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }

    pub fn next_row(&mut self) -> Option<ScannedRow> {
        self.rows.next()
    }
}

impl Iterator for RowCursor {
    type Item = ScannedRow;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller now holds the lock on an unchanged current version.
    NoChange,
    /// Another transaction holds the row.
    Retry,
    Deleted,
    /// The version has a committed successor.
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

pub trait StorageEngine: Send + Sync {
    fn begin(&self) -> TxnId;

    fn scan(&self, view: ReadView, request: &ScanRequest) -> Result<RowCursor>;

    /// Any version by id, visible or not.
    fn read_version(&self, table: TableId, id: RecordId) -> Result<Option<Row>>;

    fn lock_row(&self, txn: TxnId, table: TableId, id: RecordId) -> Result<LockOutcome>;

    /// Writes a version tagged `(txn, command)`. `hint` is the version it
    /// replaces, for placement; `cluster` asks for placement next to it.
    fn write_new_record(
        &self,
        txn: TxnId,
        command: CommandId,
        table: TableId,
        row: &Row,
        hint: Option<RecordId>,
        cluster: bool,
    ) -> Result<RecordId>;

    /// Marks `old_id` superseded by `new_id`. The caller holds the lock.
    fn register_update(
        &self,
        txn: TxnId,
        command: CommandId,
        table: TableId,
        old_id: RecordId,
        new_id: RecordId,
    ) -> Result<()>;

    fn delete_locked_row(&self, txn: TxnId, command: CommandId, table: TableId, id: RecordId) -> Result<()>;

    fn create_index(&self, index: IndexId, table: TableId, columns: &[ColumnId]) -> Result<()>;

    fn drop_index(&self, index: IndexId) -> Result<()>;

    /// Rows of the index's table whose first key column is `>= lower`
    /// (ascending) or `<= lower` (descending), in key order.
    fn range_query(
        &self,
        view: ReadView,
        index: IndexId,
        lower: &Value,
        direction: Direction,
    ) -> Result<RowCursor>;

    /// Undoes every write of `command` in `txn`.
    fn rollback_command(&self, txn: TxnId, command: CommandId) -> Result<()>;

    fn commit(&self, txn: TxnId) -> Result<()>;

    fn rollback(&self, txn: TxnId) -> Result<()>;
}
