use crate::catalog::types::{ColumnId, CommandId, IndexId, RecordId, Row, TableId, TxnId, Value};
use crate::error::{Result, TxnError};
use crate::storage::index::OrderedIndex;
use crate::storage::{
    Direction, LockOutcome, ReadView, RowCursor, ScanRequest, ScannedRow, StorageEngine,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    txn: TxnId,
    command: CommandId,
    committed: bool,
}

impl Stamp {
    fn seen_by(&self, view: ReadView) -> bool {
        match view {
            ReadView::Committed => self.committed,
            ReadView::Txn { txn, command_limit } => {
                self.committed || (self.txn == txn && self.command < command_limit)
            }
            ReadView::Present => true,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredVersion {
    table: TableId,
    row: Row,
    created: Stamp,
    expired: Option<Stamp>,
    successor: Option<RecordId>,
    locked_by: Option<TxnId>,
}

impl StoredVersion {
    fn visible(&self, view: ReadView) -> bool {
        let created = match view {
            ReadView::Present => true,
            _ => self.created.seen_by(view),
        };
        let expired = match (view, self.expired) {
            (_, None) => false,
            (ReadView::Present, Some(stamp)) => stamp.committed,
            (_, Some(stamp)) => stamp.seen_by(view),
        };
        created && !expired
    }
}

#[derive(Debug, Default)]
struct TxnWrites {
    created: Vec<RecordId>,
    expired: Vec<RecordId>,
    locked: BTreeSet<RecordId>,
}

#[derive(Debug, Default)]
struct Inner {
    next_txn: TxnId,
    next_record: u64,
    versions: BTreeMap<RecordId, StoredVersion>,
    tables: BTreeMap<TableId, BTreeSet<RecordId>>,
    indexes: BTreeMap<IndexId, OrderedIndex>,
    active: BTreeMap<TxnId, TxnWrites>,
}

impl Inner {
    fn writes(&mut self, txn: TxnId) -> Result<&mut TxnWrites> {
        self.active
            .get_mut(&txn)
            .ok_or_else(|| TxnError::InvalidArg(format!("transaction {txn} is not active")))
    }

    fn version_mut(&mut self, table: TableId, id: RecordId) -> Result<&mut StoredVersion> {
        match self.versions.get_mut(&id) {
            Some(version) if version.table == table => Ok(version),
            _ => Err(TxnError::InvalidArg(format!(
                "record {id} does not exist in table {table}"
            ))),
        }
    }

    fn index_version(&mut self, id: RecordId) {
        let Some(version) = self.versions.get(&id) else {
            return;
        };
        for index in self.indexes.values_mut() {
            if index.table_id == version.table {
                index.insert(&version.row, id);
            }
        }
    }

    fn forget_version(&mut self, id: RecordId) {
        let Some(version) = self.versions.remove(&id) else {
            return;
        };
        if let Some(ids) = self.tables.get_mut(&version.table) {
            ids.remove(&id);
        }
        for index in self.indexes.values_mut() {
            if index.table_id == version.table {
                index.remove(&version.row, id);
            }
        }
    }

    /// Clears expiry stamps of `txn` on `ids` that match `filter`.
    fn restore_expired(&mut self, txn: TxnId, ids: &[RecordId], filter: impl Fn(&Stamp) -> bool) {
        for id in ids {
            if let Some(version) = self.versions.get_mut(id)
                && let Some(stamp) = version.expired
                && stamp.txn == txn
                && filter(&stamp)
            {
                version.expired = None;
                version.successor = None;
            }
        }
    }

    fn cursor(&self, ids: impl Iterator<Item = RecordId>, view: ReadView, request: Option<&ScanRequest>) -> RowCursor {
        let all_versions = request.is_some_and(|r| r.all_versions);
        let rows = ids
            .filter_map(|id| self.versions.get(&id).map(|v| (id, v)))
            .filter_map(|(id, version)| {
                let visible = version.visible(view);
                if !visible && !all_versions {
                    return None;
                }
                if let Some(request) = request
                    && !request.matches(id, &version.row)
                {
                    return None;
                }
                Some(ScannedRow {
                    id,
                    row: version.row.clone(),
                    visible,
                })
            })
            .collect();
        RowCursor::new(rows)
    }
}

/// Multi-version row store held entirely in memory.
///
/// Every write creates a version stamped with its transaction and command;
/// commit flips the stamps of that transaction to committed and rollback
/// removes them.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version_count(&self) -> usize {
        self.inner.lock().versions.len()
    }

    pub fn active_transactions(&self) -> usize {
        self.inner.lock().active.len()
    }
}

impl StorageEngine for MemoryStorage {
    fn begin(&self) -> TxnId {
        let mut inner = self.inner.lock();
        inner.next_txn += 1;
        let txn = inner.next_txn;
        inner.active.insert(txn, TxnWrites::default());
        txn
    }

    fn scan(&self, view: ReadView, request: &ScanRequest) -> Result<RowCursor> {
        let inner = self.inner.lock();
        let Some(ids) = inner.tables.get(&request.table) else {
            return Ok(RowCursor::default());
        };
        Ok(inner.cursor(ids.iter().copied(), view, Some(request)))
    }

    fn read_version(&self, table: TableId, id: RecordId) -> Result<Option<Row>> {
        let inner = self.inner.lock();
        Ok(inner
            .versions
            .get(&id)
            .filter(|v| v.table == table)
            .map(|v| v.row.clone()))
    }

    fn lock_row(&self, txn: TxnId, table: TableId, id: RecordId) -> Result<LockOutcome> {
        let mut inner = self.inner.lock();
        let version = inner.version_mut(table, id)?;
        if let Some(holder) = version.locked_by
            && holder != txn
        {
            return Ok(LockOutcome::Retry);
        }
        if let Some(stamp) = version.expired {
            if !stamp.committed && stamp.txn != txn {
                return Ok(LockOutcome::Retry);
            }
            return Ok(if version.successor.is_some() {
                LockOutcome::Updated
            } else {
                LockOutcome::Deleted
            });
        }
        if !version.created.committed && version.created.txn != txn {
            return Ok(LockOutcome::Retry);
        }
        version.locked_by = Some(txn);
        inner.writes(txn)?.locked.insert(id);
        Ok(LockOutcome::NoChange)
    }

    fn write_new_record(
        &self,
        txn: TxnId,
        command: CommandId,
        table: TableId,
        row: &Row,
        hint: Option<RecordId>,
        _cluster: bool,
    ) -> Result<RecordId> {
        let mut inner = self.inner.lock();
        if let Some(hint) = hint
            && !inner.versions.contains_key(&hint)
        {
            return Err(TxnError::InvalidArg(format!("placement hint {hint} does not exist")));
        }
        inner.next_record += 1;
        let id = RecordId(inner.next_record);
        inner.writes(txn)?.created.push(id);
        inner.versions.insert(
            id,
            StoredVersion {
                table,
                row: row.clone(),
                created: Stamp {
                    txn,
                    command,
                    committed: false,
                },
                expired: None,
                successor: None,
                locked_by: Some(txn),
            },
        );
        inner.tables.entry(table).or_default().insert(id);
        inner.index_version(id);
        Ok(id)
    }

    fn register_update(
        &self,
        txn: TxnId,
        command: CommandId,
        table: TableId,
        old_id: RecordId,
        new_id: RecordId,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.versions.contains_key(&new_id) {
            return Err(TxnError::Internal(format!("successor {new_id} was never written")));
        }
        let version = inner.version_mut(table, old_id)?;
        if version.locked_by != Some(txn) {
            return Err(TxnError::Conflict(format!("record {old_id} is not locked by {txn}")));
        }
        version.expired = Some(Stamp {
            txn,
            command,
            committed: false,
        });
        version.successor = Some(new_id);
        inner.writes(txn)?.expired.push(old_id);
        Ok(())
    }

    fn delete_locked_row(&self, txn: TxnId, command: CommandId, table: TableId, id: RecordId) -> Result<()> {
        let mut inner = self.inner.lock();
        let version = inner.version_mut(table, id)?;
        if version.locked_by != Some(txn) {
            return Err(TxnError::Conflict(format!("record {id} is not locked by {txn}")));
        }
        version.expired = Some(Stamp {
            txn,
            command,
            committed: false,
        });
        inner.writes(txn)?.expired.push(id);
        Ok(())
    }

    fn create_index(&self, index: IndexId, table: TableId, columns: &[ColumnId]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.indexes.contains_key(&index) {
            return Ok(());
        }
        let mut built = OrderedIndex::new(index, table, columns.to_vec());
        if let Some(ids) = inner.tables.get(&table) {
            for id in ids {
                if let Some(version) = inner.versions.get(id) {
                    built.insert(&version.row, *id);
                }
            }
        }
        inner.indexes.insert(index, built);
        Ok(())
    }

    fn drop_index(&self, index: IndexId) -> Result<()> {
        self.inner.lock().indexes.remove(&index);
        Ok(())
    }

    fn range_query(
        &self,
        view: ReadView,
        index: IndexId,
        lower: &Value,
        direction: Direction,
    ) -> Result<RowCursor> {
        let inner = self.inner.lock();
        let built = inner
            .indexes
            .get(&index)
            .ok_or_else(|| TxnError::InvalidArg(format!("index {index} does not exist")))?;
        let ids = built.scan_from(lower, direction);
        Ok(inner.cursor(ids.into_iter(), view, None))
    }

    fn rollback_command(&self, txn: TxnId, command: CommandId) -> Result<()> {
        let mut inner = self.inner.lock();
        let writes = inner.writes(txn)?;
        let created = std::mem::take(&mut writes.created);
        let expired = std::mem::take(&mut writes.expired);
        let (undone, kept): (Vec<RecordId>, Vec<RecordId>) = created.into_iter().partition(|id| {
            inner_created_in(&inner.versions, *id, command)
        });
        for id in &undone {
            inner.forget_version(*id);
        }
        inner.restore_expired(txn, &expired, |stamp| stamp.command == command);
        let expired_kept: Vec<RecordId> = expired
            .into_iter()
            .filter(|id| inner.versions.get(id).is_some_and(|v| v.expired.is_some()))
            .collect();
        let writes = inner.writes(txn)?;
        writes.created = kept;
        writes.expired = expired_kept;
        debug!(txn, command, undone = undone.len(), "command rolled back");
        Ok(())
    }

    fn commit(&self, txn: TxnId) -> Result<()> {
        let mut inner = self.inner.lock();
        let writes = inner
            .active
            .remove(&txn)
            .ok_or_else(|| TxnError::InvalidArg(format!("transaction {txn} is not active")))?;
        for id in &writes.created {
            if let Some(version) = inner.versions.get_mut(id) {
                version.created.committed = true;
            }
        }
        for id in &writes.expired {
            if let Some(version) = inner.versions.get_mut(id)
                && let Some(stamp) = version.expired.as_mut()
                && stamp.txn == txn
            {
                stamp.committed = true;
            }
        }
        for id in writes.locked.iter().chain(writes.created.iter()) {
            if let Some(version) = inner.versions.get_mut(id) {
                version.locked_by = None;
            }
        }
        Ok(())
    }

    fn rollback(&self, txn: TxnId) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(writes) = inner.active.remove(&txn) else {
            return Ok(());
        };
        for id in &writes.created {
            inner.forget_version(*id);
        }
        inner.restore_expired(txn, &writes.expired, |_| true);
        for id in &writes.locked {
            if let Some(version) = inner.versions.get_mut(id) {
                version.locked_by = None;
            }
        }
        Ok(())
    }
}

fn inner_created_in(versions: &BTreeMap<RecordId, StoredVersion>, id: RecordId, command: CommandId) -> bool {
    versions.get(&id).is_some_and(|v| v.created.command == command)
}
