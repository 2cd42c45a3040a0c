//! Per-transaction state machine.
//!
//! A transaction pins one metadata snapshot through its [`MetadataRef`] and
//! groups its writes into commands. Writes of a command become visible to the
//! transaction's own reads once [`Transaction::finish_command`] closes it;
//! other transactions see them only after commit.

use super::autonumber::AutonumberSource;
use super::ledger::{ModificationLedger, TableChangeSummary};
use super::{AbortHandle, CoreContext, VisibilityOverride};
use crate::catalog::HotMetadata;
use crate::catalog::reader::read_from_storage;
use crate::catalog::types::{
    ColumnId, CommandId, IndexId, ObjectId, RecordId, RoleId, TableId, TxnId,
};
use crate::error::{Result, TxnError};
use crate::privilege::{PrivilegeDescriptor, PrivilegeKind, ROOT_ROLE};
use crate::snapshot::MetadataRef;
use crate::storage::{ReadView, RowCursor, ScanRequest};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Normal,
    /// Writes fail with `ReadOnlyTransaction`.
    ReadOnly,
    /// Entered on a fatal error. Writes are dropped silently and the
    /// transaction can only roll back.
    ReadOnlyAfterError,
}

/// Privileges of the enabled roles, memoized per object until the next
/// metadata refresh or role change.
#[derive(Debug, Default)]
struct PrivilegeCache {
    memo: HashMap<ObjectId, PrivilegeDescriptor>,
}

impl PrivilegeCache {
    fn clear(&mut self) {
        self.memo.clear();
    }
}

/// What a successful commit changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub txn_id: TxnId,
    /// Version of the committed snapshot published for this commit, if it
    /// changed metadata.
    pub published_version: Option<u32>,
    pub changes: BTreeMap<TableId, TableChangeSummary>,
}

pub struct Transaction {
    pub(crate) ctx: Arc<CoreContext>,
    pub(crate) txn_id: TxnId,
    pub(crate) command: CommandId,
    state: TxnState,
    pub(crate) metadata: MetadataRef,
    pub(crate) ledger: ModificationLedger,
    /// Ledger as of the start of the running command.
    command_start: ModificationLedger,
    base_role: RoleId,
    current_role: Option<RoleId>,
    privileges: PrivilegeCache,
    overrides: BTreeMap<(TableId, RecordId), VisibilityOverride>,
    pub(crate) new_overrides: BTreeMap<(TableId, RecordId), VisibilityOverride>,
    abort: AbortHandle,
    metadata_modified: bool,
    pub(crate) created_indexes: Vec<IndexId>,
    pub(crate) dropped_indexes: Vec<IndexId>,
    pub(crate) dropped_columns: Vec<ColumnId>,
    open: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("txn_id", &self.txn_id)
            .field("command", &self.command)
            .field("state", &self.state)
            .field("base_role", &self.base_role)
            .field("current_role", &self.current_role)
            .field("metadata_version", &self.metadata.version_id())
            .field("metadata_modified", &self.metadata_modified)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn begin(ctx: Arc<CoreContext>, role_name: &str) -> Result<Self> {
        let metadata = ctx.store.acquire();
        let base_role = metadata
            .privileges()
            .role_by_name(role_name)
            .map(|r| r.role_id)
            .ok_or_else(|| TxnError::InvalidArg(format!("role {role_name} does not exist")))?;
        let txn_id = ctx.storage.begin();
        debug!(
            txn_id,
            role = base_role,
            version_id = metadata.version_id(),
            "transaction started"
        );
        Ok(Self {
            ctx,
            txn_id,
            command: 0,
            state: TxnState::Normal,
            metadata,
            ledger: ModificationLedger::new(),
            command_start: ModificationLedger::new(),
            base_role,
            current_role: None,
            privileges: PrivilegeCache::default(),
            overrides: BTreeMap::new(),
            new_overrides: BTreeMap::new(),
            abort: AbortHandle::new(),
            metadata_modified: false,
            created_indexes: Vec::new(),
            dropped_indexes: Vec::new(),
            dropped_columns: Vec::new(),
            open: true,
        })
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn command(&self) -> CommandId {
        self.command
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// The pinned snapshot. Borrows from it stay valid until this
    /// transaction refreshes its metadata.
    pub fn metadata(&self) -> &HotMetadata {
        &self.metadata
    }

    pub fn metadata_ref(&self) -> &MetadataRef {
        &self.metadata
    }

    pub fn ledger(&self) -> &ModificationLedger {
        &self.ledger
    }

    pub fn base_role(&self) -> RoleId {
        self.base_role
    }

    /// The role acting as grantor and owner: the role set with
    /// [`Transaction::set_role`], else the base role.
    pub fn effective_role(&self) -> RoleId {
        self.current_role.unwrap_or(self.base_role)
    }

    pub(crate) fn set_current_role(&mut self, role: Option<RoleId>) {
        self.current_role = role;
        self.privileges.clear();
    }

    pub(crate) fn is_root(&self) -> bool {
        self.base_role == ROOT_ROLE || self.current_role == Some(ROOT_ROLE)
    }

    pub fn is_metadata_modified(&self) -> bool {
        self.metadata_modified
    }

    pub(crate) fn mark_metadata_modified(&mut self) {
        self.metadata_modified = true;
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn check_abort_flag(&self) -> Result<()> {
        self.abort.check()
    }

    pub fn set_read_only(&mut self) {
        if self.state == TxnState::Normal {
            self.state = TxnState::ReadOnly;
        }
    }

    /// `Ok(false)` means the write must be dropped without error.
    pub(crate) fn writable(&self) -> Result<bool> {
        match self.state {
            TxnState::Normal => Ok(true),
            TxnState::ReadOnly => Err(TxnError::ReadOnlyTransaction),
            TxnState::ReadOnlyAfterError => Ok(false),
        }
    }

    /// Committed state plus this transaction's closed commands.
    pub fn read_view(&self) -> ReadView {
        ReadView::txn(self.txn_id, self.command)
    }

    /// Like [`Transaction::read_view`] but including the running command.
    pub(crate) fn current_view(&self) -> ReadView {
        ReadView::txn_current(self.txn_id)
    }

    /// Runs `op`; on failure undoes the running command before returning the
    /// error.
    pub(crate) fn guarded<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = op(self);
        if let Err(err) = &result {
            self.abort_command(err);
        }
        result
    }

    fn abort_command(&mut self, err: &TxnError) {
        if let Err(rollback_err) = self.ctx.storage.rollback_command(self.txn_id, self.command) {
            warn!(txn_id = self.txn_id, command = self.command, error = %rollback_err, "command rollback failed");
            self.state = TxnState::ReadOnlyAfterError;
        }
        self.ledger = self.command_start.clone();
        self.new_overrides.clear();
        debug!(txn_id = self.txn_id, command = self.command, code = err.code_str(), "command aborted");
        if err.is_fatal() && self.state != TxnState::ReadOnlyAfterError {
            warn!(txn_id = self.txn_id, error = %err, "transaction is read-only after error");
            self.state = TxnState::ReadOnlyAfterError;
        }
    }

    /// Closes the running command: runs referential actions for rows deleted
    /// in it, checks references, and folds its visibility overrides into the
    /// durable map.
    pub fn finish_command(&mut self) -> Result<()> {
        if self.state == TxnState::ReadOnlyAfterError {
            return Ok(());
        }
        self.guarded(Self::close_command)
    }

    fn close_command(&mut self) -> Result<()> {
        self.check_abort_flag()?;
        let deleted = self.run_cascades()?;
        self.check_restrict(&deleted)?;
        self.check_foreign_keys()?;
        for (key, marking) in std::mem::take(&mut self.new_overrides) {
            match marking.folded() {
                Some(durable) => {
                    self.overrides.insert(key, durable);
                }
                None => {
                    self.overrides.remove(&key);
                }
            }
        }
        self.command += 1;
        self.command_start = self.ledger.clone();
        Ok(())
    }

    /// Rebuilds the pinned snapshot from the catalog as this transaction sees
    /// it and resets the privilege cache.
    pub fn refresh_metadata(&mut self, tolerant: bool) -> Result<()> {
        self.guarded(|tx| tx.reload_metadata(tolerant))
    }

    fn reload_metadata(&mut self, tolerant: bool) -> Result<()> {
        let version_id = self.metadata.version_id();
        let fresh = read_from_storage(
            self.ctx.storage.as_ref(),
            self.read_view(),
            tolerant,
            self.ctx.config.recovery_mode,
            version_id,
        )?;
        if fresh.privileges().role(self.base_role).is_none() {
            return Err(TxnError::Internal(format!(
                "role {} of transaction {} no longer exists",
                self.base_role, self.txn_id
            )));
        }
        let swap = self.metadata.swap_metadata(fresh);
        if let Some(role) = self.current_role
            && self.metadata.privileges().role(role).is_none()
        {
            debug!(txn_id = self.txn_id, role, "enabled role vanished");
            self.current_role = None;
        }
        self.privileges.clear();
        debug!(txn_id = self.txn_id, command = self.command, ?swap, "metadata refreshed");
        Ok(())
    }

    /// Merged privileges of the enabled roles on `object` and its ancestors.
    pub fn get_privileges_for_object(&mut self, object: ObjectId) -> PrivilegeDescriptor {
        if let Some(held) = self.privileges.memo.get(&object) {
            return *held;
        }
        let graph = self.metadata.privileges();
        let mut held = graph.get_privileges_for_object(self.base_role, object);
        if let Some(role) = self.current_role {
            held.merge(&graph.get_privileges_for_object(role, object));
        }
        self.privileges.memo.insert(object, held);
        held
    }

    pub(crate) fn has_privilege(&mut self, object: ObjectId, kind: PrivilegeKind) -> bool {
        self.get_privileges_for_object(object).has(kind)
    }

    /// Allocates the next free key of an autonumber column.
    pub fn get_autonumber_key(&mut self, table: TableId, column: ColumnId) -> Result<i32> {
        let def = self
            .metadata
            .column(column)
            .filter(|c| c.table_id == table && self.metadata.is_live(c.column_id))
            .ok_or_else(|| {
                TxnError::InvalidArg(format!("column {column} is not a live column of table {table}"))
            })?;
        let index = if self.ctx.config.autonumber_index_lookup {
            self.metadata
                .single_column_index(table, column)
                .map(|i| i.index_id)
        } else {
            None
        };
        let source = AutonumberSource::for_column(def, index)?;
        self.ctx
            .autonumbers
            .get_autonumber_key(self.ctx.storage.as_ref(), source)
    }

    pub fn set_visibility_override(&mut self, table: TableId, id: RecordId, marking: VisibilityOverride) {
        self.new_overrides.insert((table, id), marking);
    }

    pub fn visibility_override(&self, table: TableId, id: RecordId) -> Option<VisibilityOverride> {
        self.new_overrides
            .get(&(table, id))
            .or_else(|| self.overrides.get(&(table, id)))
            .copied()
    }

    fn table_has_overrides(&self, table: TableId) -> bool {
        self.overrides
            .range((table, RecordId(0))..=(table, RecordId(u64::MAX)))
            .next()
            .is_some()
    }

    /// Visible rows of a table as this transaction sees them, after privilege
    /// checks, durable visibility overrides and row-level read access.
    pub fn scan(&mut self, request: &ScanRequest) -> Result<RowCursor> {
        self.check_abort_flag()?;
        let access_checked = self.metadata.live_table(request.table)?.access_checked;
        let table_name = self.metadata.qualified_name(request.table);
        if !self.has_privilege(request.table, PrivilegeKind::ColumnSelect)
            || (access_checked && !self.ctx.access.has_handler(request.table))
        {
            return Err(TxnError::ReadAccessDenied { table: table_name });
        }
        let overridden = self.table_has_overrides(request.table);
        let request = if overridden {
            request.clone().with_all_versions()
        } else {
            request.clone()
        };
        let mut rows = Vec::new();
        for mut scanned in self.ctx.storage.scan(self.read_view(), &request)? {
            let visible = self
                .overrides
                .get(&(request.table, scanned.id))
                .map_or(scanned.visible, |marking| marking.apply(scanned.visible));
            if !visible {
                continue;
            }
            if access_checked && !self.ctx.access.check_read(self.txn_id, request.table, &scanned.row) {
                continue;
            }
            scanned.visible = true;
            rows.push(scanned);
        }
        Ok(RowCursor::new(rows))
    }

    /// Per-table inserted/updated/deleted counts and modified columns.
    pub fn modification_summary(&self) -> BTreeMap<TableId, TableChangeSummary> {
        self.ledger.summary()
    }

    /// Closes the last command, commits storage and, when the catalog
    /// changed, publishes a committed snapshot.
    pub fn commit(mut self) -> Result<CommitReport> {
        if self.state == TxnState::ReadOnlyAfterError {
            self.release()?;
            return Err(TxnError::InvalidArg(format!(
                "transaction {} failed earlier and can only roll back",
                self.txn_id
            )));
        }
        if let Err(err) = self.finish_command() {
            self.release()?;
            return Err(err);
        }
        let changes = self.ledger.summary();
        self.ctx.storage.commit(self.txn_id)?;
        self.open = false;
        for index in std::mem::take(&mut self.dropped_indexes) {
            self.ctx.storage.drop_index(index)?;
        }
        for column in std::mem::take(&mut self.dropped_columns) {
            self.ctx.autonumbers.reset(column);
        }
        let published_version = if self.metadata_modified {
            Some(self.publish_committed()?)
        } else {
            None
        };
        debug!(txn_id = self.txn_id, tables = changes.len(), ?published_version, "transaction committed");
        Ok(CommitReport {
            txn_id: self.txn_id,
            published_version,
            changes,
        })
    }

    fn publish_committed(&self) -> Result<u32> {
        let _order = self.ctx.publish_lock.lock();
        let version_id = self.ctx.store.next_version_id();
        let committed = read_from_storage(
            self.ctx.storage.as_ref(),
            ReadView::as_of_commit(),
            true,
            self.ctx.config.recovery_mode,
            version_id,
        )
        .inspect_err(|err| {
            warn!(txn_id = self.txn_id, version_id, error = %err, "committed catalog could not be read");
        })?;
        if !self.ctx.store.publish(committed) {
            info!(version_id, "newer metadata already published");
        }
        Ok(version_id)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        for index in std::mem::take(&mut self.created_indexes) {
            self.ctx.storage.drop_index(index)?;
        }
        self.ctx.storage.rollback(self.txn_id)?;
        debug!(txn_id = self.txn_id, "transaction rolled back");
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(txn_id = self.txn_id, error = %err, "rollback on drop failed");
        }
    }
}
