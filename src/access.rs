use crate::catalog::types::{Row, TableId, TxnId};
use crate::error::{Result, TxnError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteAction {
    Insert,
    Update,
    Delete,
}

/// Row-level access callbacks for an access-checked table.
pub trait AccessHandler: Send + Sync {
    fn read_access(&self, txn: TxnId, table: TableId, row: &Row) -> bool;

    /// Rejects the write with an error, typically `WriteAccessDenied`.
    fn write_access(
        &self,
        txn: TxnId,
        table: TableId,
        action: WriteAction,
        old_row: Option<&Row>,
        new_row: Option<&Row>,
    ) -> Result<()>;
}

/// Handlers by table. A table with no handler denies everything.
#[derive(Default)]
pub struct AccessRegistry {
    handlers: RwLock<HashMap<TableId, Arc<dyn AccessHandler>>>,
}

impl std::fmt::Debug for AccessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables: Vec<TableId> = self.handlers.read().keys().copied().collect();
        f.debug_struct("AccessRegistry").field("tables", &tables).finish()
    }
}

impl AccessRegistry {
    pub fn register(&self, table: TableId, handler: Arc<dyn AccessHandler>) {
        self.handlers.write().insert(table, handler);
    }

    pub fn unregister(&self, table: TableId) -> bool {
        self.handlers.write().remove(&table).is_some()
    }

    fn handler(&self, table: TableId) -> Option<Arc<dyn AccessHandler>> {
        self.handlers.read().get(&table).cloned()
    }

    pub fn check_read(&self, txn: TxnId, table: TableId, row: &Row) -> bool {
        self.handler(table)
            .is_some_and(|h| h.read_access(txn, table, row))
    }

    pub fn has_handler(&self, table: TableId) -> bool {
        self.handlers.read().contains_key(&table)
    }

    pub fn check_write(
        &self,
        txn: TxnId,
        table: TableId,
        table_name: &str,
        action: WriteAction,
        old_row: Option<&Row>,
        new_row: Option<&Row>,
    ) -> Result<()> {
        match self.handler(table) {
            Some(handler) => handler.write_access(txn, table, action, old_row, new_row),
            None => Err(TxnError::WriteAccessDenied {
                table: table_name.to_string(),
            }),
        }
    }
}
