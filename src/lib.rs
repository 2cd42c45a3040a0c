pub mod access;
pub mod catalog;
pub mod commit;
pub mod config;
pub mod error;
#[cfg(test)]
mod lib_tests;
pub mod privilege;
pub mod snapshot;
pub mod storage;

use crate::access::AccessHandler;
use crate::catalog::bootstrap::system_indexes;
use crate::catalog::reader::read_from_storage;
use crate::catalog::types::TableId;
use crate::commit::CoreContext;
use crate::snapshot::{MetadataRef, MetadataStore};
use crate::storage::{ReadView, StorageEngine};
use std::sync::Arc;
use tracing::{info, warn};

pub use crate::access::WriteAction;
pub use crate::catalog::HotMetadata;
pub use crate::catalog::schema::OnDelete;
pub use crate::catalog::types::{ColumnType, RecordId, Row, Value};
pub use crate::commit::ddl::ReferenceSpec;
pub use crate::commit::{
    AbortHandle, ColumnSpec, CommitReport, TableSpec, Transaction, TxnState, VisibilityOverride,
};
pub use crate::config::{CoreConfig, RecoveryMode};
pub use crate::error::{Result, TxnError, TxnErrorCode};
pub use crate::privilege::{Grantability, PrivilegeDescriptor, PrivilegeKind};
pub use crate::storage::{MemoryStorage, ScanRequest};

/// First version id handed out by a freshly opened database.
const INITIAL_VERSION_ID: u32 = 1;

/// Entry point: owns the shared context and hands out transactions.
pub struct Database {
    ctx: Arc<CoreContext>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("ctx", &self.ctx).finish()
    }
}

impl Database {
    /// Opens the core on top of `storage`, reading the committed catalog.
    ///
    /// In recovery mode catalog issues are logged and the offending entries
    /// downgraded; otherwise the first issue fails the open.
    pub fn open(config: CoreConfig, storage: Arc<dyn StorageEngine>) -> Result<Self> {
        config.validate()?;
        for (index, table, column) in system_indexes() {
            storage.create_index(index, table, &[column])?;
        }
        let metadata = read_from_storage(
            storage.as_ref(),
            ReadView::as_of_commit(),
            config.is_recovery(),
            config.recovery_mode,
            INITIAL_VERSION_ID,
        )?;
        for index in metadata.live_indexes() {
            storage.create_index(index.index_id, index.table_id, &index.columns)?;
        }
        if !metadata.issues().is_empty() {
            warn!(issues = metadata.issues().len(), "catalog opened with issues");
        }
        info!(
            version_id = metadata.version_id(),
            tables = metadata.live_tables().count(),
            roles = metadata.privileges().roles().count(),
            recovery = config.is_recovery(),
            "database opened"
        );
        let store = MetadataStore::new(metadata);
        Ok(Self {
            ctx: Arc::new(CoreContext::new(config, storage, store)),
        })
    }

    /// Opens an empty in-memory database.
    pub fn open_in_memory(config: CoreConfig) -> Result<Self> {
        Self::open(config, Arc::new(MemoryStorage::new()))
    }

    /// Starts a transaction running as `role_name`.
    pub fn begin(&self, role_name: &str) -> Result<Transaction> {
        Transaction::begin(Arc::clone(&self.ctx), role_name)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.ctx.config
    }

    /// The most recently published committed snapshot.
    pub fn current_metadata(&self) -> MetadataRef {
        self.ctx.store.acquire()
    }

    pub fn current_version(&self) -> u32 {
        self.ctx.store.current_version()
    }

    pub fn register_access_handler(&self, table: TableId, handler: Arc<dyn AccessHandler>) {
        self.ctx.access.register(table, handler);
    }

    pub fn unregister_access_handler(&self, table: TableId) -> bool {
        self.ctx.access.unregister(table)
    }
}
