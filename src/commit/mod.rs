pub mod autonumber;
pub mod cascade;
pub mod chain;
pub mod ddl;
pub mod ledger;
pub mod tx;

use crate::access::AccessRegistry;
use crate::config::CoreConfig;
use crate::error::TxnError;
use crate::snapshot::MetadataStore;
use crate::storage::StorageEngine;
use autonumber::AutonumberRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

pub use ddl::{ColumnSpec, TableSpec};
pub use ledger::{ModificationLedger, TableChangeSummary};
pub use tx::{CommitReport, Transaction, TxnState};

/// Process-wide state every transaction shares.
pub struct CoreContext {
    pub(crate) config: CoreConfig,
    pub(crate) storage: Arc<dyn StorageEngine>,
    pub(crate) store: MetadataStore,
    pub(crate) autonumbers: AutonumberRegistry,
    pub(crate) access: AccessRegistry,
    /// Serializes committed-snapshot construction so versions publish in
    /// commit order.
    pub(crate) publish_lock: Mutex<()>,
    /// Held from a catalog name check until the named row is written.
    pub(crate) name_lock: Mutex<()>,
}

impl CoreContext {
    pub(crate) fn new(config: CoreConfig, storage: Arc<dyn StorageEngine>, store: MetadataStore) -> Self {
        Self {
            config,
            storage,
            store,
            autonumbers: AutonumberRegistry::new(),
            access: AccessRegistry::default(),
            publish_lock: Mutex::new(()),
            name_lock: Mutex::new(()),
        }
    }
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("config", &self.config)
            .field("published_version", &self.store.current_version())
            .field("access", &self.access)
            .finish()
    }
}

/// Scan-layer marking of one physical version within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityOverride {
    Normal,
    /// Superseded or deleted by this command.
    Expired,
    /// Reached by following a version chain during this command.
    IntroducedByChase,
    ForcedVisible,
    ForcedInvisible,
}

impl VisibilityOverride {
    /// What a command-scoped marking becomes once its command finishes.
    /// `None` clears the durable entry.
    pub fn folded(self) -> Option<VisibilityOverride> {
        match self {
            VisibilityOverride::Expired => Some(VisibilityOverride::ForcedInvisible),
            VisibilityOverride::IntroducedByChase => Some(VisibilityOverride::ForcedVisible),
            VisibilityOverride::Normal => None,
            forced @ (VisibilityOverride::ForcedVisible | VisibilityOverride::ForcedInvisible) => {
                Some(forced)
            }
        }
    }

    /// Visibility after applying this marking to what storage reported.
    pub fn apply(self, storage_visible: bool) -> bool {
        match self {
            VisibilityOverride::ForcedVisible | VisibilityOverride::IntroducedByChase => true,
            VisibilityOverride::ForcedInvisible | VisibilityOverride::Expired => false,
            VisibilityOverride::Normal => storage_visible,
        }
    }
}

const ABORT_NONE: u8 = 0;
const ABORT_DISCONNECT: u8 = 1;
const ABORT_TIMEOUT: u8 = 2;

/// Externally settable cancellation flag, sampled between row operations.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicU8>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disconnect(&self) {
        let _ = self
            .flag
            .compare_exchange(ABORT_NONE, ABORT_DISCONNECT, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn timeout(&self) {
        let _ = self
            .flag
            .compare_exchange(ABORT_NONE, ABORT_TIMEOUT, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire) != ABORT_NONE
    }

    pub(crate) fn check(&self) -> Result<(), TxnError> {
        match self.flag.load(Ordering::Acquire) {
            ABORT_DISCONNECT => Err(TxnError::Disconnect),
            ABORT_TIMEOUT => Err(TxnError::Timeout),
            _ => Ok(()),
        }
    }
}
