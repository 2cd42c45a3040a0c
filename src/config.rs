use crate::error::{Result, TxnError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum RecoveryMode {
    /// The first catalog issue found while reading metadata fails the read.
    #[default]
    Strict,
    /// Catalog issues are logged, the offending object is downgraded or its
    /// reference dropped, and the read carries on.
    Permissive,
}

/// Runtime configuration for the transactional core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    pub recovery_mode: RecoveryMode,
    pub cascade_enabled: bool,
    /// Write a new physical version even when an update changes nothing.
    pub clustering_updates: bool,
    pub autonumber_index_lookup: bool,
    /// Extra metadata refreshes allowed after a DDL command when grant
    /// reconciliation produced corrective writes.
    pub max_reconcile_rounds: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            recovery_mode: RecoveryMode::Strict,
            cascade_enabled: true,
            clustering_updates: false,
            autonumber_index_lookup: true,
            max_reconcile_rounds: 1,
        }
    }
}

impl CoreConfig {
    pub fn production() -> Self {
        Self {
            recovery_mode: RecoveryMode::Strict,
            ..Self::default()
        }
    }

    /// Boots on a damaged catalog: issues are collected and logged instead of
    /// failing the metadata read.
    pub fn development() -> Self {
        Self {
            recovery_mode: RecoveryMode::Permissive,
            max_reconcile_rounds: 2,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_reconcile_rounds == 0 {
            return Err(TxnError::InvalidArg(
                "max_reconcile_rounds must be at least 1".into(),
            ));
        }
        if self.max_reconcile_rounds > 16 {
            return Err(TxnError::InvalidArg(format!(
                "max_reconcile_rounds {} exceeds the limit of 16",
                self.max_reconcile_rounds
            )));
        }
        Ok(())
    }

    pub fn is_recovery(&self) -> bool {
        self.recovery_mode == RecoveryMode::Permissive
    }
}
