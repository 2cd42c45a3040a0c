use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnErrorCode {
    ReadOnlyTransaction,
    Conflict,
    Constraint,
    ConstraintNotNull,
    MetadataBad,
    WriteAccessDenied,
    ReadAccessDenied,
    InvalidArg,
    Internal,
    Disconnect,
    Timeout,
}

impl TxnErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TxnErrorCode::ReadOnlyTransaction => "read_only_transaction",
            TxnErrorCode::Conflict => "conflict",
            TxnErrorCode::Constraint => "constraint",
            TxnErrorCode::ConstraintNotNull => "constraint_not_null",
            TxnErrorCode::MetadataBad => "metadata_bad",
            TxnErrorCode::WriteAccessDenied => "write_access_denied",
            TxnErrorCode::ReadAccessDenied => "read_access_denied",
            TxnErrorCode::InvalidArg => "invalid_arg",
            TxnErrorCode::Internal => "internal",
            TxnErrorCode::Disconnect => "disconnect",
            TxnErrorCode::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TxnError {
    #[error("transaction is read-only")]
    ReadOnlyTransaction,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("NOT NULL violation: column {column} in table {table}")]
    ConstraintNotNull { table: String, column: String },
    #[error("metadata inconsistent: {0}")]
    MetadataBad(String),
    #[error("write access denied on table {table}")]
    WriteAccessDenied { table: String },
    #[error("read access denied on table {table}")]
    ReadAccessDenied { table: String },
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("client disconnected")]
    Disconnect,
    #[error("timeout")]
    Timeout,
}

impl TxnError {
    pub fn code(&self) -> TxnErrorCode {
        match self {
            TxnError::ReadOnlyTransaction => TxnErrorCode::ReadOnlyTransaction,
            TxnError::Conflict(_) => TxnErrorCode::Conflict,
            TxnError::Constraint(_) => TxnErrorCode::Constraint,
            TxnError::ConstraintNotNull { .. } => TxnErrorCode::ConstraintNotNull,
            TxnError::MetadataBad(_) => TxnErrorCode::MetadataBad,
            TxnError::WriteAccessDenied { .. } => TxnErrorCode::WriteAccessDenied,
            TxnError::ReadAccessDenied { .. } => TxnErrorCode::ReadAccessDenied,
            TxnError::InvalidArg(_) => TxnErrorCode::InvalidArg,
            TxnError::Internal(_) => TxnErrorCode::Internal,
            TxnError::Disconnect => TxnErrorCode::Disconnect,
            TxnError::Timeout => TxnErrorCode::Timeout,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Errors after which the transaction may not write again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TxnError::Disconnect | TxnError::Timeout | TxnError::Internal(_)
        )
    }
}

pub type Result<T, E = TxnError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::{TxnError, TxnErrorCode};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(TxnErrorCode::Conflict.as_str(), "conflict");
        assert_eq!(
            TxnErrorCode::ConstraintNotNull.as_str(),
            "constraint_not_null"
        );
        assert_eq!(TxnErrorCode::MetadataBad.as_str(), "metadata_bad");
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = TxnError::WriteAccessDenied {
            table: "SYSTEM.ROLES".into(),
        };
        assert_eq!(err.code(), TxnErrorCode::WriteAccessDenied);
        assert_eq!(err.code_str(), "write_access_denied");
    }

    #[test]
    fn only_abort_and_internal_errors_are_fatal() {
        assert!(TxnError::Disconnect.is_fatal());
        assert!(TxnError::Timeout.is_fatal());
        assert!(TxnError::Internal("missing table".into()).is_fatal());
        assert!(!TxnError::Conflict("row locked".into()).is_fatal());
        assert!(!TxnError::Constraint("duplicate".into()).is_fatal());
    }
}
