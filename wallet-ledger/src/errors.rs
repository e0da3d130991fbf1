use crate::models::{AccountId, UserId};
use rust_decimal::Decimal;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Postgres SQLSTATE codes the store cares about.
mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const CHECK_VIOLATION: &str = "23514";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Account already exists for user {0}")]
    AlreadyExists(UserId),

    #[error("Cannot transfer from account {0} to itself")]
    SelfTransfer(AccountId),

    #[error("Insufficient funds in account {account}: requested {requested}")]
    InsufficientFunds { account: AccountId, requested: Decimal },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn account_not_found(account_id: AccountId) -> Self {
        LedgerError::NotFound(format!("account {}", account_id))
    }

    pub fn user_not_found(user: impl std::fmt::Display) -> Self {
        LedgerError::NotFound(format!("account for user {}", user))
    }

    /// The resulting balance would not fit the ledger's decimal range.
    pub fn balance_out_of_range(account_id: AccountId) -> Self {
        LedgerError::InvalidAmount(format!(
            "balance of account {} would exceed ledger range",
            account_id
        ))
    }

    /// Stable tag for the API layer to map onto its own status codes.
    pub fn error_type(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::AlreadyExists(_) => "already_exists",
            LedgerError::SelfTransfer(_) => "self_transfer",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::StoreUnavailable(_) => "store_unavailable",
            LedgerError::Database(_) => "database_error",
            LedgerError::Serialization(_) => "serialization_error",
            LedgerError::Internal(_) => "internal_error",
        }
    }

    /// Whether a caller may reasonably retry. The ledger itself never does.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Conflict(_) | LedgerError::StoreUnavailable(_)
        )
    }

    /// Business rejections are expected outcomes, not infrastructure faults.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidAmount(_)
                | LedgerError::NotFound(_)
                | LedgerError::AlreadyExists(_)
                | LedgerError::SelfTransfer(_)
                | LedgerError::InsufficientFunds { .. }
        )
    }
}

/// Returns the SQLSTATE of a database error, if the driver reported one.
pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(sqlstate::UNIQUE_VIOLATION)
}

/// Whether `err` is a CHECK violation of the named constraint.
pub(crate) fn is_check_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some(sqlstate::CHECK_VIOLATION)
                && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match sqlstate(&err).as_deref() {
            Some(sqlstate::SERIALIZATION_FAILURE) | Some(sqlstate::DEADLOCK_DETECTED) => {
                return LedgerError::Conflict(err.to_string());
            }
            Some(sqlstate::UNIQUE_VIOLATION) | Some(sqlstate::CHECK_VIOLATION) => {
                return LedgerError::Conflict(err.to_string());
            }
            _ => {}
        }

        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => LedgerError::StoreUnavailable(err.to_string()),
            other => LedgerError::Database(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_unavailable() {
        let err: LedgerError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, LedgerError::StoreUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(err.error_type(), "store_unavailable");
    }

    #[test]
    fn test_row_not_found_is_database_error() {
        let err: LedgerError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, LedgerError::Database(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rejections_are_not_retryable() {
        let err = LedgerError::InsufficientFunds {
            account: AccountId(7),
            requested: Decimal::new(6000, 2),
        };
        assert!(err.is_rejection());
        assert!(!err.is_retryable());
        assert_eq!(err.error_type(), "insufficient_funds");
        assert!(err.to_string().contains("60.00"));
    }

    #[test]
    fn test_balance_out_of_range_is_a_rejection() {
        let err = LedgerError::balance_out_of_range(AccountId(4));
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        assert!(err.is_rejection());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("account 4"));
    }

    #[test]
    fn test_not_found_messages() {
        assert_eq!(
            LedgerError::account_not_found(AccountId(3)).to_string(),
            "Not found: account 3"
        );
        assert_eq!(
            LedgerError::user_not_found("alice").to_string(),
            "Not found: account for user alice"
        );
    }
}
