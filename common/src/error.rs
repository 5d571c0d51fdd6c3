//! Error types for ledger operations.

use crate::{AccountId, TransactionId};
use thiserror::Error;

/// Main error type for ledger operations.
///
/// Business rejections discovered while applying a transaction (unknown
/// account, insufficient funds, ...) are not errors: they are recorded as
/// FAILED transactions so that retries replay them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed request.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
        field: Option<String>,
    },

    /// Idempotency key already used for a different request.
    #[error("Idempotency key {0} was already used for a different request")]
    IdempotencyConflict(TransactionId),

    /// Transaction not found.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Account not found.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Transaction cannot be reversed.
    #[error("Transaction {id} cannot be reversed: {reason}")]
    NotReversible { id: TransactionId, reason: String },

    /// Account status change not allowed.
    #[error("Account {account_id}: {reason}")]
    InvalidAccountTransition { account_id: AccountId, reason: String },

    /// Optimistic concurrency retries exhausted.
    #[error("Contention: gave up after {attempts} attempts")]
    Contention { attempts: u32 },

    /// A submission with the same key is still being applied.
    #[error("Transaction {0} is still in flight")]
    InFlight(TransactionId),

    /// Underlying storage could not be reached.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error (corrupt data, broken invariant).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Build an [`LedgerError::InvalidRequest`] tied to a field.
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        LedgerError::InvalidRequest {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Retrying with the same idempotency key is always safe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Contention { .. }
                | LedgerError::InFlight(_)
                | LedgerError::StorageUnavailable(_)
        )
    }

    /// Get suggested retry delay in milliseconds.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            LedgerError::Contention { .. } => Some(10),
            LedgerError::InFlight(_) => Some(100),
            LedgerError::StorageUnavailable(_) => Some(1000),
            _ => None,
        }
    }

    /// Get stable error code for transport layers.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::InvalidRequest { .. } => "INVALID_REQUEST",
            LedgerError::IdempotencyConflict(_) => "IDEMPOTENCY_CONFLICT",
            LedgerError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::NotReversible { .. } => "NOT_REVERSIBLE",
            LedgerError::InvalidAccountTransition { .. } => "INVALID_ACCOUNT_TRANSITION",
            LedgerError::Contention { .. } => "CONTENTION",
            LedgerError::InFlight(_) => "IN_FLIGHT",
            LedgerError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            LedgerError::Configuration(_) => "CONFIGURATION_ERROR",
            LedgerError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
