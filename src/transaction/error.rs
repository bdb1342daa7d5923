//! Bank Error Types
//!
//! Every operation of the transaction core returns one of these kinds. The
//! surrounding services map `code()` to their transport status codes.

use thiserror::Error;

use crate::models::ids::{AccountId, CustomerId, TransactionId};
use crate::money::MoneyError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BankError {
    // === Validation Errors ===
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid transaction type: {0}")]
    InvalidTransactionType(String),

    #[error("Source and destination account cannot be the same")]
    SameAccountTransfer,

    #[error("Transfer requires a destination account")]
    MissingDestinationAccount,

    // === Idempotency Errors ===
    #[error("Duplicate reference id: {0}")]
    DuplicateReference(String),

    // === Lookup Errors ===
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Customer not found: {0}")]
    CustomerNotFound(CustomerId),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    // === Account State Errors ===
    #[error("Account {0} is locked by another transaction")]
    AccountLocked(AccountId),

    #[error("Account {0} is not active")]
    AccountInactive(AccountId),

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Account balance is already empty")]
    AccountEmpty,

    // === Concurrency Errors ===
    #[error("Version conflict: {0}")]
    Conflict(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Lock inconsistent: expected {expected} locked accounts, found {actual}")]
    LockInconsistent { expected: usize, actual: usize },

    // === Lifecycle Errors ===
    #[error("Transaction already completed")]
    TransactionCompleted,

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    // === System Errors ===
    #[error("Store error: {0}")]
    Store(String),
}

impl BankError {
    /// Stable error code for callers
    pub fn code(&self) -> &'static str {
        match self {
            BankError::Validation(_) => "VALIDATION",
            BankError::InvalidAmount(_) => "INVALID_AMOUNT",
            BankError::InvalidTransactionType(_) => "INVALID_TRANSACTION_TYPE",
            BankError::SameAccountTransfer => "SAME_ACCOUNT_TRANSFER",
            BankError::MissingDestinationAccount => "MISSING_DESTINATION_ACCOUNT",
            BankError::DuplicateReference(_) => "DUPLICATE_REFERENCE",
            BankError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            BankError::CustomerNotFound(_) => "CUSTOMER_NOT_FOUND",
            BankError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            BankError::AccountLocked(_) => "ACCOUNT_LOCKED",
            BankError::AccountInactive(_) => "ACCOUNT_INACTIVE",
            BankError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            BankError::AccountEmpty => "ACCOUNT_EMPTY",
            BankError::Conflict(_) => "CONFLICT",
            BankError::Timeout(_) => "TIMEOUT",
            BankError::LockInconsistent { .. } => "LOCK_INCONSISTENT",
            BankError::TransactionCompleted => "TRANSACTION_COMPLETED",
            BankError::TransactionFailed(_) => "TRANSACTION_FAILED",
            BankError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            BankError::Store(_) => "STORE_ERROR",
        }
    }

    /// Whether the caller may retry the same request after reloading
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BankError::Conflict(_) | BankError::Timeout(_) | BankError::Store(_)
        )
    }
}

impl From<sqlx::Error> for BankError {
    fn from(e: sqlx::Error) -> Self {
        BankError::Store(e.to_string())
    }
}

impl From<MoneyError> for BankError {
    fn from(e: MoneyError) -> Self {
        BankError::InvalidAmount(e.to_string())
    }
}
