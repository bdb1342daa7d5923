//! Transaction entity and its lifecycle predicates
//!
//! ```text
//! PENDING ──commit──▶ COMPLETED
//!    │  ╲
//!    │   ╲──recovery retry──▶ RECOVERING ──commit──▶ COMPLETED
//!    ▼                            │
//! FAILED ◀────────────────────────┘   (timeout / max retries / commit failure)
//! CANCELLED (terminal, set by operators)
//! ```
//!
//! Terminal statuses never change again and their balances are final.

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::ids::{AccountId, TransactionId};
use crate::money;
use crate::transaction::error::BankError;

/// Maximum recovery retries before a transaction is failed
pub const MAX_RETRIES: i32 = 3;

/// Default time a transaction may stay non-terminal
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum TransactionType {
    /// Move funds between two accounts
    Transfer = 1,
    /// Drain the source account to zero
    WithdrawFull = 2,
    /// Withdraw part of the source balance
    WithdrawAmount = 3,
    /// Deposit into the source account
    AddAmount = 4,
}

impl TransactionType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(TransactionType::Transfer),
            2 => Some(TransactionType::WithdrawFull),
            3 => Some(TransactionType::WithdrawAmount),
            4 => Some(TransactionType::AddAmount),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Transfer => "transfer",
            TransactionType::WithdrawFull => "withdraw_full",
            TransactionType::WithdrawAmount => "withdraw_amount",
            TransactionType::AddAmount => "add_amount",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = BankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transfer" => Ok(TransactionType::Transfer),
            "withdraw_full" => Ok(TransactionType::WithdrawFull),
            "withdraw_amount" => Ok(TransactionType::WithdrawAmount),
            "add_amount" => Ok(TransactionType::AddAmount),
            other => Err(BankError::InvalidTransactionType(other.to_string())),
        }
    }
}

/// Transaction lifecycle status
///
/// Terminal: COMPLETED, FAILED, CANCELLED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TransactionStatus {
    /// Persisted and (after lifecycle begin) owning its participant locks
    Pending = 0,
    /// Picked up by recovery for a retry
    Recovering = 10,
    /// Terminal: balances applied
    Completed = 40,
    /// Terminal: no balances applied
    Failed = -10,
    /// Terminal: withdrawn before commit
    Cancelled = -20,
}

impl TransactionStatus {
    pub const TERMINAL: [TransactionStatus; 3] = [
        TransactionStatus::Completed,
        TransactionStatus::Failed,
        TransactionStatus::Cancelled,
    ];

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::Cancelled
        )
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransactionStatus::Pending),
            10 => Some(TransactionStatus::Recovering),
            40 => Some(TransactionStatus::Completed),
            -10 => Some(TransactionStatus::Failed),
            -20 => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Recovering => "RECOVERING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub source_account_id: AccountId,
    /// Present iff `tx_type == Transfer`
    pub destination_account_id: Option<AccountId>,
    pub amount: Decimal,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    /// Caller-supplied idempotency key, unique across all transactions
    pub reference_id: String,
    pub timeout_at: DateTime<Utc>,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub error_reason: Option<String>,
    pub version: i64,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Create a new PENDING transaction with a fresh id
    ///
    /// `withdraw_full` always carries amount 0 and no destination.
    pub fn new(
        source: AccountId,
        destination: Option<AccountId>,
        amount: Decimal,
        tx_type: TransactionType,
        reference_id: &str,
        actor: &str,
        timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        let (amount, destination) = match tx_type {
            TransactionType::WithdrawFull => (Decimal::ZERO, None),
            _ => (amount, destination),
        };
        let timeout_at = TimeDelta::from_std(timeout)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            id: TransactionId::new(),
            source_account_id: source,
            destination_account_id: destination,
            amount,
            tx_type,
            status: TransactionStatus::Pending,
            reference_id: reference_id.to_string(),
            timeout_at,
            retry_count: 0,
            last_retry_at: None,
            error_reason: None,
            version: 1,
            created_by: actor.to_string(),
            updated_by: actor.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Enforce the type/amount matrix
    pub fn validate(&self) -> Result<(), BankError> {
        if self.reference_id.trim().is_empty() {
            return Err(BankError::Validation("reference id is required".into()));
        }
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            return Err(BankError::InvalidAmount("amount must not be negative".into()));
        }
        money::normalize(self.amount)?;

        match self.tx_type {
            TransactionType::Transfer => {
                let dest = self
                    .destination_account_id
                    .ok_or(BankError::MissingDestinationAccount)?;
                if dest == self.source_account_id {
                    return Err(BankError::SameAccountTransfer);
                }
                if self.amount <= Decimal::ZERO {
                    return Err(BankError::InvalidAmount("amount must be positive".into()));
                }
            }
            TransactionType::WithdrawAmount | TransactionType::AddAmount => {
                if self.destination_account_id.is_some() {
                    return Err(BankError::Validation(format!(
                        "{} does not take a destination account",
                        self.tx_type
                    )));
                }
                if self.amount <= Decimal::ZERO {
                    return Err(BankError::InvalidAmount("amount must be positive".into()));
                }
            }
            TransactionType::WithdrawFull => {
                if !self.amount.is_zero() {
                    return Err(BankError::InvalidAmount(
                        "withdraw_full carries no amount".into(),
                    ));
                }
                if self.destination_account_id.is_some() {
                    return Err(BankError::Validation(
                        "withdraw_full does not take a destination account".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    #[inline]
    pub fn requires_destination_account(&self) -> bool {
        self.tx_type == TransactionType::Transfer
    }

    /// Participants: `[source]` or `[source, destination]`
    pub fn accounts_to_lock(&self) -> Vec<AccountId> {
        match (self.requires_destination_account(), self.destination_account_id) {
            (true, Some(dest)) => vec![self.source_account_id, dest],
            _ => vec![self.source_account_id],
        }
    }

    /// Number of accounts that must be locked to this transaction
    #[inline]
    pub fn expected_lock_count(&self) -> usize {
        if self.requires_destination_account() { 2 } else { 1 }
    }

    pub fn is_participant(&self, account_id: &AccountId) -> bool {
        self.source_account_id == *account_id
            || self.destination_account_id.as_ref() == Some(account_id)
    }

    pub fn should_timeout(&self) -> bool {
        self.should_timeout_at(Utc::now())
    }

    pub fn should_timeout_at(&self, now: DateTime<Utc>) -> bool {
        now > self.timeout_at
    }

    /// `retry_count < MAX_RETRIES` and not timed out
    pub fn can_retry(&self) -> bool {
        self.can_retry_with(MAX_RETRIES, Utc::now())
    }

    pub fn can_retry_with(&self, max_retries: i32, now: DateTime<Utc>) -> bool {
        self.retry_count < max_retries && !self.should_timeout_at(now)
    }

    /// Count a retry and hand the transaction to recovery
    pub fn mark_for_retry(&mut self, actor: &str) {
        let now = Utc::now();
        self.retry_count += 1;
        self.last_retry_at = Some(now);
        self.status = TransactionStatus::Recovering;
        self.updated_by = actor.to_string();
        self.updated_at = now;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction[{}] {} {} amount={} ref={} status={}",
            self.id,
            self.tx_type,
            self.source_account_id,
            self.amount,
            self.reference_id,
            self.status
        )
    }
}
