//! Account entity
//!
//! An account is owned by exactly one customer. The lock columns
//! (`locked_for_tx`, `active_transaction_id`, `locked_version`) form a
//! back-reference to the transaction currently owning the account; they are a
//! cached hint maintained by the lock protocol and always re-validated against
//! the transaction record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{AccountId, CustomerId, TransactionId};

/// Account product type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum AccountType {
    Savings = 1,
    Current = 2,
}

impl AccountType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(AccountType::Savings),
            2 => Some(AccountType::Current),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Savings => "savings",
            AccountType::Current => "current",
        }
    }
}

/// Lifecycle status of an account or customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum ActiveStatus {
    Active = 1,
    Inactive = 2,
    /// Administratively locked (unrelated to transaction locking)
    Locked = 3,
}

impl ActiveStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(ActiveStatus::Active),
            2 => Some(ActiveStatus::Inactive),
            3 => Some(ActiveStatus::Locked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveStatus::Active => "active",
            ActiveStatus::Inactive => "inactive",
            ActiveStatus::Locked => "locked",
        }
    }
}

/// Soft-delete status of an account or customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum RecordStatus {
    Valid = 1,
    /// Soft-deleted
    Invalid = 0,
}

impl RecordStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(RecordStatus::Valid),
            0 => Some(RecordStatus::Invalid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Valid => "valid",
            RecordStatus::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub customer_id: CustomerId,
    /// Never negative; scale `money::MONEY_SCALE`
    pub balance: Decimal,
    pub account_type: AccountType,
    pub active_status: ActiveStatus,
    pub status: RecordStatus,
    pub locked_for_tx: bool,
    pub active_transaction_id: Option<TransactionId>,
    /// `version` snapshot taken when the current lock was acquired
    pub locked_version: Option<i64>,
    /// Optimistic concurrency version, starts at 1
    pub version: i64,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new, valid, active and unlocked account at version 1
    pub fn new(
        customer_id: CustomerId,
        account_type: AccountType,
        balance: Decimal,
        actor: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AccountId::new(),
            customer_id,
            balance,
            account_type,
            active_status: ActiveStatus::Active,
            status: RecordStatus::Valid,
            locked_for_tx: false,
            active_transaction_id: None,
            locked_version: None,
            version: 1,
            created_by: actor.to_string(),
            updated_by: actor.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// True iff the account may join a new transaction
    pub fn can_transact(&self) -> bool {
        self.status == RecordStatus::Valid
            && self.active_status == ActiveStatus::Active
            && !self.locked_for_tx
            && self.active_transaction_id.is_none()
    }

    /// True iff the account is locked to exactly `tx_id`
    pub fn is_locked_by(&self, tx_id: &TransactionId) -> bool {
        self.locked_for_tx && self.active_transaction_id.as_ref() == Some(tx_id)
    }

    /// The lock flag and the back-reference must agree
    pub fn lock_state_consistent(&self) -> bool {
        self.locked_for_tx == self.active_transaction_id.is_some()
    }

    /// Balance was written after the current lock was taken
    pub fn changed_under_lock(&self) -> bool {
        match self.locked_version {
            Some(v) => self.locked_for_tx && self.version != v,
            None => false,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status == RecordStatus::Invalid
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Account[{}] {} balance={} v{}{}",
            self.id,
            self.account_type.as_str(),
            self.balance,
            self.version,
            match &self.active_transaction_id {
                Some(tx) => format!(" locked_by={}", tx),
                None => String::new(),
            }
        )
    }
}
