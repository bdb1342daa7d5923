//! Persistence ports
//!
//! The transaction core talks to storage only through these traits. Each
//! method documents its atomicity boundary; implementations must honor it.
//!
//! - [`memory::InMemoryStore`] - single-mutex store used by tests and local runs
//! - [`postgres::PgStore`] - sqlx/PostgreSQL store
//!
//! Lock columns are not versioned: `version` increments only on balance writes
//! and record-status changes. Locking snapshots `version` into
//! `locked_version`, which lets recovery detect balances written under a lock.

pub mod memory;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::{
    Account, AccountId, Customer, CustomerId, Event, Transaction, TransactionId,
    TransactionStatus, TransactionType,
};
use crate::transaction::error::BankError;

pub use memory::{Fault, InMemoryStore};
pub use postgres::PgStore;

/// One leg of a version-conditional balance write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceWrite {
    pub account_id: AccountId,
    pub new_balance: Decimal,
    pub expected_version: i64,
}

/// Result of a successful balance write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceUpdated {
    pub account_id: AccountId,
    pub new_version: i64,
}

/// Default page size for transaction history
pub const DEFAULT_PAGE_LIMIT: usize = 20;
/// Upper bound for a single history page
pub const MAX_PAGE_LIMIT: usize = 100;

/// Transaction history query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionFilter {
    /// Matches source or destination
    pub account_id: Option<AccountId>,
    pub status: Option<TransactionStatus>,
    pub tx_type: Option<TransactionType>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for TransactionFilter {
    fn default() -> Self {
        Self {
            account_id: None,
            status: None,
            tx_type: None,
            created_from: None,
            created_to: None,
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl TransactionFilter {
    pub fn for_account(account_id: AccountId) -> Self {
        Self {
            account_id: Some(account_id),
            ..Self::default()
        }
    }

    /// Clamp the page size into `1..=MAX_PAGE_LIMIT`
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        if let Some(account) = &self.account_id
            && !tx.is_participant(account)
        {
            return false;
        }
        if self.status.is_some_and(|s| s != tx.status) {
            return false;
        }
        if self.tx_type.is_some_and(|t| t != tx.tx_type) {
            return false;
        }
        if self.created_from.is_some_and(|from| tx.created_at < from) {
            return false;
        }
        if self.created_to.is_some_and(|to| tx.created_at > to) {
            return false;
        }
        true
    }
}

/// One page of results plus the total number of matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn create_customer(&self, customer: &Customer) -> Result<(), BankError>;

    async fn get_customer(&self, id: &CustomerId) -> Result<Option<Customer>, BankError>;

    /// Mark the customer invalid/inactive if `version == expected_version`
    async fn soft_delete_customer(
        &self,
        id: &CustomerId,
        expected_version: i64,
        actor: &str,
    ) -> Result<Customer, BankError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fails with `CustomerNotFound` if the owner does not exist
    async fn create_account(&self, account: &Account) -> Result<(), BankError>;

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, BankError>;

    /// Read with row-level write intent: the returned row is the latest
    /// committed state, serialized against concurrent writers.
    async fn get_account_for_update(&self, id: &AccountId) -> Result<Option<Account>, BankError>;

    async fn list_accounts_by_customer(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<Account>, BankError>;

    /// Single version-conditional balance write; returns the new version
    /// (`expected_version + 1`). Fails with `Conflict` on version mismatch.
    async fn update_balance(
        &self,
        id: &AccountId,
        new_balance: Decimal,
        expected_version: i64,
        actor: &str,
    ) -> Result<i64, BankError> {
        let write = BalanceWrite {
            account_id: *id,
            new_balance,
            expected_version,
        };
        let updated = self.update_balances(None, &[write], actor).await?;
        updated
            .first()
            .map(|u| u.new_version)
            .ok_or_else(|| BankError::Store("balance write returned no rows".into()))
    }

    /// Atomic: every leg is applied or none is.
    ///
    /// Each leg is version-conditional. A locked account may only be written
    /// by the transaction it is locked to (`tx_id`); writes without `tx_id`
    /// are rejected for locked accounts.
    async fn update_balances(
        &self,
        tx_id: Option<&TransactionId>,
        writes: &[BalanceWrite],
        actor: &str,
    ) -> Result<Vec<BalanceUpdated>, BankError>;

    /// Atomic: all accounts become locked to `tx_id`, or nothing changes.
    /// Accounts already locked to `tx_id` are accepted as-is.
    async fn lock_for_transaction(
        &self,
        account_ids: &[AccountId],
        tx_id: &TransactionId,
    ) -> Result<(), BankError>;

    /// Release the accounts locked to `tx_id`; returns how many were released
    async fn unlock_from_transaction(&self, tx_id: &TransactionId) -> Result<usize, BankError>;

    /// Recovery unlock: clears every account pointing at `tx_id` regardless
    /// of flag consistency
    async fn force_unlock(&self, tx_id: &TransactionId) -> Result<usize, BankError>;

    /// Exactly the accounts whose `active_transaction_id == tx_id`
    async fn get_accounts_in_transaction(
        &self,
        tx_id: &TransactionId,
    ) -> Result<Vec<Account>, BankError>;

    /// Mark the account invalid/inactive if `version == expected_version`
    async fn soft_delete_account(
        &self,
        id: &AccountId,
        expected_version: i64,
        actor: &str,
    ) -> Result<Account, BankError>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Uniqueness check on `reference_id` and insert are atomic;
    /// fails with `DuplicateReference`
    async fn create_transaction(&self, tx: &Transaction) -> Result<(), BankError>;

    async fn get_transaction(&self, id: &TransactionId) -> Result<Option<Transaction>, BankError>;

    async fn get_transaction_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Option<Transaction>, BankError>;

    /// Set status (and reason). Terminal rows only accept their own status.
    async fn update_status(
        &self,
        id: &TransactionId,
        status: TransactionStatus,
        error_reason: Option<&str>,
        actor: &str,
    ) -> Result<(), BankError>;

    /// Version-conditional full update; bumps `tx.version` on success
    async fn update_transaction(&self, tx: &mut Transaction) -> Result<(), BankError>;

    /// Persist retry bookkeeping; bumps `tx.version` on success
    async fn update_on_recovery(&self, tx: &mut Transaction) -> Result<(), BankError>;

    /// Atomic composite: lock the participants and stamp the transaction as
    /// begun, in one commit
    async fn begin_lifecycle(
        &self,
        tx_id: &TransactionId,
        account_ids: &[AccountId],
    ) -> Result<(), BankError>;

    /// Atomic composite: unlock the participants and, if still non-terminal,
    /// move the transaction to `status` (which must be terminal)
    async fn complete_lifecycle(
        &self,
        tx_id: &TransactionId,
        status: TransactionStatus,
        error_reason: Option<&str>,
    ) -> Result<(), BankError>;

    /// Atomic composite: apply every balance leg, mark the transaction
    /// `Completed` and unlock its participants, in one commit.
    ///
    /// Fails with `Conflict` unless the row is still non-terminal at
    /// `expected_version`; on any failure nothing changes. Each leg follows
    /// the `update_balances` rules with the accounts locked to `tx_id`.
    /// Returns the completed row.
    async fn commit_lifecycle(
        &self,
        tx_id: &TransactionId,
        expected_version: i64,
        writes: &[BalanceWrite],
        actor: &str,
    ) -> Result<Transaction, BankError>;

    /// PENDING or RECOVERING transactions not yet timed out
    async fn get_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, BankError>;

    /// Non-terminal transactions whose `timeout_at < now`
    async fn get_stuck(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<Transaction>, BankError>;

    /// Transactions still holding account locks while terminal, or whose
    /// participants had balances written under the lock while non-terminal
    async fn get_locked_but_incomplete(&self, limit: usize)
    -> Result<Vec<Transaction>, BankError>;

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Page<Transaction>, BankError>;

    /// Deployment-wide advisory lease for the recovery sweeper
    async fn try_acquire_recovery_lease(&self) -> Result<bool, BankError>;

    async fn release_recovery_lease(&self) -> Result<(), BankError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_event(&self, event: &Event) -> Result<(), BankError>;

    /// Events of one aggregate in append order
    async fn list_events(&self, aggregate_id: &str) -> Result<Vec<Event>, BankError>;
}

/// A backend implementing every port
pub trait BankStore: CustomerStore + AccountStore + TransactionStore + EventStore {}

impl<T> BankStore for T where T: CustomerStore + AccountStore + TransactionStore + EventStore {}

/// The ports handed to the core, usually all backed by one store
#[derive(Clone)]
pub struct Stores {
    pub customers: Arc<dyn CustomerStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub transactions: Arc<dyn TransactionStore>,
    pub events: Arc<dyn EventStore>,
}

impl Stores {
    pub fn from_shared<S: BankStore + 'static>(store: Arc<S>) -> Self {
        Self {
            customers: store.clone(),
            accounts: store.clone(),
            transactions: store.clone(),
            events: store,
        }
    }
}
