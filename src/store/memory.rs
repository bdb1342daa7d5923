//! In-memory store
//!
//! Implements every port behind a single mutex, so each operation (including
//! the lifecycle composites) is atomic and linearizable. Used by tests and by
//! the binary when no PostgreSQL URL is configured.
//!
//! The fault switchboard lets tests fail a named operation exactly once
//! to exercise crash and partial-failure paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{
    AccountStore, BalanceUpdated, BalanceWrite, CustomerStore, EventStore, Page,
    TransactionFilter, TransactionStore,
};
use crate::models::{
    Account, AccountId, ActiveStatus, Customer, CustomerId, Event, RecordStatus, Transaction,
    TransactionId, TransactionStatus,
};
use crate::money;
use crate::transaction::error::BankError;

/// Store operations that can be made to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    CreateTransaction,
    BeginLifecycle,
    LockAccounts,
    UpdateBalances,
    CommitLifecycle,
    UpdateStatus,
    UpdateOnRecovery,
    CompleteLifecycle,
    ForceUnlock,
    AppendEvent,
}

#[derive(Default)]
struct State {
    customers: HashMap<CustomerId, Customer>,
    accounts: BTreeMap<AccountId, Account>,
    transactions: BTreeMap<TransactionId, Transaction>,
    references: HashMap<String, TransactionId>,
    events: Vec<Event>,
}

impl State {
    fn lock_accounts(
        &mut self,
        account_ids: &[AccountId],
        tx_id: &TransactionId,
    ) -> Result<(), BankError> {
        let mut ids = account_ids.to_vec();
        ids.sort();
        ids.dedup();

        // Validate everything first so a failure changes nothing
        for id in &ids {
            let acc = self
                .accounts
                .get(id)
                .ok_or(BankError::AccountNotFound(*id))?;
            if acc.is_locked_by(tx_id) {
                continue;
            }
            if acc.locked_for_tx || acc.active_transaction_id.is_some() {
                return Err(BankError::AccountLocked(*id));
            }
        }

        for id in &ids {
            if let Some(acc) = self.accounts.get_mut(id)
                && !acc.is_locked_by(tx_id)
            {
                acc.locked_for_tx = true;
                acc.active_transaction_id = Some(*tx_id);
                acc.locked_version = Some(acc.version);
            }
        }
        Ok(())
    }

    fn unlock_accounts(&mut self, tx_id: &TransactionId, force: bool) -> usize {
        let mut released = 0;
        for acc in self.accounts.values_mut() {
            let owned = acc.active_transaction_id.as_ref() == Some(tx_id);
            if owned && (force || acc.locked_for_tx) {
                acc.locked_for_tx = false;
                acc.active_transaction_id = None;
                acc.locked_version = None;
                released += 1;
            }
        }
        released
    }

    /// Validate every leg, then apply them all; a failure changes nothing
    fn apply_balance_writes(
        &mut self,
        tx_id: Option<&TransactionId>,
        writes: &[BalanceWrite],
        actor: &str,
    ) -> Result<Vec<BalanceUpdated>, BankError> {
        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(writes.len());
        for write in writes {
            if !seen.insert(write.account_id) {
                return Err(BankError::Validation(format!(
                    "account {} written twice in one batch",
                    write.account_id
                )));
            }
            let balance = money::normalize(write.new_balance)?;
            let acc = self
                .accounts
                .get(&write.account_id)
                .ok_or(BankError::AccountNotFound(write.account_id))?;
            match tx_id {
                Some(tx) if !acc.is_locked_by(tx) => {
                    return Err(if acc.locked_for_tx {
                        BankError::AccountLocked(acc.id)
                    } else {
                        BankError::Validation(format!(
                            "account {} is not locked to transaction {}",
                            acc.id, tx
                        ))
                    });
                }
                None if acc.locked_for_tx => return Err(BankError::AccountLocked(acc.id)),
                _ => {}
            }
            if acc.version != write.expected_version {
                return Err(BankError::Conflict(format!(
                    "account {} at version {}, expected {}",
                    acc.id, acc.version, write.expected_version
                )));
            }
            normalized.push((write.account_id, balance));
        }

        let now = Utc::now();
        let mut updated = Vec::with_capacity(normalized.len());
        for (id, balance) in normalized {
            if let Some(acc) = self.accounts.get_mut(&id) {
                acc.balance = balance;
                acc.version += 1;
                acc.updated_by = actor.to_string();
                acc.updated_at = now;
                updated.push(BalanceUpdated {
                    account_id: id,
                    new_version: acc.version,
                });
            }
        }
        Ok(updated)
    }

    fn transaction_mut(&mut self, id: &TransactionId) -> Result<&mut Transaction, BankError> {
        self.transactions
            .get_mut(id)
            .ok_or(BankError::TransactionNotFound(*id))
    }
}

pub struct InMemoryStore {
    state: Mutex<State>,
    faults: Mutex<HashSet<Fault>>,
    recovery_lease: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            faults: Mutex::new(HashSet::new()),
            recovery_lease: AtomicBool::new(false),
        }
    }

    /// Make the next call of `fault` fail with a store error
    pub fn inject_fault(&self, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(fault);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    /// Replace a stored transaction row verbatim (seeding / crash simulation)
    pub fn overwrite_transaction(&self, tx: Transaction) -> Result<(), BankError> {
        let mut state = self.state()?;
        state.references.insert(tx.reference_id.clone(), tx.id);
        state.transactions.insert(tx.id, tx);
        Ok(())
    }

    /// Replace a stored account row verbatim (seeding / crash simulation)
    pub fn overwrite_account(&self, account: Account) -> Result<(), BankError> {
        let mut state = self.state()?;
        state.accounts.insert(account.id, account);
        Ok(())
    }

    /// Snapshot of every account, ordered by id
    pub fn all_accounts(&self) -> Result<Vec<Account>, BankError> {
        Ok(self.state()?.accounts.values().cloned().collect())
    }

    /// Snapshot of every transaction, ordered by id
    pub fn all_transactions(&self) -> Result<Vec<Transaction>, BankError> {
        Ok(self.state()?.transactions.values().cloned().collect())
    }

    pub fn event_count(&self) -> Result<usize, BankError> {
        Ok(self.state()?.events.len())
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, BankError> {
        self.state
            .lock()
            .map_err(|_| BankError::Store("in-memory store mutex poisoned".into()))
    }

    fn check_fault(&self, fault: Fault) -> Result<(), BankError> {
        let triggered = self
            .faults
            .lock()
            .map(|mut faults| faults.remove(&fault))
            .unwrap_or(false);
        if triggered {
            debug!(?fault, "Injected store fault triggered");
            return Err(BankError::Store(format!("injected fault: {:?}", fault)));
        }
        Ok(())
    }
}

#[async_trait]
impl CustomerStore for InMemoryStore {
    async fn create_customer(&self, customer: &Customer) -> Result<(), BankError> {
        let mut state = self.state()?;
        if state.customers.contains_key(&customer.id) {
            return Err(BankError::Store(format!(
                "customer {} already exists",
                customer.id
            )));
        }
        state.customers.insert(customer.id, customer.clone());
        Ok(())
    }

    async fn get_customer(&self, id: &CustomerId) -> Result<Option<Customer>, BankError> {
        Ok(self.state()?.customers.get(id).cloned())
    }

    async fn soft_delete_customer(
        &self,
        id: &CustomerId,
        expected_version: i64,
        actor: &str,
    ) -> Result<Customer, BankError> {
        let mut state = self.state()?;
        let customer = state
            .customers
            .get_mut(id)
            .ok_or(BankError::CustomerNotFound(*id))?;
        if customer.version != expected_version {
            return Err(BankError::Conflict(format!(
                "customer {} at version {}, expected {}",
                id, customer.version, expected_version
            )));
        }
        customer.status = RecordStatus::Invalid;
        customer.active_status = ActiveStatus::Inactive;
        customer.version += 1;
        customer.updated_by = actor.to_string();
        customer.updated_at = Utc::now();
        Ok(customer.clone())
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn create_account(&self, account: &Account) -> Result<(), BankError> {
        let mut state = self.state()?;
        if !state.customers.contains_key(&account.customer_id) {
            return Err(BankError::CustomerNotFound(account.customer_id));
        }
        if state.accounts.contains_key(&account.id) {
            return Err(BankError::Store(format!(
                "account {} already exists",
                account.id
            )));
        }
        state.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, BankError> {
        Ok(self.state()?.accounts.get(id).cloned())
    }

    async fn get_account_for_update(&self, id: &AccountId) -> Result<Option<Account>, BankError> {
        // Every read already observes the latest committed state
        self.get_account(id).await
    }

    async fn list_accounts_by_customer(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<Account>, BankError> {
        Ok(self
            .state()?
            .accounts
            .values()
            .filter(|a| a.customer_id == *customer_id)
            .cloned()
            .collect())
    }

    async fn update_balances(
        &self,
        tx_id: Option<&TransactionId>,
        writes: &[BalanceWrite],
        actor: &str,
    ) -> Result<Vec<BalanceUpdated>, BankError> {
        self.check_fault(Fault::UpdateBalances)?;
        self.state()?.apply_balance_writes(tx_id, writes, actor)
    }

    async fn lock_for_transaction(
        &self,
        account_ids: &[AccountId],
        tx_id: &TransactionId,
    ) -> Result<(), BankError> {
        self.check_fault(Fault::LockAccounts)?;
        self.state()?.lock_accounts(account_ids, tx_id)
    }

    async fn unlock_from_transaction(&self, tx_id: &TransactionId) -> Result<usize, BankError> {
        Ok(self.state()?.unlock_accounts(tx_id, false))
    }

    async fn force_unlock(&self, tx_id: &TransactionId) -> Result<usize, BankError> {
        self.check_fault(Fault::ForceUnlock)?;
        Ok(self.state()?.unlock_accounts(tx_id, true))
    }

    async fn get_accounts_in_transaction(
        &self,
        tx_id: &TransactionId,
    ) -> Result<Vec<Account>, BankError> {
        Ok(self
            .state()?
            .accounts
            .values()
            .filter(|a| a.active_transaction_id.as_ref() == Some(tx_id))
            .cloned()
            .collect())
    }

    async fn soft_delete_account(
        &self,
        id: &AccountId,
        expected_version: i64,
        actor: &str,
    ) -> Result<Account, BankError> {
        let mut state = self.state()?;
        let acc = state
            .accounts
            .get_mut(id)
            .ok_or(BankError::AccountNotFound(*id))?;
        if acc.version != expected_version {
            return Err(BankError::Conflict(format!(
                "account {} at version {}, expected {}",
                id, acc.version, expected_version
            )));
        }
        if acc.locked_for_tx {
            return Err(BankError::AccountLocked(*id));
        }
        acc.status = RecordStatus::Invalid;
        acc.active_status = ActiveStatus::Inactive;
        acc.version += 1;
        acc.updated_by = actor.to_string();
        acc.updated_at = Utc::now();
        Ok(acc.clone())
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn create_transaction(&self, tx: &Transaction) -> Result<(), BankError> {
        self.check_fault(Fault::CreateTransaction)?;
        let mut state = self.state()?;
        if state.references.contains_key(&tx.reference_id) {
            return Err(BankError::DuplicateReference(tx.reference_id.clone()));
        }
        state.references.insert(tx.reference_id.clone(), tx.id);
        state.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn get_transaction(&self, id: &TransactionId) -> Result<Option<Transaction>, BankError> {
        Ok(self.state()?.transactions.get(id).cloned())
    }

    async fn get_transaction_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Option<Transaction>, BankError> {
        let state = self.state()?;
        Ok(state
            .references
            .get(reference_id)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn update_status(
        &self,
        id: &TransactionId,
        status: TransactionStatus,
        error_reason: Option<&str>,
        actor: &str,
    ) -> Result<(), BankError> {
        self.check_fault(Fault::UpdateStatus)?;
        let mut state = self.state()?;
        let tx = state.transaction_mut(id)?;
        if tx.status.is_terminal() {
            if tx.status == status {
                return Ok(());
            }
            return Err(BankError::InvalidStateTransition(format!(
                "{} -> {}",
                tx.status, status
            )));
        }
        tx.status = status;
        if let Some(reason) = error_reason {
            tx.error_reason = Some(reason.to_string());
        }
        tx.version += 1;
        tx.updated_by = actor.to_string();
        tx.updated_at = Utc::now();
        Ok(())
    }

    async fn update_transaction(&self, tx: &mut Transaction) -> Result<(), BankError> {
        let mut state = self.state()?;
        let stored = state.transaction_mut(&tx.id)?;
        if stored.version != tx.version {
            return Err(BankError::Conflict(format!(
                "transaction {} at version {}, expected {}",
                tx.id, stored.version, tx.version
            )));
        }
        if stored.status.is_terminal() && stored.status != tx.status {
            return Err(BankError::InvalidStateTransition(format!(
                "{} -> {}",
                stored.status, tx.status
            )));
        }
        tx.version += 1;
        tx.updated_at = Utc::now();
        *stored = tx.clone();
        Ok(())
    }

    async fn update_on_recovery(&self, tx: &mut Transaction) -> Result<(), BankError> {
        self.check_fault(Fault::UpdateOnRecovery)?;
        let mut state = self.state()?;
        let stored = state.transaction_mut(&tx.id)?;
        if stored.status.is_terminal() {
            return Err(BankError::InvalidStateTransition(format!(
                "{} -> {}",
                stored.status, tx.status
            )));
        }
        stored.status = tx.status;
        stored.retry_count = tx.retry_count;
        stored.last_retry_at = tx.last_retry_at;
        stored.error_reason = tx.error_reason.clone();
        stored.updated_by = tx.updated_by.clone();
        stored.updated_at = Utc::now();
        stored.version += 1;
        tx.version = stored.version;
        tx.updated_at = stored.updated_at;
        Ok(())
    }

    async fn begin_lifecycle(
        &self,
        tx_id: &TransactionId,
        account_ids: &[AccountId],
    ) -> Result<(), BankError> {
        self.check_fault(Fault::BeginLifecycle)?;
        let mut state = self.state()?;
        let status = state.transaction_mut(tx_id)?.status;
        if status.is_terminal() {
            return Err(BankError::InvalidStateTransition(format!(
                "cannot begin lifecycle of {} transaction",
                status
            )));
        }
        state.lock_accounts(account_ids, tx_id)?;
        let tx = state.transaction_mut(tx_id)?;
        tx.version += 1;
        tx.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_lifecycle(
        &self,
        tx_id: &TransactionId,
        status: TransactionStatus,
        error_reason: Option<&str>,
    ) -> Result<(), BankError> {
        self.check_fault(Fault::CompleteLifecycle)?;
        if !status.is_terminal() {
            return Err(BankError::InvalidStateTransition(format!(
                "lifecycle cannot complete as {}",
                status
            )));
        }
        let mut state = self.state()?;
        // Existence check before touching any account
        state.transaction_mut(tx_id)?;
        state.unlock_accounts(tx_id, true);
        let tx = state.transaction_mut(tx_id)?;
        if !tx.status.is_terminal() {
            tx.status = status;
            if let Some(reason) = error_reason {
                tx.error_reason = Some(reason.to_string());
            }
            tx.version += 1;
            tx.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn commit_lifecycle(
        &self,
        tx_id: &TransactionId,
        expected_version: i64,
        writes: &[BalanceWrite],
        actor: &str,
    ) -> Result<Transaction, BankError> {
        self.check_fault(Fault::CommitLifecycle)?;
        let mut state = self.state()?;
        let tx = state.transaction_mut(tx_id)?;
        if tx.status.is_terminal() || tx.version != expected_version {
            return Err(BankError::Conflict(format!(
                "transaction {} is {} at version {}, expected live at {}",
                tx_id, tx.status, tx.version, expected_version
            )));
        }
        state.apply_balance_writes(Some(tx_id), writes, actor)?;
        state.unlock_accounts(tx_id, true);
        let tx = state.transaction_mut(tx_id)?;
        tx.status = TransactionStatus::Completed;
        tx.error_reason = None;
        tx.updated_by = actor.to_string();
        tx.updated_at = Utc::now();
        tx.version += 1;
        Ok(tx.clone())
    }

    async fn get_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, BankError> {
        let state = self.state()?;
        let mut pending: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| {
                matches!(
                    t.status,
                    TransactionStatus::Pending | TransactionStatus::Recovering
                ) && !t.should_timeout_at(now)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn get_stuck(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, BankError> {
        let state = self.state()?;
        let mut stuck: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| !t.status.is_terminal() && t.timeout_at < now)
            .cloned()
            .collect();
        stuck.sort_by_key(|t| t.timeout_at);
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn get_locked_but_incomplete(
        &self,
        limit: usize,
    ) -> Result<Vec<Transaction>, BankError> {
        let state = self.state()?;
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for acc in state.accounts.values() {
            let Some(tx_id) = acc.active_transaction_id else {
                continue;
            };
            let Some(tx) = state.transactions.get(&tx_id) else {
                continue;
            };
            let inconsistent = tx.status.is_terminal() || acc.changed_under_lock();
            if inconsistent && seen.insert(tx_id) {
                found.push(tx.clone());
                if found.len() >= limit {
                    break;
                }
            }
        }
        Ok(found)
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Page<Transaction>, BankError> {
        let state = self.state()?;
        let mut matching: Vec<&Transaction> = state
            .transactions
            .values()
            .filter(|t| filter.matches(t))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .cloned()
            .collect();
        Ok(Page { items, total })
    }

    async fn try_acquire_recovery_lease(&self) -> Result<bool, BankError> {
        Ok(self
            .recovery_lease
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    async fn release_recovery_lease(&self) -> Result<(), BankError> {
        self.recovery_lease.store(false, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn append_event(&self, event: &Event) -> Result<(), BankError> {
        self.check_fault(Fault::AppendEvent)?;
        self.state()?.events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, aggregate_id: &str) -> Result<Vec<Event>, BankError> {
        Ok(self
            .state()?
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountType, DEFAULT_TRANSACTION_TIMEOUT, TransactionType};
    use rust_decimal::Decimal;

    async fn seed(store: &InMemoryStore, balances: &[i64]) -> Vec<Account> {
        let customer = Customer::new("Test", None, "seed");
        store.create_customer(&customer).await.unwrap();
        let mut accounts = Vec::new();
        for b in balances {
            let acc = Account::new(customer.id, AccountType::Current, Decimal::new(*b, 0), "seed");
            store.create_account(&acc).await.unwrap();
            accounts.push(acc);
        }
        accounts
    }

    fn add(account: AccountId, reference: &str) -> Transaction {
        Transaction::new(
            account,
            None,
            Decimal::TEN,
            TransactionType::AddAmount,
            reference,
            "tester",
            DEFAULT_TRANSACTION_TIMEOUT,
        )
    }

    #[tokio::test]
    async fn test_update_balance_is_version_conditional() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100]).await;
        let acc = &accs[0];

        let v = store
            .update_balance(&acc.id, Decimal::new(90, 0), 1, "t")
            .await
            .unwrap();
        assert_eq!(v, 2);

        let stale = store.update_balance(&acc.id, Decimal::new(80, 0), 1, "t").await;
        assert!(matches!(stale, Err(BankError::Conflict(_))));

        let stored = store.get_account(&acc.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, Decimal::new(90, 0));
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_negative_balance_rejected() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100]).await;
        let acc = &accs[0];
        let res = store.update_balance(&acc.id, Decimal::new(-1, 0), 1, "t").await;
        assert!(matches!(res, Err(BankError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_lock_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100, 100, 100]).await;
        let first = TransactionId::new();
        store.lock_for_transaction(&[accs[1].id], &first).await.unwrap();

        let second = TransactionId::new();
        let res = store
            .lock_for_transaction(&[accs[0].id, accs[1].id, accs[2].id], &second)
            .await;
        assert_eq!(res, Err(BankError::AccountLocked(accs[1].id)));

        // Neither free account was left locked to the failed transaction
        assert!(store.get_accounts_in_transaction(&second).await.unwrap().is_empty());
        assert!(store.get_account(&accs[0].id).await.unwrap().unwrap().can_transact());
    }

    #[tokio::test]
    async fn test_lock_is_idempotent_for_owner() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100]).await;
        let acc = &accs[0];
        let tx = TransactionId::new();
        store.lock_for_transaction(&[acc.id], &tx).await.unwrap();
        store.lock_for_transaction(&[acc.id], &tx).await.unwrap();
        assert_eq!(store.get_accounts_in_transaction(&tx).await.unwrap().len(), 1);
        assert_eq!(store.unlock_from_transaction(&tx).await.unwrap(), 1);
        assert_eq!(store.unlock_from_transaction(&tx).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_locked_account_write_guard() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100]).await;
        let acc = &accs[0];
        let owner = TransactionId::new();
        store.lock_for_transaction(&[acc.id], &owner).await.unwrap();

        let write = BalanceWrite {
            account_id: acc.id,
            new_balance: Decimal::new(50, 0),
            expected_version: 1,
        };
        let other = TransactionId::new();
        assert_eq!(
            store.update_balances(Some(&other), &[write.clone()], "t").await,
            Err(BankError::AccountLocked(acc.id))
        );
        assert_eq!(
            store.update_balances(None, &[write.clone()], "t").await,
            Err(BankError::AccountLocked(acc.id))
        );
        let ok = store.update_balances(Some(&owner), &[write], "t").await.unwrap();
        assert_eq!(ok[0].new_version, 2);
    }

    #[tokio::test]
    async fn test_multi_leg_write_is_atomic() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100, 100]).await;
        let writes = [
            BalanceWrite {
                account_id: accs[0].id,
                new_balance: Decimal::new(50, 0),
                expected_version: 1,
            },
            BalanceWrite {
                account_id: accs[1].id,
                new_balance: Decimal::new(150, 0),
                expected_version: 7,
            },
        ];
        assert!(matches!(
            store.update_balances(None, &writes, "t").await,
            Err(BankError::Conflict(_))
        ));
        let first = store.get_account(&accs[0].id).await.unwrap().unwrap();
        assert_eq!(first.balance, Decimal::new(100, 0));
        assert_eq!(first.version, 1);
    }

    #[tokio::test]
    async fn test_duplicate_reference_rejected() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100]).await;
        let acc = &accs[0];
        store.create_transaction(&add(acc.id, "R")).await.unwrap();
        assert_eq!(
            store.create_transaction(&add(acc.id, "R")).await,
            Err(BankError::DuplicateReference("R".into()))
        );
        assert_eq!(store.all_transactions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_lifecycle_unlocks_and_keeps_terminal_status() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100]).await;
        let acc = &accs[0];
        let mut tx = add(acc.id, "R");
        store.create_transaction(&tx).await.unwrap();
        store.begin_lifecycle(&tx.id, &[acc.id]).await.unwrap();

        tx = store.get_transaction(&tx.id).await.unwrap().unwrap();
        tx.status = TransactionStatus::Completed;
        store.update_transaction(&mut tx).await.unwrap();

        store
            .complete_lifecycle(&tx.id, TransactionStatus::Failed, Some("late"))
            .await
            .unwrap();
        let stored = store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Completed);
        assert!(stored.error_reason.is_none());
        assert!(store.get_account(&acc.id).await.unwrap().unwrap().can_transact());
    }

    #[tokio::test]
    async fn test_commit_lifecycle_is_fenced_on_version() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100]).await;
        let acc = &accs[0];
        let tx = add(acc.id, "C");
        store.create_transaction(&tx).await.unwrap();
        store.begin_lifecycle(&tx.id, &[acc.id]).await.unwrap();
        let begun = store.get_transaction(&tx.id).await.unwrap().unwrap();
        let write = BalanceWrite {
            account_id: acc.id,
            new_balance: Decimal::new(110, 0),
            expected_version: 1,
        };

        // Stale transaction version: nothing moves
        assert!(matches!(
            store
                .commit_lifecycle(&tx.id, begun.version - 1, &[write.clone()], "t")
                .await,
            Err(BankError::Conflict(_))
        ));
        assert_eq!(
            store.get_account(&acc.id).await.unwrap().unwrap().balance,
            Decimal::new(100, 0)
        );

        let done = store
            .commit_lifecycle(&tx.id, begun.version, &[write.clone()], "t")
            .await
            .unwrap();
        assert_eq!(done.status, TransactionStatus::Completed);
        assert_eq!(done.version, begun.version + 1);
        let stored = store.get_account(&acc.id).await.unwrap().unwrap();
        assert_eq!((stored.balance, stored.version), (Decimal::new(110, 0), 2));
        assert!(stored.can_transact());

        // Replaying the same commit is fenced off by the terminal row
        assert!(matches!(
            store.commit_lifecycle(&tx.id, done.version, &[write], "t").await,
            Err(BankError::Conflict(_))
        ));
        assert_eq!(
            store.get_account(&acc.id).await.unwrap().unwrap().balance,
            Decimal::new(110, 0)
        );
    }

    #[tokio::test]
    async fn test_commit_lifecycle_rejected_leg_changes_nothing() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100, 100]).await;
        let tx = add(accs[0].id, "C2");
        store.create_transaction(&tx).await.unwrap();
        store.begin_lifecycle(&tx.id, &[accs[0].id]).await.unwrap();
        let begun = store.get_transaction(&tx.id).await.unwrap().unwrap();

        // Second leg targets an account not locked to the transaction
        let writes = [
            BalanceWrite {
                account_id: accs[0].id,
                new_balance: Decimal::new(90, 0),
                expected_version: 1,
            },
            BalanceWrite {
                account_id: accs[1].id,
                new_balance: Decimal::new(110, 0),
                expected_version: 1,
            },
        ];
        assert!(matches!(
            store.commit_lifecycle(&tx.id, begun.version, &writes, "t").await,
            Err(BankError::Validation(_))
        ));
        let stored = store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Pending);
        assert_eq!(stored.version, begun.version);
        let first = store.get_account(&accs[0].id).await.unwrap().unwrap();
        assert_eq!(first.balance, Decimal::new(100, 0));
        assert!(first.is_locked_by(&tx.id));
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100]).await;
        let acc = &accs[0];
        let tx = add(acc.id, "R");
        store.create_transaction(&tx).await.unwrap();
        store
            .update_status(&tx.id, TransactionStatus::Failed, Some("x"), "t")
            .await
            .unwrap();
        assert!(matches!(
            store
                .update_status(&tx.id, TransactionStatus::Completed, None, "t")
                .await,
            Err(BankError::InvalidStateTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_locked_but_incomplete_detection() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100, 100]).await;

        // Terminal transaction still holding a lock
        let done = add(accs[0].id, "done");
        store.create_transaction(&done).await.unwrap();
        store.begin_lifecycle(&done.id, &[accs[0].id]).await.unwrap();
        store
            .update_status(&done.id, TransactionStatus::Completed, None, "t")
            .await
            .unwrap();

        // Live transaction whose balance was written under the lock
        let live = add(accs[1].id, "live");
        store.create_transaction(&live).await.unwrap();
        store.begin_lifecycle(&live.id, &[accs[1].id]).await.unwrap();

        let found = store.get_locked_but_incomplete(10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, done.id);

        let write = BalanceWrite {
            account_id: accs[1].id,
            new_balance: Decimal::new(110, 0),
            expected_version: 1,
        };
        store.update_balances(Some(&live.id), &[write], "t").await.unwrap();
        let found = store.get_locked_but_incomplete(10).await.unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_and_stuck_queries() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100]).await;
        let acc = &accs[0];
        let fresh = add(acc.id, "fresh");
        let mut old = add(acc.id, "old");
        old.timeout_at = Utc::now() - chrono::TimeDelta::seconds(5);
        store.create_transaction(&fresh).await.unwrap();
        store.create_transaction(&old).await.unwrap();

        let now = Utc::now();
        let pending = store.get_pending(now, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, fresh.id);

        let stuck = store.get_stuck(now, 10).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, old.id);
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let store = InMemoryStore::new();
        let accs = seed(&store, &[100]).await;
        let acc = &accs[0];
        store.inject_fault(Fault::CreateTransaction);
        assert!(matches!(
            store.create_transaction(&add(acc.id, "R")).await,
            Err(BankError::Store(_))
        ));
        store.create_transaction(&add(acc.id, "R")).await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_lease_is_exclusive() {
        let store = InMemoryStore::new();
        assert!(store.try_acquire_recovery_lease().await.unwrap());
        assert!(!store.try_acquire_recovery_lease().await.unwrap());
        store.release_recovery_lease().await.unwrap();
        assert!(store.try_acquire_recovery_lease().await.unwrap());
    }
}
