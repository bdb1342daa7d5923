//! Lock Manager
//!
//! Mediates all participant locking. Atomicity of multi-account locking comes
//! from the store (`lock_for_transaction` / `begin_lifecycle` run in one store
//! transaction); this layer normalizes participant order and verifies lock
//! ownership before balances are touched.

use std::sync::Arc;
use tracing::{debug, warn};

use super::error::BankError;
use crate::models::{Account, AccountId, TransactionId};
use crate::store::{AccountStore, TransactionStore};

/// Participants sorted ascending, duplicates removed
pub fn lock_order(account_ids: &[AccountId]) -> Vec<AccountId> {
    let mut ids = account_ids.to_vec();
    ids.sort();
    ids.dedup();
    ids
}

pub struct LockManager {
    accounts: Arc<dyn AccountStore>,
    transactions: Arc<dyn TransactionStore>,
}

impl LockManager {
    pub fn new(accounts: Arc<dyn AccountStore>, transactions: Arc<dyn TransactionStore>) -> Self {
        Self {
            accounts,
            transactions,
        }
    }

    /// Lock participants and mark the transaction begun, in one commit
    pub async fn begin(
        &self,
        tx_id: &TransactionId,
        account_ids: &[AccountId],
    ) -> Result<(), BankError> {
        let ids = lock_order(account_ids);
        self.transactions.begin_lifecycle(tx_id, &ids).await?;
        debug!(tx_id = %tx_id, accounts = ids.len(), "Lifecycle begun");
        Ok(())
    }

    /// All-or-nothing lock of `account_ids` to `tx_id`
    pub async fn lock(
        &self,
        tx_id: &TransactionId,
        account_ids: &[AccountId],
    ) -> Result<(), BankError> {
        if account_ids.is_empty() {
            return Err(BankError::Validation("no accounts to lock".into()));
        }
        let ids = lock_order(account_ids);
        self.accounts.lock_for_transaction(&ids, tx_id).await?;
        debug!(tx_id = %tx_id, accounts = ids.len(), "Accounts locked");
        Ok(())
    }

    pub async fn unlock(&self, tx_id: &TransactionId) -> Result<usize, BankError> {
        let released = self.accounts.unlock_from_transaction(tx_id).await?;
        debug!(tx_id = %tx_id, released, "Accounts unlocked");
        Ok(released)
    }

    /// Recovery unlock, ignores flag consistency
    pub async fn force_unlock(&self, tx_id: &TransactionId) -> Result<usize, BankError> {
        let released = self.accounts.force_unlock(tx_id).await?;
        if released > 0 {
            warn!(tx_id = %tx_id, released, "Accounts force-unlocked");
        }
        Ok(released)
    }

    pub async fn accounts_in(&self, tx_id: &TransactionId) -> Result<Vec<Account>, BankError> {
        self.accounts.get_accounts_in_transaction(tx_id).await
    }

    /// Load the participants of `tx_id` and check ownership of every lock
    ///
    /// Fails with `LockInconsistent` when the number of locked accounts
    /// differs from `expected`, and with `Validation` when a participant's
    /// lock flag and back-reference disagree.
    pub async fn verify(
        &self,
        tx_id: &TransactionId,
        expected: usize,
    ) -> Result<Vec<Account>, BankError> {
        let locked = self.accounts_in(tx_id).await?;
        if locked.len() != expected {
            return Err(BankError::LockInconsistent {
                expected,
                actual: locked.len(),
            });
        }
        for acc in &locked {
            if !acc.is_locked_by(tx_id) {
                return Err(BankError::Validation(format!(
                    "account {} lock mismatch: locked_for_tx={}, active_transaction_id={:?}",
                    acc.id, acc.locked_for_tx, acc.active_transaction_id
                )));
            }
        }
        Ok(locked)
    }
}
