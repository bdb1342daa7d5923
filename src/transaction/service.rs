//! Transaction Service
//!
//! Capability-typed entry point used by the surrounding services. Wires the
//! lock manager, initializer, committer and recovery worker over one set of
//! store ports, and bounds every call by the configured request timeout.

use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::committer::{CommitOutcome, TransactionCommitter};
use super::error::BankError;
use super::inflight::InFlight;
use super::initializer::{InitRequest, InitializerConfig, TransactionInitializer};
use super::lock::LockManager;
use super::recovery::RecoveryWorker;
use crate::config::AppConfig;
use crate::events::EventEmitter;
use crate::models::{Account, AccountId, ActiveStatus, RecordStatus, Transaction, TransactionId};
use crate::store::{BalanceUpdated, BalanceWrite, Page, Stores, TransactionFilter};

/// Value plus the terse human message callers relay
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply<T> {
    pub value: T,
    pub message: String,
}

impl<T> Reply<T> {
    fn new(value: T, message: &str) -> Self {
        Self {
            value,
            message: message.to_string(),
        }
    }
}

pub struct TransactionService {
    stores: Stores,
    locks: Arc<LockManager>,
    initializer: TransactionInitializer,
    committer: Arc<TransactionCommitter>,
    events: Arc<EventEmitter>,
    inflight: InFlight,
    config: AppConfig,
}

impl TransactionService {
    pub fn new(stores: Stores, events: Arc<EventEmitter>, config: AppConfig) -> Self {
        let locks = Arc::new(LockManager::new(
            stores.accounts.clone(),
            stores.transactions.clone(),
        ));
        let inflight = InFlight::new();
        let initializer = TransactionInitializer::new(
            stores.clone(),
            locks.clone(),
            events.clone(),
            InitializerConfig {
                transaction_timeout: config.recovery.transaction_timeout(),
                min_deposit_amount: config.account.min_deposit_amount,
            },
        );
        let committer = Arc::new(TransactionCommitter::new(
            stores.clone(),
            locks.clone(),
            events.clone(),
            inflight.clone(),
        ));
        Self {
            stores,
            locks,
            initializer,
            committer,
            events,
            inflight,
            config,
        }
    }

    /// Recovery worker sharing this service's in-flight registry
    pub fn recovery_worker(&self) -> RecoveryWorker {
        RecoveryWorker::new(
            self.stores.clone(),
            self.locks.clone(),
            self.committer.clone(),
            self.events.clone(),
            self.inflight.clone(),
            self.config.recovery.clone(),
        )
    }

    pub fn committer(&self) -> &Arc<TransactionCommitter> {
        &self.committer
    }

    pub fn inflight(&self) -> &InFlight {
        &self.inflight
    }

    fn request_timeout(&self) -> Duration {
        self.config.service.request_timeout()
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T, BankError>
    where
        F: Future<Output = Result<T, BankError>>,
    {
        let limit = self.request_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                debug!(op, timeout_ms = limit.as_millis() as u64, "Request deadline exceeded");
                Err(BankError::Timeout(format!(
                    "{} exceeded {}ms",
                    op,
                    limit.as_millis()
                )))
            }
        }
    }

    pub async fn init_transaction(&self, req: InitRequest) -> Result<Reply<Transaction>, BankError> {
        let tx = self.bounded("init_transaction", self.initializer.init(req)).await?;
        Ok(Reply::new(tx, "transaction initialized"))
    }

    pub async fn commit_transaction(
        &self,
        tx_id: &TransactionId,
        actor: &str,
    ) -> Result<Reply<Transaction>, BankError> {
        if actor.trim().is_empty() {
            return Err(BankError::Validation("actor is required".into()));
        }
        let outcome = self
            .bounded("commit_transaction", self.committer.commit(tx_id, actor))
            .await?;
        let message = outcome.message();
        let tx = match outcome {
            CommitOutcome::Completed(tx) | CommitOutcome::AlreadyCompleted(tx) => tx,
        };
        Ok(Reply::new(tx, message))
    }

    pub async fn get_transaction_history(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Page<Transaction>, BankError> {
        self.bounded(
            "get_transaction_history",
            self.stores.transactions.list_transactions(filter),
        )
        .await
    }

    /// Every account must exist, be valid and active, and be free or locked
    /// to `tx_id`
    pub async fn validate_accounts_for_transaction(
        &self,
        tx_id: &TransactionId,
        account_ids: &[AccountId],
        actor: &str,
    ) -> Result<Reply<Vec<Account>>, BankError> {
        let accounts = self
            .bounded("validate_accounts_for_transaction", async {
                if account_ids.is_empty() {
                    return Err(BankError::Validation("no accounts to validate".into()));
                }
                let mut accounts = Vec::with_capacity(account_ids.len());
                for id in account_ids {
                    let acc = self
                        .stores
                        .accounts
                        .get_account(id)
                        .await?
                        .ok_or(BankError::AccountNotFound(*id))?;
                    if acc.status != RecordStatus::Valid || acc.active_status != ActiveStatus::Active {
                        return Err(BankError::AccountInactive(*id));
                    }
                    if (acc.locked_for_tx || acc.active_transaction_id.is_some())
                        && !acc.is_locked_by(tx_id)
                    {
                        return Err(BankError::AccountLocked(*id));
                    }
                    accounts.push(acc);
                }
                Ok(accounts)
            })
            .await?;
        debug!(tx_id = %tx_id, actor, count = accounts.len(), "Accounts validated");
        Ok(Reply::new(accounts, "accounts validated"))
    }

    pub async fn lock_accounts_for_transaction(
        &self,
        tx_id: &TransactionId,
        account_ids: &[AccountId],
        actor: &str,
    ) -> Result<Reply<()>, BankError> {
        self.bounded(
            "lock_accounts_for_transaction",
            self.locks.lock(tx_id, account_ids),
        )
        .await?;
        debug!(tx_id = %tx_id, actor, "Accounts locked on request");
        Ok(Reply::new((), "accounts locked"))
    }

    /// Returns how many accounts were released
    pub async fn unlock_accounts_for_transaction(
        &self,
        tx_id: &TransactionId,
        actor: &str,
    ) -> Result<Reply<usize>, BankError> {
        let released = self
            .bounded("unlock_accounts_for_transaction", self.locks.unlock(tx_id))
            .await?;
        debug!(tx_id = %tx_id, actor, released, "Accounts unlocked on request");
        Ok(Reply::new(released, "accounts unlocked"))
    }

    /// Atomic batch of version-conditional writes to unlocked accounts
    pub async fn update_balances_for_transaction(
        &self,
        writes: &[BalanceWrite],
        actor: &str,
    ) -> Result<Reply<Vec<BalanceUpdated>>, BankError> {
        if writes.is_empty() {
            return Err(BankError::Validation("no balance writes".into()));
        }
        if let Some(w) = writes.iter().find(|w| w.new_balance < Decimal::ZERO) {
            return Err(BankError::InvalidAmount(format!(
                "negative balance for account {}",
                w.account_id
            )));
        }
        let updated = self
            .bounded(
                "update_balances_for_transaction",
                self.stores.accounts.update_balances(None, writes, actor),
            )
            .await?;
        Ok(Reply::new(updated, "balances updated"))
    }
}
