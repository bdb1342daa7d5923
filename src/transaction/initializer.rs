//! Transaction Initializer
//!
//! Validates a money-movement request, persists it `Pending` and locks its
//! participants. A transaction that fails to begin its lifecycle is marked
//! failed immediately, so no `Pending` row is left without its locks.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::error::BankError;
use super::lock::LockManager;
use crate::events::EventEmitter;
use crate::models::{
    Account, AccountId, DEFAULT_TRANSACTION_TIMEOUT, EventKind, Transaction, TransactionStatus,
    TransactionType,
};
use crate::store::Stores;

/// A new money-movement request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitRequest {
    pub source_account_id: AccountId,
    #[serde(default)]
    pub destination_account_id: Option<AccountId>,
    #[serde(default)]
    pub amount: Decimal,
    pub tx_type: TransactionType,
    /// Caller-supplied idempotency key
    pub reference_id: String,
    pub actor: String,
    /// Correlation id carried into event payloads; generated when empty
    #[serde(default)]
    pub request_id: String,
}

impl InitRequest {
    pub fn transfer(
        source: AccountId,
        destination: AccountId,
        amount: Decimal,
        reference_id: &str,
        actor: &str,
    ) -> Self {
        Self::new(source, Some(destination), amount, TransactionType::Transfer, reference_id, actor)
    }

    pub fn new(
        source: AccountId,
        destination: Option<AccountId>,
        amount: Decimal,
        tx_type: TransactionType,
        reference_id: &str,
        actor: &str,
    ) -> Self {
        Self {
            source_account_id: source,
            destination_account_id: destination,
            amount,
            tx_type,
            reference_id: reference_id.to_string(),
            actor: actor.to_string(),
            request_id: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitializerConfig {
    pub transaction_timeout: Duration,
    pub min_deposit_amount: Decimal,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            min_deposit_amount: Decimal::ZERO,
        }
    }
}

pub struct TransactionInitializer {
    stores: Stores,
    locks: Arc<LockManager>,
    events: Arc<EventEmitter>,
    config: InitializerConfig,
}

impl TransactionInitializer {
    pub fn new(
        stores: Stores,
        locks: Arc<LockManager>,
        events: Arc<EventEmitter>,
        config: InitializerConfig,
    ) -> Self {
        Self {
            stores,
            locks,
            events,
            config,
        }
    }

    /// Validate, persist and lock; returns the `Pending` transaction
    pub async fn init(&self, req: InitRequest) -> Result<Transaction, BankError> {
        // 1. Required fields
        if req.reference_id.trim().is_empty() {
            return Err(BankError::Validation("reference id is required".into()));
        }
        if req.actor.trim().is_empty() {
            return Err(BankError::Validation("actor is required".into()));
        }

        // 2. Idempotency key
        if self
            .stores
            .transactions
            .get_transaction_by_reference(&req.reference_id)
            .await?
            .is_some()
        {
            debug!(reference_id = %req.reference_id, "Duplicate reference id");
            return Err(BankError::DuplicateReference(req.reference_id));
        }

        // 3. Type-specific amount rules; withdraw_full drops amount and destination
        let mut tx = Transaction::new(
            req.source_account_id,
            req.destination_account_id,
            req.amount,
            req.tx_type,
            &req.reference_id,
            &req.actor,
            self.config.transaction_timeout,
        );
        tx.validate()?;
        if tx.tx_type == TransactionType::AddAmount && tx.amount < self.config.min_deposit_amount {
            return Err(BankError::InvalidAmount(format!(
                "deposit below minimum of {}",
                self.config.min_deposit_amount
            )));
        }

        // 4. Participants must be able to transact
        let source = self.load_participant(&tx.source_account_id).await?;
        if let Some(dest_id) = tx.destination_account_id {
            self.load_participant(&dest_id).await?;
        }
        if tx.tx_type == TransactionType::WithdrawFull && source.balance <= Decimal::ZERO {
            return Err(BankError::AccountEmpty);
        }

        // 5. Persist, then lock + begin in one store commit
        self.stores.transactions.create_transaction(&tx).await?;

        let request_id = if req.request_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            req.request_id
        };

        if let Err(e) = self.locks.begin(&tx.id, &tx.accounts_to_lock()).await {
            warn!(
                tx_id = %tx.id,
                reference_id = %tx.reference_id,
                error = %e,
                "Failed to begin transaction lifecycle"
            );
            let reason = e.to_string();
            if let Err(status_err) = self
                .stores
                .transactions
                .update_status(&tx.id, TransactionStatus::Failed, Some(&reason), &req.actor)
                .await
            {
                // Left to recovery: a pending row holding no locks
                error!(
                    tx_id = %tx.id,
                    error = %status_err,
                    "CRITICAL: could not mark transaction failed after begin failure"
                );
            } else {
                tx.status = TransactionStatus::Failed;
                tx.error_reason = Some(reason);
                self.events
                    .transaction(EventKind::TransactionFail, &tx, &req.actor, &request_id)
                    .await;
            }
            return Err(e);
        }
        // begin_lifecycle stamps the row
        tx.version += 1;

        info!(
            tx_id = %tx.id,
            reference_id = %tx.reference_id,
            tx_type = %tx.tx_type,
            amount = %tx.amount,
            "Transaction initialized"
        );
        self.events
            .transaction(EventKind::TransactionInit, &tx, &req.actor, &request_id)
            .await;

        Ok(tx)
    }

    async fn load_participant(&self, id: &AccountId) -> Result<Account, BankError> {
        let account = self
            .stores
            .accounts
            .get_account(id)
            .await?
            .ok_or(BankError::AccountNotFound(*id))?;

        match self.stores.customers.get_customer(&account.customer_id).await? {
            Some(owner) if !owner.is_deleted() => {}
            _ => return Err(BankError::CustomerNotFound(account.customer_id)),
        }

        if !account.can_transact() {
            if account.locked_for_tx || account.active_transaction_id.is_some() {
                return Err(BankError::AccountLocked(*id));
            }
            return Err(BankError::AccountInactive(*id));
        }
        Ok(account)
    }
}
