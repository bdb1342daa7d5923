//! Transaction Committer
//!
//! Drives a `Pending`/`Recovering` transaction to a terminal state:
//!
//! ```text
//! load ─→ terminal? ─→ completed: idempotent success / failed: TransactionFailed
//!   │
//!   ├─→ timed out ─────────────────────────────→ FAILED (unlock)
//!   ├─→ verify locks ─── mismatch ─────────────→ FAILED (unlock)
//!   ├─→ balance math ─── insufficient / empty ─→ FAILED (unlock)
//!   └─→ commit_lifecycle: balances + COMPLETED + unlock
//!         ├─ Conflict ─→ re-read: completed elsewhere / failed / retry later
//!         └─ error ────→ FAILED (unlock)
//! ```
//!
//! Every leg, the status change and the unlock land in one store commit that
//! is fenced on the transaction version the committer loaded. A second
//! committer in any process loses that fence and applies nothing.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::balance::plan_balance_writes;
use super::error::BankError;
use super::inflight::{Claimant, InFlight};
use super::lock::LockManager;
use crate::events::EventEmitter;
use crate::models::{Account, EventKind, Transaction, TransactionId, TransactionStatus};
use crate::store::Stores;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CommitOutcome {
    /// This call applied the balances
    Completed(Transaction),
    /// An earlier call did; nothing was re-applied
    AlreadyCompleted(Transaction),
}

impl CommitOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            CommitOutcome::Completed(tx) | CommitOutcome::AlreadyCompleted(tx) => tx,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CommitOutcome::Completed(_) => "transaction completed",
            CommitOutcome::AlreadyCompleted(_) => "transaction already completed",
        }
    }
}

pub struct TransactionCommitter {
    stores: Stores,
    locks: Arc<LockManager>,
    events: Arc<EventEmitter>,
    inflight: InFlight,
}

impl TransactionCommitter {
    pub fn new(
        stores: Stores,
        locks: Arc<LockManager>,
        events: Arc<EventEmitter>,
        inflight: InFlight,
    ) -> Self {
        Self {
            stores,
            locks,
            events,
            inflight,
        }
    }

    /// Commit `tx_id`; a concurrent commit of the same id in this process
    /// gets `Conflict`
    pub async fn commit(&self, tx_id: &TransactionId, actor: &str) -> Result<CommitOutcome, BankError> {
        let _guard = self
            .inflight
            .try_acquire(*tx_id, Claimant::Commit)
            .ok_or_else(|| {
                let by = match self.inflight.holder(tx_id) {
                    Some(Claimant::Recovery) => "recovery",
                    _ => "another commit",
                };
                BankError::Conflict(format!("transaction {} is being processed by {}", tx_id, by))
            })?;
        let request_id = uuid::Uuid::new_v4().to_string();
        self.commit_claimed(tx_id, actor, &request_id).await
    }

    /// Commit body; the caller must hold the in-flight claim for `tx_id`.
    /// `request_id` tags the events this call emits.
    pub(crate) async fn commit_claimed(
        &self,
        tx_id: &TransactionId,
        actor: &str,
        request_id: &str,
    ) -> Result<CommitOutcome, BankError> {
        // 1. Load and short-circuit terminal states
        let mut tx = self
            .stores
            .transactions
            .get_transaction(tx_id)
            .await?
            .ok_or(BankError::TransactionNotFound(*tx_id))?;

        match tx.status {
            TransactionStatus::Completed => {
                debug!(tx_id = %tx_id, "Commit of completed transaction is a no-op");
                return Ok(CommitOutcome::AlreadyCompleted(tx));
            }
            TransactionStatus::Failed | TransactionStatus::Cancelled => {
                return Err(BankError::TransactionFailed(
                    tx.error_reason
                        .clone()
                        .unwrap_or_else(|| tx.status.as_str().to_string()),
                ));
            }
            TransactionStatus::Pending | TransactionStatus::Recovering => {}
        }

        if tx.should_timeout() {
            let err = BankError::Timeout(format!("transaction {} passed its timeout", tx_id));
            self.fail(&mut tx, "transaction timeout", actor, request_id).await;
            return Err(err);
        }

        // 2-3. Participants must be locked to exactly this transaction
        let locked = match self.locks.verify(tx_id, tx.expected_lock_count()).await {
            Ok(locked) => locked,
            Err(e) => {
                warn!(tx_id = %tx_id, error = %e, "Lock verification failed");
                self.fail(&mut tx, &e.to_string(), actor, request_id).await;
                return Err(e);
            }
        };

        // 4. Balance math
        let writes = match Self::plan(&tx, &locked) {
            Ok(writes) => writes,
            Err(e) => {
                self.fail(&mut tx, &e.to_string(), actor, request_id).await;
                return Err(e);
            }
        };

        // 5-6. Every leg, COMPLETED and the unlock in one commit
        let tx = match self
            .stores
            .transactions
            .commit_lifecycle(tx_id, tx.version, &writes, actor)
            .await
        {
            Ok(done) => done,
            Err(BankError::Conflict(reason)) => return self.settle_conflict(tx_id, reason).await,
            Err(e) => {
                warn!(tx_id = %tx_id, error = %e, "Balance write failed");
                self.fail(&mut tx, &e.to_string(), actor, request_id).await;
                return Err(e);
            }
        };

        info!(
            tx_id = %tx_id,
            reference_id = %tx.reference_id,
            tx_type = %tx.tx_type,
            amount = %tx.amount,
            "Transaction completed"
        );

        // 7.
        self.events
            .transaction(EventKind::TransactionCommit, &tx, actor, request_id)
            .await;

        Ok(CommitOutcome::Completed(tx))
    }

    /// The fenced commit lost: someone else moved the row since it was loaded
    async fn settle_conflict(
        &self,
        tx_id: &TransactionId,
        reason: String,
    ) -> Result<CommitOutcome, BankError> {
        let tx = self
            .stores
            .transactions
            .get_transaction(tx_id)
            .await?
            .ok_or(BankError::TransactionNotFound(*tx_id))?;
        match tx.status {
            TransactionStatus::Completed => {
                info!(tx_id = %tx_id, "Transaction completed by a concurrent commit");
                Ok(CommitOutcome::AlreadyCompleted(tx))
            }
            TransactionStatus::Failed | TransactionStatus::Cancelled => {
                warn!(tx_id = %tx_id, status = %tx.status, "Transaction terminated during commit");
                Err(BankError::TransactionFailed(
                    tx.error_reason
                        .clone()
                        .unwrap_or_else(|| tx.status.as_str().to_string()),
                ))
            }
            // Still live (recovery bumped it); nothing applied, retry after reload
            TransactionStatus::Pending | TransactionStatus::Recovering => {
                debug!(tx_id = %tx_id, reason = %reason, "Commit lost the version fence");
                Err(BankError::Conflict(reason))
            }
        }
    }

    fn plan(
        tx: &Transaction,
        locked: &[Account],
    ) -> Result<Vec<crate::store::BalanceWrite>, BankError> {
        let find = |id| locked.iter().find(|a| a.id == id);
        let source = find(tx.source_account_id).ok_or_else(|| {
            BankError::Validation(format!(
                "source account {} is not locked to {}",
                tx.source_account_id, tx.id
            ))
        })?;
        let destination = match tx.destination_account_id {
            Some(dest_id) => Some(find(dest_id).ok_or_else(|| {
                BankError::Validation(format!(
                    "destination account {} is not locked to {}",
                    dest_id, tx.id
                ))
            })?),
            None => None,
        };
        plan_balance_writes(tx, source, destination)
    }

    /// Fail `tx` and release its locks in one store commit
    ///
    /// Best-effort: a store failure here is logged CRITICAL and never masks
    /// the error the caller is about to return.
    async fn fail(&self, tx: &mut Transaction, reason: &str, actor: &str, request_id: &str) {
        match self
            .stores
            .transactions
            .complete_lifecycle(&tx.id, TransactionStatus::Failed, Some(reason))
            .await
        {
            Ok(()) => {
                tx.status = TransactionStatus::Failed;
                tx.error_reason = Some(reason.to_string());
                info!(tx_id = %tx.id, reason, "Transaction failed");
                self.events
                    .transaction(EventKind::TransactionFail, tx, actor, request_id)
                    .await;
            }
            Err(e) => {
                error!(
                    tx_id = %tx.id,
                    reason,
                    error = %e,
                    "CRITICAL: could not persist transaction failure"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountType, Customer, TransactionType};
    use crate::store::{AccountStore, CustomerStore, EventStore, InMemoryStore, TransactionStore};
    use rust_decimal::Decimal;

    struct Fixture {
        store: Arc<InMemoryStore>,
        committer: TransactionCommitter,
        locks: Arc<LockManager>,
        inflight: InFlight,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let stores = Stores::from_shared(store.clone());
        let locks = Arc::new(LockManager::new(stores.accounts.clone(), stores.transactions.clone()));
        let events = Arc::new(EventEmitter::new(stores.events.clone(), None));
        let inflight = InFlight::new();
        Fixture {
            committer: TransactionCommitter::new(stores, locks.clone(), events, inflight.clone()),
            store,
            locks,
            inflight,
        }
    }

    async fn account(f: &Fixture, balance: i64) -> Account {
        let customer = Customer::new("C", None, "seed");
        f.store.create_customer(&customer).await.unwrap();
        let acc = Account::new(customer.id, AccountType::Current, Decimal::new(balance, 0), "seed");
        f.store.create_account(&acc).await.unwrap();
        acc
    }

    /// Persist + begin, bypassing initializer preflight
    async fn pending(
        f: &Fixture,
        kind: TransactionType,
        src: &Account,
        dst: Option<&Account>,
        amount: i64,
    ) -> Transaction {
        let tx = Transaction::new(
            src.id,
            dst.map(|d| d.id),
            Decimal::new(amount, 0),
            kind,
            &format!("ref-{}", TransactionId::new()),
            "t",
            crate::models::DEFAULT_TRANSACTION_TIMEOUT,
        );
        f.store.create_transaction(&tx).await.unwrap();
        f.locks.begin(&tx.id, &tx.accounts_to_lock()).await.unwrap();
        tx
    }

    #[tokio::test]
    async fn test_commit_transfer() {
        let f = fixture().await;
        let a = account(&f, 500).await;
        let b = account(&f, 200).await;
        let tx = pending(&f, TransactionType::Transfer, &a, Some(&b), 100).await;

        let outcome = f.committer.commit(&tx.id, "t").await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Completed(_)));
        assert_eq!(outcome.message(), "transaction completed");

        let a = f.store.get_account(&a.id).await.unwrap().unwrap();
        let b = f.store.get_account(&b.id).await.unwrap().unwrap();
        assert_eq!((a.balance, a.version), (Decimal::new(400, 0), 2));
        assert_eq!((b.balance, b.version), (Decimal::new(300, 0), 2));
        assert!(a.can_transact() && b.can_transact());
        assert_eq!(
            f.store.get_transaction(&tx.id).await.unwrap().unwrap().status,
            TransactionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_events_carry_a_per_call_request_id() {
        let f = fixture().await;
        let a = account(&f, 100).await;
        let b = account(&f, 100).await;
        let done = pending(&f, TransactionType::AddAmount, &a, None, 10).await;
        let failed = pending(&f, TransactionType::WithdrawAmount, &b, None, 500).await;

        f.committer.commit(&done.id, "t").await.unwrap();
        assert_eq!(
            f.committer.commit(&failed.id, "t").await,
            Err(BankError::InsufficientBalance)
        );

        let mut seen = Vec::new();
        for (tx, kind) in [
            (&done, EventKind::TransactionCommit),
            (&failed, EventKind::TransactionFail),
        ] {
            let events = f.store.list_events(&tx.id.to_string()).await.unwrap();
            let event = events.iter().find(|e| e.kind == kind).unwrap();
            let request_id = event.payload["request_id"].as_str().unwrap().to_string();
            assert!(uuid::Uuid::parse_str(&request_id).is_ok());
            assert_ne!(request_id, tx.id.to_string());
            seen.push(request_id);
        }
        assert_ne!(seen[0], seen[1]);
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let f = fixture().await;
        let a = account(&f, 100).await;
        let tx = pending(&f, TransactionType::AddAmount, &a, None, 10).await;

        f.committer.commit(&tx.id, "t").await.unwrap();
        let again = f.committer.commit(&tx.id, "t").await.unwrap();
        assert!(matches!(again, CommitOutcome::AlreadyCompleted(_)));
        assert_eq!(again.message(), "transaction already completed");

        let a = f.store.get_account(&a.id).await.unwrap().unwrap();
        assert_eq!(a.balance, Decimal::new(110, 0));
        assert_eq!(a.version, 2);
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails_and_unlocks() {
        let f = fixture().await;
        let a = account(&f, 500).await;
        let b = account(&f, 200).await;
        let tx = pending(&f, TransactionType::Transfer, &a, Some(&b), 600).await;

        assert_eq!(
            f.committer.commit(&tx.id, "t").await,
            Err(BankError::InsufficientBalance)
        );
        let stored = f.store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
        for id in [a.id, b.id] {
            let acc = f.store.get_account(&id).await.unwrap().unwrap();
            assert!(acc.can_transact());
            assert_eq!(acc.version, 1);
        }

        // Failed is terminal for later commits too
        assert!(matches!(
            f.committer.commit(&tx.id, "t").await,
            Err(BankError::TransactionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_transaction() {
        let f = fixture().await;
        let id = TransactionId::new();
        assert_eq!(
            f.committer.commit(&id, "t").await,
            Err(BankError::TransactionNotFound(id))
        );
    }

    #[tokio::test]
    async fn test_lock_count_mismatch_fails_transaction() {
        let f = fixture().await;
        let a = account(&f, 100).await;
        let tx = pending(&f, TransactionType::WithdrawAmount, &a, None, 10).await;
        f.locks.unlock(&tx.id).await.unwrap();

        assert_eq!(
            f.committer.commit(&tx.id, "t").await,
            Err(BankError::LockInconsistent { expected: 1, actual: 0 })
        );
        let stored = f.store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn test_timed_out_transaction_is_failed() {
        let f = fixture().await;
        let a = account(&f, 100).await;
        let mut tx = pending(&f, TransactionType::AddAmount, &a, None, 10).await;
        tx = f.store.get_transaction(&tx.id).await.unwrap().unwrap();
        tx.timeout_at = chrono::Utc::now() - chrono::TimeDelta::seconds(1);
        f.store.overwrite_transaction(tx.clone()).unwrap();

        assert!(matches!(
            f.committer.commit(&tx.id, "t").await,
            Err(BankError::Timeout(_))
        ));
        let stored = f.store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
        assert_eq!(stored.error_reason.as_deref(), Some("transaction timeout"));
        assert!(f.store.get_account(&a.id).await.unwrap().unwrap().can_transact());
    }

    #[tokio::test]
    async fn test_concurrent_claim_conflicts() {
        let f = fixture().await;
        let a = account(&f, 100).await;
        let tx = pending(&f, TransactionType::AddAmount, &a, None, 10).await;

        let _held = f.inflight.try_acquire(tx.id, Claimant::Recovery).unwrap();
        match f.committer.commit(&tx.id, "t").await {
            Err(BankError::Conflict(msg)) => assert!(msg.ends_with("by recovery"), "{}", msg),
            other => panic!("expected conflict, got {:?}", other),
        }
        // Untouched
        assert_eq!(
            f.store.get_transaction(&tx.id).await.unwrap().unwrap().status,
            TransactionStatus::Pending
        );
    }
}
