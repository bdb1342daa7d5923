//! Recovery Worker
//!
//! Periodic (and startup) sweeper that drives non-terminal transactions to a
//! terminal state after crashes, timeouts or partial failures.
//!
//! Each sweep holds the deployment-wide recovery lease and runs two passes:
//!
//! 1. Inconsistent locks: transactions still owning account locks while
//!    terminal, or whose participants had balances written under the lock
//!    while still non-terminal. Locks are force-released; non-terminal ones
//!    are failed.
//! 2. Stuck transactions: timed out → failed; retryable → marked
//!    `Recovering` and re-committed as `system`; retries exhausted → failed.
//!    The startup sweep also feeds non-timed-out `Pending`/`Recovering`
//!    transactions into this pass.
//!
//! Ids claimed by an in-flight commit in this process are skipped.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::committer::{CommitOutcome, TransactionCommitter};
use super::error::BankError;
use super::inflight::{Claimant, InFlight};
use super::lock::LockManager;
use crate::config::RecoveryConfig;
use crate::events::EventEmitter;
use crate::models::{EventKind, Transaction, TransactionStatus};
use crate::store::Stores;

/// Actor recorded on every recovery write
pub const RECOVERY_ACTOR: &str = "system";

pub const REASON_FORCED_UNLOCK: &str = "recovery: forced unlock due to inconsistent state";
pub const REASON_TIMEOUT: &str = "transaction timeout during recovery";

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// False when another runner held the lease and nothing was done
    pub lease_acquired: bool,
    /// Pass 1: transactions whose locks were force-released
    pub unlocked: usize,
    pub timed_out: usize,
    pub retried: usize,
    /// Retries that reached `completed`
    pub completed: usize,
    pub exhausted: usize,
    /// In flight elsewhere or already terminal when re-read
    pub skipped: usize,
    pub errors: usize,
}

impl RecoveryReport {
    pub fn acted(&self) -> usize {
        self.unlocked + self.timed_out + self.retried + self.exhausted
    }
}

pub struct RecoveryWorker {
    stores: Stores,
    locks: Arc<LockManager>,
    committer: Arc<TransactionCommitter>,
    events: Arc<EventEmitter>,
    inflight: InFlight,
    config: RecoveryConfig,
}

impl RecoveryWorker {
    pub fn new(
        stores: Stores,
        locks: Arc<LockManager>,
        committer: Arc<TransactionCommitter>,
        events: Arc<EventEmitter>,
        inflight: InFlight,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            stores,
            locks,
            committer,
            events,
            inflight,
            config,
        }
    }

    /// Run sweeps every `interval` until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Recovery worker disabled");
            return;
        }
        info!(
            interval_secs = self.config.interval_secs,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "Starting recovery worker"
        );

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; startup recovery is separate
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep(false).await {
                        Ok(report) if report.acted() > 0 || report.errors > 0 => {
                            info!(?report, "Recovery sweep finished");
                        }
                        Ok(_) => debug!("Recovery sweep found nothing to do"),
                        Err(e) => error!(error = %e, "Recovery sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Recovery worker stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One-off startup sweep, including interrupted initializations
    pub async fn run_startup(&self) -> Result<RecoveryReport, BankError> {
        if !self.config.enabled || !self.config.startup_recovery {
            debug!("Startup recovery disabled");
            return Ok(RecoveryReport::default());
        }
        let report = self.sweep(true).await?;
        info!(?report, "Startup recovery finished");
        Ok(report)
    }

    /// Both passes under the recovery lease
    pub async fn sweep(&self, include_pending: bool) -> Result<RecoveryReport, BankError> {
        if !self.stores.transactions.try_acquire_recovery_lease().await? {
            debug!("Recovery lease held elsewhere, skipping sweep");
            return Ok(RecoveryReport::default());
        }

        let mut report = RecoveryReport {
            lease_acquired: true,
            ..RecoveryReport::default()
        };
        let result = self.run_passes(include_pending, &mut report).await;

        if let Err(e) = self.stores.transactions.release_recovery_lease().await {
            warn!(error = %e, "Failed to release recovery lease");
        }
        result.map(|_| report)
    }

    async fn run_passes(
        &self,
        include_pending: bool,
        report: &mut RecoveryReport,
    ) -> Result<(), BankError> {
        self.reconcile_locks(report).await?;
        self.recover_stuck(include_pending, report).await
    }

    /// Pass 1
    async fn reconcile_locks(&self, report: &mut RecoveryReport) -> Result<(), BankError> {
        let candidates = self
            .stores
            .transactions
            .get_locked_but_incomplete(self.config.batch_size)
            .await?;
        if !candidates.is_empty() {
            info!(count = candidates.len(), "Found transactions with inconsistent locks");
        }

        for candidate in candidates {
            let Some(_guard) = self.inflight.try_acquire(candidate.id, Claimant::Recovery) else {
                report.skipped += 1;
                continue;
            };
            if let Err(e) = self.reconcile_one(&candidate).await {
                error!(tx_id = %candidate.id, error = %e, "Lock reconciliation failed");
                report.errors += 1;
            } else {
                report.unlocked += 1;
            }
        }
        Ok(())
    }

    async fn reconcile_one(&self, candidate: &Transaction) -> Result<(), BankError> {
        let participants = self.locks.accounts_in(&candidate.id).await?;
        let applied = participants.iter().any(|a| a.changed_under_lock());

        self.locks.force_unlock(&candidate.id).await?;

        let Some(mut tx) = self.stores.transactions.get_transaction(&candidate.id).await? else {
            return Err(BankError::TransactionNotFound(candidate.id));
        };
        if tx.is_terminal() {
            debug!(tx_id = %tx.id, status = %tx.status, "Released locks of terminal transaction");
            return Ok(());
        }

        if applied {
            error!(
                tx_id = %tx.id,
                reference_id = %tx.reference_id,
                "CRITICAL: balances were applied under lock but transaction never completed, operator review required"
            );
        }
        self.stores
            .transactions
            .update_status(
                &tx.id,
                TransactionStatus::Failed,
                Some(REASON_FORCED_UNLOCK),
                RECOVERY_ACTOR,
            )
            .await?;
        tx.status = TransactionStatus::Failed;
        tx.error_reason = Some(REASON_FORCED_UNLOCK.to_string());
        warn!(tx_id = %tx.id, "Transaction failed by forced unlock");
        self.emit_fail(&tx, &uuid::Uuid::new_v4().to_string()).await;
        Ok(())
    }

    /// Pass 2
    async fn recover_stuck(
        &self,
        include_pending: bool,
        report: &mut RecoveryReport,
    ) -> Result<(), BankError> {
        let now = Utc::now();
        let mut candidates = self
            .stores
            .transactions
            .get_stuck(now, self.config.batch_size)
            .await?;
        if include_pending {
            let pending = self
                .stores
                .transactions
                .get_pending(now, self.config.batch_size)
                .await?;
            let mut seen: HashSet<_> = candidates.iter().map(|t| t.id).collect();
            candidates.extend(pending.into_iter().filter(|t| seen.insert(t.id)));
        }
        if !candidates.is_empty() {
            info!(count = candidates.len(), include_pending, "Recovering transactions");
        }

        for candidate in candidates {
            let Some(_guard) = self.inflight.try_acquire(candidate.id, Claimant::Recovery) else {
                report.skipped += 1;
                continue;
            };
            // Re-read under the claim
            let tx = match self.stores.transactions.get_transaction(&candidate.id).await {
                Ok(Some(tx)) if !tx.is_terminal() => tx,
                Ok(_) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(tx_id = %candidate.id, error = %e, "Failed to reload transaction");
                    report.errors += 1;
                    continue;
                }
            };
            if let Err(e) = self.classify(tx, report).await {
                error!(tx_id = %candidate.id, error = %e, "Transaction recovery failed");
                report.errors += 1;
            }
        }
        Ok(())
    }

    async fn classify(&self, mut tx: Transaction, report: &mut RecoveryReport) -> Result<(), BankError> {
        let now = Utc::now();
        // Correlates every event of this recovery attempt
        let request_id = uuid::Uuid::new_v4().to_string();

        if tx.should_timeout_at(now) {
            self.fail_and_release(&mut tx, REASON_TIMEOUT, &request_id).await?;
            report.timed_out += 1;
            return Ok(());
        }

        if !tx.can_retry_with(self.config.max_retries, now) {
            let reason = format!("max retries exceeded ({} retries)", tx.retry_count);
            self.fail_and_release(&mut tx, &reason, &request_id).await?;
            report.exhausted += 1;
            return Ok(());
        }

        tx.mark_for_retry(RECOVERY_ACTOR);
        self.stores.transactions.update_on_recovery(&mut tx).await?;
        report.retried += 1;
        info!(
            tx_id = %tx.id,
            retry_count = tx.retry_count,
            "Retrying transaction"
        );

        // Initialization may have crashed before the participants were locked
        let held = self.locks.accounts_in(&tx.id).await?.len();
        if held < tx.expected_lock_count()
            && let Err(e) = self.locks.begin(&tx.id, &tx.accounts_to_lock()).await
        {
            let reason = format!("recovery: participants unavailable: {}", e);
            self.fail_and_release(&mut tx, &reason, &request_id).await?;
            return Ok(());
        }

        match self.committer.commit_claimed(&tx.id, RECOVERY_ACTOR, &request_id).await {
            Ok(CommitOutcome::Completed(_)) | Ok(CommitOutcome::AlreadyCompleted(_)) => {
                report.completed += 1;
            }
            Err(e) => {
                // The committer already terminalized what it could; anything
                // left non-terminal is reclassified by the next sweep
                warn!(
                    tx_id = %tx.id,
                    retry_count = tx.retry_count,
                    error = %e,
                    "Recovery retry did not complete"
                );
            }
        }
        Ok(())
    }

    async fn fail_and_release(
        &self,
        tx: &mut Transaction,
        reason: &str,
        request_id: &str,
    ) -> Result<(), BankError> {
        self.stores
            .transactions
            .complete_lifecycle(&tx.id, TransactionStatus::Failed, Some(reason))
            .await?;
        tx.status = TransactionStatus::Failed;
        tx.error_reason = Some(reason.to_string());
        warn!(tx_id = %tx.id, reason, "Transaction failed by recovery");
        self.emit_fail(tx, request_id).await;
        Ok(())
    }

    async fn emit_fail(&self, tx: &Transaction, request_id: &str) {
        self.events
            .transaction(EventKind::TransactionFail, tx, RECOVERY_ACTOR, request_id)
            .await;
    }
}
