//! End-to-end banking scenarios through the public API
//!
//! Each test wires a fresh in-memory store, the registry and the transaction
//! service exactly as the binary does.

use std::sync::Arc;
use std::time::Duration;

use bank_core::config::AppConfig;
use bank_core::events::{BroadcastEventBus, EventBus, EventEmitter};
use bank_core::models::{AccountType, EventKind, TransactionStatus, TransactionType};
use bank_core::money::parse_amount;
use bank_core::store::{AccountStore, EventStore, InMemoryStore, Stores, TransactionFilter};
use bank_core::transaction::{BankError, InitRequest, TransactionService};
use bank_core::{Account, Registry};
use rust_decimal::Decimal;

struct Bank {
    store: Arc<InMemoryStore>,
    registry: Registry,
    service: TransactionService,
}

impl Bank {
    fn new(bus: Option<Arc<dyn EventBus>>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let stores = Stores::from_shared(store.clone());
        let events = Arc::new(EventEmitter::new(stores.events.clone(), bus));
        let registry = Registry::new(stores.clone(), events.clone());
        let service = TransactionService::new(stores, events, AppConfig::default());
        Self {
            store,
            registry,
            service,
        }
    }

    async fn open(&self, balances: &[&str]) -> Vec<Account> {
        let customer = self
            .registry
            .open_customer("Ada Lovelace", Some("ada@bank.test"), "teller")
            .await
            .unwrap();
        let mut accounts = Vec::new();
        for b in balances {
            let acc = self
                .registry
                .open_account(
                    &customer.id,
                    AccountType::Current,
                    parse_amount(b).unwrap(),
                    "teller",
                )
                .await
                .unwrap();
            accounts.push(acc);
        }
        accounts
    }

    async fn balance(&self, account: &Account) -> Decimal {
        self.store
            .get_account(&account.id)
            .await
            .unwrap()
            .unwrap()
            .balance
    }
}

#[tokio::test]
async fn transfer_moves_money_and_releases_locks() {
    let bank = Bank::new(None);
    let accs = bank.open(&["250.00", "10.00"]).await;

    let init = bank
        .service
        .init_transaction(InitRequest::transfer(
            accs[0].id,
            accs[1].id,
            parse_amount("99.99").unwrap(),
            "invoice-1",
            "web",
        ))
        .await
        .unwrap();
    assert_eq!(init.message, "transaction initialized");
    assert_eq!(init.value.status, TransactionStatus::Pending);

    let locked = bank.store.get_account(&accs[0].id).await.unwrap().unwrap();
    assert!(locked.is_locked_by(&init.value.id));

    let done = bank
        .service
        .commit_transaction(&init.value.id, "web")
        .await
        .unwrap();
    assert_eq!(done.message, "transaction completed");
    assert_eq!(done.value.status, TransactionStatus::Completed);

    assert_eq!(bank.balance(&accs[0]).await, parse_amount("150.01").unwrap());
    assert_eq!(bank.balance(&accs[1]).await, parse_amount("109.99").unwrap());
    for acc in bank.store.all_accounts().unwrap() {
        assert!(acc.can_transact(), "{} still locked", acc.id);
        assert_eq!(acc.version, 2);
    }

    let again = bank
        .service
        .commit_transaction(&init.value.id, "web")
        .await
        .unwrap();
    assert_eq!(again.message, "transaction already completed");
    assert_eq!(bank.balance(&accs[0]).await, parse_amount("150.01").unwrap());
}

#[tokio::test]
async fn insufficient_funds_fail_the_transaction() {
    let bank = Bank::new(None);
    let accs = bank.open(&["5.00", "0.00"]).await;

    let init = bank
        .service
        .init_transaction(InitRequest::transfer(
            accs[0].id,
            accs[1].id,
            parse_amount("5.01").unwrap(),
            "too-much",
            "web",
        ))
        .await
        .unwrap();
    let err = bank
        .service
        .commit_transaction(&init.value.id, "web")
        .await
        .unwrap_err();
    assert_eq!(err, BankError::InsufficientBalance);
    assert_eq!(err.code(), "INSUFFICIENT_BALANCE");

    let history = bank
        .service
        .get_transaction_history(&TransactionFilter::for_account(accs[0].id))
        .await
        .unwrap();
    assert_eq!(history.total, 1);
    assert_eq!(history.items[0].status, TransactionStatus::Failed);
    assert_eq!(bank.balance(&accs[0]).await, parse_amount("5.00").unwrap());
    assert!(bank
        .store
        .all_accounts()
        .unwrap()
        .iter()
        .all(Account::can_transact));
}

#[tokio::test]
async fn reference_ids_are_single_use() {
    let bank = Bank::new(None);
    let accs = bank.open(&["100.00"]).await;
    let deposit = |reference: &str| {
        InitRequest::new(
            accs[0].id,
            None,
            Decimal::TEN,
            TransactionType::AddAmount,
            reference,
            "atm",
        )
    };

    let first = bank.service.init_transaction(deposit("atm-7")).await.unwrap();
    bank.service
        .commit_transaction(&first.value.id, "atm")
        .await
        .unwrap();

    assert_eq!(
        bank.service.init_transaction(deposit("atm-7")).await,
        Err(BankError::DuplicateReference("atm-7".into()))
    );
    assert_eq!(bank.balance(&accs[0]).await, parse_amount("110.00").unwrap());
}

#[tokio::test]
async fn withdraw_full_drains_and_then_refuses() {
    let bank = Bank::new(None);
    let accs = bank.open(&["42.17"]).await;
    let drain = |reference: &str| {
        InitRequest::new(
            accs[0].id,
            None,
            Decimal::ZERO,
            TransactionType::WithdrawFull,
            reference,
            "branch",
        )
    };

    let init = bank.service.init_transaction(drain("close-1")).await.unwrap();
    bank.service
        .commit_transaction(&init.value.id, "branch")
        .await
        .unwrap();
    assert_eq!(bank.balance(&accs[0]).await, Decimal::ZERO);

    assert_eq!(
        bank.service.init_transaction(drain("close-2")).await,
        Err(BankError::AccountEmpty)
    );

    // An emptied account can be closed
    let closed = bank.registry.close_account(&accs[0].id, "branch").await.unwrap();
    assert!(closed.is_deleted());
}

#[tokio::test]
async fn locked_account_rejects_a_second_transaction() {
    let bank = Bank::new(None);
    let accs = bank.open(&["100.00", "100.00", "100.00"]).await;

    let first = bank
        .service
        .init_transaction(InitRequest::transfer(
            accs[0].id,
            accs[1].id,
            Decimal::ONE,
            "first",
            "web",
        ))
        .await
        .unwrap();
    let second = bank
        .service
        .init_transaction(InitRequest::transfer(
            accs[2].id,
            accs[1].id,
            Decimal::ONE,
            "second",
            "web",
        ))
        .await;
    assert_eq!(second, Err(BankError::AccountLocked(accs[1].id)));

    // The rejected request left nothing locked behind
    let third = bank.store.get_account(&accs[2].id).await.unwrap().unwrap();
    assert!(third.can_transact());

    bank.service
        .commit_transaction(&first.value.id, "web")
        .await
        .unwrap();
    bank.service
        .init_transaction(InitRequest::transfer(
            accs[2].id,
            accs[1].id,
            Decimal::ONE,
            "second-retry",
            "web",
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn closed_customer_cannot_transact() {
    let bank = Bank::new(None);
    let customer = bank.registry.open_customer("Temp", None, "teller").await.unwrap();
    let acc = bank
        .registry
        .open_account(&customer.id, AccountType::Savings, Decimal::ZERO, "teller")
        .await
        .unwrap();
    bank.registry.close_account(&acc.id, "teller").await.unwrap();
    bank.registry.close_customer(&customer.id, "teller").await.unwrap();

    let res = bank
        .service
        .init_transaction(InitRequest::new(
            acc.id,
            None,
            Decimal::ONE,
            TransactionType::AddAmount,
            "late-deposit",
            "atm",
        ))
        .await;
    assert_eq!(res, Err(BankError::CustomerNotFound(customer.id)));
}

#[tokio::test]
async fn history_is_newest_first_and_paged() {
    let bank = Bank::new(None);
    let accs = bank.open(&["1000.00"]).await;
    let mut ids = Vec::new();
    for i in 0..5 {
        let init = bank
            .service
            .init_transaction(InitRequest::new(
                accs[0].id,
                None,
                Decimal::ONE,
                TransactionType::WithdrawAmount,
                &format!("w-{}", i),
                "atm",
            ))
            .await
            .unwrap();
        bank.service
            .commit_transaction(&init.value.id, "atm")
            .await
            .unwrap();
        ids.push(init.value.id);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let filter = TransactionFilter {
        limit: 2,
        offset: 1,
        tx_type: Some(TransactionType::WithdrawAmount),
        ..TransactionFilter::for_account(accs[0].id)
    };
    let page = bank.service.get_transaction_history(&filter).await.unwrap();
    assert_eq!(page.total, 5);
    let got: Vec<_> = page.items.iter().map(|t| t.id).collect();
    assert_eq!(got, vec![ids[3], ids[2]]);
    assert_eq!(bank.balance(&accs[0]).await, parse_amount("995.00").unwrap());
}

#[tokio::test]
async fn audit_trail_and_bus_follow_the_lifecycle() {
    let bus = Arc::new(BroadcastEventBus::new(64));
    let mut rx = bus.subscribe();
    let bank = Bank::new(Some(bus.clone() as Arc<dyn EventBus>));
    let accs = bank.open(&["20.00", "0.00"]).await;

    let init = bank
        .service
        .init_transaction(InitRequest::transfer(
            accs[0].id,
            accs[1].id,
            Decimal::TEN,
            "audit-1",
            "web",
        ))
        .await
        .unwrap();
    bank.service
        .commit_transaction(&init.value.id, "web")
        .await
        .unwrap();

    let trail = bank
        .store
        .list_events(&init.value.id.to_string())
        .await
        .unwrap();
    let kinds: Vec<_> = trail.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::TransactionInit, EventKind::TransactionCommit]);
    assert_eq!(trail[1].payload["status"], "COMPLETED");
    assert_eq!(trail[1].payload["reference_id"], "audit-1");
    assert!(!trail[0].payload["request_id"].as_str().unwrap().is_empty());
    assert_eq!(trail[1].payload["actor"], "web");

    // 1 customer + 2 accounts + init + commit
    let mut seen = Vec::new();
    while seen.len() < 5 {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("bus delivery")
            .unwrap();
        seen.push(event.kind);
    }
    assert!(seen.contains(&EventKind::TransactionCommit));
    assert_eq!(seen.iter().filter(|k| **k == EventKind::AccountCreated).count(), 2);
}

#[tokio::test]
async fn startup_recovery_finishes_an_interrupted_transfer() {
    let bank = Bank::new(None);
    let accs = bank.open(&["80.00", "20.00"]).await;

    // Process died right after init: pending row holding its locks
    let init = bank
        .service
        .init_transaction(InitRequest::transfer(
            accs[0].id,
            accs[1].id,
            parse_amount("30.00").unwrap(),
            "crash-1",
            "web",
        ))
        .await
        .unwrap();

    let report = bank.service.recovery_worker().run_startup().await.unwrap();
    assert!(report.lease_acquired);
    assert_eq!(report.retried, 1);
    assert_eq!(report.completed, 1);

    let tx = bank
        .service
        .get_transaction_history(&TransactionFilter::for_account(accs[0].id))
        .await
        .unwrap()
        .items
        .remove(0);
    assert_eq!(tx.id, init.value.id);
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.retry_count, 1);
    assert_eq!(bank.balance(&accs[0]).await, parse_amount("50.00").unwrap());
    assert_eq!(bank.balance(&accs[1]).await, parse_amount("50.00").unwrap());

    // Nothing left for a second pass
    let report = bank.service.recovery_worker().run_startup().await.unwrap();
    assert_eq!(report.acted(), 0);
}
