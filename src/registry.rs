//! Customer and account lifecycle
//!
//! Opens and soft-deletes customers and accounts, emitting the matching audit
//! events. Closing enforces that no money or live transaction is left behind.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

use crate::events::EventEmitter;
use crate::models::{Account, AccountId, AccountType, Customer, CustomerId, EventKind};
use crate::money;
use crate::store::Stores;
use crate::transaction::error::BankError;

pub struct Registry {
    stores: Stores,
    events: Arc<EventEmitter>,
}

impl Registry {
    pub fn new(stores: Stores, events: Arc<EventEmitter>) -> Self {
        Self { stores, events }
    }

    pub async fn open_customer(
        &self,
        name: &str,
        email: Option<&str>,
        actor: &str,
    ) -> Result<Customer, BankError> {
        if name.trim().is_empty() {
            return Err(BankError::Validation("customer name is required".into()));
        }
        let customer = Customer::new(name.trim(), email, actor);
        self.stores.customers.create_customer(&customer).await?;
        info!(customer_id = %customer.id, "Customer created");
        self.events
            .customer(EventKind::CustomerCreated, &customer, actor)
            .await;
        Ok(customer)
    }

    pub async fn open_account(
        &self,
        customer_id: &CustomerId,
        account_type: AccountType,
        opening_balance: Decimal,
        actor: &str,
    ) -> Result<Account, BankError> {
        let balance = money::normalize(opening_balance)?;
        match self.stores.customers.get_customer(customer_id).await? {
            Some(owner) if !owner.is_deleted() => {}
            _ => return Err(BankError::CustomerNotFound(*customer_id)),
        }
        let account = Account::new(*customer_id, account_type, balance, actor);
        self.stores.accounts.create_account(&account).await?;
        info!(
            account_id = %account.id,
            customer_id = %customer_id,
            balance = %account.balance,
            "Account created"
        );
        self.events
            .account(EventKind::AccountCreated, &account, actor)
            .await;
        Ok(account)
    }

    /// Soft-delete; the account must be empty and not in a transaction
    pub async fn close_account(&self, id: &AccountId, actor: &str) -> Result<Account, BankError> {
        let account = self
            .stores
            .accounts
            .get_account(id)
            .await?
            .ok_or(BankError::AccountNotFound(*id))?;
        if account.is_deleted() {
            return Err(BankError::AccountNotFound(*id));
        }
        if account.locked_for_tx || account.active_transaction_id.is_some() {
            return Err(BankError::AccountLocked(*id));
        }
        if account.balance > Decimal::ZERO {
            return Err(BankError::Validation(format!(
                "account {} still holds {}",
                id,
                money::format_amount(account.balance)
            )));
        }
        let closed = self
            .stores
            .accounts
            .soft_delete_account(id, account.version, actor)
            .await?;
        info!(account_id = %id, "Account closed");
        self.events
            .account(EventKind::AccountDeleted, &closed, actor)
            .await;
        Ok(closed)
    }

    /// Soft-delete; no live account may hold money or a lock
    pub async fn close_customer(
        &self,
        id: &CustomerId,
        actor: &str,
    ) -> Result<Customer, BankError> {
        let customer = self
            .stores
            .customers
            .get_customer(id)
            .await?
            .filter(|c| !c.is_deleted())
            .ok_or(BankError::CustomerNotFound(*id))?;
        let accounts = self.stores.accounts.list_accounts_by_customer(id).await?;
        customer
            .can_be_deleted(&accounts)
            .map_err(BankError::Validation)?;
        let closed = self
            .stores
            .customers
            .soft_delete_customer(id, customer.version, actor)
            .await?;
        info!(customer_id = %id, "Customer closed");
        self.events
            .customer(EventKind::CustomerDeleted, &closed, actor)
            .await;
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecordStatus, TransactionId};
    use crate::store::{AccountStore, EventStore, InMemoryStore};

    fn registry() -> (Arc<InMemoryStore>, Registry) {
        let store = Arc::new(InMemoryStore::new());
        let stores = Stores::from_shared(store.clone());
        let events = Arc::new(EventEmitter::new(stores.events.clone(), None));
        (store, Registry::new(stores, events))
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let (store, reg) = registry();
        let customer = reg.open_customer("Grace", Some("g@bank.test"), "teller").await.unwrap();
        let acc = reg
            .open_account(&customer.id, AccountType::Savings, Decimal::ZERO, "teller")
            .await
            .unwrap();

        let closed = reg.close_account(&acc.id, "teller").await.unwrap();
        assert_eq!(closed.status, RecordStatus::Invalid);
        assert_eq!(closed.version, 2);

        let gone = reg.close_customer(&customer.id, "teller").await.unwrap();
        assert!(gone.is_deleted());

        let kinds: Vec<EventKind> = store
            .list_events(&customer.id.to_string())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::CustomerCreated, EventKind::CustomerDeleted]);
        assert_eq!(store.list_events(&acc.id.to_string()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_account_with_money_stays_open() {
        let (_store, reg) = registry();
        let customer = reg.open_customer("Ann", None, "t").await.unwrap();
        let acc = reg
            .open_account(&customer.id, AccountType::Current, Decimal::new(1, 2), "t")
            .await
            .unwrap();
        assert!(matches!(
            reg.close_account(&acc.id, "t").await,
            Err(BankError::Validation(_))
        ));
        assert!(matches!(
            reg.close_customer(&customer.id, "t").await,
            Err(BankError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_locked_account_stays_open() {
        let (store, reg) = registry();
        let customer = reg.open_customer("Bo", None, "t").await.unwrap();
        let acc = reg
            .open_account(&customer.id, AccountType::Current, Decimal::ZERO, "t")
            .await
            .unwrap();
        store
            .lock_for_transaction(&[acc.id], &TransactionId::new())
            .await
            .unwrap();
        assert_eq!(
            reg.close_account(&acc.id, "t").await,
            Err(BankError::AccountLocked(acc.id))
        );
        assert!(matches!(
            reg.close_customer(&customer.id, "t").await,
            Err(BankError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_open_account_rules() {
        let (_store, reg) = registry();
        let missing = CustomerId::new();
        assert_eq!(
            reg.open_account(&missing, AccountType::Current, Decimal::ZERO, "t").await,
            Err(BankError::CustomerNotFound(missing))
        );

        let customer = reg.open_customer("Cy", None, "t").await.unwrap();
        assert!(matches!(
            reg.open_account(&customer.id, AccountType::Current, Decimal::new(-5, 0), "t").await,
            Err(BankError::InvalidAmount(_))
        ));
        assert!(matches!(
            reg.open_account(&customer.id, AccountType::Current, Decimal::new(1, 3), "t").await,
            Err(BankError::InvalidAmount(_))
        ));

        reg.close_customer(&customer.id, "t").await.unwrap();
        assert_eq!(
            reg.open_account(&customer.id, AccountType::Current, Decimal::ZERO, "t").await,
            Err(BankError::CustomerNotFound(customer.id))
        );
        assert!(matches!(
            reg.open_customer("  ", None, "t").await,
            Err(BankError::Validation(_))
        ));
    }
}
