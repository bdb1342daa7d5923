//! Entity model: customers, accounts, transactions and audit events

pub mod account;
pub mod customer;
pub mod event;
pub mod ids;
pub mod transaction;

pub use account::{Account, AccountType, ActiveStatus, RecordStatus};
pub use customer::Customer;
pub use event::{AggregateType, Event, EventKind};
pub use ids::{AccountId, CustomerId, EventId, TransactionId};
pub use transaction::{
    DEFAULT_TRANSACTION_TIMEOUT, MAX_RETRIES, Transaction, TransactionStatus, TransactionType,
};
