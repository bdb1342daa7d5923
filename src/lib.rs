//! bank_core - Transaction Coordination Core
//!
//! Moves money between customer accounts through a persistent, recoverable
//! lifecycle: create, lock participants, apply balances, complete, unlock.
//! A background recovery worker drives anything left in between to a
//! terminal state.
//!
//! # Modules
//!
//! - [`models`] - Customers, accounts, transactions and audit events
//! - [`money`] - Two-decimal amount parsing and validation
//! - [`store`] - Persistence ports plus in-memory and PostgreSQL backends
//! - [`transaction`] - Lock manager, initializer, committer, recovery, service
//! - [`events`] - Audit event emission and bus forwarding
//! - [`registry`] - Customer and account lifecycle
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup
//! - [`db`] - PostgreSQL pool management

pub mod config;
pub mod db;
pub mod events;
pub mod logging;
pub mod models;
pub mod money;
pub mod registry;
pub mod store;
pub mod transaction;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use events::{BroadcastEventBus, EventBus, EventEmitter, HttpEventBus};
pub use models::{
    Account, AccountId, AccountType, Customer, CustomerId, Event, EventKind, Transaction,
    TransactionId, TransactionStatus, TransactionType,
};
pub use registry::Registry;
pub use store::{InMemoryStore, PgStore, Stores, TransactionFilter};
pub use transaction::{
    BankError, CommitOutcome, InitRequest, RecoveryReport, RecoveryWorker, Reply,
    TransactionService,
};
