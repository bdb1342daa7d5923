//! Transaction coordination core
//!
//! Every money movement goes through a persistent lifecycle:
//!
//! ```text
//!            init (create + lock)            commit
//! request ─────────────────────→ PENDING ───────────────→ COMPLETED
//!                                   │  ╲
//!                         recovery  │   ╲ any failure
//!                                   ↓    ↘
//!                              RECOVERING ──→ FAILED
//! ```
//!
//! # Safety Invariants
//!
//! 1. **All-or-nothing locking**: participants lock together or not at all
//! 2. **Locked writes**: a locked account is written only by its owner
//! 3. **Versioned writes**: two writes with the same expected version never
//!    both succeed
//! 4. **Terminal is final**: `completed`, `failed` and `cancelled` never change

pub mod balance;
pub mod committer;
pub mod error;
pub mod inflight;
pub mod initializer;
pub mod lock;
pub mod recovery;
pub mod service;


pub use committer::{CommitOutcome, TransactionCommitter};
pub use error::BankError;
pub use inflight::{Claimant, InFlight};
pub use initializer::{InitRequest, InitializerConfig, TransactionInitializer};
pub use lock::LockManager;
pub use recovery::{RecoveryReport, RecoveryWorker};
pub use service::{Reply, TransactionService};
