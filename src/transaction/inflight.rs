//! In-flight registry
//!
//! Process-local set of transaction ids whose commit or recovery handling is
//! running. Commit and recovery both claim an id here before touching it, so
//! a sweep never acts on a transaction a caller is committing.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

use crate::models::TransactionId;

/// Who holds the claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claimant {
    Commit,
    Recovery,
}

#[derive(Debug, Default, Clone)]
pub struct InFlight {
    entries: Arc<DashMap<TransactionId, Claimant>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `tx_id`; `None` if someone else already holds it
    pub fn try_acquire(&self, tx_id: TransactionId, claimant: Claimant) -> Option<InFlightGuard> {
        match self.entries.entry(tx_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(claimant);
                Some(InFlightGuard {
                    entries: Arc::clone(&self.entries),
                    tx_id,
                })
            }
        }
    }

    pub fn holder(&self, tx_id: &TransactionId) -> Option<Claimant> {
        self.entries.get(tx_id).map(|e| *e)
    }
}

/// Releases the claim on drop
#[derive(Debug)]
pub struct InFlightGuard {
    entries: Arc<DashMap<TransactionId, Claimant>>,
    tx_id: TransactionId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.entries.remove(&self.tx_id);
    }
}
