//! Customer entity - a grouping of accounts

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::account::{Account, ActiveStatus, RecordStatus};
use super::ids::CustomerId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub name: String,
    pub email: Option<String>,
    pub active_status: ActiveStatus,
    pub status: RecordStatus,
    pub version: i64,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    pub fn new(name: &str, email: Option<&str>, actor: &str) -> Self {
        let now = Utc::now();
        Self {
            id: CustomerId::new(),
            name: name.to_string(),
            email: email.map(str::to_string),
            active_status: ActiveStatus::Active,
            status: RecordStatus::Valid,
            version: 1,
            created_by: actor.to_string(),
            updated_by: actor.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status == RecordStatus::Invalid
    }

    /// A customer may be soft-deleted only when none of its live accounts
    /// holds a positive balance or participates in a transaction.
    pub fn can_be_deleted(&self, accounts: &[Account]) -> Result<(), String> {
        for acc in accounts.iter().filter(|a| !a.is_deleted()) {
            if acc.balance > Decimal::ZERO {
                return Err(format!("account {} still holds a positive balance", acc.id));
            }
            if acc.locked_for_tx || acc.active_transaction_id.is_some() {
                return Err(format!("account {} participates in a live transaction", acc.id));
            }
        }
        Ok(())
    }
}
