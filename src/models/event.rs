//! Append-only audit event

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::EventId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum AggregateType {
    Account = 1,
    Customer = 2,
    Transaction = 3,
}

impl AggregateType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(AggregateType::Account),
            2 => Some(AggregateType::Customer),
            3 => Some(AggregateType::Transaction),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateType::Account => "account",
            AggregateType::Customer => "customer",
            AggregateType::Transaction => "transaction",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    CustomerCreated,
    CustomerDeleted,
    AccountCreated,
    AccountDeleted,
    TransactionInit,
    TransactionCommit,
    TransactionFail,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CustomerCreated => "CustomerCreated",
            EventKind::CustomerDeleted => "CustomerDeleted",
            EventKind::AccountCreated => "AccountCreated",
            EventKind::AccountDeleted => "AccountDeleted",
            EventKind::TransactionInit => "TransactionInit",
            EventKind::TransactionCommit => "TransactionCommit",
            EventKind::TransactionFail => "TransactionFail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CustomerCreated" => Some(EventKind::CustomerCreated),
            "CustomerDeleted" => Some(EventKind::CustomerDeleted),
            "AccountCreated" => Some(EventKind::AccountCreated),
            "AccountDeleted" => Some(EventKind::AccountDeleted),
            "TransactionInit" => Some(EventKind::TransactionInit),
            "TransactionCommit" => Some(EventKind::TransactionCommit),
            "TransactionFail" => Some(EventKind::TransactionFail),
            _ => None,
        }
    }

    /// Aggregate an event kind belongs to
    pub fn aggregate_type(&self) -> AggregateType {
        match self {
            EventKind::CustomerCreated | EventKind::CustomerDeleted => AggregateType::Customer,
            EventKind::AccountCreated | EventKind::AccountDeleted => AggregateType::Account,
            EventKind::TransactionInit
            | EventKind::TransactionCommit
            | EventKind::TransactionFail => AggregateType::Transaction,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit record. Never updated or deleted once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub kind: EventKind,
    pub actor: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, aggregate_id: String, actor: &str, payload: serde_json::Value) -> Self {
        Self {
            id: EventId::new(),
            aggregate_type: kind.aggregate_type(),
            aggregate_id,
            kind,
            actor: actor.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_determines_aggregate() {
        let ev = Event::new(
            EventKind::TransactionCommit,
            "tx".into(),
            "system",
            serde_json::json!({}),
        );
        assert_eq!(ev.aggregate_type, AggregateType::Transaction);
        assert_eq!(EventKind::AccountCreated.aggregate_type(), AggregateType::Account);
        assert_eq!(EventKind::CustomerDeleted.aggregate_type(), AggregateType::Customer);
    }

    #[test]
    fn test_kind_parse_roundtrip() {
        for kind in [
            EventKind::CustomerCreated,
            EventKind::CustomerDeleted,
            EventKind::AccountCreated,
            EventKind::AccountDeleted,
            EventKind::TransactionInit,
            EventKind::TransactionCommit,
            EventKind::TransactionFail,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("Nope"), None);
    }
}
