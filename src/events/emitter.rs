//! Event Emitter
//!
//! Appends audit events to the event store, then hands them to the external
//! bus. Neither step can fail the operation that emitted the event.
//!
//! Bus publishing runs on a single forwarding task fed in emit order, so the
//! bus sees events in the order they were appended.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::bus::EventBus;
use crate::models::{Account, Customer, Event, EventKind, Transaction};
use crate::money::format_amount;
use crate::store::EventStore;

pub struct EventEmitter {
    store: Arc<dyn EventStore>,
    forward: Option<mpsc::UnboundedSender<Event>>,
}

impl EventEmitter {
    /// With a bus, spawns its forwarding task; must run inside a Tokio runtime
    pub fn new(store: Arc<dyn EventStore>, bus: Option<Arc<dyn EventBus>>) -> Self {
        let forward = bus.map(|bus| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(forward_events(bus, rx));
            tx
        });
        Self { store, forward }
    }

    /// Persist `event` and forward it to the bus (best-effort)
    pub async fn emit(&self, event: Event) {
        if let Err(e) = self.store.append_event(&event).await {
            error!(
                event_id = %event.id,
                kind = %event.kind,
                aggregate_id = %event.aggregate_id,
                error = %e,
                "Failed to append event"
            );
        } else {
            debug!(event_id = %event.id, kind = %event.kind, "Event appended");
        }

        if let Some(forward) = &self.forward
            && let Err(unsent) = forward.send(event)
        {
            warn!(event_id = %unsent.0.id, "Event forwarder stopped, bus publish skipped");
        }
    }

    pub async fn transaction(
        &self,
        kind: EventKind,
        tx: &Transaction,
        actor: &str,
        request_id: &str,
    ) {
        let payload = transaction_payload(tx, actor, request_id);
        self.emit(Event::new(kind, tx.id.to_string(), actor, payload))
            .await;
    }

    pub async fn account(&self, kind: EventKind, account: &Account, actor: &str) {
        let payload = serde_json::json!({
            "account_id": account.id.to_string(),
            "customer_id": account.customer_id.to_string(),
            "account_type": account.account_type.as_str(),
            "balance": format_amount(account.balance),
            "version": account.version,
            "actor": actor,
        });
        self.emit(Event::new(kind, account.id.to_string(), actor, payload))
            .await;
    }

    pub async fn customer(&self, kind: EventKind, customer: &Customer, actor: &str) {
        let payload = serde_json::json!({
            "customer_id": customer.id.to_string(),
            "name": customer.name,
            "actor": actor,
        });
        self.emit(Event::new(kind, customer.id.to_string(), actor, payload))
            .await;
    }
}

/// Publish queued events one at a time until every emitter handle is dropped
async fn forward_events(bus: Arc<dyn EventBus>, mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = bus.publish(&event).await {
            warn!(
                bus = bus.name(),
                event_id = %event.id,
                kind = %event.kind,
                error = %e,
                "Event bus publish failed"
            );
        }
    }
    debug!(bus = bus.name(), "Event forwarder stopped");
}

/// Transaction event payload
pub fn transaction_payload(tx: &Transaction, actor: &str, request_id: &str) -> serde_json::Value {
    serde_json::json!({
        "transaction_id": tx.id.to_string(),
        "type": tx.tx_type.as_str(),
        "source_account": tx.source_account_id.to_string(),
        "destination_account": tx.destination_account_id.map(|d| d.to_string()),
        "amount": format_amount(tx.amount),
        "reference_id": tx.reference_id,
        "status": tx.status.as_str(),
        "error_reason": tx.error_reason,
        "actor": actor,
        "request_id": request_id,
    })
}
