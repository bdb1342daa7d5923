//! Audit events: durable append to the event store, best-effort bus forwarding

pub mod bus;
pub mod emitter;

pub use bus::{BroadcastEventBus, BusError, EventBus, HttpEventBus};
pub use emitter::{EventEmitter, transaction_payload};
