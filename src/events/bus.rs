//! External event bus
//!
//! The event store is the durable record; the bus is distribution only.
//! Publishing is fire-and-forget from the core's point of view: a failed
//! publish is logged and never changes the outcome of the operation that
//! produced the event.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::Event;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus transport error: {0}")]
    Transport(String),

    #[error("Bus rejected event with status {0}")]
    Rejected(u16),

    #[error("Bus configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for BusError {
    fn from(e: reqwest::Error) -> Self {
        BusError::Transport(e.to_string())
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Bus name for logging
    fn name(&self) -> &'static str;

    /// Publish one event. Consumers must tolerate duplicates.
    async fn publish(&self, event: &Event) -> Result<(), BusError>;
}

/// Publishes to a Kafka-compatible REST proxy (`POST /topics/<topic>`)
pub struct HttpEventBus {
    client: reqwest::Client,
    url: String,
}

impl HttpEventBus {
    pub fn new(endpoint: &str, topic: &str, timeout: Duration) -> Result<Self, BusError> {
        if endpoint.trim().is_empty() || topic.trim().is_empty() {
            return Err(BusError::Config("endpoint and topic are required".into()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: topic_url(endpoint, topic),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn topic_url(endpoint: &str, topic: &str) -> String {
    format!("{}/topics/{}", endpoint.trim_end_matches('/'), topic)
}

/// REST proxy record envelope; keyed by aggregate id so one aggregate's
/// events land on one partition in order.
fn record_body(event: &Event) -> serde_json::Value {
    serde_json::json!({
        "records": [{
            "key": event.aggregate_id,
            "value": event,
        }]
    })
}

#[async_trait]
impl EventBus for HttpEventBus {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn publish(&self, event: &Event) -> Result<(), BusError> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/vnd.kafka.json.v2+json")
            .json(&record_body(event))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(BusError::Rejected(status.as_u16()))
        }
    }
}

/// In-process fan-out to local subscribers
pub struct BroadcastEventBus {
    tx: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn publish(&self, event: &Event) -> Result<(), BusError> {
        // No subscribers is not an error for a fire-and-forget bus
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}
