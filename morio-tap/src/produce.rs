//! Structured message producer.
//!
//! Alarms, events and notifications share one envelope:
//!
//! ```json
//! { "host": { "id": "…" }, "tags": [], "morio": { "alarm": { "context", "data", "time", "title", "type", "hash" } } }
//! ```
//!
//! published on `{kind}s` with a `morio_context` header. `hash` is the
//! SHA-256 of `type + context` and is meant for grouping downstream; the
//! tap itself does not deduplicate.

use crate::cache::Cache;
use crate::error::TapError;
use crate::models::OutboundRecord;
use crate::tools::{clock, create_hash};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Broker side of the producer.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, record: OutboundRecord) -> Result<(), TapError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Alarm,
    Event,
    Notification,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Alarm => "alarm",
            MessageKind::Event => "event",
            MessageKind::Notification => "notification",
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            MessageKind::Alarm => "alarms",
            MessageKind::Event => "events",
            MessageKind::Notification => "notifications",
        }
    }
}

/// Caller input; every field is optional and defaulted in [`StructuredInput::build`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StructuredInput {
    pub context: Option<String>,
    pub data: Option<Value>,
    pub host: Option<String>,
    pub tags: Option<Vec<String>>,
    pub time: Option<i64>,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// A validated message, ready to publish.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredMessage {
    #[serde(skip)]
    pub kind: MessageKind,
    #[serde(skip)]
    pub host: String,
    #[serde(skip)]
    pub tags: Vec<String>,
    pub context: String,
    pub data: Value,
    pub time: i64,
    pub title: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub hash: String,
}

impl StructuredInput {
    pub fn from_value(value: Value) -> Result<Self, TapError> {
        if !value.is_object() {
            return Err(TapError::Invalid("structured message data must be an object".into()));
        }
        Ok(serde_json::from_value(value)?)
    }

    fn validate(&self) -> Result<(), TapError> {
        if matches!(self.kind.as_deref(), Some(t) if t.trim().is_empty()) {
            return Err(TapError::Invalid("type must not be empty".into()));
        }
        if matches!(self.context.as_deref(), Some(c) if c.trim().is_empty()) {
            return Err(TapError::Invalid("context must not be empty".into()));
        }
        if matches!(self.time, Some(t) if t < 0) {
            return Err(TapError::Invalid("time must not be negative".into()));
        }
        Ok(())
    }

    pub fn build(self, kind: MessageKind) -> Result<StructuredMessage, TapError> {
        self.validate()?;
        let name = kind.as_str();
        let context = self.context.unwrap_or_else(|| format!("{name}.context.missing"));
        let message_type = self.kind.unwrap_or_else(|| format!("{name}.type.missing"));
        let hash = create_hash(&format!("{message_type}{context}"));

        Ok(StructuredMessage {
            kind,
            host: self.host.unwrap_or_else(|| "unknown".into()),
            tags: self.tags.unwrap_or_default(),
            context,
            data: self.data.unwrap_or(Value::Null),
            time: self.time.unwrap_or_else(clock::now_ms),
            title: self.title.unwrap_or_else(|| format!("Untitled {name}")),
            message_type,
            hash,
        })
    }
}

impl StructuredMessage {
    pub fn to_record(&self) -> Result<OutboundRecord, TapError> {
        let mut morio = serde_json::Map::new();
        morio.insert(self.kind.as_str().to_string(), serde_json::to_value(self)?);
        let envelope = json!({
            "host": { "id": self.host },
            "tags": self.tags,
            "morio": morio,
        });
        Ok(OutboundRecord::json(self.kind.topic(), &envelope)?.with_header("morio_context", &self.context))
    }
}

#[derive(Clone)]
pub struct Producer {
    publisher: Arc<dyn Publisher>,
    cache: Cache,
}

impl Producer {
    /// Publish failures are noted through `cache`, never re-published.
    pub fn new(publisher: Arc<dyn Publisher>, cache: Cache) -> Self {
        Self { publisher, cache }
    }

    pub async fn alarm(&self, input: StructuredInput) -> Result<(), TapError> {
        self.structured(MessageKind::Alarm, input).await
    }

    pub async fn event(&self, input: StructuredInput) -> Result<(), TapError> {
        self.structured(MessageKind::Event, input).await
    }

    pub async fn notification(&self, input: StructuredInput) -> Result<(), TapError> {
        self.structured(MessageKind::Notification, input).await
    }

    pub async fn structured(&self, kind: MessageKind, input: StructuredInput) -> Result<(), TapError> {
        let message = input.build(kind)?;
        debug!("Producing {} {}", kind.as_str(), message.context);
        self.send(message.to_record()?).await
    }

    /// Forwards host telemetry to `inventory`; without `host.id` nothing is sent.
    pub async fn inventory_update(&self, data: &Value) -> Result<(), TapError> {
        let has_id = data
            .pointer("/host/id")
            .and_then(Value::as_str)
            .is_some_and(|id| !id.is_empty());
        if !has_id {
            self.cache.note("Inventory update lacks host ID", data.clone());
            return Ok(());
        }
        self.send(OutboundRecord::json("inventory", data)?).await
    }

    pub async fn metrics(&self, data: &Value) -> Result<(), TapError> {
        self.send(OutboundRecord::json("metrics", data)?).await
    }

    /// Publishes without noting a failure; the caller reports it.
    pub async fn publish(&self, record: OutboundRecord) -> Result<(), TapError> {
        self.publisher.publish(record).await
    }

    pub async fn send(&self, record: OutboundRecord) -> Result<(), TapError> {
        let topic = record.topic.clone();
        self.publish(record).await.inspect_err(|e| {
            self.cache.note(
                "Failed to produce message",
                json!({ "topic": topic, "error": e.to_string() }),
            );
        })
    }

    /// Publishes in the background; for callers that do not await delivery.
    pub fn detach<F>(&self, fut: F)
    where
        F: std::future::Future<Output = Result<(), TapError>> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                debug!("Detached publish failed: {}", e);
            }
        });
    }
}

/// Records everything published; optionally rejects every publish.
#[derive(Default)]
pub struct MemoryPublisher {
    records: Mutex<Vec<OutboundRecord>>,
    failing: Mutex<bool>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn records(&self) -> Vec<OutboundRecord> {
        self.records.lock().clone()
    }

    pub fn records_for(&self, topic: &str) -> Vec<OutboundRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

#[async_trait::async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, record: OutboundRecord) -> Result<(), TapError> {
        if *self.failing.lock() {
            return Err(TapError::Publish {
                topic: record.topic,
                reason: "publisher is failing".into(),
            });
        }
        self.records.lock().push(record);
        Ok(())
    }
}
