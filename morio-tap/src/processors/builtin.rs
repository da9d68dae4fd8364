//! Processors that ship with the tap. Each one is small: pick the relevant
//! part of the message and hand it to the cache, the producer or the inventory.

use super::Processor;
use crate::error::TapError;
use crate::models::Envelope;
use crate::produce::StructuredInput;
use crate::tools::{create_context, extract, Tools};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Minimum time between two inventory forwards for the same host.
pub const INVENTORY_INTERVAL: Duration = Duration::from_secs(300);

pub fn builtins() -> Vec<Arc<dyn Processor>> {
    vec![
        Arc::new(AuditProcessor),
        Arc::new(ChecksProcessor),
        Arc::new(LogsProcessor),
        Arc::new(MetricsProcessor::default()),
        Arc::new(InventoryProcessor),
    ]
}

fn topics(list: &[&str]) -> Vec<String> {
    list.iter().map(|t| t.to_string()).collect()
}

pub struct AuditProcessor;

#[async_trait::async_trait]
impl Processor for AuditProcessor {
    fn name(&self) -> &str {
        "audit"
    }

    fn topics(&self) -> Vec<String> {
        topics(&["audit"])
    }

    async fn handle(&self, envelope: &Envelope, tools: &Tools, _topic: &str) -> Result<(), TapError> {
        tools.cache.audit(&envelope.data);
        Ok(())
    }
}

/// Caches healthchecks and raises an alarm for every failing one.
pub struct ChecksProcessor;

#[async_trait::async_trait]
impl Processor for ChecksProcessor {
    fn name(&self) -> &str {
        "checks"
    }

    fn topics(&self) -> Vec<String> {
        topics(&["checks"])
    }

    async fn handle(&self, envelope: &Envelope, tools: &Tools, _topic: &str) -> Result<(), TapError> {
        let data = &envelope.data;
        if !data.is_object() {
            return Err(TapError::handler(self.name(), "healthcheck is not an object"));
        }
        tools.cache.healthcheck(data);

        if data.get("up") == Some(&Value::Bool(false)) {
            let id = match data.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => extract::check(data),
            };
            let input = StructuredInput {
                context: Some(create_context(&["check", &id])),
                data: Some(data.clone()),
                host: data.get("host").and_then(Value::as_str).map(str::to_string),
                tags: Some(vec!["check".into()]),
                time: None,
                title: Some(format!("Check {id} is down")),
                kind: Some("check.down".into()),
            };
            let produce = tools.produce.clone();
            tools.produce.detach(async move { produce.alarm(input).await });
        }
        Ok(())
    }
}

/// Caches log lines under their dataset; the line itself is `message` when present.
pub struct LogsProcessor;

#[async_trait::async_trait]
impl Processor for LogsProcessor {
    fn name(&self) -> &str {
        "logs"
    }

    fn topics(&self) -> Vec<String> {
        topics(&["logs"])
    }

    async fn handle(&self, envelope: &Envelope, tools: &Tools, _topic: &str) -> Result<(), TapError> {
        let data = &envelope.data;
        let logset = data
            .pointer("/event/dataset")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown-logset");
        let line = data.get("message").unwrap_or(data);
        tools.cache.logline(logset, line, data);
        Ok(())
    }
}

/// Caches metricsets and forwards host telemetry to the inventory topic,
/// at most once per host per [`INVENTORY_INTERVAL`].
#[derive(Default)]
pub struct MetricsProcessor {
    forwarded: Mutex<HashMap<String, Instant>>,
}

impl MetricsProcessor {
    fn should_forward(&self, host: &str, now: Instant) -> bool {
        let mut forwarded = self.forwarded.lock();
        match forwarded.get(host) {
            Some(last) if now.duration_since(*last) < INVENTORY_INTERVAL => false,
            _ => {
                forwarded.retain(|_, last| now.duration_since(*last) < INVENTORY_INTERVAL);
                forwarded.insert(host.to_string(), now);
                true
            }
        }
    }
}

#[async_trait::async_trait]
impl Processor for MetricsProcessor {
    fn name(&self) -> &str {
        "metrics"
    }

    fn topics(&self) -> Vec<String> {
        topics(&["metrics"])
    }

    async fn handle(&self, envelope: &Envelope, tools: &Tools, _topic: &str) -> Result<(), TapError> {
        let data = &envelope.data;
        let metricset = extract::metricset(data);
        let module = data.pointer("/event/module").and_then(Value::as_str).unwrap_or("");
        let metrics = data
            .pointer(&format!("/{module}/{metricset}"))
            .or_else(|| data.pointer(&format!("/morio/tap/{metricset}")))
            .cloned()
            .unwrap_or(Value::Null);
        tools.cache.metricset(&metricset, &metrics, data);

        if let Some(host) = data.pointer("/host/id").and_then(Value::as_str) {
            if self.should_forward(host, Instant::now()) {
                debug!("Forwarding telemetry of host {} to inventory", host);
                let telemetry = json!({ "host": data["host"] });
                let produce = tools.produce.clone();
                tools
                    .produce
                    .detach(async move { produce.inventory_update(&telemetry).await });
            }
        }
        Ok(())
    }
}

pub struct InventoryProcessor;

#[async_trait::async_trait]
impl Processor for InventoryProcessor {
    fn name(&self) -> &str {
        "inventory"
    }

    fn topics(&self) -> Vec<String> {
        topics(&["inventory"])
    }

    async fn handle(&self, envelope: &Envelope, tools: &Tools, _topic: &str) -> Result<(), TapError> {
        tools.inventory.submit(envelope.data.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, CachePolicies};
    use crate::config::NodeConf;
    use crate::inventory::{Inventory, InventoryExecutor, MemoryInventory, Statement, StatementResult};
    use crate::produce::{MemoryPublisher, Producer};
    use crate::store::MemoryStore;

    /// Answers like [`MemoryInventory`], after a delay.
    struct SlowInventory {
        delay: Duration,
        inner: MemoryInventory,
    }

    #[async_trait::async_trait]
    impl InventoryExecutor for SlowInventory {
        async fn execute(&self, statements: Vec<Statement>) -> Result<Vec<StatementResult>, TapError> {
            tokio::time::sleep(self.delay).await;
            self.inner.execute(statements).await
        }
    }

    fn tools(executor: Arc<dyn InventoryExecutor>) -> Tools {
        let cache = Cache::spawn(Arc::new(MemoryStore::new()), CachePolicies::default(), 64);
        Tools {
            produce: Producer::new(Arc::new(MemoryPublisher::new()), cache.clone()),
            inventory: Inventory::new(executor, cache.clone()),
            cache,
            node: NodeConf::default(),
        }
    }

    #[test]
    fn test_builtin_names_are_unique() {
        let names: Vec<String> = builtins().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["audit", "checks", "logs", "metrics", "inventory"]);
    }

    #[test]
    fn test_inventory_forward_is_throttled_per_host() {
        let processor = MetricsProcessor::default();
        let start = Instant::now();
        assert!(processor.should_forward("h1", start));
        assert!(!processor.should_forward("h1", start + Duration::from_secs(60)));
        assert!(processor.should_forward("h2", start + Duration::from_secs(60)));
        assert!(processor.should_forward("h1", start + INVENTORY_INTERVAL));
    }

    #[test]
    fn test_throttle_forgets_quiet_hosts() {
        let processor = MetricsProcessor::default();
        let start = Instant::now();
        for host in ["h1", "h2", "h3"] {
            assert!(processor.should_forward(host, start));
        }
        assert_eq!(processor.forwarded.lock().len(), 3);

        assert!(processor.should_forward("h4", start + INVENTORY_INTERVAL));
        let forwarded = processor.forwarded.lock();
        assert_eq!(forwarded.len(), 1);
        assert!(forwarded.contains_key("h4"));
    }

    #[tokio::test]
    async fn test_slow_inventory_does_not_hold_up_dispatch() {
        let executor = Arc::new(SlowInventory {
            delay: Duration::from_millis(500),
            inner: MemoryInventory::new(),
        });
        let tools = tools(executor.clone());
        let envelope = Envelope {
            timestamp: None,
            offset: None,
            data: json!({ "host": { "id": "h1", "ip": ["10.0.0.1"] } }),
        };

        let started = Instant::now();
        InventoryProcessor.handle(&envelope, &tools, "inventory").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(executor.inner.batches().is_empty());

        let deadline = Instant::now() + Duration::from_secs(5);
        while executor.inner.batches().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(executor.inner.batches().len(), 1);
        assert_eq!(executor.inner.batches()[0].len(), 2);
    }
}
