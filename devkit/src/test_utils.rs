/*!
Test harness for tap processors.

Wires a real `Dispatcher` to in-memory adapters:
- `MemoryStore` behind the cache worker
- `MemoryPublisher` behind the producer
- `MemoryInventory` behind the inventory

so a test can dispatch records and then read back what landed in the
cache, on the broker and in the inventory.
*/

use anyhow::Result;
use morio_tap::cache::{Cache, CachePolicies};
use morio_tap::config::{NodeConf, TapConfig};
use morio_tap::inventory::{Inventory, MemoryInventory, Statement};
use morio_tap::processors::builtin::builtins;
use morio_tap::produce::{MemoryPublisher, Producer};
use morio_tap::store::{MemoryStore, Store};
use morio_tap::{
    Counters, DispatchReport, Dispatcher, InboundMessage, Processor, ProcessorRegistry, SharedCounters, Tools,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub publisher: Arc<MemoryPublisher>,
    pub inventory: Arc<MemoryInventory>,
    pub tools: Tools,
    dispatcher: Dispatcher,
}

impl TestHarness {
    /// Harness around the given processors, default cache policies.
    pub fn new(processors: Vec<Arc<dyn Processor>>) -> Self {
        let mut registry = ProcessorRegistry::new();
        for processor in processors {
            registry.register(processor);
        }
        Self::with_registry(registry, CachePolicies::default())
    }

    /// Harness around the built-in processors, configured like the service would be.
    pub fn builtin(config: &TapConfig) -> Self {
        let registry = ProcessorRegistry::from_config(&config.processors, builtins());
        Self::with_registry(registry, config.cache.clone())
    }

    fn with_registry(registry: ProcessorRegistry, policies: CachePolicies) -> Self {
        env_logger::try_init().ok();

        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let inventory = Arc::new(MemoryInventory::new());
        let cache = Cache::spawn(store.clone(), policies, 1024);
        let tools = Tools {
            produce: Producer::new(publisher.clone(), cache.clone()),
            inventory: Inventory::new(inventory.clone(), cache.clone()),
            cache,
            node: NodeConf {
                uuid: "00000000-0000-4000-8000-000000000000".into(),
                fqdn: "tap.test".into(),
            },
        };
        let counters = Counters::new(registry.topics(), registry.names()).shared();
        let dispatcher = Dispatcher::new(Arc::new(registry), counters, tools.clone());

        Self { store, publisher, inventory, tools, dispatcher }
    }

    pub fn cache(&self) -> &Cache {
        &self.tools.cache
    }

    pub fn counters(&self) -> SharedCounters {
        self.dispatcher.counters()
    }

    pub async fn dispatch(&self, message: &InboundMessage) -> DispatchReport {
        let report = self.dispatcher.dispatch(message).await;
        log::debug!("dispatched {} -> {:?}", message.topic, report);
        report
    }

    /// Dispatches `value` as JSON on `topic`.
    pub async fn send(&self, topic: &str, value: &Value) -> DispatchReport {
        self.dispatch(&InboundMessage::new(topic, value.to_string())).await
    }

    /// Lets detached publishes run, then waits for every queued cache write.
    pub async fn settle(&self) {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        self.tools.cache.flush().await;
    }

    /// Entries of a cache list, newest first, parsed as JSON.
    pub async fn list(&self, key: &str) -> Result<Vec<Value>> {
        self.settle().await;
        let raw = self.store.lrange(key, 0, -1).await?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(anyhow::Error::from))
            .collect()
    }

    pub async fn members(&self, key: &str) -> Result<Vec<String>> {
        self.settle().await;
        Ok(self.store.smembers(key).await?)
    }

    /// Module -> names registration kept in `logs|{host}` / `metrics|{host}`.
    pub async fn registered(&self, key: &str, field: &str) -> Result<Vec<String>> {
        self.settle().await;
        match self.store.hget(key, field).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// JSON payloads published on `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Value> {
        self.publisher
            .records_for(topic)
            .iter()
            .filter_map(|r| r.json_value().ok())
            .collect()
    }

    pub fn inventory_batches(&self) -> Vec<Vec<Statement>> {
        self.inventory.batches()
    }

    /// Asserts a field, addressed as `a.b.c`, of the latest payload on `topic`.
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let Some(latest) = self.published(topic).pop() else {
            anyhow::bail!("Nothing published on {}", topic);
        };
        match get_nested_field(&latest, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!("Field '{}' mismatch: expected {:?}, got {:?}", field_path, expected, actual),
            None => anyhow::bail!("Field '{}' not found in latest message on {}", field_path, topic),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let mut topic_counts = HashMap::new();
        let records = self.publisher.records();
        for record in &records {
            *topic_counts.entry(record.topic.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_messages: records.len(),
            topic_counts,
            dropped_writes: self.tools.cache.dropped(),
        }
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| current.as_object()?.get(part))
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub dropped_writes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_harness_basic_functionality() {
        let harness = TestHarness::new(Vec::new());
        harness.cache().note("Harness", json!({ "ok": true }));

        let notes = harness.list("notes").await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0]["title"], "Harness");
        assert_eq!(harness.get_stats().total_messages, 0);
    }

    #[tokio::test]
    async fn test_assert_field_equals() {
        let harness = TestHarness::new(Vec::new());
        harness.tools.produce.metrics(&json!({ "a": { "b": 1 } })).await.unwrap();

        harness.assert_field_equals("metrics", "a.b", &json!(1)).unwrap();
        assert!(harness.assert_field_equals("metrics", "a.c", &json!(1)).is_err());
        assert!(harness.assert_field_equals("events", "a", &json!(1)).is_err());
    }
}
