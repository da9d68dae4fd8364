/*!
 * PROCESSOR REGISTRY
 *
 * A processor is a named handler subscribed to a fixed list of topics.
 * The registry is built once at startup from the built-in processors and
 * the `processors` config section (`enabled`, `topics` override), and is
 * read-only afterwards: the dispatcher asks it who subscribes to a topic,
 * the broker asks it which topics to subscribe to.
 *
 * ```yaml
 * processors:
 *   logs:
 *     enabled: false
 *   checks:
 *     topics: [checks, uptime]
 * ```
 */

pub mod builtin;

use crate::config::ProcessorConf;
use crate::error::TapError;
use crate::models::Envelope;
use crate::tools::Tools;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;

#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    fn topics(&self) -> Vec<String>;

    async fn handle(&self, envelope: &Envelope, tools: &Tools, topic: &str) -> Result<(), TapError>;
}

struct Registration {
    processor: Arc<dyn Processor>,
    topics: BTreeSet<String>,
}

#[derive(Default)]
pub struct ProcessorRegistry {
    registrations: Vec<Registration>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `processor` to its own topics.
    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        let topics = processor.topics();
        self.register_on(processor, topics);
    }

    /// Subscribes `processor` to `topics`, replacing an earlier registration of the same name.
    pub fn register_on(&mut self, processor: Arc<dyn Processor>, topics: Vec<String>) {
        self.registrations.retain(|r| r.processor.name() != processor.name());
        self.registrations.push(Registration {
            processor,
            topics: topics.into_iter().collect(),
        });
    }

    /// Applies per-name config: disabled processors are skipped, `topics` replaces the default list.
    pub fn from_config(config: &BTreeMap<String, ProcessorConf>, available: Vec<Arc<dyn Processor>>) -> Self {
        let mut registry = Self::new();
        for processor in available {
            let conf = config.get(processor.name());
            if conf.is_some_and(|c| !c.enabled) {
                info!("Processor {} is disabled", processor.name());
                continue;
            }
            let topics = conf
                .and_then(|c| c.topics.clone())
                .unwrap_or_else(|| processor.topics());
            info!("Processor {} subscribes to {}", processor.name(), topics.join(", "));
            registry.register_on(processor, topics);
        }
        registry
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.registrations
            .iter()
            .map(|r| r.processor.name().to_string())
            .collect()
    }

    /// Union of every subscribed topic, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.registrations
            .iter()
            .flat_map(|r| r.topics.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Processors subscribed to `topic`, in registration order.
    pub fn subscribers(&self, topic: &str) -> Vec<Arc<dyn Processor>> {
        self.registrations
            .iter()
            .filter(|r| r.topics.contains(topic))
            .map(|r| r.processor.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static [&'static str]);

    #[async_trait::async_trait]
    impl Processor for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn topics(&self) -> Vec<String> {
            self.1.iter().map(|t| t.to_string()).collect()
        }

        async fn handle(&self, _: &Envelope, _: &Tools, _: &str) -> Result<(), TapError> {
            Ok(())
        }
    }

    fn available() -> Vec<Arc<dyn Processor>> {
        vec![
            Arc::new(Named("logs", &["logs"])),
            Arc::new(Named("checks", &["checks"])),
            Arc::new(Named("watch", &["checks", "audit"])),
        ]
    }

    #[test]
    fn test_topics_are_a_sorted_union() {
        let registry = ProcessorRegistry::from_config(&BTreeMap::new(), available());
        assert_eq!(registry.topics(), vec!["audit", "checks", "logs"]);
        assert_eq!(registry.names(), vec!["logs", "checks", "watch"]);
        assert_eq!(registry.subscribers("checks").len(), 2);
        assert!(registry.subscribers("nothing").is_empty());
    }

    #[test]
    fn test_config_disables_and_overrides() {
        let mut config = BTreeMap::new();
        config.insert("logs".to_string(), ProcessorConf { enabled: false, topics: None });
        config.insert(
            "checks".to_string(),
            ProcessorConf { enabled: true, topics: Some(vec!["uptime".into()]) },
        );
        let registry = ProcessorRegistry::from_config(&config, available());
        assert_eq!(registry.names(), vec!["checks", "watch"]);
        assert_eq!(registry.subscribers("uptime").len(), 1);
        assert_eq!(registry.subscribers("checks").len(), 1);
        assert!(registry.subscribers("logs").is_empty());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(Named("logs", &["logs"])));
        registry.register(Arc::new(Named("logs", &["syslog"])));
        assert_eq!(registry.names().len(), 1);
        assert_eq!(registry.topics(), vec!["syslog"]);
    }
}
