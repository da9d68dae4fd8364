/*!
 * DISPATCHER
 *
 * Called once per consumed record:
 * 1. count the topic (always, even without subscribers)
 * 2. stop there when nobody subscribes to the topic
 * 3. parse the envelope (`timestamp`/`offset` as numbers, `value` as JSON,
 *    falling back to the raw string when it is not JSON)
 * 4. for every subscriber: count the processor, then run its handler
 *
 * A failing handler is logged, noted and counted in the returned report;
 * the remaining subscribers still run.
 */

use crate::counters::SharedCounters;
use crate::models::{Envelope, InboundMessage};
use crate::processors::ProcessorRegistry;
use crate::tools::Tools;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What one dispatch call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ProcessorRegistry>,
    counters: SharedCounters,
    tools: Tools,
}

/// Numeric cast of a broker-provided string; anything unparseable is `None`.
fn numeric(raw: Option<&str>) -> Option<i64> {
    let raw = raw?.trim();
    raw.parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
}

/// Builds the envelope handed to processors.
pub fn parse_envelope(message: &InboundMessage) -> Envelope {
    let data = match message.value.as_deref() {
        None | Some([]) => Value::Null,
        Some(bytes) => match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!("Message on {} is not JSON, passing it on as text: {}", message.topic, e);
                Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
        },
    };
    Envelope {
        timestamp: numeric(message.timestamp.as_deref()),
        offset: numeric(message.offset.as_deref()),
        data,
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<ProcessorRegistry>, counters: SharedCounters, tools: Tools) -> Self {
        Self { registry, counters, tools }
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn counters(&self) -> SharedCounters {
        self.counters.clone()
    }

    pub async fn dispatch(&self, message: &InboundMessage) -> DispatchReport {
        let mut report = DispatchReport::default();
        self.counters.lock().message(&message.topic);

        let subscribers = self.registry.subscribers(&message.topic);
        if subscribers.is_empty() {
            return report;
        }

        let envelope = parse_envelope(message);
        for processor in subscribers {
            let name = processor.name().to_string();
            self.counters.lock().processor(&name);
            debug!("Dispatching {} to {}", message.topic, name);

            if let Err(e) = processor.handle(&envelope, &self.tools, &message.topic).await {
                error!("Processor {} failed on {}: {}", name, message.topic, e);
                self.tools.cache.note(
                    "Processor failed",
                    json!({ "processor": name, "topic": message.topic, "error": e.to_string() }),
                );
                report.failed.push(name.clone());
            }
            report.invoked.push(name);
        }
        report
    }
}
