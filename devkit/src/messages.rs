/*!
Inbound records and payload fixtures.

`MessageBuilder` produces the `InboundMessage` the broker consumer would
hand to the dispatcher; `fixtures` builds the ECS-shaped payloads the
built-in processors understand.
*/

use chrono::{DateTime, Utc};
use morio_tap::InboundMessage;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: InboundMessage,
}

impl MessageBuilder {
    pub fn new(topic: &str) -> Self {
        Self {
            message: InboundMessage {
                topic: topic.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn json(mut self, value: &Value) -> Self {
        self.message.value = Some(value.to_string().into_bytes());
        self
    }

    pub fn raw(mut self, value: &str) -> Self {
        self.message.value = Some(value.as_bytes().to_vec());
        self
    }

    /// Broker timestamp, as the millisecond string the consumer reads.
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.message.timestamp = Some(time.timestamp_millis().to_string());
        self
    }

    pub fn timestamp(mut self, raw: &str) -> Self {
        self.message.timestamp = Some(raw.to_string());
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.message.offset = Some(offset.to_string());
        self
    }

    pub fn build(self) -> InboundMessage {
        self.message
    }
}

pub mod fixtures {
    use chrono::Utc;
    use serde_json::{json, Value};

    fn now() -> String {
        Utc::now().to_rfc3339()
    }

    pub fn healthcheck(id: &str, host: &str, up: bool) -> Value {
        json!({ "id": id, "host": host, "up": up, "url": { "full": format!("https://{host}/") } })
    }

    pub fn audit(host: &str, user: &str, action: &str) -> Value {
        json!({ "@timestamp": now(), "host": host, "user": { "name": user }, "event": { "action": action } })
    }

    pub fn logline(host: &str, module: &str, dataset: &str, message: &str) -> Value {
        json!({
            "@timestamp": now(),
            "host": { "id": host },
            "labels": { "morio.module": module },
            "event": { "dataset": dataset },
            "message": message,
        })
    }

    /// A metricset as shipped by metric agents: values live under `{module}.{name}`.
    pub fn metricset(host: &str, module: &str, name: &str, metrics: Value) -> Value {
        let mut data = json!({
            "@timestamp": now(),
            "host": { "id": host, "name": host, "arch": "x86_64" },
            "labels": { "morio.module": module },
            "event": { "module": module },
            "metricset": { "name": name },
        });
        data[module][name] = metrics;
        data
    }

    pub fn host_telemetry(id: &str, ips: &[&str], macs: &[&str]) -> Value {
        json!({
            "host": {
                "id": id,
                "name": id,
                "arch": "x86_64",
                "cores": 4,
                "memory": 8192,
                "os": { "family": "debian", "kernel": "6.1.0" },
                "ip": ips,
                "mac": macs,
            }
        })
    }
}
