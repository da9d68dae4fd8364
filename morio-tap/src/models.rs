use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One record as consumed from the broker, before parsing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub timestamp: Option<String>,
    pub offset: Option<String>,
    pub value: Option<Vec<u8>>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            value: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn with_offset(mut self, offset: impl Into<String>) -> Self {
        self.offset = Some(offset.into());
        self
    }
}

/// Normalized message handed to every subscribed processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: Option<i64>,
    pub offset: Option<i64>,
    pub data: Value,
}

/// One record to publish on the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub topic: String,
    pub value: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutboundRecord {
    pub fn json(topic: impl Into<String>, value: &Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            topic: topic.into(),
            value: serde_json::to_vec(value)?,
            headers: Vec::new(),
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parses the payload back as JSON (tests and recording publishers).
    pub fn json_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.value)
    }
}
