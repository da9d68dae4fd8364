/*!
Recording processor for dispatch tests.

Records `(topic, envelope)` for every call; `failing()` makes every call
return a handler error after recording it.
*/

use morio_tap::{Envelope, Processor, TapError, Tools};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub topic: String,
    pub envelope: Envelope,
}

pub struct RecordingProcessor {
    name: String,
    topics: Vec<String>,
    fail: AtomicBool,
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingProcessor {
    pub fn new(name: &str, topics: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            fail: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::Relaxed);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.calls.lock().iter().map(|c| c.envelope.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait::async_trait]
impl Processor for RecordingProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn topics(&self) -> Vec<String> {
        self.topics.clone()
    }

    async fn handle(&self, envelope: &Envelope, _tools: &Tools, topic: &str) -> Result<(), TapError> {
        self.calls.lock().push(RecordedCall {
            topic: topic.to_string(),
            envelope: envelope.clone(),
        });
        log::debug!("{} recorded a message on {}", self.name, topic);
        if self.fail.load(Ordering::Relaxed) {
            return Err(TapError::handler(&self.name, "recording processor set to fail"));
        }
        Ok(())
    }
}
