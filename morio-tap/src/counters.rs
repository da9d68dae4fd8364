/*!
 * THROUGHPUT COUNTERS
 *
 * Per-topic and per-processor message counts, kept in one shared map pair
 * written by the dispatcher and rolled over by the reporter task.
 *
 * Every tick the reporter takes `ceil(count / tick_seconds)` for every
 * known key, resets all window counts in the same critical section and
 * publishes the result on `metrics`. Only keys known at startup are
 * reported; anything else is counted for the window and then discarded.
 * Peaks are the highest rate seen per key since start and are never reset.
 *
 * ```json
 * { "@timestamp": "...", "@metadata": {"type": "_doc", "_id": "..."},
 *   "ecs": {"version": "8.0.0"},
 *   "event": {"dataset": "morio-tap.throughput"},
 *   "metricset": {"name": "throughput", "period": 30000},
 *   "morio": {"tap": {"throughput": {"topics": {}, "processors": {},
 *     "peak": {"topics": {}, "processors": {}}}, "version": 7}},
 *   "host": {"id": "...", "name": "..."}, "labels": {"morio.module": "morio-tap"} }
 * ```
 */

use crate::cache::Cache;
use crate::config::NodeConf;
use crate::error::TapError;
use crate::models::OutboundRecord;
use crate::produce::Producer;
use crate::tools::{clock, create_id};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub const THROUGHPUT_VERSION: u32 = 7;

pub type SharedCounters = Arc<Mutex<Counters>>;

/// Highest per-second rate seen for every known key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Peaks {
    pub topics: BTreeMap<String, u64>,
    pub processors: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Counters {
    /// Counts of the current window. May hold keys outside the known set until the next roll-over.
    pub topics: BTreeMap<String, u64>,
    pub processors: BTreeMap<String, u64>,
    pub peak: Peaks,
    known_topics: BTreeSet<String>,
    known_processors: BTreeSet<String>,
}

/// Messages per second for every known key of one window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Throughput {
    pub topics: BTreeMap<String, u64>,
    pub processors: BTreeMap<String, u64>,
    pub peak: Peaks,
}

fn roll(
    window: &mut BTreeMap<String, u64>,
    known: &BTreeSet<String>,
    peak: &mut BTreeMap<String, u64>,
    tick_ms: u64,
) -> BTreeMap<String, u64> {
    window.retain(|k, _| known.contains(k));
    window
        .iter_mut()
        .map(|(k, raw)| {
            let per_sec = (*raw * 1000).div_ceil(tick_ms);
            *raw = 0;
            let highest = peak.entry(k.clone()).or_insert(0);
            *highest = (*highest).max(per_sec);
            (k.clone(), per_sec)
        })
        .collect()
}

impl Counters {
    /// Every known name starts at an explicit zero so each report carries the full key set.
    pub fn new<T, P>(topics: T, processors: P) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        let known_topics: BTreeSet<String> = topics.into_iter().map(Into::into).collect();
        let known_processors: BTreeSet<String> = processors.into_iter().map(Into::into).collect();
        let zeroed = |keys: &BTreeSet<String>| -> BTreeMap<String, u64> { keys.iter().map(|k| (k.clone(), 0)).collect() };
        Self {
            topics: zeroed(&known_topics),
            processors: zeroed(&known_processors),
            peak: Peaks {
                topics: zeroed(&known_topics),
                processors: zeroed(&known_processors),
            },
            known_topics,
            known_processors,
        }
    }

    pub fn shared(self) -> SharedCounters {
        Arc::new(Mutex::new(self))
    }

    pub fn message(&mut self, topic: &str) {
        *self.topics.entry(topic.to_string()).or_insert(0) += 1;
    }

    pub fn processor(&mut self, name: &str) {
        *self.processors.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Snapshot and reset in one step. Rates round up so a single message still shows.
    pub fn roll_over(&mut self, tick: Duration) -> Throughput {
        let tick_ms = (tick.as_millis() as u64).max(1);
        let topics = roll(&mut self.topics, &self.known_topics, &mut self.peak.topics, tick_ms);
        let processors = roll(
            &mut self.processors,
            &self.known_processors,
            &mut self.peak.processors,
            tick_ms,
        );
        Throughput {
            topics,
            processors,
            peak: self.peak.clone(),
        }
    }
}

/// The ECS envelope published on `metrics`.
pub fn throughput_envelope(throughput: &Throughput, node: &NodeConf, tick: Duration) -> Value {
    json!({
        "@timestamp": clock::iso_now(),
        "@metadata": { "type": "_doc", "_id": create_id() },
        "ecs": { "version": "8.0.0" },
        "event": { "dataset": "morio-tap.throughput" },
        "metricset": { "name": "throughput", "period": tick.as_millis() as u64 },
        "morio": {
            "tap": {
                "throughput": throughput,
                "version": THROUGHPUT_VERSION,
            }
        },
        "host": { "id": node.uuid, "name": node.fqdn },
        "labels": { "morio.module": "morio-tap" },
    })
}

pub struct ThroughputReporter {
    counters: SharedCounters,
    producer: Producer,
    cache: Cache,
    node: NodeConf,
    tick: Duration,
}

impl ThroughputReporter {
    pub fn new(counters: SharedCounters, producer: Producer, cache: Cache, node: NodeConf, tick: Duration) -> Self {
        Self { counters, producer, cache, node, tick }
    }

    async fn publish(&self, envelope: &Value) -> Result<(), TapError> {
        self.producer.publish(OutboundRecord::json("metrics", envelope)?).await
    }

    /// One window: roll over, then publish. A failure is noted here only.
    pub async fn report(&self) {
        let throughput = self.counters.lock().roll_over(self.tick);
        let envelope = throughput_envelope(&throughput, &self.node, self.tick);
        match self.publish(&envelope).await {
            Ok(()) => debug!("Published throughput for {} topics", throughput.topics.len()),
            Err(e) => {
                warn!("Error when producing counters: {}", e);
                self.cache.note(
                    "Error when producing counters",
                    json!({ "error": e.to_string(), "throughput": throughput }),
                );
            }
        }
    }

    /// First report lands one full tick after start. Abort the handle to stop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.report().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicies;
    use crate::produce::MemoryPublisher;
    use crate::store::{MemoryStore, Store};

    const TICK: Duration = Duration::from_millis(30_000);

    #[test]
    fn test_known_keys_start_at_zero() {
        let counters = Counters::new(["logs", "checks"], ["logs"]);
        assert_eq!(counters.topics["logs"], 0);
        assert_eq!(counters.topics["checks"], 0);
        assert_eq!(counters.processors["logs"], 0);
        assert_eq!(counters.peak.topics["checks"], 0);
    }

    #[test]
    fn test_roll_over_rounds_up_and_resets() {
        let mut counters = Counters::new(["logs", "checks", "audit"], ["logs"]);
        counters.message("logs");
        for _ in 0..31 {
            counters.message("checks");
        }
        counters.processor("logs");

        let snapshot = counters.roll_over(TICK);
        assert_eq!(snapshot.topics["logs"], 1);
        assert_eq!(snapshot.topics["checks"], 2);
        assert_eq!(snapshot.topics["audit"], 0);
        assert_eq!(snapshot.processors["logs"], 1);

        assert!(counters.topics.values().all(|v| *v == 0));
        assert!(counters.processors.values().all(|v| *v == 0));

        counters.message("logs");
        assert_eq!(snapshot.topics["logs"], 1);
        assert_eq!(counters.roll_over(TICK).topics["logs"], 1);
    }

    #[test]
    fn test_unknown_keys_are_counted_but_not_reported() {
        let mut counters = Counters::new(["logs"], ["logs"]);
        counters.message("elsewhere");
        counters.processor("stranger");
        assert_eq!(counters.topics["elsewhere"], 1);

        for _ in 0..2 {
            let snapshot = counters.roll_over(TICK);
            assert_eq!(snapshot.topics.keys().collect::<Vec<_>>(), vec!["logs"]);
            assert_eq!(snapshot.processors.keys().collect::<Vec<_>>(), vec!["logs"]);
            assert!(!snapshot.peak.topics.contains_key("elsewhere"));
        }
        assert!(!counters.topics.contains_key("elsewhere"));
    }

    #[test]
    fn test_peak_survives_roll_over() {
        let mut counters = Counters::new(["logs"], ["logs"]);
        for _ in 0..90 {
            counters.message("logs");
        }
        assert_eq!(counters.roll_over(TICK).peak.topics["logs"], 3);

        counters.message("logs");
        let snapshot = counters.roll_over(TICK);
        assert_eq!(snapshot.topics["logs"], 1);
        assert_eq!(snapshot.peak.topics["logs"], 3);
        assert_eq!(snapshot.peak.processors["logs"], 0);
    }

    #[test]
    fn test_envelope_shape() {
        let node = NodeConf { uuid: "u1".into(), fqdn: "tap.example.com".into() };
        let throughput = Counters::new(["logs"], ["logs"]).roll_over(TICK);
        let value = throughput_envelope(&throughput, &node, TICK);
        assert_eq!(value["event"]["dataset"], "morio-tap.throughput");
        assert_eq!(value["metricset"]["period"], 30_000);
        assert_eq!(value["morio"]["tap"]["version"], 7);
        assert_eq!(value["morio"]["tap"]["throughput"]["topics"]["logs"], 0);
        assert_eq!(value["host"]["name"], "tap.example.com");
        assert_eq!(value["labels"]["morio.module"], "morio-tap");
        assert_eq!(value["@metadata"]["type"], "_doc");
        assert_eq!(value["@metadata"]["_id"].as_str().unwrap().len(), 40);
        assert_eq!(value["morio"]["tap"]["throughput"]["peak"]["topics"]["logs"], 0);
    }

    #[tokio::test]
    async fn test_report_publishes_and_resets() {
        let publisher = Arc::new(MemoryPublisher::new());
        let cache = Cache::spawn(Arc::new(MemoryStore::new()), CachePolicies::default(), 16);
        let producer = Producer::new(publisher.clone(), cache.clone());
        let counters = Counters::new(["logs"], Vec::<String>::new()).shared();
        counters.lock().message("logs");

        let reporter = ThroughputReporter::new(counters.clone(), producer, cache, NodeConf::default(), TICK);
        reporter.report().await;

        let records = publisher.records_for("metrics");
        assert_eq!(records.len(), 1);
        let value = records[0].json_value().unwrap();
        assert_eq!(value["morio"]["tap"]["throughput"]["topics"]["logs"], 1);
        assert_eq!(counters.lock().topics["logs"], 0);
    }

    #[tokio::test]
    async fn test_failed_report_is_noted_once() {
        let publisher = Arc::new(MemoryPublisher::new());
        publisher.set_failing(true);
        let store = Arc::new(MemoryStore::new());
        let cache = Cache::spawn(store.clone(), CachePolicies::default(), 16);
        let producer = Producer::new(publisher.clone(), cache.clone());
        let counters = Counters::new(["logs"], Vec::<String>::new()).shared();
        counters.lock().message("logs");

        let reporter = ThroughputReporter::new(counters.clone(), producer, cache.clone(), NodeConf::default(), TICK);
        reporter.report().await;
        cache.flush().await;

        assert!(publisher.records().is_empty());
        let notes = store.lrange("notes", 0, -1).await.unwrap();
        assert_eq!(notes.len(), 1);
        let note: Value = serde_json::from_str(&notes[0]).unwrap();
        assert_eq!(note["title"], "Error when producing counters");
        assert_eq!(note["data"]["throughput"]["topics"]["logs"], 1);
        assert_eq!(counters.lock().topics["logs"], 0);
    }
}
