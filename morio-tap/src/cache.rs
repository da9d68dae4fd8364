//! Cache subsystem - typed, fire-and-forget writes into the ephemeral store.
//!
//! Every public write builds one [`Pipeline`] and hands it to a bounded
//! queue; a single [`CacheWorker`] task applies the queued pipelines in
//! order. Callers never wait on the store. When the queue is full the write
//! is dropped, logged, and counted in [`Cache::dropped`]. Store failures are
//! logged by the worker and otherwise ignored.
//!
//! Key layout (all keys built with [`create_key`]):
//!
//! | Key | Type | Written by |
//! |---|---|---|
//! | `audit`, `audit\|host\|{host}`, `audit\|user\|{user}` | capped list | [`Cache::audit`] |
//! | `events` | capped list | [`Cache::event`] |
//! | `check\|{id}`, `check\|host\|{host}` | capped list | [`Cache::healthcheck`] |
//! | `checks` | set of check ids | [`Cache::healthcheck`] |
//! | `log\|{host}\|{module}\|{logset}` | capped list | [`Cache::logline`] |
//! | `logs` | sorted set host -> last seen (ms) | [`Cache::logline`] |
//! | `logs\|{host}` | hash module -> JSON list of logsets | [`Cache::logline`] |
//! | `metric\|…`, `metrics`, `metrics\|{host}` | same as the log keys | [`Cache::metricset`] |
//! | `notes` | capped list | [`Cache::note`] |

use crate::store::{Pipeline, Store, StoreError};
use crate::tools::{clock, create_key, extract, with_timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

const HOUR_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditPolicy {
    pub cap: usize,
    pub host_cap: usize,
    pub user_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListPolicy {
    pub cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthcheckPolicy {
    pub cap: usize,
    pub host_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoglinePolicy {
    pub cache: bool,
    pub cap: usize,
    /// Hours.
    pub ttl: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsetPolicy {
    pub cache: bool,
    pub cap: usize,
    /// Hours.
    pub ttl: u64,
}

/// Configured defaults for every cache type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CachePolicies {
    pub audit: AuditPolicy,
    pub event: ListPolicy,
    pub healthcheck: HealthcheckPolicy,
    pub logline: LoglinePolicy,
    pub metricset: MetricsetPolicy,
    pub note: ListPolicy,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self { cap: 150, host_cap: 25, user_cap: 25 }
    }
}

impl Default for ListPolicy {
    fn default() -> Self {
        Self { cap: 150 }
    }
}

impl Default for HealthcheckPolicy {
    fn default() -> Self {
        Self { cap: 150, host_cap: 25 }
    }
}

impl Default for LoglinePolicy {
    fn default() -> Self {
        Self { cache: true, cap: 50, ttl: 1 }
    }
}

impl Default for MetricsetPolicy {
    fn default() -> Self {
        Self { cache: true, cap: 150, ttl: 1 }
    }
}

/// Per-call knobs for [`Cache::logline_with`] and [`Cache::metricset_with`].
/// `host` and `module` fall back to what is extracted from the message data.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesOptions {
    pub cache: bool,
    pub host: Option<String>,
    pub module: Option<String>,
    pub cap: usize,
    pub ttl: u64,
}

impl From<&LoglinePolicy> for SeriesOptions {
    fn from(p: &LoglinePolicy) -> Self {
        Self { cache: p.cache, host: None, module: None, cap: p.cap, ttl: p.ttl }
    }
}

impl From<&MetricsetPolicy> for SeriesOptions {
    fn from(p: &MetricsetPolicy) -> Self {
        Self { cache: p.cache, host: None, module: None, cap: p.cap, ttl: p.ttl }
    }
}

/// Adds a name to the JSON list stored at `key`/`field`, without duplicates.
#[derive(Debug, Clone)]
struct Registration {
    key: String,
    field: String,
    name: String,
    ttl_secs: u64,
}

enum Job {
    Write {
        pipeline: Pipeline,
        register: Option<Registration>,
    },
    Flush(oneshot::Sender<()>),
}

struct CacheInner {
    tx: mpsc::Sender<Job>,
    store: Arc<dyn Store>,
    policies: CachePolicies,
    dropped: AtomicU64,
}

#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

/// Applies queued writes one at a time.
pub struct CacheWorker {
    store: Arc<dyn Store>,
    rx: mpsc::Receiver<Job>,
}

impl Cache {
    /// Creates the cache handle and its worker; the caller runs the worker.
    pub fn new(store: Arc<dyn Store>, policies: CachePolicies, capacity: usize) -> (Self, CacheWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cache = Self {
            inner: Arc::new(CacheInner {
                tx,
                store: store.clone(),
                policies,
                dropped: AtomicU64::new(0),
            }),
        };
        (cache, CacheWorker { store, rx })
    }

    /// Creates the cache and spawns its worker on the current runtime.
    pub fn spawn(store: Arc<dyn Store>, policies: CachePolicies, capacity: usize) -> Self {
        let (cache, worker) = Self::new(store, policies, capacity);
        tokio::spawn(worker.run());
        cache
    }

    pub fn policies(&self) -> &CachePolicies {
        &self.inner.policies
    }

    /// The backing store, for readers.
    pub fn store(&self) -> Arc<dyn Store> {
        self.inner.store.clone()
    }

    /// Writes dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Resolves once every write queued before this call has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(Job::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    fn submit(&self, job: Job) {
        match self.inner.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "Cache queue full, dropping write");
            }
            Err(TrySendError::Closed(_)) => warn!("Cache worker is gone, dropping write"),
        }
    }

    fn write(&self, pipeline: Pipeline, register: Option<Registration>) {
        if pipeline.is_empty() && register.is_none() {
            return;
        }
        self.submit(Job::Write { pipeline, register });
    }

    pub fn audit(&self, data: &Value) {
        let policy = self.inner.policies.audit.clone();
        self.audit_with(data, &policy)
    }

    /// Global `audit` list, plus per-host and per-user lists when the data
    /// names them. A cap of 0 disables the matching list.
    pub fn audit_with(&self, data: &Value, policy: &AuditPolicy) {
        let entry = with_timestamp(data, clock::now_ms()).to_string();
        let mut pipe = Pipeline::new();
        pipe.push_capped("audit", entry.clone(), policy.cap);
        if let Some(host) = data.get("host").and_then(Value::as_str) {
            pipe.push_capped(&create_key(&["audit", "host", host]), entry.clone(), policy.host_cap);
        }
        if let Some(user) = data.pointer("/user/name").and_then(Value::as_str) {
            pipe.push_capped(&create_key(&["audit", "user", user]), entry, policy.user_cap);
        }
        self.write(pipe, None);
    }

    pub fn event(&self, data: &Value) {
        let policy = self.inner.policies.event.clone();
        self.event_with(data, &policy)
    }

    pub fn event_with(&self, data: &Value, policy: &ListPolicy) {
        let mut pipe = Pipeline::new();
        pipe.push_capped("events", with_timestamp(data, clock::now_ms()).to_string(), policy.cap);
        self.write(pipe, None);
    }

    pub fn healthcheck(&self, data: &Value) {
        let policy = self.inner.policies.healthcheck.clone();
        self.healthcheck_with(data, &policy)
    }

    /// Caches one healthcheck result under its id, registers the id in the
    /// `checks` set, and mirrors it per host when a host is given.
    pub fn healthcheck_with(&self, data: &Value, policy: &HealthcheckPolicy) {
        let id = match data.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                self.note("Healthcheck lacks an id", data.clone());
                return;
            }
        };
        let entry = with_timestamp(data, clock::now_ms()).to_string();
        let mut pipe = Pipeline::new();
        pipe.push_capped(&create_key(&["check", &id]), entry.clone(), policy.cap);
        pipe.sadd("checks", id);
        if let Some(host) = data.get("host").and_then(Value::as_str) {
            pipe.push_capped(&create_key(&["check", "host", host]), entry, policy.host_cap);
        }
        self.write(pipe, None);
    }

    pub fn logline_options(&self) -> SeriesOptions {
        SeriesOptions::from(&self.inner.policies.logline)
    }

    pub fn logline(&self, logset: &str, line: &Value, data: &Value) {
        self.logline_with(logset, line, data, &self.logline_options())
    }

    /// Caches one log line for a host/module/logset and keeps the host
    /// recency index and the module -> logsets registration current.
    pub fn logline_with(&self, logset: &str, line: &Value, data: &Value, opts: &SeriesOptions) {
        if !opts.cache {
            return;
        }
        let value = match line {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.series(("log", "logs"), logset, value, data, opts);
    }

    pub fn metricset_options(&self) -> SeriesOptions {
        SeriesOptions::from(&self.inner.policies.metricset)
    }

    pub fn metricset(&self, metricset: &str, metrics: &Value, data: &Value) {
        self.metricset_with(metricset, metrics, data, &self.metricset_options())
    }

    /// Same layout as [`Cache::logline_with`] under the `metric`/`metrics`
    /// prefixes; the cached value is the metrics plus the message time.
    pub fn metricset_with(&self, metricset: &str, metrics: &Value, data: &Value, opts: &SeriesOptions) {
        if !opts.cache {
            return;
        }
        if metricset.is_empty() || metrics.is_null() {
            self.note(
                "Cannot cache metrics, lacking data",
                json!({ "metricset": metricset, "metrics": metrics }),
            );
            return;
        }
        let value = with_timestamp(metrics, clock::when(data)).to_string();
        self.series(("metric", "metrics"), metricset, value, data, opts);
    }

    fn series(&self, prefix: (&str, &str), name: &str, value: String, data: &Value, opts: &SeriesOptions) {
        let (item, index) = prefix;
        let host = opts.host.clone().unwrap_or_else(|| extract::host(data));
        let module = opts.module.clone().unwrap_or_else(|| extract::module(data));
        let ttl_secs = opts.ttl * HOUR_SECS;
        let now = clock::now_ms();

        let key = create_key(&[item, &host, &module, name]);
        let mut pipe = Pipeline::new();
        pipe.push_capped(&key, value, opts.cap);
        pipe.expire(&key, ttl_secs);
        pipe.zadd(index, clock::when(data) as f64, host.clone());
        pipe.zrem_range_by_score(index, (now - (ttl_secs as i64) * 1000) as f64);
        pipe.expire(index, ttl_secs * 3 / 2);

        let register = Registration {
            key: create_key(&[index, &host]),
            field: module,
            name: name.to_string(),
            ttl_secs,
        };
        self.write(pipe, Some(register));
    }

    pub fn note(&self, title: &str, data: Value) {
        let policy = self.inner.policies.note.clone();
        self.note_with(title, data, &policy)
    }

    /// Notes only live in the cache and are never sent to the broker, so
    /// that reporting a problem can not feed back into the tap's own input.
    pub fn note_with(&self, title: &str, data: Value, policy: &ListPolicy) {
        debug!(title, "note");
        let entry = json!({ "title": title, "data": data, "timestamp": clock::now_ms() });
        let mut pipe = Pipeline::new();
        pipe.push_capped("notes", entry.to_string(), policy.cap);
        self.write(pipe, None);
    }
}

impl CacheWorker {
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            match job {
                Job::Write { pipeline, register } => {
                    if let Err(e) = self.apply(pipeline, register).await {
                        error!("Store pipeline exec error: {}", e);
                    }
                }
                Job::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Cache worker stopped");
    }

    async fn apply(&self, mut pipeline: Pipeline, register: Option<Registration>) -> Result<(), StoreError> {
        if let Some(reg) = register {
            match self.store.hget(&reg.key, &reg.field).await {
                Ok(existing) => {
                    let mut names = registered_names(&reg, existing);
                    if !names.contains(&reg.name) {
                        names.push(reg.name);
                    }
                    pipeline.hset(&reg.key, &reg.field, Value::from(names).to_string());
                    pipeline.expire(&reg.key, reg.ttl_secs);
                }
                Err(e) => warn!("Not registering {} under {} {}: {}", reg.name, reg.key, reg.field, e),
            }
        }
        self.store.exec(pipeline).await
    }
}

fn registered_names(reg: &Registration, existing: Option<String>) -> Vec<String> {
    let Some(raw) = existing else {
        return Vec::new();
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!("Replacing unreadable registration at {} {}: {}", reg.key, reg.field, e);
        Vec::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cache() -> (Cache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Cache::spawn(store.clone(), CachePolicies::default(), 1024);
        (cache, store)
    }

    fn parse(entries: Vec<String>) -> Vec<Value> {
        entries.iter().map(|e| serde_json::from_str(e).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_event_list_is_capped() {
        let (cache, store) = cache();
        for i in 0..200 {
            cache.event(&json!({ "n": i }));
        }
        cache.flush().await;
        let events = parse(store.lrange("events", 0, -1).await.unwrap());
        assert_eq!(events.len(), 150);
        assert_eq!(events[0]["n"], 199);
        assert_eq!(events[149]["n"], 50);
    }

    #[tokio::test]
    async fn test_note_shape() {
        let (cache, store) = cache();
        cache.note("Test", json!({ "x": 1 }));
        cache.flush().await;
        let notes = parse(store.lrange("notes", 0, -1).await.unwrap());
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0]["title"], "Test");
        assert_eq!(notes[0]["data"], json!({ "x": 1 }));
        assert!(notes[0]["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_audit_fans_out_to_host_and_user() {
        let (cache, store) = cache();
        cache.audit(&json!({ "host": "H1", "user": { "name": "Joost" }, "action": "login" }));
        cache.audit_with(&json!({ "host": "h2" }), &AuditPolicy { cap: 150, host_cap: 0, user_cap: 25 });
        cache.flush().await;
        assert_eq!(store.lrange("audit", 0, -1).await.unwrap().len(), 2);
        assert_eq!(store.lrange("audit|host|h1", 0, -1).await.unwrap().len(), 1);
        assert_eq!(store.lrange("audit|user|joost", 0, -1).await.unwrap().len(), 1);
        assert!(store.lrange("audit|host|h2", 0, -1).await.unwrap().is_empty());
        let entry = &parse(store.lrange("audit", 0, 0).await.unwrap())[0];
        assert_eq!(entry["host"], "h2");
        assert!(entry["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_healthcheck_registers_id() {
        let (cache, store) = cache();
        cache.healthcheck(&json!({ "id": "x", "host": "h1", "up": true }));
        cache.flush().await;
        assert_eq!(store.lrange("check|x", 0, -1).await.unwrap().len(), 1);
        assert_eq!(store.lrange("check|host|h1", 0, -1).await.unwrap().len(), 1);
        assert_eq!(store.smembers("checks").await.unwrap(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_healthcheck_without_id_is_noted() {
        let (cache, store) = cache();
        cache.healthcheck(&json!({ "host": "h1" }));
        cache.flush().await;
        assert!(store.smembers("checks").await.unwrap().is_empty());
        let notes = parse(store.lrange("notes", 0, -1).await.unwrap());
        assert_eq!(notes[0]["title"], "Healthcheck lacks an id");
    }

    #[tokio::test]
    async fn test_logline_registration_is_a_set() {
        let (cache, store) = cache();
        let data = json!({ "host": { "id": "h1" }, "labels": { "morio.module": "linux" } });
        cache.logline("syslog", &json!("line 1"), &data);
        cache.logline("syslog", &json!("line 2"), &data);
        cache.logline("auth", &json!("line 3"), &data);
        cache.flush().await;

        assert_eq!(
            store.lrange("log|h1|linux|syslog", 0, -1).await.unwrap(),
            vec!["line 2", "line 1"]
        );
        let registered = store.hget("logs|h1", "linux").await.unwrap().unwrap();
        let names: Vec<String> = serde_json::from_str(&registered).unwrap();
        assert_eq!(names, vec!["syslog", "auth"]);
        assert_eq!(store.ttl("logs|h1").await.unwrap(), Some(3600));
        assert_eq!(store.ttl("logs").await.unwrap(), Some(5400));
        let hosts = store.zrange_with_scores("logs").await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].0, "h1");
    }

    #[tokio::test]
    async fn test_series_prunes_stale_hosts() {
        let (cache, store) = cache();
        let stale = json!({ "@timestamp": "2001-01-01T00:00:00Z", "host": { "id": "old" } });
        let fresh = json!({ "host": { "id": "new" } });
        cache.metricset("cpu", &json!({ "pct": 1 }), &stale);
        cache.metricset("cpu", &json!({ "pct": 2 }), &fresh);
        cache.flush().await;

        let cutoff = (clock::now_ms() - 3_600_000) as f64;
        let hosts = store.zrange_with_scores("metrics").await.unwrap();
        assert_eq!(hosts.iter().map(|(h, _)| h.as_str()).collect::<Vec<_>>(), vec!["new"]);
        assert!(hosts.iter().all(|(_, score)| *score > cutoff));
        let cached = parse(store.lrange("metric|new|unknown-module|cpu", 0, -1).await.unwrap());
        assert_eq!(cached[0]["pct"], 2);
    }

    #[tokio::test]
    async fn test_series_guards() {
        let (cache, store) = cache();
        let data = json!({ "host": { "id": "h1" } });
        let mut opts = cache.logline_options();
        opts.cache = false;
        cache.logline_with("syslog", &json!("x"), &data, &opts);
        cache.metricset("", &json!({ "a": 1 }), &data);
        cache.metricset("cpu", &Value::Null, &data);
        cache.flush().await;
        assert_eq!(store.keys(), vec!["notes"]);
        assert_eq!(store.lrange("notes", 0, -1).await.unwrap().len(), 2);
    }

    /// Memory store whose hash reads always fail.
    struct UnreadableHashes(MemoryStore);

    #[async_trait::async_trait]
    impl Store for UnreadableHashes {
        async fn exec(&self, pipeline: Pipeline) -> Result<(), StoreError> {
            self.0.exec(pipeline).await
        }

        async fn hget(&self, _key: &str, _field: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Command("connection reset".into()))
        }

        async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
            self.0.lrange(key, start, stop).await
        }

        async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.0.smembers(key).await
        }

        async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
            self.0.zrange_with_scores(key).await
        }

        async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
            self.0.ttl(key).await
        }
    }

    #[tokio::test]
    async fn test_failed_registration_read_keeps_the_line() {
        let store = Arc::new(UnreadableHashes(MemoryStore::new()));
        let cache = Cache::spawn(store.clone(), CachePolicies::default(), 16);
        let data = json!({ "host": { "id": "h1" }, "labels": { "morio.module": "linux" } });
        cache.logline("syslog", &json!("line 1"), &data);
        cache.flush().await;

        assert_eq!(store.lrange("log|h1|linux|syslog", 0, -1).await.unwrap(), vec!["line 1"]);
        assert_eq!(store.zrange_with_scores("logs").await.unwrap().len(), 1);
        assert_eq!(store.0.hget("logs|h1", "linux").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreadable_registration_is_replaced() {
        let (cache, store) = cache();
        let mut pipe = Pipeline::new();
        pipe.hset("logs|h1", "linux", "not json");
        store.exec(pipe).await.unwrap();

        let data = json!({ "host": { "id": "h1" }, "labels": { "morio.module": "linux" } });
        cache.logline("syslog", &json!("line"), &data);
        cache.flush().await;

        let registered = store.hget("logs|h1", "linux").await.unwrap().unwrap();
        let names: Vec<String> = serde_json::from_str(&registered).unwrap();
        assert_eq!(names, vec!["syslog"]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_writes() {
        let store = Arc::new(MemoryStore::new());
        let (cache, worker) = Cache::new(store.clone(), CachePolicies::default(), 1);
        cache.event(&json!({ "n": 1 }));
        cache.event(&json!({ "n": 2 }));
        assert_eq!(cache.dropped(), 1);

        tokio::spawn(worker.run());
        cache.flush().await;
        assert_eq!(store.lrange("events", 0, -1).await.unwrap().len(), 1);
    }
}
