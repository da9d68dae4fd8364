//! Inventory query builder.
//!
//! Turns host telemetry (`{host: {id, arch, cores, name, fqdn, memory, os, ip, mac}}`)
//! into one batch of SQL statements for the inventory database:
//!
//! - an upsert into `inventory_hosts`
//! - a replace into `inventory_oss` when any OS field is present
//! - one replace into `inventory_ips` / `inventory_macs` per address, id `{hostId}_{value}`
//!
//! The batch is submitted as a single `POST /db/execute`; how the database
//! applies it is up to the database.

use crate::cache::Cache;
use crate::error::TapError;
use crate::tools::{clean, clock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const OS_FIELDS: [&str; 7] = ["codename", "family", "kernel", "name", "platform", "type", "version"];

/// One parameterised statement, serialised as `[sql, params]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement(pub String, pub Map<String, Value>);

/// Outcome of one statement as reported by the database.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct StatementResult {
    pub rows_affected: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
}

fn upsert_query(table: &str, params: Map<String, Value>) -> Statement {
    let keys: Vec<&str> = params.keys().map(String::as_str).collect();
    let vals = keys.iter().map(|k| format!(":{k}")).collect::<Vec<_>>().join(",");
    let updates = keys.iter().map(|k| format!("{k} = :{k}")).collect::<Vec<_>>().join(",");
    let sql = format!(
        "INSERT INTO {table}({}) VALUES({vals}) ON CONFLICT(id) DO UPDATE SET {updates}",
        keys.join(",")
    );
    Statement(sql, params)
}

fn replace_query(table: &str, params: Map<String, Value>) -> Statement {
    let keys: Vec<&str> = params.keys().map(String::as_str).collect();
    let vals = keys.iter().map(|k| format!(":{k}")).collect::<Vec<_>>().join(",");
    let sql = format!("REPLACE INTO {table}({}) VALUES({vals})", keys.join(","));
    Statement(sql, params)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(clean(s)),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) => Some(Value::Number(n.clone())),
        Value::String(s) => s.trim().parse::<f64>().ok().and_then(|f| {
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                Some(Value::from(f as i64))
            } else {
                serde_json::Number::from_f64(f).map(Value::Number)
            }
        }),
        _ => None,
    }
}

fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str()).map(str::to_string).collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Builds every statement for one host update.
/// Fails without touching anything when `host.id` is missing.
pub fn host_statements(data: &Value) -> Result<Vec<Statement>, TapError> {
    let host = data.get("host").unwrap_or(&Value::Null);
    let host_id = host
        .get("id")
        .and_then(as_text)
        .ok_or_else(|| TapError::Inventory("host update lacks an id".into()))?;
    let now = clock::iso_now();

    let mut params = Map::new();
    params.insert("id".into(), json!(host_id));
    params.insert("last_update".into(), json!(now));
    for field in ["arch", "name", "fqdn"] {
        if let Some(v) = host.get(field).and_then(as_text) {
            params.insert(field.into(), json!(v));
        }
    }
    for field in ["cores", "memory"] {
        if let Some(v) = host.get(field).and_then(as_number) {
            params.insert(field.into(), v);
        }
    }
    let mut statements = vec![upsert_query("inventory_hosts", params)];

    if let Some(os) = host.get("os") {
        let mut params = Map::new();
        for field in OS_FIELDS {
            if let Some(v) = os.get(field).filter(|v| !v.is_null() && *v != "") {
                params.insert(field.into(), v.clone());
            }
        }
        if !params.is_empty() {
            params.insert("id".into(), json!(host_id));
            params.insert("last_update".into(), json!(now));
            statements.push(replace_query("inventory_oss", params));
        }
    }

    for ip in strings(host.get("ip")) {
        let ip = clean(&ip);
        let version = if ip.contains(':') { 6 } else { 4 };
        let mut params = Map::new();
        params.insert("id".into(), json!(format!("{host_id}_{ip}")));
        params.insert("ip".into(), json!(ip));
        params.insert("host".into(), json!(host_id));
        params.insert("version".into(), json!(version));
        params.insert("last_update".into(), json!(now));
        statements.push(replace_query("inventory_ips", params));
    }

    for mac in strings(host.get("mac")) {
        let mac = clean(&mac);
        let mut params = Map::new();
        params.insert("id".into(), json!(format!("{host_id}_{mac}")));
        params.insert("mac".into(), json!(mac));
        params.insert("host".into(), json!(host_id));
        params.insert("last_update".into(), json!(now));
        statements.push(replace_query("inventory_macs", params));
    }

    Ok(statements)
}

/// Database side of the inventory.
#[async_trait::async_trait]
pub trait InventoryExecutor: Send + Sync {
    async fn execute(&self, statements: Vec<Statement>) -> Result<Vec<StatementResult>, TapError>;
}

/// `POST {url}/db/execute` with the statement batch as JSON.
pub struct HttpInventory {
    client: reqwest::Client,
    url: String,
}

impl HttpInventory {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, TapError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TapError::Inventory(e.to_string()))?;
        Ok(Self {
            client,
            url: format!("{}/db/execute", url.trim_end_matches('/')),
        })
    }
}

#[async_trait::async_trait]
impl InventoryExecutor for HttpInventory {
    async fn execute(&self, statements: Vec<Statement>) -> Result<Vec<StatementResult>, TapError> {
        let response = self
            .client
            .post(&self.url)
            .json(&statements)
            .send()
            .await
            .map_err(|e| TapError::Inventory(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TapError::Inventory(e.to_string()))?;
        read_results(status, &body)
    }
}

/// Per-statement results of a `/db/execute` answer.
fn read_results(status: reqwest::StatusCode, body: &str) -> Result<Vec<StatementResult>, TapError> {
    if !status.is_success() {
        return Err(TapError::Inventory(format!("database answered {status}")));
    }
    let parsed: ExecuteResponse =
        serde_json::from_str(body).map_err(|e| TapError::Inventory(format!("unreadable answer: {e}")))?;
    Ok(parsed.results)
}

/// Records every batch it receives; each statement reports one affected row.
#[derive(Default)]
pub struct MemoryInventory {
    batches: Mutex<Vec<Vec<Statement>>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<Statement>> {
        self.batches.lock().clone()
    }
}

#[async_trait::async_trait]
impl InventoryExecutor for MemoryInventory {
    async fn execute(&self, statements: Vec<Statement>) -> Result<Vec<StatementResult>, TapError> {
        let results = statements
            .iter()
            .map(|_| StatementResult { rows_affected: Some(1), error: None })
            .collect();
        self.batches.lock().push(statements);
        Ok(results)
    }
}

/// What processors call to update the inventory.
#[derive(Clone)]
pub struct Inventory {
    executor: Arc<dyn InventoryExecutor>,
    cache: Cache,
}

impl Inventory {
    pub fn new(executor: Arc<dyn InventoryExecutor>, cache: Cache) -> Self {
        Self { executor, cache }
    }

    /// Runs [`Inventory::update_host`] on its own task; for the dispatch path.
    pub fn submit(&self, data: Value) -> JoinHandle<bool> {
        let inventory = self.clone();
        tokio::spawn(async move { inventory.update_host(&data).await })
    }

    /// Builds and submits the batch for one host. Problems are noted, not raised.
    /// Returns whether the batch was applied without errors.
    pub async fn update_host(&self, data: &Value) -> bool {
        let statements = match host_statements(data) {
            Ok(statements) => statements,
            Err(e) => {
                warn!("{}", e);
                self.cache.note("updateHost was called without an id", data.clone());
                return false;
            }
        };
        let host_id = data.pointer("/host/id").cloned().unwrap_or(Value::Null);
        let count = statements.len();

        match self.executor.execute(statements).await {
            Ok(results) => {
                let errors: Vec<&str> = results.iter().filter_map(|r| r.error.as_deref()).collect();
                if errors.is_empty() {
                    debug!("Updated inventory for host {} ({} statements)", host_id, count);
                    true
                } else {
                    self.cache.note(
                        "Error when trying to update inventory",
                        json!({ "host": host_id, "errors": errors }),
                    );
                    false
                }
            }
            Err(e) => {
                self.cache.note(
                    "Failed to update host in inventory",
                    json!({ "host": host_id, "error": e.to_string() }),
                );
                false
            }
        }
    }
}
