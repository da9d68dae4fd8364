use crate::cache::CachePolicies;
use crate::error::TapError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TapConfig {
    pub broker: Option<BrokerConf>,
    pub node: NodeConf,
    pub store: StoreConf,
    pub inventory: InventoryConf,
    pub counters: CounterConf,
    pub processors: BTreeMap<String, ProcessorConf>,
    pub cache: CachePolicies,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrokerConf {
    /// `host` or `host:port`; the first entry is used.
    pub brokers: Vec<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Consumer group; defaults to the client id.
    pub group: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConf {
    pub ca: String,
    pub cert: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NodeConf {
    pub uuid: String,
    pub fqdn: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConf {
    pub url: String,
    /// Pending cache writes before new ones are dropped.
    pub queue_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct InventoryConf {
    pub url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CounterConf {
    pub tick_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProcessorConf {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Replaces the processor's own topic list when set.
    pub topics: Option<Vec<String>>,
}

fn default_client_id() -> String {
    "morio-tap".into()
}

fn default_keep_alive() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

impl Default for NodeConf {
    fn default() -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            fqdn: "localhost".into(),
        }
    }
}

impl Default for StoreConf {
    fn default() -> Self {
        Self {
            url: "redis://morio-cache:6379/0".into(),
            queue_capacity: 4096,
        }
    }
}

impl Default for InventoryConf {
    fn default() -> Self {
        Self {
            url: "http://morio-db:4001".into(),
            timeout_secs: 10,
        }
    }
}

impl Default for CounterConf {
    fn default() -> Self {
        Self { tick_ms: 30_000 }
    }
}

impl BrokerConf {
    pub fn group(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.client_id)
    }

    /// First broker as `(host, port)`, port defaulting to 1883.
    pub fn primary(&self) -> Result<(String, u16), TapError> {
        let first = self
            .brokers
            .first()
            .ok_or_else(|| TapError::Config("Broker list is empty".into()))?;
        match first.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| TapError::Config(format!("Invalid broker port in {first}")))?;
                Ok((host.to_string(), port))
            }
            None => Ok((first.clone(), 1883)),
        }
    }
}

impl TapConfig {
    /// Checks the parts the tap can not start without.
    pub fn validate(&self) -> Result<&BrokerConf, TapError> {
        let broker = self
            .broker
            .as_ref()
            .ok_or_else(|| TapError::Config("Invalid broker configuration".into()))?;
        broker.primary()?;
        if self.counters.tick_ms == 0 {
            return Err(TapError::Config("counters.tick_ms must be positive".into()));
        }
        Ok(broker)
    }

    pub fn from_yaml(txt: &str) -> Result<Self, TapError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(txt)?)
    }
}

/// Loads `MORIO_TAP_CONFIG` (default `tap.yaml`); a missing file yields defaults.
pub async fn load_config() -> Result<TapConfig, TapError> {
    let path = std::env::var("MORIO_TAP_CONFIG").unwrap_or_else(|_| "tap.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await?;
        TapConfig::from_yaml(&txt)
    } else {
        warn!("No config file at {}, using defaults", path);
        Ok(TapConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_broker_is_fatal() {
        let cfg = TapConfig::default();
        assert!(matches!(cfg.validate(), Err(TapError::Config(_))));
    }

    #[test]
    fn test_yaml_overrides() {
        let cfg = TapConfig::from_yaml(
            r#"
broker:
  brokers: ["broker-1:1884"]
node:
  uuid: "abc"
  fqdn: "node.example.com"
counters:
  tick_ms: 10000
processors:
  logs:
    enabled: false
cache:
  event:
    cap: 10
"#,
        )
        .unwrap();
        let broker = cfg.validate().unwrap();
        assert_eq!(broker.primary().unwrap(), ("broker-1".to_string(), 1884));
        assert_eq!(broker.group(), "morio-tap");
        assert_eq!(cfg.counters.tick_ms, 10_000);
        assert!(!cfg.processors["logs"].enabled);
        assert_eq!(cfg.cache.event.cap, 10);
        assert_eq!(cfg.cache.note.cap, 150);
    }

    #[test]
    fn test_default_port() {
        let broker = BrokerConf {
            brokers: vec!["morio-broker".into()],
            client_id: default_client_id(),
            group: None,
            keep_alive_secs: 15,
            username: None,
            password: None,
            tls: None,
        };
        assert_eq!(broker.primary().unwrap().1, 1883);
    }
}
