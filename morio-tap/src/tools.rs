//! The toolbox handed to every processor, plus the small helpers that
//! writers and readers of the cache must agree on (keys, contexts, hashes).

use crate::cache::Cache;
use crate::config::NodeConf;
use crate::inventory::Inventory;
use crate::produce::Producer;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Everything a processor may call into.
#[derive(Clone)]
pub struct Tools {
    pub cache: Cache,
    pub produce: Producer,
    pub inventory: Inventory,
    pub node: NodeConf,
}

/// Lowercases and trims an identifier, `"Tony Soprano "` -> `"tony soprano"`.
pub fn clean(input: &str) -> String {
    input.trim().to_lowercase()
}

fn generate_key(parts: &[&str], spacer: &str) -> String {
    parts
        .iter()
        .map(|p| if p.is_empty() { "undefined".to_string() } else { p.replace('|', "_") })
        .collect::<Vec<_>>()
        .join(spacer)
        .to_lowercase()
}

/// Cache key: parts joined with `|`. Pure function of its inputs.
pub fn create_key(parts: &[&str]) -> String {
    generate_key(parts, "|")
}

/// Context key: same as a cache key but joined with `.`.
pub fn create_context(parts: &[&str]) -> String {
    generate_key(parts, ".")
}

/// SHA-256 of the input, hex encoded.
pub fn create_hash(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Random 20-byte document id, hex encoded. Used as `@metadata._id`.
pub fn create_id() -> String {
    let mut bytes = uuid::Uuid::new_v4().as_bytes().to_vec();
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes.truncate(20);
    hex::encode(bytes)
}

/// Lookups into ECS-shaped message data, with stable fallbacks.
pub mod extract {
    use serde_json::Value;

    fn string_at<'a>(data: &'a Value, pointer: &str) -> Option<&'a str> {
        data.pointer(pointer).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn agent(data: &Value) -> String {
        string_at(data, "/msg/agent/name").unwrap_or("unknown-agent").to_string()
    }

    pub fn check(data: &Value) -> String {
        string_at(data, "/url/full").unwrap_or("unknown-check").to_string()
    }

    pub fn host(data: &Value) -> String {
        string_at(data, "/host/id").unwrap_or("unknown-host").to_string()
    }

    pub fn metricset(data: &Value) -> String {
        string_at(data, "/metricset/name").unwrap_or("unknown-metricset").to_string()
    }

    pub fn module(data: &Value) -> String {
        data.get("labels")
            .and_then(|l| l.get("morio.module"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown-module")
            .to_string()
    }
}

pub mod clock {
    use serde_json::Value;
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    pub fn now_ms() -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }

    pub fn ms_to_s(ms: i64) -> i64 {
        ms.div_euclid(1000)
    }

    /// When a message happened: its `@timestamp` in ms, or now when absent or unparseable.
    pub fn when(data: &Value) -> i64 {
        data.get("@timestamp")
            .and_then(|ts| match ts {
                Value::String(s) => OffsetDateTime::parse(s, &Rfc3339)
                    .ok()
                    .map(|t| (t.unix_timestamp_nanos() / 1_000_000) as i64),
                Value::Number(n) => n.as_i64(),
                _ => None,
            })
            .unwrap_or_else(now_ms)
    }

    pub fn iso_now() -> String {
        OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| now_ms().to_string())
    }
}

/// Shortens a uuid for display, `xxxxx` when it is too short to be one.
pub fn short_uuid(uuid: &str) -> &str {
    if uuid.len() > 5 {
        uuid.get(..5).unwrap_or("xxxxx")
    } else {
        "xxxxx"
    }
}

/// Returns `value` as an object with `timestamp` added, wrapping non-objects.
pub(crate) fn with_timestamp(value: &Value, timestamp: i64) -> Value {
    match value {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("timestamp".to_string(), Value::from(timestamp));
            Value::Object(map)
        }
        other => serde_json::json!({ "data": other, "timestamp": timestamp }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_key() {
        assert_eq!(create_key(&["log", "Host1", "Mod", "syslog"]), "log|host1|mod|syslog");
        assert_eq!(create_key(&["audit", "host", "a|b"]), "audit|host|a_b");
        assert_eq!(create_key(&["check", ""]), "check|undefined");
        assert_eq!(create_context(&["check", "X"]), "check.x");
    }

    #[test]
    fn test_create_hash_is_stable() {
        assert_eq!(
            create_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_extract_fallbacks() {
        let data = json!({"host": {"id": "h1"}, "labels": {"morio.module": "mod"}});
        assert_eq!(extract::host(&data), "h1");
        assert_eq!(extract::module(&data), "mod");
        assert_eq!(extract::metricset(&data), "unknown-metricset");
        assert_eq!(extract::check(&Value::Null), "unknown-check");
    }

    #[test]
    fn test_when_reads_message_timestamp() {
        let data = json!({"@timestamp": "2023-11-14T22:13:20Z"});
        assert_eq!(clock::when(&data), 1_700_000_000_000);
        assert_eq!(clock::ms_to_s(clock::when(&data)), 1_700_000_000);
        let before = clock::now_ms();
        assert!(clock::when(&json!({"@timestamp": "garbage"})) >= before);
    }

    #[test]
    fn test_create_id_is_random() {
        let a = create_id();
        assert_eq!(a.len(), 40);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, create_id());
    }

    #[test]
    fn test_clean_and_short_uuid() {
        assert_eq!(clean("Tony Soprano "), "tony soprano");
        assert_eq!(short_uuid("abcdef-123"), "abcde");
        assert_eq!(short_uuid("ab"), "xxxxx");
    }
}
