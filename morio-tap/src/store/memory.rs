//! In-process [`Store`] used by tests, the devkit and offline runs.
//!
//! Mirrors the Valkey semantics the cache relies on: head-pushed lists,
//! inclusive `LTRIM` ranges with negative indexes, sorted sets ordered by
//! score, and lazily enforced key expiry. A whole pipeline is applied under
//! a single lock.

use super::{Command, Pipeline, Store, StoreError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    ZSet(Vec<(String, f64)>),
    Hash(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every live key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries);
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>) {
    let now = Instant::now();
    entries.retain(|_, e| e.expires_at.map_or(true, |at| at > now));
}

/// Resolves an inclusive Redis-style range against a length.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

fn apply(entries: &mut HashMap<String, Entry>, command: &Command) -> Result<(), StoreError> {
    match command {
        Command::LPush { key, value } => {
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::List(list) => list.push_front(value.clone()),
                _ => return Err(StoreError::WrongType(key.clone())),
            }
        }
        Command::LTrim { key, start, stop } => {
            if let Some(entry) = entries.get_mut(key) {
                let Value::List(list) = &mut entry.value else {
                    return Err(StoreError::WrongType(key.clone()));
                };
                match resolve_range(list.len(), *start, *stop) {
                    Some((from, to)) => {
                        list.truncate(to + 1);
                        list.drain(..from);
                    }
                    None => list.clear(),
                }
                if list.is_empty() {
                    entries.remove(key);
                }
            }
        }
        Command::SAdd { key, member } => {
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::Set(BTreeSet::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Set(set) => {
                    set.insert(member.clone());
                }
                _ => return Err(StoreError::WrongType(key.clone())),
            }
        }
        Command::ZAdd { key, score, member } => {
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::ZSet(Vec::new()),
                expires_at: None,
            });
            let Value::ZSet(zset) = &mut entry.value else {
                return Err(StoreError::WrongType(key.clone()));
            };
            zset.retain(|(m, _)| m != member);
            zset.push((member.clone(), *score));
            zset.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        }
        Command::ZRemRangeByScore { key, max } => {
            if let Some(entry) = entries.get_mut(key) {
                let Value::ZSet(zset) = &mut entry.value else {
                    return Err(StoreError::WrongType(key.clone()));
                };
                zset.retain(|(_, score)| score > max);
                if zset.is_empty() {
                    entries.remove(key);
                }
            }
        }
        Command::HSet { key, field, value } => {
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::Hash(BTreeMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(hash) => {
                    hash.insert(field.clone(), value.clone());
                }
                _ => return Err(StoreError::WrongType(key.clone())),
            }
        }
        Command::Expire { key, seconds } => {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(*seconds));
            }
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn exec(&self, pipeline: Pipeline) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries);
        // Work on a copy so a failing command leaves nothing behind
        let mut staged = entries.clone();
        for command in pipeline.commands() {
            apply(&mut staged, command)?;
        }
        *entries = staged;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(match resolve_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(zset)) => Ok(zset.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries);
        Ok(entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()).as_secs_f64().round() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capped_list_keeps_newest() {
        let store = MemoryStore::new();
        for i in 0..10 {
            let mut pipe = Pipeline::new();
            pipe.push_capped("l", i.to_string(), 3);
            store.exec(pipe).await.unwrap();
        }
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["9", "8", "7"]);
    }

    #[tokio::test]
    async fn test_zset_prune_and_update() {
        let store = MemoryStore::new();
        let mut pipe = Pipeline::new();
        pipe.zadd("z", 5.0, "a").zadd("z", 10.0, "b").zadd("z", 1.0, "a");
        pipe.zrem_range_by_score("z", 2.0);
        store.exec(pipe).await.unwrap();
        assert_eq!(store.zrange_with_scores("z").await.unwrap(), vec![("b".to_string(), 10.0)]);
    }

    #[tokio::test]
    async fn test_wrong_type_rolls_back_batch() {
        let store = MemoryStore::new();
        let mut pipe = Pipeline::new();
        pipe.sadd("k", "m");
        store.exec(pipe).await.unwrap();

        let mut pipe = Pipeline::new();
        pipe.lpush("other", "x").lpush("k", "y");
        assert!(store.exec(pipe).await.is_err());
        assert!(store.lrange("other", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_sets_ttl() {
        let store = MemoryStore::new();
        let mut pipe = Pipeline::new();
        pipe.hset("h", "f", "v").expire("h", 3600);
        store.exec(pipe).await.unwrap();
        assert_eq!(store.ttl("h").await.unwrap(), Some(3600));
        assert_eq!(store.ttl("missing").await.unwrap(), None);
        assert_eq!(store.hget("h", "f").await.unwrap().as_deref(), Some("v"));
    }
}
