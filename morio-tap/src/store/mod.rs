//! Store client - typed wrapper around the key/value store command set.
//!
//! Every logical cache write is expressed as one [`Pipeline`] and applied
//! atomically by [`Store::exec`], so a partially applied write is never
//! observable. Any store offering lists, sets, sorted sets, hashes and key
//! expiry can back the [`Store`] trait.

pub mod memory;
pub mod valkey;

pub use memory::MemoryStore;
pub use valkey::ValkeyStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    Pool(String),
    #[error("Command failed: {0}")]
    Command(String),
    #[error("Wrong value type at key {0}")]
    WrongType(String),
}

/// A single store command inside a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    LPush { key: String, value: String },
    LTrim { key: String, start: isize, stop: isize },
    SAdd { key: String, member: String },
    ZAdd { key: String, score: f64, member: String },
    ZRemRangeByScore { key: String, max: f64 },
    HSet { key: String, field: String, value: String },
    Expire { key: String, seconds: u64 },
}

/// Ordered batch of commands applied as one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lpush(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.commands.push(Command::LPush {
            key: key.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn ltrim(&mut self, key: &str, start: isize, stop: isize) -> &mut Self {
        self.commands.push(Command::LTrim {
            key: key.to_string(),
            start,
            stop,
        });
        self
    }

    /// Pushes to the head of a list and keeps only the `cap` newest entries.
    /// A cap of 0 disables the list: nothing is pushed.
    pub fn push_capped(&mut self, key: &str, value: impl Into<String>, cap: usize) -> &mut Self {
        if cap == 0 {
            return self;
        }
        self.lpush(key, value);
        self.ltrim(key, 0, cap as isize - 1)
    }

    pub fn sadd(&mut self, key: &str, member: impl Into<String>) -> &mut Self {
        self.commands.push(Command::SAdd {
            key: key.to_string(),
            member: member.into(),
        });
        self
    }

    pub fn zadd(&mut self, key: &str, score: f64, member: impl Into<String>) -> &mut Self {
        self.commands.push(Command::ZAdd {
            key: key.to_string(),
            score,
            member: member.into(),
        });
        self
    }

    /// Removes every member scored at or below `max` (`-inf..=max`).
    pub fn zrem_range_by_score(&mut self, key: &str, max: f64) -> &mut Self {
        self.commands.push(Command::ZRemRangeByScore {
            key: key.to_string(),
            max,
        });
        self
    }

    pub fn hset(&mut self, key: &str, field: &str, value: impl Into<String>) -> &mut Self {
        self.commands.push(Command::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn expire(&mut self, key: &str, seconds: u64) -> &mut Self {
        self.commands.push(Command::Expire {
            key: key.to_string(),
            seconds,
        });
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Applies every command of the pipeline atomically.
    async fn exec(&self, pipeline: Pipeline) -> Result<(), StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Members in ascending score order.
    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError>;

    /// Remaining time to live in seconds, `None` when the key is missing or persistent.
    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError>;
}
