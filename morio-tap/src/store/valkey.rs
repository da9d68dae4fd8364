//! Valkey / Redis backend for the [`Store`] port, over a deadpool connection pool.

use super::{Command, Pipeline, Store, StoreError};
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::{Config, Pool, Runtime};
use tracing::debug;

pub struct ValkeyStore {
    pool: Pool,
}

impl ValkeyStore {
    /// Builds the pool; connections are opened lazily on first use.
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let cfg = Config::from_url(url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        debug!("Created store pool for {}", url);
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

fn command_error(e: deadpool_redis::redis::RedisError) -> StoreError {
    StoreError::Command(e.to_string())
}

#[async_trait::async_trait]
impl Store for ValkeyStore {
    async fn exec(&self, pipeline: Pipeline) -> Result<(), StoreError> {
        if pipeline.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;

        let mut pipe = deadpool_redis::redis::pipe();
        pipe.atomic();
        for command in pipeline.commands() {
            match command {
                Command::LPush { key, value } => {
                    pipe.cmd("LPUSH").arg(key).arg(value).ignore();
                }
                Command::LTrim { key, start, stop } => {
                    pipe.cmd("LTRIM").arg(key).arg(*start).arg(*stop).ignore();
                }
                Command::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                Command::ZAdd { key, score, member } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
                }
                Command::ZRemRangeByScore { key, max } => {
                    pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg("-inf").arg(*max).ignore();
                }
                Command::HSet { key, field, value } => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore();
                }
                Command::Expire { key, seconds } => {
                    pipe.cmd("EXPIRE").arg(key).arg(*seconds).ignore();
                }
            }
        }

        let _: () = pipe.query_async(&mut conn).await.map_err(command_error)?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.hget(key, field).await.map_err(command_error)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.lrange(key, start, stop).await.map_err(command_error)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.smembers(key).await.map_err(command_error)
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        let mut conn = self.conn().await?;
        conn.zrange_withscores(key, 0, -1).await.map_err(command_error)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn().await?;
        let secs: i64 = conn.ttl(key).await.map_err(command_error)?;
        // -2: missing key, -1: no expiry
        Ok(u64::try_from(secs).ok())
    }
}
