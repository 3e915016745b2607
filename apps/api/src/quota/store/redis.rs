//! Redis-backed counter store. Each counter is a hash `{count, start}` under
//! `<prefix><action>:<subject>`; every mutation is one Lua script, so Redis
//! serialises operations on the same key. Outstanding reservations live in
//! the same hash as `h:<id>` fields, so they share its TTL and disappear
//! whenever the window is reset.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, RedisError, Script};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::quota::store::{ttl_millis, CounterStore, QuotaCounter, StoreError};
use crate::quota::tier::CounterKey;

// A key that expired after it was observed is treated as a fresh window.
const RESET_AND_INCREMENT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'start')
if current == false or current == ARGV[2] then
  redis.call('DEL', KEYS[1])
  redis.call('HSET', KEYS[1], 'count', 1, 'start', ARGV[1])
  redis.call('PEXPIRE', KEYS[1], ARGV[3])
  return {1, ARGV[1]}
end
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
return {count, current}
"#;

const TRY_INCREMENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return false end
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
return {count, redis.call('HGET', KEYS[1], 'start')}
"#;

const HOLD: &str = r#"
if redis.call('HGET', KEYS[1], 'start') ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'h:' .. ARGV[2], 1)
return 1
"#;

const SETTLE: &str = r#"
return redis.call('HDEL', KEYS[1], 'h:' .. ARGV[1])
"#;

const DECREMENT: &str = r#"
if redis.call('HDEL', KEYS[1], 'h:' .. ARGV[1]) == 0 then return false end
local count = tonumber(redis.call('HGET', KEYS[1], 'count'))
if count > 0 then count = redis.call('HINCRBY', KEYS[1], 'count', -1) end
return {count, redis.call('HGET', KEYS[1], 'start')}
"#;

const REFUND: &str = r#"
local start = redis.call('HGET', KEYS[1], 'start')
if start == false then return false end
local count = tonumber(redis.call('HGET', KEYS[1], 'count'))
if count > 0 then count = redis.call('HINCRBY', KEYS[1], 'count', -1) end
return {count, start}
"#;

/// Check if a Redis error means the connection has to be re-established.
fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
}

pub struct RedisCounterStore {
    client: Client,
    conn: RwLock<Option<MultiplexedConnection>>,
    prefix: String,
    reset_script: Script,
    increment_script: Script,
    hold_script: Script,
    settle_script: Script,
    decrement_script: Script,
    refund_script: Script,
}

impl RedisCounterStore {
    /// Connection is established lazily, so a Redis outage at start-up only
    /// degrades quota checks instead of preventing boot.
    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            conn: RwLock::new(None),
            prefix: prefix.into(),
            reset_script: Script::new(RESET_AND_INCREMENT),
            increment_script: Script::new(TRY_INCREMENT),
            hold_script: Script::new(HOLD),
            settle_script: Script::new(SETTLE),
            decrement_script: Script::new(DECREMENT),
            refund_script: Script::new(REFUND),
        }
    }

    fn redis_key(&self, key: &CounterKey) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }
        let mut slot = self.conn.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_tokio_connection().await?;
        info!("Connected to Redis for quota counters");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Maps a Redis failure, dropping the cached connection if it is broken.
    async fn fail(&self, err: RedisError) -> StoreError {
        if is_connection_error(&err) {
            warn!("Redis connection lost, reconnecting on next use: {err}");
            *self.conn.write().await = None;
        }
        StoreError::from(err)
    }

    fn decode(key: &CounterKey, count: i64, start_ms: i64) -> Result<QuotaCounter, StoreError> {
        let count = u64::try_from(count).map_err(|_| StoreError::Corrupt {
            key: *key,
            detail: format!("negative count {count}"),
        })?;
        let window_start = Utc
            .timestamp_millis_opt(start_ms)
            .single()
            .ok_or_else(|| StoreError::Corrupt {
                key: *key,
                detail: format!("bad window start {start_ms}"),
            })?;
        Ok(QuotaCounter {
            count,
            window_start,
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn peek(&self, key: &CounterKey) -> Result<Option<QuotaCounter>, StoreError> {
        let mut conn = self.connection().await?;
        let reply: (Option<i64>, Option<i64>) = match ::redis::cmd("HMGET")
            .arg(self.redis_key(key))
            .arg("count")
            .arg("start")
            .query_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e).await),
        };
        match reply {
            (Some(count), Some(start)) => Self::decode(key, count, start).map(Some),
            _ => Ok(None),
        }
    }

    async fn reset_and_increment(
        &self,
        key: &CounterKey,
        observed: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<QuotaCounter, StoreError> {
        let mut conn = self.connection().await?;
        let observed = observed
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_default();
        let reply: (i64, i64) = match self
            .reset_script
            .key(self.redis_key(key))
            .arg(now.timestamp_millis())
            .arg(observed)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e).await),
        };
        Self::decode(key, reply.0, reply.1)
    }

    async fn try_increment(&self, key: &CounterKey) -> Result<QuotaCounter, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Option<(i64, i64)> = match self
            .increment_script
            .key(self.redis_key(key))
            .invoke_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e).await),
        };
        let (count, start) = reply.ok_or(StoreError::NotFound(*key))?;
        Self::decode(key, count, start)
    }

    async fn hold(
        &self,
        key: &CounterKey,
        window_start: DateTime<Utc>,
        id: Uuid,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        match self
            .hold_script
            .key(self.redis_key(key))
            .arg(window_start.timestamp_millis())
            .arg(id.to_string())
            .invoke_async::<_, i64>(&mut conn)
            .await
        {
            Ok(held) => Ok(held == 1),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn settle(&self, key: &CounterKey, id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        match self
            .settle_script
            .key(self.redis_key(key))
            .arg(id.to_string())
            .invoke_async::<_, i64>(&mut conn)
            .await
        {
            Ok(removed) => Ok(removed == 1),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn decrement(
        &self,
        key: &CounterKey,
        id: Uuid,
    ) -> Result<Option<QuotaCounter>, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Option<(i64, i64)> = match self
            .decrement_script
            .key(self.redis_key(key))
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e).await),
        };
        reply
            .map(|(count, start)| Self::decode(key, count, start))
            .transpose()
    }

    async fn refund(&self, key: &CounterKey) -> Result<Option<QuotaCounter>, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Option<(i64, i64)> = match self
            .refund_script
            .key(self.redis_key(key))
            .invoke_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e).await),
        };
        reply
            .map(|(count, start)| Self::decode(key, count, start))
            .transpose()
    }
}
