//! Durable per-(subject, action) counters.
//!
//! Every mutation is a single atomic operation on the backing store. Nothing
//! outside this module reads a counter, computes in-process and writes it back.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::quota::tier::CounterKey;

pub mod memory;
pub mod postgres;
pub mod redis;

pub use memory::InMemoryCounterStore;
pub use postgres::PgCounterStore;
pub use self::redis::RedisCounterStore;

/// Usage attributed to the current window only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCounter {
    pub count: u64,
    pub window_start: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("no counter for {0}")]
    NotFound(CounterKey),

    #[error("corrupt counter record for {key}: {detail}")]
    Corrupt { key: CounterKey, detail: String },
}

impl From<::redis::RedisError> for StoreError {
    fn from(e: ::redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read-only lookup.
    async fn peek(&self, key: &CounterKey) -> Result<Option<QuotaCounter>, StoreError>;

    /// Starts a new window at `now` with `count = 1`, provided the stored
    /// window still starts at `observed` (`None` = no record). If another
    /// caller already renewed the window, that window is incremented instead.
    /// `ttl` is how long the store should retain the record.
    async fn reset_and_increment(
        &self,
        key: &CounterKey,
        observed: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<QuotaCounter, StoreError>;

    /// Adds one to an existing record and returns the post-increment value.
    /// Fails with `NotFound` when there is no record.
    async fn try_increment(&self, key: &CounterKey) -> Result<QuotaCounter, StoreError>;

    /// Marks reservation `id` as outstanding against the window starting at
    /// `window_start`. Returns `false` without recording anything when that
    /// window is no longer current. Holds never outlive their window.
    async fn hold(
        &self,
        key: &CounterKey,
        window_start: DateTime<Utc>,
        id: Uuid,
    ) -> Result<bool, StoreError>;

    /// Drops an outstanding hold without touching the count. Returns whether
    /// the hold existed.
    async fn settle(&self, key: &CounterKey, id: Uuid) -> Result<bool, StoreError>;

    /// Consumes the hold for `id` and gives back the unit it charged, in one
    /// atomic step. Returns `None` when `id` is not outstanding in the
    /// current window, so a reservation refunds at most once.
    async fn decrement(&self, key: &CounterKey, id: Uuid)
        -> Result<Option<QuotaCounter>, StoreError>;

    /// Gives back one unit from whatever window the record is in, never going
    /// below zero. Used when a capped resource is destroyed. Returns `None`
    /// when there is no record.
    async fn refund(&self, key: &CounterKey) -> Result<Option<QuotaCounter>, StoreError>;

    /// Drops records whose retention has lapsed. Backends with native expiry
    /// have nothing to do.
    async fn evict_expired(&self, _now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(0)
    }
}

/// Converts a retention period into whole milliseconds, at least 1.
pub(crate) fn ttl_millis(ttl: Duration) -> i64 {
    ttl.num_milliseconds().max(1)
}
