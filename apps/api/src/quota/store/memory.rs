//! In-process counter store. Per-key serialisation comes from `DashMap`'s
//! shard locks: each operation holds the entry guard for its whole
//! read-modify-write.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::quota::store::{CounterStore, QuotaCounter, StoreError};
use crate::quota::tier::CounterKey;

#[derive(Debug, Clone)]
struct Record {
    counter: QuotaCounter,
    expires_at: DateTime<Utc>,
    /// Reservations charged to this window and not yet settled.
    holds: HashSet<Uuid>,
}

#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    records: DashMap<CounterKey, Record>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn peek(&self, key: &CounterKey) -> Result<Option<QuotaCounter>, StoreError> {
        Ok(self.records.get(key).map(|r| r.counter))
    }

    async fn reset_and_increment(
        &self,
        key: &CounterKey,
        observed: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<QuotaCounter, StoreError> {
        let fresh = Record {
            counter: QuotaCounter {
                count: 1,
                window_start: now,
            },
            expires_at: now + ttl,
            holds: HashSet::new(),
        };
        let counter = fresh.counter;
        match self.records.entry(*key) {
            Entry::Vacant(slot) => {
                if observed.is_some() {
                    // Evicted since it was observed; a fresh window is still correct.
                    tracing::debug!("Counter {key} vanished before reset, starting new window");
                }
                slot.insert(fresh);
                Ok(counter)
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if Some(record.counter.window_start) == observed {
                    *record = fresh;
                } else {
                    record.counter.count = record.counter.count.saturating_add(1);
                }
                Ok(record.counter)
            }
        }
    }

    async fn try_increment(&self, key: &CounterKey) -> Result<QuotaCounter, StoreError> {
        let mut record = self
            .records
            .get_mut(key)
            .ok_or(StoreError::NotFound(*key))?;
        record.counter.count = record.counter.count.saturating_add(1);
        Ok(record.counter)
    }

    async fn hold(
        &self,
        key: &CounterKey,
        window_start: DateTime<Utc>,
        id: Uuid,
    ) -> Result<bool, StoreError> {
        let Some(mut record) = self.records.get_mut(key) else {
            return Ok(false);
        };
        if record.counter.window_start != window_start {
            return Ok(false);
        }
        record.holds.insert(id);
        Ok(true)
    }

    async fn settle(&self, key: &CounterKey, id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .records
            .get_mut(key)
            .map(|mut record| record.holds.remove(&id))
            .unwrap_or(false))
    }

    async fn decrement(
        &self,
        key: &CounterKey,
        id: Uuid,
    ) -> Result<Option<QuotaCounter>, StoreError> {
        let Some(mut record) = self.records.get_mut(key) else {
            return Ok(None);
        };
        if !record.holds.remove(&id) {
            return Ok(None);
        }
        record.counter.count = record.counter.count.saturating_sub(1);
        Ok(Some(record.counter))
    }

    async fn refund(&self, key: &CounterKey) -> Result<Option<QuotaCounter>, StoreError> {
        Ok(self.records.get_mut(key).map(|mut record| {
            record.counter.count = record.counter.count.saturating_sub(1);
            record.counter
        }))
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at > now);
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}
