//! PostgreSQL-backed counter store over the `quota_counters` table, with
//! outstanding reservations in `quota_holds`. Each operation is a single
//! statement, so the row lock taken by `INSERT .. ON CONFLICT` / `UPDATE` /
//! `DELETE` serialises concurrent callers. A hold only counts while its
//! `window_start` matches the counter's.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::quota::store::{CounterStore, QuotaCounter, StoreError};
use crate::quota::tier::CounterKey;

#[derive(Debug, FromRow)]
struct CounterRow {
    count: i64,
    window_start: DateTime<Utc>,
}

impl CounterRow {
    fn into_counter(self, key: &CounterKey) -> Result<QuotaCounter, StoreError> {
        let count = u64::try_from(self.count).map_err(|_| StoreError::Corrupt {
            key: *key,
            detail: format!("negative count {}", self.count),
        })?;
        Ok(QuotaCounter {
            count,
            window_start: self.window_start,
        })
    }
}

#[derive(Clone)]
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn peek(&self, key: &CounterKey) -> Result<Option<QuotaCounter>, StoreError> {
        let row: Option<CounterRow> = sqlx::query_as(
            "SELECT count, window_start FROM quota_counters WHERE subject = $1 AND action = $2",
        )
        .bind(key.subject.to_string())
        .bind(key.action.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_counter(key)).transpose()
    }

    async fn reset_and_increment(
        &self,
        key: &CounterKey,
        observed: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<QuotaCounter, StoreError> {
        let row: CounterRow = sqlx::query_as(
            r#"
            INSERT INTO quota_counters AS c (subject, action, count, window_start, expires_at)
            VALUES ($1, $2, 1, $3, $4)
            ON CONFLICT (subject, action) DO UPDATE SET
                count = CASE WHEN c.window_start IS NOT DISTINCT FROM $5::timestamptz
                             THEN 1 ELSE c.count + 1 END,
                window_start = CASE WHEN c.window_start IS NOT DISTINCT FROM $5::timestamptz
                                    THEN EXCLUDED.window_start ELSE c.window_start END,
                expires_at = CASE WHEN c.window_start IS NOT DISTINCT FROM $5::timestamptz
                                  THEN EXCLUDED.expires_at ELSE c.expires_at END
            RETURNING count, window_start
            "#,
        )
        .bind(key.subject.to_string())
        .bind(key.action.as_str())
        .bind(now)
        .bind(now + ttl)
        .bind(observed)
        .fetch_one(&self.pool)
        .await?;
        row.into_counter(key)
    }

    async fn try_increment(&self, key: &CounterKey) -> Result<QuotaCounter, StoreError> {
        let row: Option<CounterRow> = sqlx::query_as(
            r#"
            UPDATE quota_counters SET count = count + 1
            WHERE subject = $1 AND action = $2
            RETURNING count, window_start
            "#,
        )
        .bind(key.subject.to_string())
        .bind(key.action.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::NotFound(*key))?.into_counter(key)
    }

    async fn hold(
        &self,
        key: &CounterKey,
        window_start: DateTime<Utc>,
        id: Uuid,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO quota_holds (subject, action, reservation_id, window_start)
            SELECT subject, action, $3, window_start FROM quota_counters
            WHERE subject = $1 AND action = $2 AND window_start = $4
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(key.subject.to_string())
        .bind(key.action.as_str())
        .bind(id)
        .bind(window_start)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn settle(&self, key: &CounterKey, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM quota_holds WHERE subject = $1 AND action = $2 AND reservation_id = $3",
        )
        .bind(key.subject.to_string())
        .bind(key.action.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn decrement(
        &self,
        key: &CounterKey,
        id: Uuid,
    ) -> Result<Option<QuotaCounter>, StoreError> {
        let row: Option<CounterRow> = sqlx::query_as(
            r#"
            WITH released AS (
                DELETE FROM quota_holds
                WHERE subject = $1 AND action = $2 AND reservation_id = $3
                RETURNING window_start
            )
            UPDATE quota_counters AS c SET count = GREATEST(c.count - 1, 0)
            FROM released
            WHERE c.subject = $1 AND c.action = $2 AND c.window_start = released.window_start
            RETURNING c.count, c.window_start
            "#,
        )
        .bind(key.subject.to_string())
        .bind(key.action.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_counter(key)).transpose()
    }

    async fn refund(&self, key: &CounterKey) -> Result<Option<QuotaCounter>, StoreError> {
        let row: Option<CounterRow> = sqlx::query_as(
            r#"
            UPDATE quota_counters SET count = GREATEST(count - 1, 0)
            WHERE subject = $1 AND action = $2
            RETURNING count, window_start
            "#,
        )
        .bind(key.subject.to_string())
        .bind(key.action.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_counter(key)).transpose()
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        // Holds on evicted counters go with them through the cascade.
        let result = sqlx::query("DELETE FROM quota_counters WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"
            DELETE FROM quota_holds h
            WHERE NOT EXISTS (
                SELECT 1 FROM quota_counters c
                WHERE c.subject = h.subject AND c.action = h.action
                  AND c.window_start = h.window_start
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
