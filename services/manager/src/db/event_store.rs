//! Postgres event store.
//!
//! Ordering uses `(event_ts, seq)`: `seq` is a `BIGSERIAL` that breaks ties
//! between events stamped in the same microsecond. Appends for one tenant are
//! serialized with a transaction-scoped advisory lock so `event_ts` never
//! goes backwards within a tenant.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use shadowsync_events::{
    DeliveryState, DeliveryStatus, DeliveryTransition, Event, EventData, EventType, EventsFilter,
    NewEvent,
};
use shadowsync_id::{EventId, TenantId};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};
use tracing::debug;

use super::DbError;
use crate::store::{EventStore, StoreError, StoreResult};

/// A row from the events table.
#[derive(Debug, Clone)]
struct EventRow {
    id: String,
    tenant_id: String,
    event_type: String,
    data: serde_json::Value,
    event_ts: DateTime<Utc>,
    expire_ts: DateTime<Utc>,
    delivery_status: String,
    retry_count: i32,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            event_type: row.try_get("event_type")?,
            data: row.try_get("data")?,
            event_ts: row.try_get("event_ts")?,
            expire_ts: row.try_get("expire_ts")?,
            delivery_status: row.try_get("delivery_status")?,
            retry_count: row.try_get("retry_count")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

impl EventRow {
    fn into_event(self) -> StoreResult<Event> {
        let corrupt = |message: String| StoreError::Corrupt {
            id: self.id.clone(),
            message,
        };

        let id: EventId = self.id.parse().map_err(|e| corrupt(format!("{e}")))?;
        let tenant_id = TenantId::parse(self.tenant_id.as_str()).map_err(|e| corrupt(format!("{e}")))?;
        let event_type: EventType = self
            .event_type
            .parse()
            .map_err(|e| corrupt(format!("{e}")))?;
        let data = EventData::from_payload(event_type, self.data.clone())
            .map_err(|e| corrupt(format!("{e}")))?;
        let status: DeliveryStatus = self
            .delivery_status
            .parse()
            .map_err(|e| corrupt(format!("{e}")))?;
        let retry_count =
            u32::try_from(self.retry_count).map_err(|e| corrupt(format!("retry_count: {e}")))?;

        Ok(Event {
            id,
            tenant_id,
            data,
            event_ts: self.event_ts,
            expire_ts: self.expire_ts,
            delivery: DeliveryState {
                status,
                retry_count,
                next_attempt_at: self.next_attempt_at,
                last_error: self.last_error,
            },
        })
    }
}

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(DbError::Query(e))
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn into_events(rows: Vec<EventRow>) -> StoreResult<Vec<Event>> {
    rows.into_iter().map(EventRow::into_event).collect()
}

/// Postgres-backed [`EventStore`].
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
    retention: Duration,
}

impl PgEventStore {
    /// Create a new event store.
    pub fn new(pool: PgPool, retention: Duration) -> Self {
        Self { pool, retention }
    }

    fn retention_secs(&self) -> f64 {
        self.retention.num_milliseconds() as f64 / 1000.0
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, event: NewEvent) -> StoreResult<Event> {
        let id = event.id.unwrap_or_default();
        let payload = event.data.payload_json()?;

        let mut tx = self.pool.begin().await.map_err(query_err)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(event.tenant_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        let row = sqlx::query_as::<_, EventRow>(
            r#"
            INSERT INTO events (id, tenant_id, event_type, device_id, data, event_ts, expire_ts)
            SELECT $1, $2, $3, $4, $5, stamp.ts, stamp.ts + make_interval(secs => $6)
            FROM (
                SELECT GREATEST(
                    clock_timestamp(),
                    COALESCE(
                        (SELECT max(event_ts) FROM events WHERE tenant_id = $2),
                        '-infinity'::timestamptz
                    )
                ) AS ts
            ) AS stamp
            RETURNING id, tenant_id, event_type, data, event_ts, expire_ts,
                      delivery_status, retry_count, next_attempt_at, last_error
            "#,
        )
        .bind(id.to_string())
        .bind(event.tenant_id.as_str())
        .bind(event.data.event_type().as_str())
        .bind(event.data.device_id().as_str())
        .bind(&payload)
        .bind(self.retention_secs())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            let err = DbError::Query(e);
            if err.is_unique_violation() {
                StoreError::DuplicateKey(id)
            } else {
                StoreError::Database(err)
            }
        })?;

        tx.commit().await.map_err(query_err)?;

        let stored = row.into_event()?;
        debug!(
            event_id = %stored.id,
            tenant_id = %stored.tenant_id,
            event_type = %stored.event_type(),
            "Appended event"
        );
        Ok(stored)
    }

    async fn query(&self, tenant: &TenantId, filter: &EventsFilter) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, tenant_id, event_type, data, event_ts, expire_ts,
                   delivery_status, retry_count, next_attempt_at, last_error
            FROM events
            WHERE tenant_id = $1
              AND expire_ts > now()
              AND ($2::text IS NULL OR device_id = $2)
              AND ($3::text IS NULL OR event_type = $3)
              AND ($4::text IS NULL OR delivery_status = $4)
              AND ($5::timestamptz IS NULL OR event_ts >= $5)
              AND ($6::timestamptz IS NULL OR event_ts < $6)
            ORDER BY event_ts ASC, seq ASC
            OFFSET $7
            LIMIT $8
            "#,
        )
        .bind(tenant.as_str())
        .bind(filter.device_id.as_ref().map(|d| d.as_str().to_string()))
        .bind(filter.event_type.map(|t| t.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.since)
        .bind(filter.until)
        .bind(to_i64(filter.skip))
        .bind(to_i64(filter.effective_limit()))
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        into_events(rows)
    }

    async fn get(&self, tenant: &TenantId, id: EventId) -> StoreResult<Event> {
        let row = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, tenant_id, event_type, data, event_ts, expire_ts,
                   delivery_status, retry_count, next_attempt_at, last_error
            FROM events
            WHERE tenant_id = $1 AND id = $2 AND expire_ts > now()
            "#,
        )
        .bind(tenant.as_str())
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;

        row.ok_or(StoreError::NotFound(id))?.into_event()
    }

    async fn update_status(
        &self,
        tenant: &TenantId,
        id: EventId,
        transition: DeliveryTransition,
    ) -> StoreResult<Event> {
        // Guards mirror DeliveryState::apply; a row that fails them is left
        // untouched and read back as-is.
        let row = match &transition {
            DeliveryTransition::Delivered => {
                sqlx::query_as::<_, EventRow>(
                    r#"
                    UPDATE events
                    SET delivery_status = 'delivered', next_attempt_at = NULL
                    WHERE tenant_id = $1 AND id = $2
                      AND expire_ts > now()
                      AND delivery_status <> 'delivered'
                    RETURNING id, tenant_id, event_type, data, event_ts, expire_ts,
                              delivery_status, retry_count, next_attempt_at, last_error
                    "#,
                )
                .bind(tenant.as_str())
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
            }
            DeliveryTransition::Failed {
                attempt,
                error,
                next_attempt_at,
            } => {
                sqlx::query_as::<_, EventRow>(
                    r#"
                    UPDATE events
                    SET delivery_status = 'failed',
                        retry_count = $3,
                        next_attempt_at = $4,
                        last_error = $5
                    WHERE tenant_id = $1 AND id = $2
                      AND expire_ts > now()
                      AND delivery_status <> 'delivered'
                      AND retry_count = $3 - 1
                    RETURNING id, tenant_id, event_type, data, event_ts, expire_ts,
                              delivery_status, retry_count, next_attempt_at, last_error
                    "#,
                )
                .bind(tenant.as_str())
                .bind(id.to_string())
                .bind(i32::try_from(*attempt).unwrap_or(i32::MAX))
                .bind(*next_attempt_at)
                .bind(error)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(query_err)?;

        match row {
            Some(row) => row.into_event(),
            None => {
                debug!(
                    event_id = %id,
                    target = %transition.target_status(),
                    "Delivery transition not applicable, leaving event unchanged"
                );
                self.get(tenant, id).await
            }
        }
    }

    async fn due_for_delivery(
        &self,
        tenant: &TenantId,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: u64,
    ) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT e.id, e.tenant_id, e.event_type, e.data, e.event_ts, e.expire_ts,
                   e.delivery_status, e.retry_count, e.next_attempt_at, e.last_error
            FROM events e
            WHERE e.tenant_id = $1
              AND e.expire_ts > $2
              AND e.retry_count < $3
              AND (
                  e.delivery_status = 'not-delivered'
                  OR (e.delivery_status = 'failed' AND e.next_attempt_at <= $2)
              )
              AND NOT EXISTS (
                  SELECT 1 FROM events b
                  WHERE b.tenant_id = e.tenant_id
                    AND b.device_id = e.device_id
                    AND (b.event_ts, b.seq) < (e.event_ts, e.seq)
                    AND b.expire_ts > $2
                    AND b.delivery_status = 'failed'
                    AND b.retry_count < $3
                    AND b.next_attempt_at > $2
              )
            ORDER BY e.event_ts ASC, e.seq ASC
            LIMIT $4
            "#,
        )
        .bind(tenant.as_str())
        .bind(now)
        .bind(i64::from(max_attempts))
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        into_events(rows)
    }

    async fn tenants_with_pending(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> StoreResult<Vec<TenantId>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT tenant_id
            FROM events
            WHERE expire_ts > $1
              AND retry_count < $2
              AND (
                  delivery_status = 'not-delivered'
                  OR (delivery_status = 'failed' AND next_attempt_at <= $1)
              )
            ORDER BY tenant_id
            "#,
        )
        .bind(now)
        .bind(i64::from(max_attempts))
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("tenant_id").map_err(query_err)?;
                TenantId::parse(raw.as_str()).map_err(|e| StoreError::Corrupt {
                    id: raw,
                    message: e.to_string(),
                })
            })
            .collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM events WHERE expire_ts <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }
}
