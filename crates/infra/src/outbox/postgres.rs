//! Postgres-backed outbox store.
//!
//! ## Claiming
//!
//! `fetch_due` claims rows with a single statement:
//!
//! ```sql
//! UPDATE outbox_messages SET locked_until = $now + lease
//! WHERE id IN (SELECT id ... FOR UPDATE SKIP LOCKED LIMIT $n)
//! RETURNING ...
//! ```
//!
//! Concurrent processors skip rows another transaction is claiming, and a
//! committed claim hides the row until `locked_until` passes. `save` and
//! `release` clear the lease.
//!
//! ## Write-once `processed_at`
//!
//! `save` never overwrites a processed row: every delivery column keeps its
//! stored value once `processed_at` is set, so a late duplicate dispatch only
//! clears the lease.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use sprintforge_core::MessageId;

use super::error::OutboxStoreError;
use super::message::{OutboxMessage, OutboxMessageParts};
use super::retry::DEFAULT_MAX_RETRY_ATTEMPTS;
use super::store::{DEFAULT_CLAIM_LEASE, OutboxStats, OutboxStore};

const SCHEMA: &str = include_str!("../../migrations/0001_outbox_messages.sql");

const COLUMNS: &str = "id, event_type, payload, idempotency_key, created_at, \
                       processed_at, retry_count, next_retry_at, error";

/// Postgres-backed outbox store.
///
/// `Send + Sync`; clones share the underlying pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
    max_retry_attempts: u32,
    claim_lease: Duration,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    pub fn with_max_retry_attempts(mut self, max: u32) -> Self {
        self.max_retry_attempts = max;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Create the `outbox_messages` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), OutboxStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Insert a message inside a caller-owned transaction.
    ///
    /// Command handlers use this to write the outbox row in the same atomic
    /// unit as the business change it describes.
    #[instrument(
        skip(tx, message),
        fields(message_id = %message.id(), event_type = message.event_type()),
        err
    )]
    pub async fn insert_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        message: &OutboxMessage,
    ) -> Result<(), OutboxStoreError> {
        insert_query(message)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_insert_error(message.id(), e))?;
        Ok(())
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.claim_lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn max_retry_attempts_param(&self) -> i32 {
        i32::try_from(self.max_retry_attempts).unwrap_or(i32::MAX)
    }
}

fn insert_query(
    message: &OutboxMessage,
) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO outbox_messages (
            id,
            event_type,
            payload,
            idempotency_key,
            created_at,
            processed_at,
            retry_count,
            next_retry_at,
            error
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(*message.id().as_uuid())
    .bind(message.event_type())
    .bind(message.payload())
    .bind(message.idempotency_key())
    .bind(message.created_at())
    .bind(message.processed_at())
    .bind(retry_count_to_db(message.retry_count()))
    .bind(message.next_retry_at())
    .bind(message.error())
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(
        skip(self, message),
        fields(message_id = %message.id(), event_type = message.event_type()),
        err
    )]
    async fn insert(&self, message: &OutboxMessage) -> Result<(), OutboxStoreError> {
        insert_query(message)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_insert_error(message.id(), e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    async fn fetch_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let sql = format!(
            r#"
            UPDATE outbox_messages
            SET locked_until = $1
            WHERE id IN (
                SELECT id
                FROM outbox_messages
                WHERE processed_at IS NULL
                  AND retry_count < $2
                  AND (next_retry_at IS NULL OR next_retry_at <= $3)
                  AND (locked_until IS NULL OR locked_until <= $3)
                ORDER BY created_at ASC, id ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(self.lease_until(now))
            .bind(self.max_retry_attempts_param())
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_due", e))?;

        // RETURNING does not preserve the subquery order.
        let mut claimed = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|m| (m.created_at(), m.id()));

        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(
        skip(self, message),
        fields(message_id = %message.id(), retry_count = message.retry_count()),
        err
    )]
    async fn save(&self, message: &OutboxMessage) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET processed_at  = CASE WHEN processed_at IS NULL THEN $2 ELSE processed_at END,
                retry_count   = CASE WHEN processed_at IS NULL THEN $3 ELSE retry_count END,
                next_retry_at = CASE WHEN processed_at IS NULL THEN $4 ELSE next_retry_at END,
                error         = CASE WHEN processed_at IS NULL THEN $5 ELSE error END,
                locked_until  = NULL
            WHERE id = $1
            "#,
        )
        .bind(*message.id().as_uuid())
        .bind(message.processed_at())
        .bind(retry_count_to_db(message.retry_count()))
        .bind(message.next_retry_at())
        .bind(message.error())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;

        if result.rows_affected() == 0 {
            return Err(OutboxStoreError::NotFound(message.id()));
        }
        Ok(())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn release(&self, ids: &[MessageId]) -> Result<(), OutboxStoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<uuid::Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();

        sqlx::query("UPDATE outbox_messages SET locked_until = NULL WHERE id = ANY($1)")
            .bind(ids)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM outbox_messages
            WHERE idempotency_key = $1 AND processed_at IS NOT NULL
            ORDER BY processed_at ASC, id ASC
            LIMIT 1
            "#
        );

        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;

        row.as_ref().map(message_from_row).transpose()
    }

    #[instrument(skip(self), fields(message_id = %id), err)]
    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM outbox_messages WHERE id = $1");

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(message_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE processed_at IS NULL AND retry_count < $1)  AS pending,
                COUNT(*) FILTER (WHERE processed_at IS NOT NULL)                   AS processed,
                COUNT(*) FILTER (WHERE processed_at IS NULL AND retry_count >= $1) AS failed
            FROM outbox_messages
            "#,
        )
        .bind(self.max_retry_attempts_param())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<usize, OutboxStoreError> {
            let n: i64 = row.try_get(column).map_err(|e| {
                OutboxStoreError::Storage(format!("failed to read {column}: {e}"))
            })?;
            Ok(usize::try_from(n).unwrap_or(0))
        };

        Ok(OutboxStats {
            pending: count("pending")?,
            processed: count("processed")?,
            failed: count("failed")?,
        })
    }

    #[instrument(skip(self), err)]
    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM outbox_messages
            WHERE processed_at IS NULL AND retry_count >= $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(self.max_retry_attempts_param())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_failed", e))?;

        rows.iter().map(message_from_row).collect()
    }

    #[instrument(skip(self), fields(message_id = %id), err)]
    async fn requeue(&self, id: MessageId) -> Result<OutboxMessage, OutboxStoreError> {
        let sql = format!(
            r#"
            UPDATE outbox_messages
            SET retry_count = 0, next_retry_at = NULL, error = NULL, locked_until = NULL
            WHERE id = $1 AND processed_at IS NULL AND retry_count >= $2
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(self.max_retry_attempts_param())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue", e))?;

        match row {
            Some(row) => message_from_row(&row),
            None => match self.get(id).await? {
                Some(_) => Err(OutboxStoreError::NotRequeueable(id)),
                None => Err(OutboxStoreError::NotFound(id)),
            },
        }
    }
}

fn message_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxMessage, OutboxStoreError> {
    let read = |e: sqlx::Error| {
        OutboxStoreError::Storage(format!("failed to deserialize outbox row: {e}"))
    };

    let id: uuid::Uuid = row.try_get("id").map_err(read)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(read)?;

    Ok(OutboxMessage::from_parts(OutboxMessageParts {
        id: MessageId::from_uuid(id),
        event_type: row.try_get("event_type").map_err(read)?,
        payload: row.try_get("payload").map_err(read)?,
        idempotency_key: row.try_get("idempotency_key").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        processed_at: row.try_get("processed_at").map_err(read)?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        next_retry_at: row.try_get("next_retry_at").map_err(read)?,
        error: row.try_get("error").map_err(read)?,
    }))
}

fn retry_count_to_db(retry_count: u32) -> i32 {
    i32::try_from(retry_count).unwrap_or(i32::MAX)
}

fn map_insert_error(id: MessageId, err: sqlx::Error) -> OutboxStoreError {
    if is_unique_violation(&err) {
        OutboxStoreError::AlreadyExists(id)
    } else {
        map_sqlx_error("insert", err)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => OutboxStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            OutboxStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => OutboxStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|c| c.as_ref() == "23505"),
        _ => false,
    }
}
