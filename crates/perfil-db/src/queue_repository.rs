use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use perfil_core::error::AppError;
use perfil_core::key::CompanyKey;
use perfil_core::queue::{
    BatchEnqueueResult, EnqueueOutcome, FailOutcome, QueueConfig, QueueEntry, QueueMetrics,
    QueueStatus, WorkQueue,
};
use perfil_core::util::xorshift_below;

/// The two durable queues. Table names are compiled in; nothing dynamic
/// ever reaches the SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    Discovery,
    Profile,
}

impl QueueName {
    pub fn table(&self) -> &'static str {
        match self {
            QueueName::Discovery => "queue_discovery",
            QueueName::Profile => "queue_profile",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Discovery => "discovery",
            QueueName::Profile => "profile",
        }
    }
}

/// PostgreSQL-backed [`WorkQueue`] using `FOR UPDATE SKIP LOCKED` for
/// atomic claims and a partial unique index for the one-active-entry-
/// per-key invariant.
#[derive(Clone)]
pub struct QueueRepository {
    pool: Pool<Postgres>,
    name: QueueName,
    config: QueueConfig,
}

impl QueueRepository {
    pub fn new(pool: PgPool, name: QueueName, config: QueueConfig) -> Self {
        Self { pool, name, config }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: i64,
    company_key: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    available_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<QueueRow> for QueueEntry {
    type Error = AppError;

    fn try_from(row: QueueRow) -> Result<Self, AppError> {
        Ok(QueueEntry {
            id: row.id,
            key: CompanyKey::new(&row.company_key)?,
            status: row.status.parse().unwrap_or(QueueStatus::Queued),
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            available_at: row.available_at,
            locked_at: row.locked_at,
            locked_by: row.locked_by,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl WorkQueue for QueueRepository {
    async fn enqueue(&self, key: &CompanyKey) -> Result<EnqueueOutcome, AppError> {
        // The partial unique index on company_key (status active) makes
        // this insert the idempotency point: a concurrent duplicate
        // resolves to DO NOTHING.
        let sql = format!(
            r#"
            INSERT INTO {table} (company_key, max_attempts)
            VALUES ($1, $2)
            ON CONFLICT (company_key) WHERE status IN ('queued', 'processing') DO NOTHING
            RETURNING id
            "#,
            table = self.name.table()
        );
        let row: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(key.as_str())
            .bind(self.config.max_attempts as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        match row {
            Some((id,)) => {
                tracing::debug!(queue = self.name.as_str(), %key, id, "enqueued");
                Ok(EnqueueOutcome::Enqueued(id))
            }
            None => Ok(EnqueueOutcome::AlreadyActive),
        }
    }

    async fn enqueue_batch(&self, keys: &[CompanyKey]) -> Result<BatchEnqueueResult, AppError> {
        let mut result = BatchEnqueueResult {
            enqueued: Vec::new(),
            skipped: Vec::new(),
        };
        for key in keys {
            match self.enqueue(key).await? {
                EnqueueOutcome::Enqueued(_) => result.enqueued.push(key.clone()),
                EnqueueOutcome::AlreadyActive => result.skipped.push(key.clone()),
            }
        }
        Ok(result)
    }

    async fn claim(&self, owner: &str, batch: usize) -> Result<Vec<QueueEntry>, AppError> {
        if batch == 0 {
            return Ok(Vec::new());
        }
        // Claimable: queued-and-available, plus processing rows whose lock
        // outlived the visibility timeout (abandoned by a dead worker).
        let sql = format!(
            r#"
            WITH picked AS (
                SELECT id FROM {table}
                WHERE (status = 'queued' AND available_at <= NOW())
                   OR (status = 'processing'
                       AND locked_at < NOW() - make_interval(secs => $3))
                ORDER BY available_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} q
            SET status = 'processing',
                locked_at = NOW(),
                locked_by = $1,
                updated_at = NOW()
            FROM picked
            WHERE q.id = picked.id
            RETURNING q.id, q.company_key, q.status, q.attempts, q.max_attempts,
                      q.available_at, q.locked_at, q.locked_by, q.last_error,
                      q.created_at, q.updated_at
            "#,
            table = self.name.table()
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(owner)
            .bind(batch as i64)
            .bind(self.config.visibility_timeout.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    async fn complete(&self, entry_id: i64, owner: &str) -> Result<(), AppError> {
        // Owner-guarded: if the entry was reclaimed past the visibility
        // timeout, the original worker's completion silently misses.
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'done',
                last_error = NULL,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND locked_by = $2
            "#,
            table = self.name.table()
        );
        let result = sqlx::query(&sql)
            .bind(entry_id)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            tracing::debug!(
                queue = self.name.as_str(),
                entry_id,
                owner,
                "complete ignored: entry not held by this owner"
            );
        }
        Ok(())
    }

    async fn fail_or_retry(
        &self,
        entry_id: i64,
        owner: &str,
        error: &str,
    ) -> Result<FailOutcome, AppError> {
        // Back-off: base × 2^attempts (attempts pre-increment), capped,
        // with the jitter factor computed here.
        let base = self.config.retry.base.num_milliseconds() as f64 / 1000.0;
        let cap = self.config.retry.cap.num_milliseconds() as f64 / 1000.0;
        let jitter_span = self.config.retry.jitter;
        let jitter_factor =
            1.0 - jitter_span + (xorshift_below(2_000) as f64 / 1_000.0) * jitter_span;

        let sql = format!(
            r#"
            UPDATE {table}
            SET attempts = attempts + 1,
                status = CASE WHEN attempts + 1 >= max_attempts
                              THEN 'failed' ELSE 'queued' END,
                available_at = CASE WHEN attempts + 1 >= max_attempts THEN NOW()
                    ELSE NOW() + make_interval(secs => LEAST($3 * power(2, attempts), $4) * $5)
                END,
                last_error = $2,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND locked_by = $6
            RETURNING status, available_at
            "#,
            table = self.name.table()
        );
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(&sql)
            .bind(entry_id)
            .bind(error)
            .bind(base)
            .bind(cap)
            .bind(jitter_factor)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        match row {
            None => Ok(FailOutcome::NotOwned),
            Some((status, _)) if status == "failed" => {
                tracing::warn!(queue = self.name.as_str(), entry_id, %error, "entry dead");
                Ok(FailOutcome::Dead)
            }
            Some((_, available_at)) => {
                let next_available_in = (available_at - Utc::now()).to_std().unwrap_or_default();
                Ok(FailOutcome::Retried { next_available_in })
            }
        }
    }

    async fn metrics(&self) -> Result<QueueMetrics, AppError> {
        let sql = format!(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'queued' THEN 1 ELSE 0 END), 0)::int8 AS queued,
                COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0)::int8 AS processing,
                COALESCE(SUM(CASE WHEN status = 'done' THEN 1 ELSE 0 END), 0)::int8 AS done,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)::int8 AS failed,
                EXTRACT(EPOCH FROM (NOW() - MIN(CASE WHEN status = 'queued' THEN created_at END)))::float8
                    AS oldest_queued_age_seconds
            FROM {table}
            "#,
            table = self.name.table()
        );
        let row: (i64, i64, i64, i64, Option<f64>) = sqlx::query_as(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(QueueMetrics {
            queued: row.0,
            processing: row.1,
            done: row.2,
            failed: row.3,
            oldest_queued_age_seconds: row.4,
        })
    }
}
