use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use perfil_core::error::AppError;
use perfil_core::fetch::{FetchStrategy, ProtectionKind};
use perfil_core::models::SiteKnowledge;
use perfil_core::stores::KnowledgeStore;

/// Repository for per-origin fetch knowledge.
#[derive(Clone)]
pub struct KnowledgeRepository {
    pool: Pool<Postgres>,
}

impl KnowledgeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct KnowledgeRow {
    origin: String,
    best_strategy: String,
    protection: Option<String>,
    total_attempts: i32,
    total_successes: i32,
    last_success_at: Option<DateTime<Utc>>,
}

impl From<KnowledgeRow> for SiteKnowledge {
    fn from(row: KnowledgeRow) -> Self {
        SiteKnowledge {
            origin: row.origin,
            best_strategy: FetchStrategy::parse(&row.best_strategy)
                .unwrap_or(FetchStrategy::Standard),
            protection: row.protection.as_deref().and_then(ProtectionKind::parse),
            total_attempts: row.total_attempts.max(0) as u32,
            total_successes: row.total_successes.max(0) as u32,
            last_success_at: row.last_success_at,
        }
    }
}

impl KnowledgeStore for KnowledgeRepository {
    async fn get_knowledge(&self, origin: &str) -> Result<Option<SiteKnowledge>, AppError> {
        let row = sqlx::query_as::<_, KnowledgeRow>(
            r#"
            SELECT origin, best_strategy, protection, total_attempts, total_successes, last_success_at
            FROM site_knowledge
            WHERE origin = $1
            "#,
        )
        .bind(origin)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn upsert_knowledge(&self, knowledge: &SiteKnowledge) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO site_knowledge
                (origin, best_strategy, protection, total_attempts, total_successes, last_success_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (origin) DO UPDATE
            SET best_strategy = EXCLUDED.best_strategy,
                protection = EXCLUDED.protection,
                total_attempts = EXCLUDED.total_attempts,
                total_successes = EXCLUDED.total_successes,
                last_success_at = EXCLUDED.last_success_at,
                updated_at = NOW()
            "#,
        )
        .bind(&knowledge.origin)
        .bind(knowledge.best_strategy.as_str())
        .bind(knowledge.protection.map(|p| p.as_str()))
        .bind(knowledge.total_attempts as i32)
        .bind(knowledge.total_successes as i32)
        .bind(knowledge.last_success_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(())
    }
}
