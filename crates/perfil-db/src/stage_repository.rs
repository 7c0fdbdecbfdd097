use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use perfil_core::error::AppError;
use perfil_core::extractor::StageStatus;
use perfil_core::key::CompanyKey;
use perfil_core::models::{
    DiscoveryResult, DiscoveryStatus, NewSearchResult, ScrapedChunk, SearchHit, SearchResult,
};
use perfil_core::profile::CompanyProfile;
use perfil_core::stores::{ChunkStore, DiscoveryStore, ProfileStore, SearchStore};

/// Repository for the four stage-output tables.
#[derive(Clone)]
pub struct StageRepository {
    pool: Pool<Postgres>,
}

impl StageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// -- Internal row types --

#[derive(sqlx::FromRow)]
struct SearchRow {
    id: i64,
    company_key: String,
    query: String,
    hits: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<SearchRow> for SearchResult {
    type Error = AppError;

    fn try_from(row: SearchRow) -> Result<Self, AppError> {
        let hits: Vec<SearchHit> = serde_json::from_value(row.hits)?;
        Ok(SearchResult {
            id: row.id,
            key: CompanyKey::new(&row.company_key)?,
            query: row.query,
            hits,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DiscoveryRow {
    company_key: String,
    site_url: Option<String>,
    status: String,
    confidence: f64,
    reasoning: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DiscoveryRow> for DiscoveryResult {
    type Error = AppError;

    fn try_from(row: DiscoveryRow) -> Result<Self, AppError> {
        Ok(DiscoveryResult {
            key: CompanyKey::new(&row.company_key)?,
            site_url: row.site_url,
            status: DiscoveryStatus::parse(&row.status).unwrap_or(DiscoveryStatus::Error),
            confidence: row.confidence,
            reasoning: row.reasoning,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ChunkRow {
    company_key: String,
    chunk_index: i32,
    chunk_total: i32,
    content: String,
    tokens: i32,
    source_urls: serde_json::Value,
    content_hash: String,
}

impl TryFrom<ChunkRow> for ScrapedChunk {
    type Error = AppError;

    fn try_from(row: ChunkRow) -> Result<Self, AppError> {
        Ok(ScrapedChunk {
            key: CompanyKey::new(&row.company_key)?,
            chunk_index: row.chunk_index.max(0) as u32,
            chunk_total: row.chunk_total.max(0) as u32,
            content: row.content,
            tokens: row.tokens.max(0) as u32,
            source_urls: serde_json::from_value(row.source_urls).unwrap_or_default(),
            content_hash: row.content_hash,
        })
    }
}

impl SearchStore for StageRepository {
    async fn save_search(&self, result: &NewSearchResult) -> Result<i64, AppError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO search_results (company_key, query, hits)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(result.key.as_str())
        .bind(&result.query)
        .bind(serde_json::to_value(&result.hits)?)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(id)
    }

    async fn latest_search(&self, key: &CompanyKey) -> Result<Option<SearchResult>, AppError> {
        let row = sqlx::query_as::<_, SearchRow>(
            r#"
            SELECT id, company_key, query, hits, created_at
            FROM search_results
            WHERE company_key = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        row.map(SearchResult::try_from).transpose()
    }
}

impl DiscoveryStore for StageRepository {
    async fn upsert_discovery(&self, result: &DiscoveryResult) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO discovery_results (company_key, site_url, status, confidence, reasoning)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (company_key) DO UPDATE
            SET site_url = EXCLUDED.site_url,
                status = EXCLUDED.status,
                confidence = EXCLUDED.confidence,
                reasoning = EXCLUDED.reasoning,
                updated_at = NOW()
            "#,
        )
        .bind(result.key.as_str())
        .bind(&result.site_url)
        .bind(result.status.as_str())
        .bind(result.confidence)
        .bind(&result.reasoning)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get_discovery(&self, key: &CompanyKey) -> Result<Option<DiscoveryResult>, AppError> {
        let row = sqlx::query_as::<_, DiscoveryRow>(
            r#"
            SELECT company_key, site_url, status, confidence, reasoning, updated_at
            FROM discovery_results
            WHERE company_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        row.map(DiscoveryResult::try_from).transpose()
    }
}

impl ChunkStore for StageRepository {
    /// Delete-then-insert in one transaction: a re-scrape totally
    /// replaces the key's chunk set.
    async fn replace_chunks(
        &self,
        key: &CompanyKey,
        chunks: &[ScrapedChunk],
    ) -> Result<usize, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        sqlx::query("DELETE FROM scraped_chunks WHERE company_key = $1")
            .bind(key.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO scraped_chunks
                    (company_key, chunk_index, chunk_total, content, tokens, source_urls, content_hash)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(key.as_str())
            .bind(chunk.chunk_index as i32)
            .bind(chunk.chunk_total as i32)
            .bind(&chunk.content)
            .bind(chunk.tokens as i32)
            .bind(serde_json::to_value(&chunk.source_urls)?)
            .bind(&chunk.content_hash)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(chunks.len())
    }

    async fn get_chunks(&self, key: &CompanyKey) -> Result<Vec<ScrapedChunk>, AppError> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT company_key, chunk_index, chunk_total, content, tokens, source_urls, content_hash
            FROM scraped_chunks
            WHERE company_key = $1
            ORDER BY chunk_index
            "#,
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        rows.into_iter().map(ScrapedChunk::try_from).collect()
    }
}

impl ProfileStore for StageRepository {
    async fn upsert_profile(
        &self,
        key: &CompanyKey,
        profile: &CompanyProfile,
        status: StageStatus,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO company_profiles (company_key, profile, status, company_name, industry)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (company_key) DO UPDATE
            SET profile = EXCLUDED.profile,
                status = EXCLUDED.status,
                company_name = EXCLUDED.company_name,
                industry = EXCLUDED.industry,
                updated_at = NOW()
            "#,
        )
        .bind(key.as_str())
        .bind(serde_json::to_value(profile)?)
        .bind(status.as_str())
        .bind(&profile.identity.company_name)
        .bind(&profile.classification.industry)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(())
    }
}

impl StageRepository {
    /// Read a stored profile back (facade/status surface).
    pub async fn get_profile(
        &self,
        key: &CompanyKey,
    ) -> Result<Option<(CompanyProfile, StageStatus)>, AppError> {
        let row: Option<(serde_json::Value, String)> = sqlx::query_as(
            r#"SELECT profile, status FROM company_profiles WHERE company_key = $1"#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        row.map(|(profile, status)| {
            Ok((
                serde_json::from_value(profile)?,
                StageStatus::parse(&status).unwrap_or(StageStatus::Error),
            ))
        })
        .transpose()
    }
}
