use perfil_core::AppError;
use perfil_core::queue::QueueConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::knowledge_repository::KnowledgeRepository;
use crate::queue_repository::{QueueName, QueueRepository};
use crate::stage_repository::StageRepository;

/// Central database facade — owns the connection pool, runs migrations,
/// and vends repository instances.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    queue_config: QueueConfig,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::Config(format!("Failed to connect: {e}")))?;

        Ok(Self {
            pool,
            queue_config: QueueConfig::default(),
        })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            queue_config: QueueConfig::default(),
        }
    }

    pub fn with_queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = config;
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Config(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn queue(&self, name: QueueName) -> QueueRepository {
        QueueRepository::new(self.pool.clone(), name, self.queue_config.clone())
    }

    pub fn stage_repo(&self) -> StageRepository {
        StageRepository::new(self.pool.clone())
    }

    pub fn knowledge_repo(&self) -> KnowledgeRepository {
        KnowledgeRepository::new(self.pool.clone())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
