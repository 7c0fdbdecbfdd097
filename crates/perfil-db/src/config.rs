use perfil_core::AppError;

/// Configuration for the database connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_POOL_MAX_SIZE` (optional; defaults to 2 connections per
    ///   worker pair plus one for the facade, minimum 5)
    /// - `N_WORKERS` (only consulted for the default pool size)
    pub fn from_env() -> Result<Self, AppError> {
        let url = std::env::var("DATABASE_URL").map_err(|_| {
            AppError::Config("DATABASE_URL not set. Required for database operations.".into())
        })?;

        let workers: u32 = std::env::var("N_WORKERS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(2);

        let max_connections = match std::env::var("DATABASE_POOL_MAX_SIZE") {
            Err(_) => (workers * 2 + 1).max(5),
            Ok(raw) => {
                let parsed: u32 = raw.parse().map_err(|_| {
                    AppError::Config(format!(
                        "Invalid DATABASE_POOL_MAX_SIZE '{raw}': must be a positive integer"
                    ))
                })?;
                if parsed == 0 {
                    return Err(AppError::Config(
                        "DATABASE_POOL_MAX_SIZE must be at least 1".into(),
                    ));
                }
                parsed
            }
        };

        Ok(Self {
            url,
            max_connections,
        })
    }
}
